//! Abstract envelope transport for c2mux.
//!
//! A transport collaborator (mTLS, HTTP, DNS, ...) owns framing and
//! decoding and hands the core a sink for outbound envelopes and a source of
//! inbound ones. Delivery must be in order per connection.

use crate::codec::decode_envelope;
use crate::error::{MuxError, MuxResult};
use crate::messages::Envelope;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Outbound half of a connection.
pub trait EnvelopeSink: Send + Sync {
    /// Send one envelope to the peer.
    fn send<'a>(
        &'a mut self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + 'a>>;

    /// Close the outbound half.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>>;
}

/// Inbound half of a connection.
pub trait EnvelopeSource: Send {
    /// Next inbound envelope.
    ///
    /// `None` = EOF. `Some(Err(_))` = a malformed envelope; the connection
    /// stays usable and the caller should keep reading.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<MuxResult<Envelope>>> + Send + '_>>;
}

/// Sink backed by an mpsc channel.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Envelope>>,
}

impl EnvelopeSink for ChannelSink {
    fn send<'a>(
        &'a mut self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(MuxError::ConnectionClosed)?;
            tx.send(envelope)
                .await
                .map_err(|_| MuxError::ConnectionClosed)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = MuxResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.tx.take();
            Ok(())
        })
    }
}

/// Source backed by an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<MuxResult<Envelope>>,
}

impl EnvelopeSource for ChannelSource {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<MuxResult<Envelope>>> + Send + '_>> {
        Box::pin(self.rx.recv())
    }
}

/// The far end of an in-memory transport: what an agent (or a transport
/// adapter that already decoded its frames) talks to.
pub struct ChannelPeer {
    tx: Option<mpsc::Sender<MuxResult<Envelope>>>,
    rx: mpsc::Receiver<Envelope>,
}

impl ChannelPeer {
    /// Deliver an envelope to the server side.
    pub async fn send(&self, envelope: Envelope) -> MuxResult<()> {
        self.push(Ok(envelope)).await
    }

    /// Deliver raw CBOR bytes; undecodable input reaches the server as an error item.
    pub async fn send_raw(&self, data: &[u8]) -> MuxResult<()> {
        self.push(decode_envelope(data)).await
    }

    async fn push(&self, item: MuxResult<Envelope>) -> MuxResult<()> {
        let tx = self.tx.as_ref().ok_or(MuxError::ConnectionClosed)?;
        tx.send(item).await.map_err(|_| MuxError::ConnectionClosed)
    }

    /// Receive the next envelope sent by the server. `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Signal EOF to the server side.
    pub fn close(&mut self) {
        self.tx.take();
    }
}

/// Create an in-memory transport.
///
/// Returns the server-side sink and source plus the peer end.
pub fn channel_transport(capacity: usize) -> (ChannelSink, ChannelSource, ChannelPeer) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    (
        ChannelSink { tx: Some(out_tx) },
        ChannelSource { rx: in_rx },
        ChannelPeer {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}
