//! Byte-stream tunnels multiplexed inside a connection's envelope stream.
//!
//! Each tunnel moves through `Open → Streaming → Closing → Closed`. Tunnel
//! IDs are allocated from a per-connection counter and never reused, so a
//! data frame still in flight for a closed tunnel can never land in a newer
//! one.
//!
//! Inbound data is pushed to the local endpoint in arrival order through an
//! unbounded buffer, which keeps the connection's reader from ever blocking
//! on a slow consumer. Ordering relies on the transport delivering in order;
//! the sequence numbers carried on the wire are informational.

use crate::connection::Connection;
use c2mux_core::messages::{
    Envelope, MsgType, TunnelClosePayload, TunnelDataPayload, TunnelOpenPayload,
};
use c2mux_core::{MuxError, MuxResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type TunnelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Open,
    Streaming,
    Closing,
    Closed,
}

struct TunnelEntry {
    session_id: u64,
    state: TunnelState,
    endpoint: mpsc::UnboundedSender<Vec<u8>>,
    next_sequence: u64,
}

/// The tunnels owned by one connection.
pub(crate) struct TunnelTable {
    next_id: TunnelId,
    closed: bool,
    tunnels: HashMap<TunnelId, TunnelEntry>,
}

impl TunnelTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            closed: false,
            tunnels: HashMap::new(),
        }
    }

    fn allocate(&mut self, session_id: u64) -> MuxResult<(TunnelId, mpsc::UnboundedReceiver<Vec<u8>>)> {
        if self.closed {
            return Err(MuxError::ConnectionClosed);
        }
        let id = self.next_id;
        self.next_id += 1;
        let (endpoint, reader) = mpsc::unbounded_channel();
        self.tunnels.insert(
            id,
            TunnelEntry {
                session_id,
                state: TunnelState::Open,
                endpoint,
                next_sequence: 0,
            },
        );
        Ok((id, reader))
    }

    pub(crate) fn state(&self, id: TunnelId) -> TunnelState {
        self.tunnels
            .get(&id)
            .map(|t| t.state)
            .unwrap_or(TunnelState::Closed)
    }

    /// Check that `id` accepts outbound data and claim the next sequence number.
    fn prepare_send(&mut self, id: TunnelId) -> MuxResult<u64> {
        let entry = self.tunnels.get_mut(&id).ok_or(MuxError::TunnelClosed(id))?;
        match entry.state {
            TunnelState::Open | TunnelState::Streaming => {
                entry.state = TunnelState::Streaming;
                let seq = entry.next_sequence;
                entry.next_sequence += 1;
                Ok(seq)
            }
            TunnelState::Closing | TunnelState::Closed => Err(MuxError::TunnelClosed(id)),
        }
    }

    /// Push inbound bytes to the local endpoint. False if the tunnel is unknown.
    fn deliver(&mut self, id: TunnelId, data: Vec<u8>) -> bool {
        let Some(entry) = self.tunnels.get_mut(&id) else {
            return false;
        };
        if entry.state == TunnelState::Open {
            entry.state = TunnelState::Streaming;
        }
        if entry.endpoint.send(data).is_err() {
            debug!(tunnel_id = id, "local endpoint dropped, discarding data");
        }
        true
    }

    /// Move an active tunnel to `Closing`. Returns whether a close envelope
    /// still needs to go out (false when already closing).
    fn begin_close(&mut self, id: TunnelId) -> MuxResult<bool> {
        let entry = self.tunnels.get_mut(&id).ok_or(MuxError::TunnelNotFound(id))?;
        match entry.state {
            TunnelState::Open | TunnelState::Streaming => {
                entry.state = TunnelState::Closing;
                Ok(true)
            }
            TunnelState::Closing | TunnelState::Closed => Ok(false),
        }
    }

    /// Remove a tunnel, returning its state just before it closed.
    fn finish_close(&mut self, id: TunnelId) -> Option<TunnelState> {
        // Dropping the entry drops the endpoint sender: the reader sees EOF.
        self.tunnels.remove(&id).map(|t| t.state)
    }

    /// Close every tunnel and refuse new ones. Returns how many were open.
    pub(crate) fn close_all(&mut self) -> usize {
        self.closed = true;
        let count = self.tunnels.len();
        self.tunnels.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.tunnels.len()
    }

    fn session_of(&self, id: TunnelId) -> Option<u64> {
        self.tunnels.get(&id).map(|t| t.session_id)
    }
}

/// Local end of a tunnel: read what the agent sends, write back to it.
pub struct TunnelHandle {
    conn: Arc<Connection>,
    id: TunnelId,
    session_id: u64,
    reader: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TunnelHandle {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    pub fn state(&self) -> TunnelState {
        self.conn.tunnels().lock().state(self.id)
    }

    /// Next chunk from the agent; `None` once the tunnel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.reader.recv().await
    }

    pub async fn send(&self, data: Vec<u8>) -> MuxResult<()> {
        send_data(&self.conn, self.id, data).await
    }

    pub async fn close(&self) -> MuxResult<()> {
        close_tunnel(&self.conn, self.id).await
    }
}

/// Allocate a tunnel on `conn` and announce it to the agent.
pub async fn open_tunnel(conn: &Arc<Connection>, session_id: u64) -> MuxResult<TunnelHandle> {
    let (id, reader) = conn.tunnels().lock().allocate(session_id)?;
    let open = Envelope::from_payload(
        MsgType::TUNNEL_OPEN,
        &TunnelOpenPayload {
            tunnel_id: id,
            session_id,
        },
    )?;
    if let Err(e) = conn.send(open).await {
        conn.tunnels().lock().finish_close(id);
        return Err(e);
    }
    info!(conn_id = conn.id(), tunnel_id = id, session_id, "tunnel opened");
    Ok(TunnelHandle {
        conn: conn.clone(),
        id,
        session_id,
        reader,
    })
}

/// Send bytes to the agent on an `Open` or `Streaming` tunnel.
pub async fn send_data(conn: &Connection, tunnel_id: TunnelId, data: Vec<u8>) -> MuxResult<()> {
    // Reserve queue space first so the sequence number and the queue
    // position are assigned together under the tunnel lock.
    let permit = conn.reserve().await?;
    let mut tunnels = conn.tunnels().lock();
    let sequence = tunnels.prepare_send(tunnel_id)?;
    let envelope = Envelope::from_payload(
        MsgType::TUNNEL_DATA,
        &TunnelDataPayload {
            tunnel_id,
            sequence,
            data,
        },
    )?;
    permit.send(envelope);
    Ok(())
}

/// Start closing a tunnel. It is `Closed` once the agent acknowledges or the
/// connection goes away. Closing a tunnel that is already closing is a no-op.
pub async fn close_tunnel(conn: &Connection, tunnel_id: TunnelId) -> MuxResult<()> {
    if !conn.tunnels().lock().begin_close(tunnel_id)? {
        return Ok(());
    }
    let close = Envelope::from_payload(MsgType::TUNNEL_CLOSE, &TunnelClosePayload { tunnel_id })?;
    conn.send(close).await?;
    debug!(conn_id = conn.id(), tunnel_id, "tunnel closing");
    Ok(())
}

/// Handle inbound tunnel traffic routed here by the router.
///
/// Traffic for unknown or closed tunnels is expected after a close race and
/// is dropped quietly.
pub(crate) async fn handle_inbound(conn: &Connection, envelope: Envelope) {
    match envelope.msg_type {
        MsgType::TUNNEL_DATA => {
            let payload: TunnelDataPayload = match envelope.decode() {
                Ok(p) => p,
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "malformed tunnel data, dropping");
                    return;
                }
            };
            let id = payload.tunnel_id;
            if !conn.tunnels().lock().deliver(id, payload.data) {
                debug!(conn_id = conn.id(), tunnel_id = id, "data for unknown tunnel, dropping");
            }
        }
        MsgType::TUNNEL_CLOSE => {
            let payload: TunnelClosePayload = match envelope.decode() {
                Ok(p) => p,
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "malformed tunnel close, dropping");
                    return;
                }
            };
            let id = payload.tunnel_id;
            let prior = conn.tunnels().lock().finish_close(id);
            match prior {
                Some(TunnelState::Closing) => {
                    info!(conn_id = conn.id(), tunnel_id = id, "tunnel closed");
                }
                Some(_) => {
                    info!(conn_id = conn.id(), tunnel_id = id, "tunnel closed by agent");
                    let ack = envelope.reply(MsgType::TUNNEL_CLOSE, envelope.data.clone());
                    if let Err(e) = conn.send(ack).await {
                        debug!(conn_id = conn.id(), tunnel_id = id, error = %e, "could not ack tunnel close");
                    }
                }
                None => {
                    debug!(conn_id = conn.id(), tunnel_id = id, "close for unknown tunnel, dropping");
                }
            }
        }
        MsgType::TUNNEL_OPEN => {
            let payload: TunnelOpenPayload = match envelope.decode() {
                Ok(p) => p,
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "malformed tunnel open, dropping");
                    return;
                }
            };
            let known = conn.tunnels().lock().session_of(payload.tunnel_id).is_some();
            if known {
                debug!(conn_id = conn.id(), tunnel_id = payload.tunnel_id, "tunnel open acknowledged");
            } else {
                debug!(conn_id = conn.id(), tunnel_id = payload.tunnel_id, "open for unknown tunnel, dropping");
            }
        }
        other => {
            debug!(conn_id = conn.id(), msg_type = %other, "not tunnel traffic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused() {
        let mut table = TunnelTable::new();
        let (a, _ra) = table.allocate(1).unwrap();
        table.finish_close(a);
        let (b, _rb) = table.allocate(1).unwrap();
        assert!(b > a);
    }

    #[test]
    fn state_machine_walks_forward() {
        let mut table = TunnelTable::new();
        let (id, mut reader) = table.allocate(7).unwrap();
        assert_eq!(table.state(id), TunnelState::Open);

        assert!(table.deliver(id, b"hi".to_vec()));
        assert_eq!(table.state(id), TunnelState::Streaming);
        assert_eq!(reader.try_recv().unwrap(), b"hi".to_vec());

        assert_eq!(table.prepare_send(id).unwrap(), 0);
        assert_eq!(table.prepare_send(id).unwrap(), 1);

        assert!(table.begin_close(id).unwrap());
        assert_eq!(table.state(id), TunnelState::Closing);
        assert!(!table.begin_close(id).unwrap());
        assert!(matches!(table.prepare_send(id), Err(MuxError::TunnelClosed(_))));

        assert_eq!(table.finish_close(id), Some(TunnelState::Closing));
        assert_eq!(table.state(id), TunnelState::Closed);
        assert!(reader.try_recv().is_err());
    }

    #[test]
    fn unknown_tunnels_are_reported() {
        let mut table = TunnelTable::new();
        assert!(!table.deliver(42, vec![1]));
        assert!(matches!(table.begin_close(42), Err(MuxError::TunnelNotFound(42))));
        assert_eq!(table.finish_close(42), None);
    }

    #[test]
    fn close_all_ends_every_reader() {
        let mut table = TunnelTable::new();
        let (_a, mut ra) = table.allocate(1).unwrap();
        let (_b, mut rb) = table.allocate(1).unwrap();
        assert_eq!(table.close_all(), 2);
        assert_eq!(table.len(), 0);
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_err());
        assert!(matches!(table.allocate(1), Err(MuxError::ConnectionClosed)));
        assert_eq!(table.close_all(), 0);
    }
}
