//! One live agent connection: its outbound queue and the per-connection
//! tables (pending calls, tunnels, attached session) that die with it.

use crate::rpc::{Delivery, PendingCalls};
use crate::session::Session;
use crate::tunnel::TunnelTable;
use c2mux_core::messages::Envelope;
use c2mux_core::{MuxError, MuxResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

pub type ConnectionId = u64;

/// Bounds applied to each connection's bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_pending_calls: usize,
    pub expired_id_memory: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_pending_calls: 8192,
            expired_id_memory: 1024,
        }
    }
}

/// What teardown released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub released_calls: usize,
    pub closed_tunnels: usize,
}

pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<String>,
    outbound: mpsc::Sender<Envelope>,
    calls: Mutex<PendingCalls>,
    tunnels: Mutex<TunnelTable>,
    session: RwLock<Option<Session>>,
    created_at: Instant,
    last_seen: Mutex<Instant>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: Option<String>,
        outbound: mpsc::Sender<Envelope>,
        limits: ConnectionLimits,
    ) -> Self {
        let now = Instant::now();
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            remote_addr,
            outbound,
            calls: Mutex::new(PendingCalls::new(
                limits.max_pending_calls,
                limits.expired_id_memory,
            )),
            tunnels: Mutex::new(TunnelTable::new()),
            session: RwLock::new(None),
            created_at: now,
            last_seen: Mutex::new(now),
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub(crate) fn calls(&self) -> &Mutex<PendingCalls> {
        &self.calls
    }

    pub(crate) fn tunnels(&self) -> &Mutex<TunnelTable> {
        &self.tunnels
    }

    /// Queue an envelope for the writer task.
    pub async fn send(&self, envelope: Envelope) -> MuxResult<()> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| MuxError::ConnectionClosed)
    }

    /// Reserve one slot in the outbound queue.
    pub(crate) async fn reserve(&self) -> MuxResult<mpsc::Permit<'_, Envelope>> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }
        self.outbound
            .reserve()
            .await
            .map_err(|_| MuxError::ConnectionClosed)
    }

    pub(crate) fn deliver_response(&self, envelope: Envelope) -> Delivery {
        self.calls.lock().deliver(envelope)
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn open_tunnels(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    /// Attach or replace the session, refusing a torn-down connection.
    ///
    /// `announce` runs under the session lock and is told whether a session
    /// was replaced. Teardown reads the session after marking the connection
    /// closed, so it either sees this attach or this attach sees it.
    pub(crate) fn attach_session<F>(&self, session: Session, announce: F) -> MuxResult<()>
    where
        F: FnOnce(bool, &Session),
    {
        let mut slot = self.session.write();
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }
        let replaced = slot.is_some();
        announce(replaced, &session);
        *slot = Some(session);
        Ok(())
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_seen.lock().elapsed().as_secs()
    }

    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        // wait_for checks the current value before waiting.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Release every waiter and close every tunnel. Only the first call does
    /// any work; later calls return `None`.
    pub(crate) fn teardown(&self) -> Option<TeardownReport> {
        if self.shutdown.send_replace(true) {
            return None;
        }
        let released_calls = self.calls.lock().close();
        let closed_tunnels = self.tunnels.lock().close_all();
        Some(TeardownReport {
            released_calls,
            closed_tunnels,
        })
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote_addr: self.remote_addr.clone(),
            session: self.session(),
            pending_calls: self.pending_calls(),
            open_tunnels: self.open_tunnels(),
            idle_secs: self.idle_secs(),
            age_secs: self.age_secs(),
        }
    }
}

/// Snapshot of a connection for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: Option<String>,
    pub session: Option<Session>,
    pub pending_calls: usize,
    pub open_tunnels: usize,
    pub idle_secs: u64,
    pub age_secs: u64,
}
