//! Registry of live connections, indexed by connection ID.
//!
//! Session names are not unique, so name lookups return every match.

use crate::connection::{Connection, ConnectionId, ConnectionLimits, TeardownReport};
use crate::events::{EventBus, ServerEvent};
use crate::session::Session;
use c2mux_core::messages::{Envelope, RegisterPayload};
use c2mux_core::MuxResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    limits: ConnectionLimits,
    events: Arc<EventBus<ServerEvent>>,
}

impl ConnectionRegistry {
    pub fn new(limits: ConnectionLimits, events: Arc<EventBus<ServerEvent>>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            limits,
            events,
        }
    }

    /// Register a connection whose outbound envelopes go to `outbound`.
    pub async fn register(
        &self,
        outbound: mpsc::Sender<Envelope>,
        remote_addr: Option<String>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, remote_addr, outbound, self.limits));
        self.connections.write().await.insert(id, conn.clone());
        info!(
            conn_id = id,
            remote_addr = conn.remote_addr().unwrap_or("-"),
            "connection registered"
        );
        conn
    }

    /// Remove a connection, waking its waiters and closing its tunnels.
    /// Returns `None` if it was not registered.
    pub async fn deregister(&self, id: ConnectionId) -> Option<TeardownReport> {
        let conn = self.connections.write().await.remove(&id)?;
        // Mark closed before reading the session; see Connection::attach_session.
        let report = conn.teardown().unwrap_or_default();
        info!(
            conn_id = id,
            released_calls = report.released_calls,
            closed_tunnels = report.closed_tunnels,
            "connection closed"
        );
        if let Some(session) = conn.session() {
            self.events.publish(ServerEvent::SessionClosed(session));
        }
        Some(report)
    }

    pub async fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Every connection whose session carries `name`.
    pub async fn lookup_by_name(&self, name: &str) -> Vec<Arc<Connection>> {
        let mut found: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.session().is_some_and(|s| s.name == name))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.id());
        found
    }

    /// Resolve a numeric connection ID or, failing that, a session name.
    /// Ambiguous names resolve to the lowest connection ID.
    pub async fn get(&self, id_or_name: &str) -> Option<Arc<Connection>> {
        if let Ok(id) = id_or_name.parse::<ConnectionId>() {
            if let Some(conn) = self.lookup(id).await {
                return Some(conn);
            }
        }
        self.lookup_by_name(id_or_name).await.into_iter().next()
    }

    pub async fn list(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self.connections.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Sessions of every connection that has registered one.
    pub async fn sessions(&self) -> Vec<Session> {
        self.list().await.iter().filter_map(|c| c.session()).collect()
    }

    /// Attach agent identity to a connection. Re-registration updates the
    /// session in place. A connection that is already closed is refused, so
    /// every published `SessionOpened` is eventually followed by
    /// `SessionClosed`.
    pub fn attach_session(&self, conn: &Connection, reg: &RegisterPayload) -> MuxResult<Session> {
        let session = Session::from_registration(conn.id(), reg, conn.remote_addr());
        conn.attach_session(session.clone(), |replaced, session| {
            if replaced {
                debug!(conn_id = conn.id(), name = %session.name, "session updated");
                self.events.publish(ServerEvent::SessionUpdated(session.clone()));
            } else {
                info!(conn_id = conn.id(), name = %session.name, os = %session.os, "session opened");
                self.events.publish(ServerEvent::SessionOpened(session.clone()));
            }
        })?;
        conn.touch();
        Ok(session)
    }

    pub async fn touch(&self, id: ConnectionId) -> bool {
        match self.lookup(id).await {
            Some(conn) => {
                conn.touch();
                true
            }
            None => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Deregister every connection.
    pub async fn drain(&self) -> usize {
        let ids: Vec<_> = self.connections.read().await.keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if self.deregister(id).await.is_some() {
                closed += 1;
            }
        }
        closed
    }
}
