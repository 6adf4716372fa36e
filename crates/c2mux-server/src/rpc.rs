//! Blocking request/response over the asynchronous envelope stream.
//!
//! Every call gets a fresh correlation ID and a single-slot waiter in the
//! owning connection's pending table. The waiter is registered before the
//! request is enqueued, so a fast response can never beat its registration.
//! IDs of waiters that timed out (or whose caller went away) are remembered
//! for a while so the router can tell a late response from a new request.

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use c2mux_core::messages::Envelope;
use c2mux_core::{ids, MuxError, MuxResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Per-connection table of outstanding calls.
pub(crate) struct PendingCalls {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Envelope>>,
    expired: VecDeque<String>,
    expired_set: HashSet<String>,
    expired_cap: usize,
    max_pending: usize,
}

/// Outcome of offering an inbound envelope to the pending table.
pub(crate) enum Delivery {
    /// Handed to its waiter.
    Delivered,
    /// Answers a call that already gave up.
    Late,
    /// Not a response to anything we asked.
    Unmatched(Envelope),
}

impl PendingCalls {
    pub(crate) fn new(max_pending: usize, expired_cap: usize) -> Self {
        Self {
            closed: false,
            waiters: HashMap::new(),
            expired: VecDeque::new(),
            expired_set: HashSet::new(),
            expired_cap,
            max_pending,
        }
    }

    fn register(&mut self, id: String) -> MuxResult<oneshot::Receiver<Envelope>> {
        if self.closed {
            return Err(MuxError::ConnectionClosed);
        }
        if self.waiters.len() >= self.max_pending {
            return Err(MuxError::TooManyPending(self.waiters.len()));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok(rx)
    }

    pub(crate) fn deliver(&mut self, envelope: Envelope) -> Delivery {
        if let Some(tx) = self.waiters.remove(&envelope.id) {
            // The receiver may have been dropped a moment ago; nothing to do then.
            let _ = tx.send(envelope);
            return Delivery::Delivered;
        }
        if self.expired_set.remove(&envelope.id) {
            self.expired.retain(|id| id != &envelope.id);
            return Delivery::Late;
        }
        Delivery::Unmatched(envelope)
    }

    /// Drop the waiter for `id` and remember the ID. Returns false if the
    /// waiter was already gone (delivered or released by teardown).
    fn expire(&mut self, id: &str) -> bool {
        if self.waiters.remove(id).is_none() {
            return false;
        }
        if self.expired_cap > 0 {
            if self.expired.len() >= self.expired_cap {
                if let Some(oldest) = self.expired.pop_front() {
                    self.expired_set.remove(&oldest);
                }
            }
            self.expired.push_back(id.to_string());
            self.expired_set.insert(id.to_string());
        }
        true
    }

    /// Release every waiter with a connection-closed signal.
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let released = self.waiters.len();
        // Dropping the senders wakes each receiver with a RecvError.
        self.waiters.clear();
        self.expired.clear();
        self.expired_set.clear();
        released
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Removes the waiter if the call is abandoned before it completes.
struct WaiterGuard<'a> {
    conn: &'a Connection,
    id: &'a str,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.calls().lock().expire(self.id);
        }
    }
}

/// Send `request` on `conn` and wait for the matching response.
///
/// Any correlation ID already set on `request` is replaced.
pub async fn call(conn: &Connection, mut request: Envelope, timeout: Duration) -> MuxResult<Envelope> {
    let id = ids::correlation_id()?;
    request.id = id.clone();

    let mut rx = conn.calls().lock().register(id.clone())?;
    let mut guard = WaiterGuard {
        conn,
        id: &id,
        armed: true,
    };

    debug!(conn_id = conn.id(), correlation_id = %id, msg_type = %request.msg_type, "rpc call");
    conn.send(request).await?;

    match tokio::time::timeout(timeout, &mut rx).await {
        Ok(Ok(response)) => {
            guard.disarm();
            Ok(response)
        }
        Ok(Err(_)) => {
            guard.disarm();
            Err(MuxError::ConnectionClosed)
        }
        Err(_) => {
            guard.disarm();
            if conn.calls().lock().expire(&id) {
                debug!(conn_id = conn.id(), correlation_id = %id, "rpc call timed out");
                return Err(MuxError::Timeout);
            }
            // Lost the race: the waiter was taken just as the timer fired.
            match rx.try_recv() {
                Ok(response) => Ok(response),
                Err(_) => Err(MuxError::ConnectionClosed),
            }
        }
    }
}

/// Synchronous-call façade addressed by connection ID.
pub struct RpcClient {
    registry: Arc<ConnectionRegistry>,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(registry: Arc<ConnectionRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// Call the agent on `conn_id`, using the configured timeout when `timeout` is `None`.
    pub async fn call(
        &self,
        conn_id: u64,
        request: Envelope,
        timeout: Option<Duration>,
    ) -> MuxResult<Envelope> {
        let conn = self
            .registry
            .lookup(conn_id)
            .await
            .ok_or(MuxError::ConnectionNotFound(conn_id))?;
        call(&conn, request, timeout.unwrap_or(self.default_timeout)).await
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use c2mux_core::MsgType;

    fn response(id: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            msg_type: MsgType::PING,
            data: vec![],
        }
    }

    #[test]
    fn deliver_hits_registered_waiter_once() {
        let mut calls = PendingCalls::new(16, 16);
        let mut rx = calls.register("a".into()).unwrap();
        assert!(matches!(calls.deliver(response("a")), Delivery::Delivered));
        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert!(matches!(calls.deliver(response("a")), Delivery::Unmatched(_)));
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn expired_ids_are_recognised_once() {
        let mut calls = PendingCalls::new(16, 16);
        let _rx = calls.register("a".into()).unwrap();
        assert!(calls.expire("a"));
        assert!(!calls.expire("a"));
        assert_eq!(calls.len(), 0);
        assert!(matches!(calls.deliver(response("a")), Delivery::Late));
        assert!(matches!(calls.deliver(response("a")), Delivery::Unmatched(_)));
    }

    #[test]
    fn expired_memory_is_bounded() {
        let mut calls = PendingCalls::new(16, 2);
        for id in ["a", "b", "c"] {
            let _rx = calls.register(id.into()).unwrap();
            calls.expire(id);
        }
        assert!(matches!(calls.deliver(response("a")), Delivery::Unmatched(_)));
        assert!(matches!(calls.deliver(response("b")), Delivery::Late));
        assert!(matches!(calls.deliver(response("c")), Delivery::Late));
    }

    #[test]
    fn close_releases_waiters_and_refuses_new_ones() {
        let mut calls = PendingCalls::new(16, 16);
        let mut rx1 = calls.register("a".into()).unwrap();
        let mut rx2 = calls.register("b".into()).unwrap();
        assert_eq!(calls.close(), 2);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert!(matches!(
            calls.register("c".into()),
            Err(MuxError::ConnectionClosed)
        ));
    }

    #[test]
    fn pending_limit_is_enforced() {
        let mut calls = PendingCalls::new(1, 16);
        let _rx = calls.register("a".into()).unwrap();
        assert!(matches!(
            calls.register("b".into()),
            Err(MuxError::TooManyPending(1))
        ));
    }
}
