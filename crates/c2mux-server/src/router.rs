//! Inbound envelope routing.
//!
//! Every envelope read from a connection goes through [`BoundRouter::route`],
//! in this order: pending RPC waiter, late response to an abandoned call,
//! tunnel traffic, registered handler. Anything left is logged and dropped.
//!
//! Handlers run off the reader task, on one queue per connection, so a slow
//! handler never holds up responses or tunnel data while requests from one
//! agent still apply in the order they arrived.

use crate::connection::Connection;
use crate::handlers::{HandlerContext, HandlerFn, HandlerTable};
use crate::rpc::Delivery;
use crate::state::ServerState;
use crate::tunnel;
use c2mux_core::messages::{Envelope, MsgType};
use c2mux_core::MuxError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where an envelope went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Response,
    LateResponse,
    Tunnel,
    Handler(MsgType),
    Unhandled(MsgType),
}

#[derive(Clone)]
pub struct Router {
    handlers: Arc<HandlerTable>,
    state: Arc<ServerState>,
}

impl Router {
    pub fn new(handlers: Arc<HandlerTable>, state: Arc<ServerState>) -> Self {
        Self { handlers, state }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Start routing for one connection. Its handler queue stops once the
    /// returned router is dropped and the queue has drained.
    pub fn bind(&self, conn: &Arc<Connection>) -> BoundRouter {
        let (queue, rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            connection: conn.clone(),
            state: self.state.clone(),
        };
        tokio::spawn(run_handlers(ctx, rx));
        BoundRouter {
            handlers: self.handlers.clone(),
            conn: conn.clone(),
            queue,
        }
    }
}

/// A router tied to one connection and its handler queue.
pub struct BoundRouter {
    handlers: Arc<HandlerTable>,
    conn: Arc<Connection>,
    queue: mpsc::UnboundedSender<(HandlerFn, Envelope)>,
}

impl BoundRouter {
    pub async fn route(&self, envelope: Envelope) -> Route {
        let conn = &self.conn;
        conn.touch();

        let envelope = if envelope.is_correlated() {
            match conn.deliver_response(envelope) {
                Delivery::Delivered => return Route::Response,
                Delivery::Late => {
                    debug!(conn_id = conn.id(), "late response for an abandoned call, dropping");
                    return Route::LateResponse;
                }
                Delivery::Unmatched(envelope) => envelope,
            }
        } else {
            envelope
        };

        let msg_type = envelope.msg_type;
        if msg_type.is_tunnel() {
            tunnel::handle_inbound(conn, envelope).await;
            return Route::Tunnel;
        }

        let Some(handler) = self.handlers.get(msg_type) else {
            warn!(conn_id = conn.id(), msg_type = %msg_type, "no handler for message type, dropping");
            return Route::Unhandled(msg_type);
        };

        if self.queue.send((handler, envelope)).is_err() {
            warn!(conn_id = conn.id(), msg_type = %msg_type, "handler queue gone, dropping");
        }
        Route::Handler(msg_type)
    }
}

async fn run_handlers(ctx: HandlerContext, mut queue: mpsc::UnboundedReceiver<(HandlerFn, Envelope)>) {
    let conn = ctx.connection.clone();
    while let Some((handler, envelope)) = queue.recv().await {
        let msg_type = envelope.msg_type;
        let request_id = envelope.id.clone();
        match handler(ctx.clone(), envelope).await {
            Ok(Some(mut reply)) => {
                reply.id = request_id;
                if let Err(e) = conn.send(reply).await {
                    debug!(conn_id = conn.id(), msg_type = %msg_type, error = %e, "could not send handler reply");
                }
            }
            Ok(None) => {}
            Err(MuxError::ConnectionClosed) => {
                debug!(conn_id = conn.id(), msg_type = %msg_type, "connection closed before handler finished");
            }
            Err(e) => {
                warn!(conn_id = conn.id(), msg_type = %msg_type, error = %e, "handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::handlers::HandlerTableBuilder;
    use crate::rpc;
    use c2mux_core::messages::PingPayload;
    use c2mux_core::MuxResult;
    use std::time::Duration;

    async fn setup_with(
        builder: HandlerTableBuilder,
    ) -> (BoundRouter, Arc<Connection>, mpsc::Receiver<Envelope>) {
        setup_config(ServerConfig::default(), builder).await
    }

    async fn setup_config(
        config: ServerConfig,
        builder: HandlerTableBuilder,
    ) -> (BoundRouter, Arc<Connection>, mpsc::Receiver<Envelope>) {
        let state = Arc::new(ServerState::new(config));
        let handlers = Arc::new(builder.build());
        let (tx, rx) = mpsc::channel(16);
        let conn = state.registry.register(tx, None).await;
        let router = Router::new(handlers, state).bind(&conn);
        (router, conn, rx)
    }

    async fn setup() -> (BoundRouter, Arc<Connection>, mpsc::Receiver<Envelope>) {
        setup_with(HandlerTableBuilder::with_builtins()).await
    }

    #[tokio::test]
    async fn handler_reply_carries_request_id() {
        let (router, _conn, mut rx) = setup().await;
        let mut req = Envelope::from_payload(MsgType::PING, &PingPayload { nonce: 9 }).unwrap();
        req.id = "req-1".into();

        assert_eq!(router.route(req).await, Route::Handler(MsgType::PING));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, "req-1");
        assert_eq!(reply.decode::<PingPayload>().unwrap().nonce, 9);
    }

    #[tokio::test]
    async fn unknown_types_are_dropped() {
        let (router, _conn, mut rx) = setup().await;
        let route = router.route(Envelope::new(MsgType(0x4242), vec![])).await;
        assert_eq!(route, Route::Unhandled(MsgType(0x4242)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn responses_beat_handlers_and_late_ones_are_dropped() {
        let (router, conn, mut rx) = setup().await;

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                rpc::call(&conn, Envelope::new(MsgType::PING, vec![]), Duration::from_secs(5)).await
            })
        };
        let request = rx.recv().await.unwrap();
        let response = request.reply(MsgType::PING, vec![]);
        assert_eq!(router.route(response.clone()).await, Route::Response);
        let got: MuxResult<Envelope> = caller.await.unwrap();
        assert_eq!(got.unwrap().id, request.id);

        // Same ID again: no waiter, not expired, so it is treated as a request.
        assert_eq!(router.route(response).await, Route::Handler(MsgType::PING));

        let timed_out = rpc::call(&conn, Envelope::new(MsgType::PING, vec![]), Duration::from_millis(10)).await;
        assert!(matches!(timed_out, Err(c2mux_core::MuxError::Timeout)));
        // The duplicate above fails to decode as a ping, so nothing was sent for it.
        let late_request = rx.recv().await.unwrap();
        let late = late_request.reply(MsgType::PING, vec![]);
        assert_eq!(router.route(late).await, Route::LateResponse);
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn handlers_on_one_connection_run_in_arrival_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = order.clone();
        let builder = HandlerTableBuilder::new().register(MsgType(0x100), "step", move |_ctx: HandlerContext, env: Envelope| {
            let seen = seen.clone();
            async move {
                let step = env.data[0];
                // Earlier requests take longer; they must still finish first.
                tokio::time::sleep(Duration::from_millis(u64::from(5 - step) * 10)).await;
                seen.lock().push(step);
                Ok::<_, MuxError>(Some(Envelope::new(MsgType(0x100), vec![step])))
            }
        });
        let (router, _conn, mut rx) = setup_with(builder).await;

        for step in 0..5u8 {
            assert_eq!(
                router.route(Envelope::new(MsgType(0x100), vec![step])).await,
                Route::Handler(MsgType(0x100))
            );
        }
        let mut replies = Vec::new();
        for _ in 0..5 {
            replies.push(rx.recv().await.unwrap().data[0]);
        }
        assert_eq!(replies, vec![0, 1, 2, 3, 4]);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn responses_past_the_expired_memory_reach_handlers() {
        let config = ServerConfig {
            expired_id_memory: 1,
            ..ServerConfig::default()
        };
        let (router, conn, mut rx) = setup_config(config, HandlerTableBuilder::with_builtins()).await;

        let mut requests = Vec::new();
        for nonce in [1, 2] {
            let ping = Envelope::from_payload(MsgType::PING, &PingPayload { nonce }).unwrap();
            let result = rpc::call(&conn, ping, Duration::from_millis(10)).await;
            assert!(matches!(result, Err(MuxError::Timeout)));
            requests.push(rx.recv().await.unwrap());
        }

        // Only the newest timed-out ID is remembered.
        let newest = requests[1].reply(MsgType::PING, requests[1].data.clone());
        assert_eq!(router.route(newest).await, Route::LateResponse);
        let evicted = requests[0].reply(MsgType::PING, requests[0].data.clone());
        let evicted_id = evicted.id.clone();
        assert_eq!(router.route(evicted).await, Route::Handler(MsgType::PING));
        let echo = rx.recv().await.unwrap();
        assert_eq!(echo.id, evicted_id);
        assert_eq!(echo.decode::<PingPayload>().unwrap().nonce, 1);
    }
}
