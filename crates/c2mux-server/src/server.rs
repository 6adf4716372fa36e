//! Core server: accepts agent connections and drives their reader and
//! writer tasks.
//!
//! Owns the shared state (registry, beacon queues, event bus), the handler
//! table and the router, and exposes the operator-facing operations.

use crate::beacon::{BeaconInfo, LostTask};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionInfo, TeardownReport};
use crate::console::ConsoleAttachment;
use crate::events::{BurnNotice, EventBus, Job, ServerEvent};
use crate::handlers::{HandlerTable, HandlerTableBuilder};
use crate::router::Router;
use crate::rpc::RpcClient;
use crate::state::ServerState;
use crate::tunnel::{self, TunnelHandle, TunnelId};
use c2mux_core::messages::{Envelope, MsgType, Task, TaskResult};
use c2mux_core::transport::{EnvelopeSink, EnvelopeSource};
use c2mux_core::{MuxError, MuxResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// What one maintenance pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub lost: Vec<LostTask>,
    pub expired_results: usize,
}

/// The c2mux server instance.
pub struct C2Server {
    state: Arc<ServerState>,
    router: Router,
    rpc: RpcClient,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl C2Server {
    /// Server with the built-in handlers only.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handlers(config, HandlerTableBuilder::with_builtins())
    }

    /// Server with a caller-assembled handler table.
    pub fn with_handlers(config: ServerConfig, handlers: HandlerTableBuilder) -> Self {
        let state = Arc::new(ServerState::new(config));
        let handlers = Arc::new(handlers.build());
        info!(handlers = handlers.len(), "handler table built");
        let router = Router::new(handlers, state.clone());
        let rpc = RpcClient::new(state.registry.clone(), state.config.rpc_timeout);
        Self {
            state,
            router,
            rpc,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus<ServerEvent>> {
        &self.state.events
    }

    pub fn handlers(&self) -> &HandlerTable {
        self.router.handlers()
    }

    /// Register a new connection and start serving it.
    ///
    /// The connection is deregistered when `source` reaches EOF, the writer
    /// fails, or the server shuts down.
    pub async fn accept<S, R>(&self, sink: S, source: R, remote_addr: Option<String>) -> Arc<Connection>
    where
        S: EnvelopeSink + 'static,
        R: EnvelopeSource + 'static,
    {
        let (tx, rx) = mpsc::channel(self.state.config.send_queue_capacity);
        let conn = self.state.registry.register(tx, remote_addr).await;

        tokio::spawn(writer_loop(conn.clone(), sink, rx, self.state.clone()));
        tokio::spawn(reader_loop(
            conn.clone(),
            source,
            self.router.clone(),
            self.state.clone(),
            self.shutdown_tx.subscribe(),
        ));
        conn
    }

    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.state
            .registry
            .list()
            .await
            .iter()
            .map(|c| c.info())
            .collect()
    }

    /// Look up a connection by numeric ID or session name.
    pub async fn get_connection(&self, id_or_name: &str) -> Option<ConnectionInfo> {
        self.state.registry.get(id_or_name).await.map(|c| c.info())
    }

    /// Blocking call to the agent on `conn_id`; `None` uses the configured timeout.
    pub async fn call(&self, conn_id: ConnectionId, request: Envelope, timeout: Option<Duration>) -> MuxResult<Envelope> {
        self.rpc.call(conn_id, request, timeout).await
    }

    async fn connection(&self, conn_id: ConnectionId) -> MuxResult<Arc<Connection>> {
        self.state
            .registry
            .lookup(conn_id)
            .await
            .ok_or(MuxError::ConnectionNotFound(conn_id))
    }

    pub async fn open_tunnel(&self, conn_id: ConnectionId, session_id: u64) -> MuxResult<TunnelHandle> {
        let conn = self.connection(conn_id).await?;
        tunnel::open_tunnel(&conn, session_id).await
    }

    pub async fn send_data(&self, conn_id: ConnectionId, tunnel_id: TunnelId, data: Vec<u8>) -> MuxResult<()> {
        let conn = self.connection(conn_id).await?;
        tunnel::send_data(&conn, tunnel_id, data).await
    }

    pub async fn close_tunnel(&self, conn_id: ConnectionId, tunnel_id: TunnelId) -> MuxResult<()> {
        let conn = self.connection(conn_id).await?;
        tunnel::close_tunnel(&conn, tunnel_id).await
    }

    pub fn enqueue_task(&self, beacon_id: &str, msg_type: MsgType, data: Vec<u8>) -> MuxResult<String> {
        self.state.beacons.enqueue_task(beacon_id, msg_type, data)
    }

    pub fn on_poll(&self, beacon_id: &str, results: Vec<TaskResult>) -> MuxResult<Vec<Task>> {
        self.state.beacons.on_poll(beacon_id, results)
    }

    pub fn take_task_result(&self, beacon_id: &str, task_id: &str) -> MuxResult<Option<TaskResult>> {
        self.state.beacons.take_result(beacon_id, task_id)
    }

    pub fn list_beacons(&self) -> Vec<BeaconInfo> {
        self.state.beacons.list()
    }

    pub fn remove_beacon(&self, beacon_id: &str) -> Option<BeaconInfo> {
        self.state.beacons.remove(beacon_id)
    }

    /// Attach an operator console to the event feed.
    pub fn attach_console(&self, operator: &str) -> ConsoleAttachment {
        ConsoleAttachment::attach(operator, self.state.events.clone())
    }

    pub fn job_stopped(&self, job: Job) {
        info!(job_id = job.id, name = %job.name, "job stopped");
        self.state.events.publish(ServerEvent::JobStopped(job));
    }

    pub fn beacon_burned(&self, notice: BurnNotice) {
        warn!(name = %notice.name, "implant burned");
        self.state.events.publish(ServerEvent::BeaconBurned(notice));
    }

    /// Forcibly close a connection.
    pub async fn disconnect(&self, conn_id: ConnectionId) -> MuxResult<TeardownReport> {
        self.state
            .registry
            .deregister(conn_id)
            .await
            .ok_or(MuxError::ConnectionNotFound(conn_id))
    }

    /// One maintenance pass: report lost beacon tasks and drop results
    /// nobody collected within the beacon task timeout.
    pub fn sweep(&self) -> SweepReport {
        let timeout = self.state.config.beacon_task_timeout;
        SweepReport {
            lost: self.state.beacons.expire_lost(timeout),
            expired_results: self.state.beacons.expire_results(timeout),
        }
    }

    /// Run maintenance every `gc_interval` until shutdown.
    pub async fn run_maintenance(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.state.config.gc_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep();
                    if !report.lost.is_empty() || report.expired_results > 0 {
                        info!(
                            lost = report.lost.len(),
                            expired_results = report.expired_results,
                            "maintenance sweep"
                        );
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Stop every reader and deregister every connection.
    pub async fn shutdown(&self) -> usize {
        info!("shutting down connections");
        let closed = self.state.registry.drain().await;
        // No receivers just means maintenance was never started.
        let _ = self.shutdown_tx.send(());
        closed
    }
}

async fn writer_loop<S: EnvelopeSink>(
    conn: Arc<Connection>,
    mut sink: S,
    mut rx: mpsc::Receiver<Envelope>,
    state: Arc<ServerState>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(envelope) = next else { break };
                if let Err(e) = sink.send(envelope).await {
                    warn!(conn_id = conn.id(), error = %e, "send failed, closing connection");
                    state.registry.deregister(conn.id()).await;
                    break;
                }
            }
            _ = conn.closed() => break,
        }
    }
    if let Err(e) = sink.close().await {
        debug!(conn_id = conn.id(), error = %e, "sink close failed");
    }
}

async fn reader_loop<R: EnvelopeSource>(
    conn: Arc<Connection>,
    mut source: R,
    router: Router,
    state: Arc<ServerState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let router = router.bind(&conn);
    loop {
        tokio::select! {
            next = source.recv() => match next {
                Some(Ok(envelope)) => {
                    let route = router.route(envelope).await;
                    debug!(conn_id = conn.id(), ?route, "routed");
                }
                Some(Err(e)) => {
                    warn!(conn_id = conn.id(), error = %e, "malformed envelope, dropping");
                }
                None => {
                    debug!(conn_id = conn.id(), "transport reached EOF");
                    break;
                }
            },
            _ = conn.closed() => return,
            _ = shutdown.recv() => break,
        }
    }
    state.registry.deregister(conn.id()).await;
}
