//! Message-type → handler dispatch table.
//!
//! The table is assembled once at startup and is immutable afterwards.
//! Collaborators add their own message types through
//! [`HandlerTableBuilder::register`]; tunnel traffic is reserved for the
//! tunnel manager and can never be claimed by a handler.

use crate::connection::Connection;
use crate::events::ServerEvent;
use crate::state::ServerState;
use c2mux_core::messages::{
    BeaconRegisterPayload, BeaconTaskResultPayload, BeaconTasksPayload, BeaconTasksResponse,
    Envelope, MsgType, PingPayload, RegisterPayload,
};
use c2mux_core::{cbor_encode, MuxResult};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a handler gets to work with.
#[derive(Clone)]
pub struct HandlerContext {
    pub connection: Arc<Connection>,
    pub state: Arc<ServerState>,
}

/// A handler returns an optional reply; the router stamps it with the
/// request's correlation ID.
pub type HandlerFn =
    Arc<dyn Fn(HandlerContext, Envelope) -> BoxFuture<'static, MuxResult<Option<Envelope>>> + Send + Sync>;

struct Entry {
    name: String,
    handler: HandlerFn,
}

pub struct HandlerTable {
    entries: HashMap<MsgType, Entry>,
}

impl HandlerTable {
    pub fn get(&self, msg_type: MsgType) -> Option<HandlerFn> {
        self.entries.get(&msg_type).map(|e| e.handler.clone())
    }

    /// Registered message types and their handler names.
    pub fn list(&self) -> BTreeMap<MsgType, String> {
        self.entries
            .iter()
            .map(|(t, e)| (*t, e.name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    entries: HashMap<MsgType, Entry>,
}

impl HandlerTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded with registration, ping and beacon tasking.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(MsgType::REGISTER, "register", register_session)
            .register(MsgType::REGISTER_BEACON, "register-beacon", register_beacon)
            .register(MsgType::PING, "ping", ping)
            .register(MsgType::BEACON_TASKS, "beacon-tasks", beacon_tasks)
            .register(MsgType::BEACON_TASK_RESULT, "beacon-task-result", beacon_task_result)
    }

    /// Add a handler for `msg_type`. A later registration for the same type
    /// replaces the earlier one. Tunnel types are refused.
    pub fn register<F, Fut>(mut self, msg_type: MsgType, name: &str, f: F) -> Self
    where
        F: Fn(HandlerContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MuxResult<Option<Envelope>>> + Send + 'static,
    {
        if msg_type.is_tunnel() {
            warn!(msg_type = %msg_type, name, "tunnel message types cannot have handlers, ignoring");
            return self;
        }
        let handler: HandlerFn =
            Arc::new(move |ctx: HandlerContext, env: Envelope| f(ctx, env).boxed());
        let replaced = self.entries.insert(
            msg_type,
            Entry {
                name: name.to_string(),
                handler,
            },
        );
        if let Some(old) = replaced {
            warn!(msg_type = %msg_type, old = %old.name, new = name, "handler replaced");
        }
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            entries: self.entries,
        }
    }
}

async fn register_session(ctx: HandlerContext, env: Envelope) -> MuxResult<Option<Envelope>> {
    let reg: RegisterPayload = env.decode()?;
    ctx.state.registry.attach_session(&ctx.connection, &reg)?;
    Ok(None)
}

async fn register_beacon(ctx: HandlerContext, env: Envelope) -> MuxResult<Option<Envelope>> {
    let mut reg: BeaconRegisterPayload = env.decode()?;
    if reg.agent.remote_address.is_empty() {
        if let Some(addr) = ctx.connection.remote_addr() {
            reg.agent.remote_address = addr.to_string();
        }
    }
    let (info, is_new) = ctx.state.beacons.register(reg);
    if is_new {
        ctx.state.events.publish(ServerEvent::BeaconRegistered(info));
    }
    Ok(None)
}

async fn ping(ctx: HandlerContext, env: Envelope) -> MuxResult<Option<Envelope>> {
    let ping: PingPayload = env.decode()?;
    ctx.connection.touch();
    debug!(conn_id = ctx.connection.id(), nonce = ping.nonce, "ping");
    Ok(Some(Envelope::from_payload(MsgType::PING, &ping)?))
}

async fn beacon_tasks(ctx: HandlerContext, env: Envelope) -> MuxResult<Option<Envelope>> {
    let poll: BeaconTasksPayload = env.decode()?;
    let tasks = ctx.state.beacons.on_poll(&poll.beacon_id, poll.results)?;
    let reply = BeaconTasksResponse { tasks };
    Ok(Some(Envelope::new(MsgType::BEACON_TASKS, cbor_encode(&reply)?)))
}

async fn beacon_task_result(ctx: HandlerContext, env: Envelope) -> MuxResult<Option<Envelope>> {
    let submitted: BeaconTaskResultPayload = env.decode()?;
    ctx.state
        .beacons
        .submit_result(&submitted.beacon_id, submitted.result)?;
    Ok(None)
}
