//! c2mux-server: control plane for a multiplexed agent server.
//!
//! Correlates responses with blocking calls, dispatches agent-initiated
//! messages to handlers, carries tunnels inside a connection, queues tasks
//! for polling agents and publishes server events to operator consoles.

pub mod beacon;
pub mod config;
pub mod connection;
pub mod console;
pub mod events;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod server;
pub mod session;
pub mod state;
pub mod tunnel;

pub use config::{Overrides, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionInfo};
pub use events::{EventBus, ServerEvent};
pub use handlers::{HandlerContext, HandlerTableBuilder};
pub use server::{C2Server, SweepReport};
pub use tunnel::{TunnelHandle, TunnelState};
