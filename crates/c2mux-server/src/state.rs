//! Shared server state handed to every handler.

use crate::beacon::BeaconTaskQueue;
use crate::config::ServerConfig;
use crate::events::{EventBus, ServerEvent};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;

pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub beacons: Arc<BeaconTaskQueue>,
    pub events: Arc<EventBus<ServerEvent>>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_queue_capacity));
        let registry = Arc::new(ConnectionRegistry::new(
            config.connection_limits(),
            events.clone(),
        ));
        Self {
            config,
            registry,
            beacons: Arc::new(BeaconTaskQueue::new()),
            events,
        }
    }
}
