//! Operator console support: the selected session, a renderer for server
//! events, and per-operator attachments to the event feed.

use crate::connection::ConnectionId;
use crate::events::{BurnSignal, EventBus, ServerEvent, SubscriptionId};
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The session an operator is currently interacting with.
///
/// Observers are told about every change, including backgrounding.
pub struct SessionSelection {
    current: RwLock<Option<Session>>,
    observers: EventBus<Option<Session>>,
}

impl Default for SessionSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSelection {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            observers: EventBus::new(16),
        }
    }

    pub fn get(&self) -> Option<Session> {
        self.current.read().clone()
    }

    pub fn set(&self, session: Session) {
        *self.current.write() = Some(session.clone());
        self.observers.publish(Some(session));
    }

    /// Target and timeout for a call to the selected session, or `None` when
    /// nothing is selected.
    pub fn request(&self, timeout: Duration) -> Option<(ConnectionId, Duration)> {
        self.current.read().as_ref().map(|s| (s.id, timeout))
    }

    /// Clear the selection. Returns the session that was selected.
    pub fn background(&self) -> Option<Session> {
        let previous = self.current.write().take();
        self.observers.publish(None);
        previous
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(Option<Session>) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }
}

/// Turns server events into console lines for one operator.
pub struct ConsoleFeed {
    registry: Arc<ConnectionRegistry>,
    selection: Arc<SessionSelection>,
}

impl ConsoleFeed {
    pub fn new(registry: Arc<ConnectionRegistry>, selection: Arc<SessionSelection>) -> Self {
        Self {
            registry,
            selection,
        }
    }

    pub fn selection(&self) -> &Arc<SessionSelection> {
        &self.selection
    }

    /// Render `event`, updating the selection when the selected session is lost.
    pub async fn apply(&self, event: &ServerEvent) -> Vec<String> {
        let mut lines = Vec::new();
        match event {
            ServerEvent::BeaconBurned(notice) => {
                let source = match &notice.signal {
                    BurnSignal::Canary { domain } => format!("DNS canary {domain}"),
                    BurnSignal::Watchtower { seen_on } => format!("seen on {seen_on}"),
                };
                lines.push(format!("WARNING: {} has been burned ({source})", notice.name));
                for conn in self.registry.lookup_by_name(&notice.name).await {
                    lines.push(format!("\tSession #{} is affected", conn.id()));
                }
            }
            ServerEvent::OperatorJoined { operator } => {
                lines.push(format!("{operator} has joined the game"));
            }
            ServerEvent::OperatorLeft { operator } => {
                lines.push(format!("{operator} left the game"));
            }
            ServerEvent::JobStopped(job) => {
                lines.push(format!("Job #{} stopped ({}/{})", job.id, job.protocol, job.name));
            }
            ServerEvent::SessionOpened(session) => {
                // A half-registered session has no OS yet; its update follows.
                if !session.os.is_empty() {
                    lines.push(format!("Session #{} {}", session.id, describe(session)));
                }
            }
            ServerEvent::SessionUpdated(session) => {
                lines.push(format!("Session #{} has been updated", session.id));
            }
            ServerEvent::SessionClosed(session) => {
                lines.push(format!("Lost session #{} {}", session.id, describe(session)));
                if self.selection.get().is_some_and(|s| s.id == session.id) {
                    self.selection.background();
                    lines.push("Active session disconnected".to_string());
                }
            }
            ServerEvent::BeaconRegistered(beacon) => {
                lines.push(format!(
                    "Beacon {} {} - {} ({}) - {}/{}",
                    beacon.beacon_id,
                    beacon.name,
                    beacon.remote_address,
                    beacon.hostname,
                    beacon.os,
                    beacon.arch
                ));
            }
        }
        lines
    }
}

fn describe(s: &Session) -> String {
    format!(
        "{} - {} ({}) - {}/{}",
        s.name, s.remote_address, s.hostname, s.os, s.arch
    )
}

/// An operator's live view of the event feed. Dropping it announces that the
/// operator left.
pub struct ConsoleAttachment {
    operator: String,
    events: BoxStream<'static, ServerEvent>,
    bus: Arc<EventBus<ServerEvent>>,
}

impl ConsoleAttachment {
    pub(crate) fn attach(operator: &str, bus: Arc<EventBus<ServerEvent>>) -> Self {
        // Subscribe first so the operator sees their own join.
        let events = bus.stream();
        bus.publish(ServerEvent::OperatorJoined {
            operator: operator.to_string(),
        });
        info!(operator, "operator attached");
        Self {
            operator: operator.to_string(),
            events,
            bus,
        }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub async fn next(&mut self) -> Option<ServerEvent> {
        self.events.next().await
    }
}

impl Drop for ConsoleAttachment {
    fn drop(&mut self) {
        info!(operator = %self.operator, "operator detached");
        self.bus.publish(ServerEvent::OperatorLeft {
            operator: self.operator.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionLimits;
    use crate::events::{BurnNotice, Job, JobStatus};
    use c2mux_core::messages::RegisterPayload;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn session(id: u64, name: &str, os: &str) -> Session {
        let reg = RegisterPayload {
            name: name.into(),
            hostname: "web01".into(),
            os: os.into(),
            arch: "amd64".into(),
            remote_address: "10.1.1.1:4444".into(),
            ..Default::default()
        };
        Session::from_registration(id, &reg, None)
    }

    fn feed() -> (ConsoleFeed, Arc<ConnectionRegistry>, Arc<EventBus<ServerEvent>>) {
        let bus = Arc::new(EventBus::new(16));
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default(), bus.clone()));
        let feed = ConsoleFeed::new(registry.clone(), Arc::new(SessionSelection::new()));
        (feed, registry, bus)
    }

    #[test]
    fn requests_target_the_selected_session() {
        let selection = SessionSelection::new();
        assert_eq!(selection.request(Duration::from_secs(30)), None);

        selection.set(session(7, "QUIET_HERON", "linux"));
        assert_eq!(
            selection.request(Duration::from_secs(30)),
            Some((7, Duration::from_secs(30)))
        );

        selection.background();
        assert_eq!(selection.request(Duration::from_secs(30)), None);
    }

    #[tokio::test]
    async fn half_registered_sessions_are_not_announced() {
        let (feed, _, _) = feed();
        assert!(feed.apply(&ServerEvent::SessionOpened(session(1, "A", ""))).await.is_empty());
        let lines = feed.apply(&ServerEvent::SessionOpened(session(1, "A", "linux"))).await;
        assert_eq!(lines, vec!["Session #1 A - 10.1.1.1:4444 (web01) - linux/amd64"]);
    }

    #[tokio::test]
    async fn losing_the_selected_session_backgrounds_it() {
        let (feed, _, _) = feed();
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.selection().subscribe(move |s: Option<Session>| {
            let _ = tx.send(s.map(|s| s.id));
        });

        feed.selection().set(session(3, "A", "linux"));
        let lines = feed.apply(&ServerEvent::SessionClosed(session(3, "A", "linux"))).await;
        assert_eq!(lines.last().map(String::as_str), Some("Active session disconnected"));
        assert!(feed.selection().get().is_none());

        let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(seen, Some(Some(3)));
        let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(seen, Some(None));

        // Some other session closing leaves the selection alone.
        feed.selection().set(session(4, "B", "linux"));
        let lines = feed.apply(&ServerEvent::SessionClosed(session(5, "C", "linux"))).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(feed.selection().get().map(|s| s.id), Some(4));
    }

    #[tokio::test]
    async fn burned_implants_list_affected_sessions() {
        let (feed, registry, _) = feed();
        let (tx, _rx) = mpsc::channel(1);
        let reg = RegisterPayload {
            name: "LOUD_CRANE".into(),
            os: "windows".into(),
            ..Default::default()
        };
        let a = registry.register(tx.clone(), None).await;
        let b = registry.register(tx, None).await;
        registry.attach_session(&a, &reg).unwrap();
        registry.attach_session(&b, &reg).unwrap();

        let lines = feed
            .apply(&ServerEvent::BeaconBurned(BurnNotice {
                name: "LOUD_CRANE".into(),
                signal: BurnSignal::Watchtower {
                    seen_on: "VirusTotal".into(),
                },
            }))
            .await;
        assert_eq!(lines[0], "WARNING: LOUD_CRANE has been burned (seen on VirusTotal)");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(&format!("#{}", a.id())));
    }

    #[tokio::test]
    async fn jobs_and_operators_render() {
        let (feed, _, _) = feed();
        let job = Job {
            id: 2,
            name: "https".into(),
            protocol: "tcp".into(),
            port: 443,
            status: JobStatus::Stopped,
        };
        assert_eq!(
            feed.apply(&ServerEvent::JobStopped(job)).await,
            vec!["Job #2 stopped (tcp/https)"]
        );
        assert_eq!(
            feed.apply(&ServerEvent::OperatorLeft { operator: "ghost".into() }).await,
            vec!["ghost left the game"]
        );
    }

    #[tokio::test]
    async fn attachment_announces_join_and_leave() {
        let bus = Arc::new(EventBus::new(16));
        let mut watcher = bus.stream();
        let mut console = ConsoleAttachment::attach("ghost", bus.clone());
        assert_eq!(console.operator(), "ghost");
        assert_eq!(console.next().await.unwrap().kind(), "operator-joined");
        drop(console);

        assert_eq!(watcher.next().await.unwrap().kind(), "operator-joined");
        assert_eq!(watcher.next().await.unwrap().kind(), "operator-left");
    }
}
