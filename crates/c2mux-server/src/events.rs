//! In-process publish/subscribe for operator-facing server events.
//!
//! Publishing never blocks: events go into a bounded broadcast ring and each
//! subscriber drains its own receiver on its own task. A subscriber that
//! falls behind loses the oldest events and a warning is logged.

use crate::beacon::BeaconInfo;
use crate::session::Session;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type SubscriptionId = u64;

struct Subscriber {
    // Held while the callback runs; cleared by unsubscribe.
    active: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus whose ring holds up to `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for every event published from now on.
    ///
    /// Callbacks run on a dedicated task in publish order. A callback must not
    /// unsubscribe itself.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.tx.subscribe();
        let active = Arc::new(Mutex::new(true));
        let gate = active.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let active = gate.lock();
                        if !*active {
                            break;
                        }
                        callback(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(subscription_id = id, skipped, "event subscriber lagging, oldest events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.subscribers.lock().insert(id, Subscriber { active, task });
        debug!(subscription_id = id, "event subscriber added");
        id
    }

    /// Remove a subscription. Once this returns the callback is never invoked
    /// again. Returns false if `id` was not subscribed.
    ///
    /// If the callback is running when this is called, the calling thread
    /// blocks until it returns. Callbacks should therefore stay short; hand
    /// slow work to a task, or use [`EventBus::stream`] and drop the stream
    /// instead of unsubscribing.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscribers.lock().remove(&id) else {
            return false;
        };
        *sub.active.lock() = false;
        sub.task.abort();
        debug!(subscription_id = id, "event subscriber removed");
        true
    }

    /// Publish to every current subscriber. Returns how many receivers the
    /// event was queued for.
    pub fn publish(&self, event: E) -> usize {
        // Err only means nobody is listening.
        self.tx.send(event).unwrap_or(0)
    }

    /// Long-lived subscription as a stream, ending when the consumer drops it.
    pub fn stream(&self) -> BoxStream<'static, E> {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagging, oldest events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E> Drop for EventBus<E> {
    fn drop(&mut self) {
        for (_, sub) in self.subscribers.get_mut().drain() {
            sub.task.abort();
        }
    }
}

/// A listener or job that stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: u32,
    pub name: String,
    pub protocol: String,
    pub port: u16,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Stopped,
    Failed,
}

/// Where a burned-implant signal came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum BurnSignal {
    /// A DNS canary embedded in the implant was resolved.
    Canary { domain: String },
    /// The implant hash showed up on a threat-intel feed.
    Watchtower { seen_on: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BurnNotice {
    /// Implant name; every session with this name is affected.
    pub name: String,
    pub signal: BurnSignal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionOpened(Session),
    SessionUpdated(Session),
    SessionClosed(Session),
    BeaconRegistered(BeaconInfo),
    BeaconBurned(BurnNotice),
    JobStopped(Job),
    OperatorJoined { operator: String },
    OperatorLeft { operator: String },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionOpened(_) => "session-opened",
            ServerEvent::SessionUpdated(_) => "session-updated",
            ServerEvent::SessionClosed(_) => "session-closed",
            ServerEvent::BeaconRegistered(_) => "beacon-registered",
            ServerEvent::BeaconBurned(_) => "beacon-burned",
            ServerEvent::JobStopped(_) => "job-stopped",
            ServerEvent::OperatorJoined { .. } => "operator-joined",
            ServerEvent::OperatorLeft { .. } => "operator-left",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |n: u32| {
            let _ = tx.send(n);
        });

        for n in 1..=3 {
            bus.publish(n);
        }
        for expected in 1..=3 {
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_idempotent() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe(move |n: u32| {
            let _ = tx.send(n);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(1);
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), Some(1));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(2);
        // The task was aborted, so its sender is gone and the channel ends.
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_waits_for_a_running_callback() {
        let bus = EventBus::new(4);
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done = finished.clone();
        let id = bus.subscribe(move |_: u32| {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            done.store(true, Ordering::SeqCst);
        });

        bus.publish(1);
        timeout(Duration::from_secs(1), started.recv()).await.unwrap().unwrap();
        assert!(bus.unsubscribe(id));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus: EventBus<u32> = EventBus::new(4);
        assert_eq!(bus.publish(7), 0);
    }

    #[tokio::test]
    async fn lagging_stream_skips_the_oldest() {
        let bus = EventBus::new(2);
        let mut events = bus.stream();
        for n in 1..=5u32 {
            bus.publish(n);
        }
        assert_eq!(events.next().await, Some(4));
        assert_eq!(events.next().await, Some(5));
    }

    #[test]
    fn server_events_serialize_with_kind_and_payload() {
        let event = ServerEvent::OperatorJoined {
            operator: "ghost".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "operator-joined");
        assert_eq!(json["payload"]["operator"], "ghost");
        assert_eq!(event.kind(), "operator-joined");

        let burned = ServerEvent::BeaconBurned(BurnNotice {
            name: "QUIET_HERON".into(),
            signal: BurnSignal::Canary {
                domain: "x.example.com".into(),
            },
        });
        let json = serde_json::to_value(&burned).unwrap();
        assert_eq!(json["payload"]["signal"]["source"], "canary");
    }
}
