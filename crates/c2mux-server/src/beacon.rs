//! Task queues for asynchronous (check-in) agents.
//!
//! Tasks are delivered at most once. A poll drains every queued task and
//! marks it in flight; a task whose result never arrives is eventually
//! reported as lost by [`BeaconTaskQueue::expire_lost`] instead of being
//! redelivered.
//!
//! Each beacon has its own lock. The outer map lock is only taken to look up
//! or insert a beacon, so polls from different beacons never contend.

use c2mux_core::messages::{BeaconRegisterPayload, MsgType, Task, TaskResult};
use c2mux_core::{ids, MuxError, MuxResult};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest check-in interval or jitter accepted from an agent: thirty days.
pub const MAX_CHECKIN_SECS: u64 = 30 * 24 * 60 * 60;

struct InFlight {
    task: Task,
    sent_at: Instant,
}

struct Completed {
    result: TaskResult,
    at: Instant,
}

struct BeaconQueue {
    meta: BeaconRegisterPayload,
    queued: VecDeque<Task>,
    in_flight: HashMap<String, InFlight>,
    completed: HashMap<String, Completed>,
    last_checkin: Instant,
    next_checkin: Instant,
}

impl BeaconQueue {
    fn new(meta: BeaconRegisterPayload) -> Self {
        let now = Instant::now();
        let mut queue = Self {
            meta,
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
            completed: HashMap::new(),
            last_checkin: now,
            next_checkin: now,
        };
        queue.checked_in();
        queue
    }

    fn checked_in(&mut self) {
        self.last_checkin = Instant::now();
        let jitter = if self.meta.jitter_secs > 0 {
            rand::thread_rng().gen_range(0..=self.meta.jitter_secs)
        } else {
            0
        };
        let wait = Duration::from_secs(self.meta.interval_secs.saturating_add(jitter));
        self.next_checkin = self
            .last_checkin
            .checked_add(wait)
            .unwrap_or(self.last_checkin);
    }

    fn accept(&mut self, result: TaskResult) -> bool {
        if self.in_flight.remove(&result.task_id).is_none() {
            return false;
        }
        self.completed.insert(
            result.task_id.clone(),
            Completed {
                result,
                at: Instant::now(),
            },
        );
        true
    }

    fn info(&self) -> BeaconInfo {
        let now = Instant::now();
        let agent = &self.meta.agent;
        BeaconInfo {
            beacon_id: self.meta.beacon_id.clone(),
            name: agent.name.clone(),
            hostname: agent.hostname.clone(),
            username: agent.username.clone(),
            os: agent.os.clone(),
            arch: agent.arch.clone(),
            transport: agent.transport.clone(),
            remote_address: agent.remote_address.clone(),
            pid: agent.pid,
            interval_secs: self.meta.interval_secs,
            jitter_secs: self.meta.jitter_secs,
            last_checkin_secs: now.duration_since(self.last_checkin).as_secs(),
            next_checkin_secs: self.next_checkin.saturating_duration_since(now).as_secs(),
            overdue: now > self.next_checkin,
            queued_tasks: self.queued.len(),
            in_flight_tasks: self.in_flight.len(),
            completed_tasks: self.completed.len(),
        }
    }
}

/// Snapshot of a beacon for listings and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeaconInfo {
    pub beacon_id: String,
    pub name: String,
    pub hostname: String,
    pub username: String,
    pub os: String,
    pub arch: String,
    pub transport: String,
    pub remote_address: String,
    pub pid: i32,
    pub interval_secs: u64,
    pub jitter_secs: u64,
    /// Seconds since the last check-in.
    pub last_checkin_secs: u64,
    /// Seconds until the next expected check-in, zero when overdue.
    pub next_checkin_secs: u64,
    pub overdue: bool,
    pub queued_tasks: usize,
    pub in_flight_tasks: usize,
    pub completed_tasks: usize,
}

/// An in-flight task that never produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LostTask {
    pub beacon_id: String,
    pub task_id: String,
    pub msg_type: MsgType,
}

#[derive(Default)]
pub struct BeaconTaskQueue {
    beacons: RwLock<HashMap<String, Arc<Mutex<BeaconQueue>>>>,
}

impl BeaconTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, beacon_id: &str) -> MuxResult<Arc<Mutex<BeaconQueue>>> {
        self.beacons
            .read()
            .get(beacon_id)
            .cloned()
            .ok_or_else(|| MuxError::BeaconNotFound(beacon_id.to_string()))
    }

    /// Register a beacon, or refresh its metadata if it is already known.
    /// Returns the beacon's snapshot and whether it was new.
    ///
    /// Interval and jitter are clamped to [`MAX_CHECKIN_SECS`].
    pub fn register(&self, mut payload: BeaconRegisterPayload) -> (BeaconInfo, bool) {
        if payload.interval_secs > MAX_CHECKIN_SECS || payload.jitter_secs > MAX_CHECKIN_SECS {
            warn!(
                beacon_id = %payload.beacon_id,
                interval_secs = payload.interval_secs,
                jitter_secs = payload.jitter_secs,
                "check-in schedule out of range, clamping"
            );
            payload.interval_secs = payload.interval_secs.min(MAX_CHECKIN_SECS);
            payload.jitter_secs = payload.jitter_secs.min(MAX_CHECKIN_SECS);
        }
        if let Ok(existing) = self.queue(&payload.beacon_id) {
            let mut queue = existing.lock();
            queue.meta = payload;
            queue.checked_in();
            return (queue.info(), false);
        }

        let beacon_id = payload.beacon_id.clone();
        let mut beacons = self.beacons.write();
        let (queue, is_new) = match beacons.get(&beacon_id) {
            // Registered concurrently between the two lookups.
            Some(existing) => {
                let existing = existing.clone();
                {
                    let mut queue = existing.lock();
                    queue.meta = payload;
                    queue.checked_in();
                }
                (existing, false)
            }
            None => {
                let queue = Arc::new(Mutex::new(BeaconQueue::new(payload)));
                beacons.insert(beacon_id.clone(), queue.clone());
                (queue, true)
            }
        };
        drop(beacons);

        let info = queue.lock().info();
        if is_new {
            info!(beacon_id = %beacon_id, name = %info.name, "beacon registered");
        }
        (info, is_new)
    }

    /// Queue a task for the beacon's next poll. Returns the task ID.
    pub fn enqueue_task(&self, beacon_id: &str, msg_type: MsgType, data: Vec<u8>) -> MuxResult<String> {
        let queue = self.queue(beacon_id)?;
        let id = ids::task_id()?;
        queue.lock().queued.push_back(Task {
            id: id.clone(),
            msg_type,
            data,
        });
        debug!(beacon_id, task_id = %id, msg_type = %msg_type, "task queued");
        Ok(id)
    }

    /// Handle a check-in: accept the results it carries and hand over every
    /// queued task in FIFO order.
    pub fn on_poll(&self, beacon_id: &str, results: Vec<TaskResult>) -> MuxResult<Vec<Task>> {
        let queue = self.queue(beacon_id)?;
        let mut queue = queue.lock();
        queue.checked_in();

        for result in results {
            let task_id = result.task_id.clone();
            if !queue.accept(result) {
                warn!(beacon_id, task_id = %task_id, "result for a task that is not in flight, dropping");
            }
        }

        let now = Instant::now();
        let tasks: Vec<Task> = queue.queued.drain(..).collect();
        for task in &tasks {
            queue.in_flight.insert(
                task.id.clone(),
                InFlight {
                    task: task.clone(),
                    sent_at: now,
                },
            );
        }
        if !tasks.is_empty() {
            debug!(beacon_id, count = tasks.len(), "tasks handed to beacon");
        }
        Ok(tasks)
    }

    /// Accept a single result outside of a poll. Returns false if the task
    /// was not in flight.
    pub fn submit_result(&self, beacon_id: &str, result: TaskResult) -> MuxResult<bool> {
        let queue = self.queue(beacon_id)?;
        let task_id = result.task_id.clone();
        let accepted = queue.lock().accept(result);
        if !accepted {
            warn!(beacon_id, task_id = %task_id, "result for a task that is not in flight, dropping");
        }
        Ok(accepted)
    }

    /// Collect a completed result, removing it from the beacon.
    pub fn take_result(&self, beacon_id: &str, task_id: &str) -> MuxResult<Option<TaskResult>> {
        let queue = self.queue(beacon_id)?;
        let result = queue.lock().completed.remove(task_id).map(|c| c.result);
        Ok(result)
    }

    /// Drop every completed result nobody collected within `timeout`.
    /// Returns how many were dropped.
    pub fn expire_results(&self, timeout: Duration) -> usize {
        let queues: Vec<_> = self.beacons.read().values().cloned().collect();
        let mut dropped = 0;
        for queue in queues {
            let mut queue = queue.lock();
            let before = queue.completed.len();
            queue.completed.retain(|_, c| c.at.elapsed() < timeout);
            let expired = before - queue.completed.len();
            if expired > 0 {
                info!(beacon_id = %queue.meta.beacon_id, count = expired, "uncollected task results expired");
                dropped += expired;
            }
        }
        dropped
    }

    /// Report and forget every in-flight task older than `timeout`.
    pub fn expire_lost(&self, timeout: Duration) -> Vec<LostTask> {
        let queues: Vec<_> = self.beacons.read().values().cloned().collect();
        let mut lost = Vec::new();
        for queue in queues {
            let mut queue = queue.lock();
            let beacon_id = queue.meta.beacon_id.clone();
            let expired: Vec<String> = queue
                .in_flight
                .iter()
                .filter(|(_, f)| f.sent_at.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in expired {
                if let Some(flight) = queue.in_flight.remove(&task_id) {
                    warn!(beacon_id = %beacon_id, task_id = %task_id, msg_type = %flight.task.msg_type, "beacon task lost");
                    lost.push(LostTask {
                        beacon_id: beacon_id.clone(),
                        task_id,
                        msg_type: flight.task.msg_type,
                    });
                }
            }
        }
        lost
    }

    pub fn get(&self, beacon_id: &str) -> Option<BeaconInfo> {
        self.queue(beacon_id).ok().map(|q| q.lock().info())
    }

    pub fn list(&self) -> Vec<BeaconInfo> {
        let queues: Vec<_> = self.beacons.read().values().cloned().collect();
        let mut infos: Vec<BeaconInfo> = queues.iter().map(|q| q.lock().info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.beacon_id.cmp(&b.beacon_id)));
        infos
    }

    /// Forget a beacon along with its queued tasks and unread results.
    pub fn remove(&self, beacon_id: &str) -> Option<BeaconInfo> {
        let queue = self.beacons.write().remove(beacon_id)?;
        let info = queue.lock().info();
        info!(beacon_id, "beacon removed");
        Some(info)
    }

    pub fn len(&self) -> usize {
        self.beacons.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use c2mux_core::messages::RegisterPayload;

    fn beacon(id: &str) -> BeaconRegisterPayload {
        BeaconRegisterPayload {
            beacon_id: id.into(),
            interval_secs: 60,
            jitter_secs: 10,
            agent: RegisterPayload {
                name: "SLOW_OTTER".into(),
                os: "linux".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn poll_drains_in_fifo_order() {
        let q = BeaconTaskQueue::new();
        q.register(beacon("b1"));
        let t1 = q.enqueue_task("b1", MsgType(0x100), b"ls".to_vec()).unwrap();
        let t2 = q.enqueue_task("b1", MsgType(0x101), b"ps".to_vec()).unwrap();

        let tasks = q.on_poll("b1", vec![]).unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![t1, t2]);

        // Delivered at most once.
        assert!(q.on_poll("b1", vec![]).unwrap().is_empty());
    }

    #[test]
    fn tasks_enqueued_after_a_poll_wait_for_the_next() {
        let q = BeaconTaskQueue::new();
        q.register(beacon("b1"));
        q.enqueue_task("b1", MsgType(0x100), vec![]).unwrap();
        assert_eq!(q.on_poll("b1", vec![]).unwrap().len(), 1);

        let late = q.enqueue_task("b1", MsgType(0x100), vec![]).unwrap();
        let next = q.on_poll("b1", vec![]).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, late);
    }

    #[test]
    fn results_complete_in_flight_tasks() {
        let q = BeaconTaskQueue::new();
        q.register(beacon("b1"));
        let id = q.enqueue_task("b1", MsgType(0x100), vec![]).unwrap();
        q.on_poll("b1", vec![]).unwrap();

        let result = TaskResult {
            task_id: id.clone(),
            data: b"ok".to_vec(),
        };
        q.on_poll("b1", vec![result.clone()]).unwrap();
        assert_eq!(q.get("b1").unwrap().in_flight_tasks, 0);
        assert_eq!(q.take_result("b1", &id).unwrap(), Some(result.clone()));
        assert_eq!(q.take_result("b1", &id).unwrap(), None);

        // A second copy of the same result is not accepted.
        assert!(!q.submit_result("b1", result).unwrap());
    }

    #[test]
    fn lost_tasks_are_expired_not_redelivered() {
        let q = BeaconTaskQueue::new();
        q.register(beacon("b1"));
        let id = q.enqueue_task("b1", MsgType(0x100), vec![]).unwrap();
        q.on_poll("b1", vec![]).unwrap();

        assert!(q.expire_lost(Duration::from_secs(3600)).is_empty());
        let lost = q.expire_lost(Duration::ZERO);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].task_id, id);
        assert!(q.on_poll("b1", vec![]).unwrap().is_empty());
        assert_eq!(q.get("b1").unwrap().in_flight_tasks, 0);
    }

    #[test]
    fn registration_is_an_upsert() {
        let q = BeaconTaskQueue::new();
        let (_, new) = q.register(beacon("b1"));
        assert!(new);
        q.enqueue_task("b1", MsgType(0x100), vec![]).unwrap();

        let mut again = beacon("b1");
        again.agent.hostname = "renamed".into();
        let (info, new) = q.register(again);
        assert!(!new);
        assert_eq!(info.hostname, "renamed");
        assert_eq!(info.queued_tasks, 1);
        assert!(info.next_checkin_secs <= 70);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn oversized_schedules_are_clamped() {
        let q = BeaconTaskQueue::new();
        let mut huge = beacon("b1");
        huge.interval_secs = u64::MAX;
        huge.jitter_secs = u64::MAX;
        let (info, _) = q.register(huge.clone());
        assert_eq!(info.interval_secs, MAX_CHECKIN_SECS);
        assert_eq!(info.jitter_secs, MAX_CHECKIN_SECS);
        assert!(!info.overdue);

        // The stored schedule stays usable for later check-ins and re-registration.
        assert!(q.on_poll("b1", vec![]).unwrap().is_empty());
        let (info, new) = q.register(huge);
        assert!(!new);
        assert!(info.next_checkin_secs <= 2 * MAX_CHECKIN_SECS);
    }

    #[test]
    fn uncollected_results_expire() {
        let q = BeaconTaskQueue::new();
        q.register(beacon("b1"));
        let id = q.enqueue_task("b1", MsgType(0x100), vec![]).unwrap();
        q.on_poll("b1", vec![]).unwrap();
        q.on_poll(
            "b1",
            vec![TaskResult {
                task_id: id.clone(),
                data: b"ok".to_vec(),
            }],
        )
        .unwrap();

        assert_eq!(q.expire_results(Duration::from_secs(3600)), 0);
        assert_eq!(q.get("b1").unwrap().completed_tasks, 1);
        assert_eq!(q.expire_results(Duration::ZERO), 1);
        assert_eq!(q.get("b1").unwrap().completed_tasks, 0);
        assert_eq!(q.take_result("b1", &id).unwrap(), None);
    }

    #[test]
    fn unknown_beacons_are_errors() {
        let q = BeaconTaskQueue::new();
        assert!(matches!(
            q.enqueue_task("nope", MsgType(0x100), vec![]),
            Err(MuxError::BeaconNotFound(_))
        ));
        assert!(matches!(q.on_poll("nope", vec![]), Err(MuxError::BeaconNotFound(_))));
        assert!(q.remove("nope").is_none());
    }
}
