//! In-memory `StoreGateway` used by unit tests and the `tests/` scenario
//! suite. No I/O, no `sqlx` — lets the Controller/Aggregator/Pipeline be
//! driven deterministically without a database, the same role the teacher's
//! `CoordinationClient` trait plays for search code that can run against
//! either an HTTP coordinator or Postgres directly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AckMap, GoalState, GoalStateMap, Heartbeat, OutgoingCommand, QueuedCommand, RunDoc, RunModeDoc,
    RunRate,
};

use super::{AggregateSnapshot, ErrorType, LogPriority, StoreGateway};

#[derive(Debug, Clone)]
pub struct LoggedEntry {
    pub message: String,
    pub priority: LogPriority,
    pub error_type: ErrorType,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    goal_state: GoalStateMap,
    heartbeats: HashMap<String, Heartbeat>,
    run_modes: HashMap<String, RunModeDoc>,
    runs: HashMap<i64, RunDoc>,
    /// Keyed by the same id `publish_command` hands back, not by vector
    /// position — `next_id` is shared with `enqueue_durable`, so ids are not
    /// contiguous indices into a plain `Vec`.
    outgoing: HashMap<i64, OutgoingCommand>,
    /// `(detector, command)` -> id of the tracked row in `outgoing`.
    ack_lookup: HashMap<(String, crate::model::CommandKind), i64>,
    snapshots: Vec<AggregateSnapshot>,
    logs: Vec<LoggedEntry>,
    last_log_at: HashMap<ErrorType, DateTime<Utc>>,
    durable_queue: HashMap<i64, QueuedCommand>,
    next_id: i64,
}

/// Fully in-memory, `Mutex`-guarded store. Test code reaches past the
/// `StoreGateway` trait into the inherent methods (`set_goal_state`,
/// `set_heartbeat`, `outgoing_commands`, ...) to arrange scenarios and make
/// assertions; production code only ever sees the trait.
pub struct FakeStore {
    inner: Mutex<Inner>,
    /// Injected clock so `write_log`'s rate limiting and `read_heartbeats`'s
    /// `age_seconds` can be driven by the test harness's `now`, matching
    /// `spec.md`'s "clock-controlled harness" in §8.
    pub now: Mutex<DateTime<Utc>>,
}

impl FakeStore {
    pub fn new(now: DateTime<Utc>) -> Self {
        FakeStore {
            inner: Mutex::new(Inner::default()),
            now: Mutex::new(now),
        }
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) -> DateTime<Utc> {
        let mut n = self.now.lock().unwrap();
        *n += delta;
        *n
    }

    pub fn set_goal_state(&self, detector: &str, goal: GoalState) {
        self.inner
            .lock()
            .unwrap()
            .goal_state
            .insert(detector.to_string(), goal);
    }

    pub fn set_heartbeat(&self, hb: Heartbeat) {
        self.inner
            .lock()
            .unwrap()
            .heartbeats
            .insert(hb.host.clone(), hb);
    }

    pub fn set_run_mode(&self, doc: RunModeDoc) {
        self.inner
            .lock()
            .unwrap()
            .run_modes
            .insert(doc.name.clone(), doc);
    }

    pub fn seed_run_number(&self, number: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.runs.insert(
            number,
            RunDoc {
                number,
                detectors: vec![],
                user: String::new(),
                mode: String::new(),
                daq_config: RunModeDoc::default(),
                start: None,
                end: None,
                tags: vec![],
                comments: vec![],
                rate: None,
                data: vec![],
            },
        );
    }

    pub fn outgoing_commands(&self) -> Vec<OutgoingCommand> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<&i64> = inner.outgoing.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| inner.outgoing[id].clone()).collect()
    }

    pub fn run_doc(&self, number: i64) -> Option<RunDoc> {
        self.inner.lock().unwrap().runs.get(&number).cloned()
    }

    pub fn logs(&self) -> Vec<LoggedEntry> {
        self.inner.lock().unwrap().logs.clone()
    }

    pub fn durable_queue_len(&self) -> usize {
        self.inner.lock().unwrap().durable_queue.len()
    }

    /// Mark host `h`'s entry in the tracked `(detector, command)` as
    /// acknowledged at `at` — simulates the reader/crate-controller
    /// acknowledging the command asynchronously.
    pub fn ack_host(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
        host: &str,
        at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.ack_lookup.get(&(detector.to_string(), command)) {
            if let Some(cmd) = inner.outgoing.get_mut(&id) {
                cmd.acknowledged.insert(host.to_string(), Some(at));
            }
        }
    }
}

#[async_trait]
impl StoreGateway for FakeStore {
    async fn read_goal_state(&self) -> Result<GoalStateMap> {
        Ok(self.inner.lock().unwrap().goal_state.clone())
    }

    async fn read_heartbeats(
        &self,
        expected_hosts: &[String],
        _now: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>> {
        let inner = self.inner.lock().unwrap();
        Ok(expected_hosts
            .iter()
            .filter_map(|h| inner.heartbeats.get(h).cloned())
            .collect())
    }

    async fn read_run_mode(&self, name: &str) -> Result<RunModeDoc> {
        let inner = self.inner.lock().unwrap();
        let base = inner
            .run_modes
            .get(name)
            .ok_or_else(|| crate::error::DispatcherError::ModeNotFound(name.to_string()))?;
        let includes: Vec<(String, Option<serde_json::Value>)> = base
            .includes
            .iter()
            .map(|inc| {
                let doc = inner.run_modes.get(inc).map(|d| serde_json::to_value(d).unwrap());
                (inc.clone(), doc)
            })
            .collect();
        let base_value = serde_json::to_value(base).unwrap();
        let merged = crate::run_mode::merge_run_mode_docs(name, base_value, includes)?;
        crate::run_mode::parse_run_mode_doc(name, merged)
    }

    async fn allocate_run_number(&self) -> Result<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(Some(inner.runs.keys().max().copied().map_or(0, |m| m + 1)))
    }

    async fn publish_command(&self, cmd: &OutgoingCommand) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.outgoing.insert(id, cmd.clone());
        Ok(id)
    }

    async fn write_ack_lookup(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
        id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .ack_lookup
            .insert((detector.to_string(), command), id);
        Ok(())
    }

    async fn read_ack(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
    ) -> Result<Option<AckMap>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ack_lookup
            .get(&(detector.to_string(), command))
            .and_then(|id| inner.outgoing.get(id))
            .map(|c| c.acknowledged.clone()))
    }

    async fn read_ack_time(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
        host: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ack_lookup
            .get(&(detector.to_string(), command))
            .and_then(|id| inner.outgoing.get(id))
            .and_then(|c| c.acknowledged.get(host).copied().flatten()))
    }

    async fn read_tracked_commands(
        &self,
        detector: &str,
    ) -> Result<Vec<(crate::model::CommandKind, DateTime<Utc>, AckMap)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ack_lookup
            .iter()
            .filter(|((d, _), _)| d == detector)
            .filter_map(|((_, cmd), id)| {
                inner
                    .outgoing
                    .get(id)
                    .map(|c| (*cmd, c.created_at, c.acknowledged.clone()))
            })
            .collect())
    }

    async fn create_run_doc(&self, doc: &RunDoc) -> Result<()> {
        self.inner.lock().unwrap().runs.insert(doc.number, doc.clone());
        Ok(())
    }

    async fn set_run_end(&self, number: i64, end_time: DateTime<Utc>, messy: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.get_mut(&number) {
            run.end = Some(end_time);
            if messy {
                run.tags.push(crate::model::RunTag {
                    name: "messy".to_string(),
                    user: "dispatcher".to_string(),
                    date: end_time,
                });
            }
        }
        Ok(())
    }

    async fn annotate_run_rate(&self, number: i64, rate: RunRate) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.get_mut(&number) {
            run.rate = Some(rate);
        }
        Ok(())
    }

    async fn set_run_start(&self, number: i64, start_time: DateTime<Utc>, messy: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.get_mut(&number) {
            run.start = Some(start_time);
            if messy {
                run.tags.push(crate::model::RunTag {
                    name: "messy".to_string(),
                    user: "dispatcher".to_string(),
                    date: start_time,
                });
            }
        }
        Ok(())
    }

    async fn get_run_start(&self, number: i64) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .runs
            .get(&number)
            .and_then(|r| r.start))
    }

    async fn write_aggregate_snapshot(&self, snap: &AggregateSnapshot) -> Result<()> {
        self.inner.lock().unwrap().snapshots.push(snap.clone());
        Ok(())
    }

    async fn aggregate_run_rate(&self, run_number: i64) -> Result<Option<RunRate>> {
        let inner = self.inner.lock().unwrap();
        let rates: Vec<f64> = inner
            .snapshots
            .iter()
            .filter(|s| s.run_number == Some(run_number))
            .map(|s| s.rate)
            .collect();
        if rates.is_empty() {
            return Ok(None);
        }
        let avg = rates.iter().sum::<f64>() / rates.len() as f64;
        let max = rates.iter().cloned().fold(f64::MIN, f64::max);
        Ok(Some(RunRate { avg, max }))
    }

    async fn write_log(&self, message: &str, priority: LogPriority, error_type: ErrorType) -> Result<()> {
        let now = *self.now.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if let Some(min_interval) = error_type.min_interval() {
            if let Some(&last) = inner.last_log_at.get(&error_type) {
                if now - last < min_interval {
                    return Ok(());
                }
            }
        }
        inner.last_log_at.insert(error_type, now);
        inner.logs.push(LoggedEntry {
            message: message.to_string(),
            priority,
            error_type,
            at: now,
        });
        Ok(())
    }

    async fn enqueue_durable(&self, cmd: &QueuedCommand) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.durable_queue.insert(id, cmd.clone());
        Ok(id)
    }

    async fn dequeue_durable(&self, id: i64) -> Result<()> {
        self.inner.lock().unwrap().durable_queue.remove(&id);
        Ok(())
    }

    async fn load_durable_queue(&self) -> Result<Vec<(i64, QueuedCommand)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.durable_queue.iter().map(|(&id, c)| (id, c.clone())).collect())
    }
}
