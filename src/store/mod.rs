//! The Store Gateway — `spec.md` §4.1.
//!
//! `StoreGateway` is the only door the rest of the core has onto the backing
//! database. Nothing outside this module ever formulates a query; the
//! Aggregator, Pipeline, and Controller only call these semantic operations.
//! Two implementations: [`postgres::PostgresStore`] (production, `sqlx`) and
//! [`fake::FakeStore`] (in-memory, used by `tests/` and the unit tests in
//! `controller.rs`/`aggregator.rs`/`pipeline.rs`) — the same split the teacher
//! draws between `db::Database` (real) and the `CoordinationClient` trait
//! that lets search code run against either an HTTP coordinator or Postgres.

pub mod fake;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AckMap, GoalStateMap, Heartbeat, OutgoingCommand, QueuedCommand, RunDoc, RunModeDoc, RunRate,
};

/// Priority, 0 (lowest) through 4 (highest) — `spec.md` §6's log shape.
pub type LogPriority = u8;

/// The rate-limit key for `write_log` — `spec.md` §4.1: each kind has its own
/// minimum inter-emission interval (`ARM_TIMEOUT`/`START_TIMEOUT` unthrottled,
/// `STOP_TIMEOUT` 900s by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    ArmTimeout,
    StartTimeout,
    StopTimeout,
    HostDisagreement,
    ModeNotFound,
}

impl ErrorType {
    /// `None` means unthrottled.
    pub fn min_interval(self) -> Option<chrono::Duration> {
        match self {
            ErrorType::ArmTimeout | ErrorType::StartTimeout => None,
            ErrorType::StopTimeout => Some(chrono::Duration::seconds(900)),
            ErrorType::HostDisagreement | ErrorType::ModeNotFound => {
                Some(chrono::Duration::seconds(60))
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::ArmTimeout => "ARM_TIMEOUT",
            ErrorType::StartTimeout => "START_TIMEOUT",
            ErrorType::StopTimeout => "STOP_TIMEOUT",
            ErrorType::HostDisagreement => "HOST_DISAGREEMENT",
            ErrorType::ModeNotFound => "MODE_NOT_FOUND",
        }
    }
}

/// The aggregate-status snapshot written once per detector per tick
/// (`spec.md` §3's "Aggregated status", persisted verbatim).
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub detector: String,
    pub status: crate::model::Status,
    pub run_number: Option<i64>,
    pub mode: Option<String>,
    pub rate: f64,
    pub buffer_bytes: i64,
    pub pll_unlocks: i32,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Most recent goal-state document per `(detector, key)`; `None` for a
    /// detector missing any of the required keys (`spec.md` §4.1).
    async fn read_goal_state(&self) -> Result<GoalStateMap>;

    /// Most recent heartbeat per host in `expected_hosts`, with `age_seconds`
    /// derived from `recorded_at` relative to `now`.
    async fn read_heartbeats(
        &self,
        expected_hosts: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>>;

    /// Merged run-mode recipe: `includes` folded left-to-right, base overlaid
    /// last. `Err(ModeNotFound)` / `Err(ModeIncludeMissing)` per `spec.md`.
    async fn read_run_mode(&self, name: &str) -> Result<RunModeDoc>;

    /// `max(run.number)+1`, or `Some(0)` if the `runs` table is empty, or
    /// `None` (the `NO_NEW_RUN` sentinel) on transient failure.
    async fn allocate_run_number(&self) -> Result<Option<i64>>;

    /// Write a command to `outgoing_commands`, returning its row id.
    async fn publish_command(&self, cmd: &OutgoingCommand) -> Result<i64>;

    /// Record the most recently published command's id for `(detector,
    /// command)`, used for ack lookups (`spec.md`'s "command tracker").
    async fn write_ack_lookup(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
        id: i64,
    ) -> Result<()>;

    /// Current `acknowledged` map of the tracked command for `(detector,
    /// command)`, or `None` if nothing has ever been published.
    async fn read_ack(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
    ) -> Result<Option<AckMap>>;

    /// Ack time of a single host within the tracked command for `(detector,
    /// command)` — used by run-start/run-end bookkeeping to read the crate
    /// controller's ack time specifically.
    async fn read_ack_time(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
        host: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Every command currently tracked for `detector` — at most one per kind,
    /// per `spec.md` §3's I3 — with its publish time and ack map. Used by the
    /// Aggregator to detect condition (b) of `spec.md` §4.2's timeout-action
    /// signal: a TPC host with an unacknowledged outstanding command older
    /// than `client_timeout`.
    async fn read_tracked_commands(
        &self,
        detector: &str,
    ) -> Result<Vec<(crate::model::CommandKind, DateTime<Utc>, AckMap)>>;

    async fn create_run_doc(&self, doc: &RunDoc) -> Result<()>;
    async fn set_run_end(&self, number: i64, end_time: DateTime<Utc>, messy: bool) -> Result<()>;
    async fn annotate_run_rate(&self, number: i64, rate: RunRate) -> Result<()>;
    async fn set_run_start(&self, number: i64, start_time: DateTime<Utc>, messy: bool) -> Result<()>;
    async fn get_run_start(&self, number: i64) -> Result<Option<DateTime<Utc>>>;

    async fn write_aggregate_snapshot(&self, snap: &AggregateSnapshot) -> Result<()>;

    /// Average/max `rate` across aggregate snapshots tagged with `run_number`.
    async fn aggregate_run_rate(&self, run_number: i64) -> Result<Option<RunRate>>;

    /// Rate-limited by `error_type`; drops silently (debug-logged by the
    /// caller) when within the throttle window.
    async fn write_log(&self, message: &str, priority: LogPriority, error_type: ErrorType) -> Result<()>;

    /// Persist a queued command so a restart doesn't lose it (`spec.md` §4.3,
    /// §5's restart-survival requirement).
    async fn enqueue_durable(&self, cmd: &QueuedCommand) -> Result<i64>;
    /// Delete a durable queue row once its publish has succeeded.
    async fn dequeue_durable(&self, id: i64) -> Result<()>;
    /// Everything still pending in `command_queue`, used to rebuild the
    /// in-memory heap on startup.
    async fn load_durable_queue(&self) -> Result<Vec<(i64, QueuedCommand)>>;
}
