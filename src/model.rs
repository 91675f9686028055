//! Core data model — `spec.md` §3.
//!
//! Plain data, no I/O. Everything here is `Serialize`/`Deserialize` so it can
//! cross the `StoreGateway` boundary, and `Clone` so the Controller can hold
//! its own copy of a tick's inputs independent of what the Aggregator does
//! with its own afterwards.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One host's (or a folded detector's) observed state. Priority order for
/// folding (`spec.md` §4.2) is `ARMING > ERROR > TIMEOUT > UNKNOWN`, which is
/// *not* declaration order, so this type intentionally does not derive `Ord`
/// — see `status::fold_statuses`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Idle,
    Arming,
    Armed,
    Running,
    Error,
    Timeout,
    Unknown,
}

impl Status {
    /// Parse the integer enum a heartbeat document carries in its `status`
    /// field. Unrecognized values surface as `None` rather than panicking —
    /// callers promote a parse failure to `Status::Unknown` via
    /// `HostStatusParseError`, per `spec.md` §7.
    pub fn from_raw(v: i32) -> Option<Status> {
        match v {
            0 => Some(Status::Idle),
            1 => Some(Status::Arming),
            2 => Some(Status::Armed),
            3 => Some(Status::Running),
            4 => Some(Status::Error),
            5 => Some(Status::Timeout),
            6 => Some(Status::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Idle => "IDLE",
            Status::Arming => "ARMING",
            Status::Armed => "ARMED",
            Status::Running => "RUNNING",
            Status::Error => "ERROR",
            Status::Timeout => "TIMEOUT",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// The three commands the Controller ever issues. A closed enum in place of
/// the original's bare `str` command names rules out typos at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Arm,
    Start,
    Stop,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandKind::Arm => "arm",
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// A host's role within its physical detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRole {
    Reader,
    Controller,
}

/// The static, config-loaded host → physical-detector mapping (`spec.md`
/// §3's "Host" / "PhysicalDetector"). Built once from `MasterDAQConfig` and
/// never mutated at runtime (I1: exactly one physical detector per host).
#[derive(Debug, Clone, Default)]
pub struct HostTopology {
    pub detectors: HashMap<String, PhysicalDetector>,
    /// host name -> owning physical detector name, the inverse index used
    /// throughout the Aggregator.
    pub host_detector: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PhysicalDetector {
    pub readers: Vec<String>,
    pub controllers: Vec<String>,
}

impl HostTopology {
    pub fn from_master_config(cfg: &HashMap<String, PhysicalDetector>) -> Self {
        let mut host_detector = HashMap::new();
        for (det, pd) in cfg {
            for h in pd.readers.iter().chain(pd.controllers.iter()) {
                host_detector.insert(h.clone(), det.clone());
            }
        }
        HostTopology {
            detectors: cfg.clone(),
            host_detector,
        }
    }

    pub fn detector_of(&self, host: &str) -> Option<&str> {
        self.host_detector.get(host).map(String::as_str)
    }
}

/// One parsed heartbeat document (`node_status` collection, `spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub host: String,
    pub status_raw: i32,
    pub rate: f64,
    pub buffer_size: i64,
    pub pll: i32,
    pub mode: Option<String>,
    pub number: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

/// The goal state for one detector (`spec.md` §3's `GoalState[detector]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalState {
    pub active: bool,
    pub mode: String,
    pub user: String,
    pub comment: Option<String>,
    pub stop_after: Option<i64>,
    pub finish_run_on_stop: bool,
    pub written_at: DateTime<Utc>,
}

pub type GoalStateMap = HashMap<String, GoalState>;

/// Aggregated status for one (possibly super-) detector (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStatus {
    pub detector: String,
    pub status: Status,
    pub run_number: Option<i64>,
    pub mode: Option<String>,
    pub rate: f64,
    pub buffer_bytes: i64,
    pub pll_unlocks: i32,
    pub timestamp: DateTime<Utc>,
}

pub type AggregatedStatusMap = HashMap<String, AggregatedStatus>;

/// A board entry in a run mode's `boards` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub host: String,
    #[serde(rename = "type")]
    pub board_type: String,
}

/// A run-mode recipe after include-merging (`spec.md` §3's `RunModeDoc`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunModeDoc {
    pub name: String,
    pub detectors: Vec<String>,
    pub boards: Vec<Board>,
    #[serde(default)]
    pub includes: Vec<String>,
    /// Caller-defined extras (e.g. `source`, `strax_output_path`) preserved
    /// verbatim into the run doc's `daq_config`, per `spec.md` §6.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `host -> ack timestamp`, `0`/absent meaning "not yet acknowledged" —
/// `spec.md` §3's `acknowledged` map. Modeled as `Option<DateTime<Utc>>`
/// rather than the original's sentinel `0` integer.
pub type AckMap = HashMap<String, Option<DateTime<Utc>>>;

/// A command written to `outgoing_commands` (`spec.md` §3's
/// `OutgoingCommand`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingCommand {
    pub command: CommandKind,
    pub detector: String,
    pub mode: String,
    pub user: String,
    pub hosts: Vec<String>,
    pub acknowledged: AckMap,
    pub created_at: DateTime<Utc>,
    pub options_override: Option<serde_json::Value>,
}

impl OutgoingCommand {
    /// A command is acknowledged by the detector once every host in
    /// `hosts` has a non-`None` entry in `acknowledged` (`spec.md` §3).
    pub fn acknowledged_by_detector(&self) -> bool {
        self.hosts
            .iter()
            .all(|h| matches!(self.acknowledged.get(h), Some(Some(_))))
    }
}

/// A command still waiting in the internal pipeline queue (`spec.md` §3's
/// `QueuedCommand`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub command: CommandKind,
    pub detector: String,
    pub mode: String,
    pub user: String,
    pub hosts: Vec<String>,
    pub options_override: Option<serde_json::Value>,
    pub due_at: DateTime<Utc>,
    /// Whether `hosts` includes a crate-controller host. A split `stop`
    /// (`spec.md` §4.3) queues the controller group and the reader group as
    /// two separate documents; only the one carrying the crate controller
    /// should ever be recorded as the `(detector, command)` ack-lookup
    /// target, or a later reader-only publish overwrites it.
    pub has_controller_host: bool,
}

/// A run document (`spec.md` §3's `RunDoc`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDoc {
    pub number: i64,
    pub detectors: Vec<String>,
    pub user: String,
    pub mode: String,
    pub daq_config: RunModeDoc,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub tags: Vec<RunTag>,
    pub comments: Vec<RunComment>,
    pub rate: Option<RunRate>,
    pub data: Vec<RunDataEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTag {
    pub name: String,
    pub user: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComment {
    pub user: String,
    pub date: DateTime<Utc>,
    pub comment: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunRate {
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDataEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub location: String,
}

/// A single host's classified status plus the raw heartbeat it came from,
/// used internally by the Aggregator while folding (`spec.md` §4.2).
#[derive(Debug, Clone)]
pub struct HostStatus {
    pub host: String,
    pub status: Status,
    pub heartbeat: Option<Heartbeat>,
    pub age_seconds: Option<f64>,
}
