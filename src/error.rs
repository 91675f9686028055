//! Error kinds for the dispatcher core.
//!
//! Mirrors `spec.md` §7: storage faults are always transient and recovered
//! locally (skip the tick / drop the write), everything else is a named
//! condition the Controller or Aggregator reacts to explicitly. Nothing here
//! is fatal — only startup misconfiguration (see `config.rs`) aborts the
//! process.

use thiserror::Error;

use crate::model::CommandKind;

#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Any storage read/write fault (connectivity, serialization, timeout).
    /// Callers skip the current tick on a read, or drop the write and log at
    /// debug — this variant is never escalated to an operator.
    #[error("transient store error: {0}")]
    TransientStore(#[source] sqlx::Error),

    /// `read_run_mode` was asked for a name that doesn't exist in
    /// `run_mode_options`.
    #[error("run mode '{0}' not found")]
    ModeNotFound(String),

    /// A run mode's `includes` list names a mode that doesn't exist.
    #[error("run mode '{mode}' includes missing mode '{missing}'")]
    ModeIncludeMissing { mode: String, missing: String },

    /// A heartbeat document's `status` field didn't parse into a known
    /// `Status` value. The offending host is reported as `UNKNOWN`; this
    /// error is informational only.
    #[error("host '{0}' sent an unparseable status")]
    HostStatusParseError(String),

    /// Normal back-pressure: a command was gated off by its cooldown or the
    /// minimum inter-command gap. Not an error condition, debug-logged only.
    #[error("{command:?} to '{detector}' blocked by cooldown")]
    CommandCooldownBlock {
        command: CommandKind,
        detector: String,
    },

    /// `stop` has been retried `RetryReset` times without the detector
    /// returning to `IDLE`.
    #[error("'{0}' stop retries exhausted")]
    StopStuck(String),

    /// An `arm` stayed in `ARMING` past `ArmCommandTimeout`.
    #[error("'{0}' arm timed out")]
    ArmTimeout(String),

    /// A `start` stayed unacknowledged past `StartCommandTimeout`.
    #[error("'{0}' start timed out")]
    StartTimeout(String),

    /// A detector's hosts disagree on `mode` or run `number`.
    #[error("'{detector}' hosts disagree: {detail}")]
    HostDisagreement { detector: String, detail: String },
}

impl From<sqlx::Error> for DispatcherError {
    fn from(e: sqlx::Error) -> Self {
        DispatcherError::TransientStore(e)
    }
}

pub type Result<T> = std::result::Result<T, DispatcherError>;
