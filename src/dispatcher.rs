//! Ties the Aggregator, Controller and Pipeline together into the
//! fixed-period reconciliation loop `spec.md` §2 and §5 describe. Mirrors the
//! teacher's `Fleet` poll loop shape (read state, prune/classify, act, sleep)
//! but split across the three collaborators those modules already own.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::controller::Controller;
use crate::error::Result;
use crate::metrics::{CommandLabel, ErrorLabel, Metrics};
use crate::model::{AckMap, OutgoingCommand, QueuedCommand, RunDoc, RunModeDoc, RunRate};
use crate::store::{AggregateSnapshot, ErrorType, LogPriority, StoreGateway};

/// Runs `Aggregator::tick` then `Controller::tick` once per `poll_frequency`
/// seconds until `stop` is flipped. Each pass re-reads goal state fresh
/// (`spec.md` §4.1: goal state is the only externally-mutated input besides
/// heartbeats), so an operator's write is visible on the very next tick.
pub async fn run_reconciliation_loop(
    store: Arc<dyn StoreGateway>,
    aggregator: Aggregator,
    mut controller: Controller,
    metrics: Arc<Metrics>,
    poll_frequency: u64,
    stop: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_frequency.max(1)));
    info!(poll_frequency, "reconciliation loop starting");
    loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        interval.tick().await;
        let tick_start = std::time::Instant::now();
        let now = Utc::now();

        let goal = match store.read_goal_state().await {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "failed to read goal state, skipping tick");
                metrics
                    .aggregation_errors
                    .get_or_create(&ErrorLabel {
                        error_type: "goal_state_read".to_string(),
                    })
                    .inc();
                continue;
            }
        };

        let run_modes = match load_run_modes(store.as_ref(), &goal).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to load run modes, skipping tick");
                continue;
            }
        };

        let result = match aggregator.tick(store.as_ref(), &goal, &run_modes, now).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "aggregation tick failed");
                metrics
                    .aggregation_errors
                    .get_or_create(&ErrorLabel {
                        error_type: "aggregation".to_string(),
                    })
                    .inc();
                continue;
            }
        };

        for action in &result.timeout_actions {
            warn!(host = %action.host, reason = ?action.reason, "TPC host exceeded timeout-action threshold");
        }

        metrics.detectors_tracked.set(result.statuses.len() as i64);

        controller.tick(&result.statuses, &goal, now).await;
        metrics.queue_depth.set(controller.queue_depth().await as i64);

        metrics.ticks_run.inc();
        metrics
            .tick_duration_ms
            .set(tick_start.elapsed().as_secs_f64() * 1000.0);
    }
    info!("reconciliation loop stopped");
}

/// Every mode any detector's goal state currently names, resolved (with
/// includes merged) through the store. A detector whose mode fails to
/// resolve is simply absent from the map — the Aggregator already treats a
/// missing mode as "skip this detector" for the tick.
async fn load_run_modes(
    store: &dyn StoreGateway,
    goal: &crate::model::GoalStateMap,
) -> crate::error::Result<HashMap<String, RunModeDoc>> {
    let mut modes = HashMap::new();
    let mut names: Vec<&String> = goal.values().map(|g| &g.mode).collect();
    names.sort();
    names.dedup();
    for name in names {
        match store.read_run_mode(name).await {
            Ok(doc) => {
                modes.insert(name.clone(), doc);
            }
            Err(e) => {
                warn!(mode = %name, error = %e, "run mode failed to resolve");
            }
        }
    }
    Ok(modes)
}

/// Wraps a [`StoreGateway`] to bump `dispatcher_commands_sent` on every
/// publish without threading a `Metrics` handle through the Pipeline or
/// Controller — the same decorator shape the teacher reaches for when a
/// cross-cutting concern (there, request logging) shouldn't live inside the
/// thing it's observing.
pub struct MeteredStore {
    inner: Arc<dyn StoreGateway>,
    metrics: Arc<Metrics>,
}

impl MeteredStore {
    pub fn new(inner: Arc<dyn StoreGateway>, metrics: Arc<Metrics>) -> Arc<dyn StoreGateway> {
        Arc::new(MeteredStore { inner, metrics })
    }
}

#[async_trait]
impl StoreGateway for MeteredStore {
    async fn read_goal_state(&self) -> Result<crate::model::GoalStateMap> {
        self.inner.read_goal_state().await
    }

    async fn read_heartbeats(
        &self,
        expected_hosts: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<crate::model::Heartbeat>> {
        self.inner.read_heartbeats(expected_hosts, now).await
    }

    async fn read_run_mode(&self, name: &str) -> Result<RunModeDoc> {
        self.inner.read_run_mode(name).await
    }

    async fn allocate_run_number(&self) -> Result<Option<i64>> {
        self.inner.allocate_run_number().await
    }

    async fn publish_command(&self, cmd: &OutgoingCommand) -> Result<i64> {
        let id = self.inner.publish_command(cmd).await?;
        self.metrics
            .commands_sent
            .get_or_create(&CommandLabel {
                command: cmd.command.to_string(),
            })
            .inc();
        Ok(id)
    }

    async fn write_ack_lookup(&self, detector: &str, command: crate::model::CommandKind, id: i64) -> Result<()> {
        self.inner.write_ack_lookup(detector, command, id).await
    }

    async fn read_ack(&self, detector: &str, command: crate::model::CommandKind) -> Result<Option<AckMap>> {
        self.inner.read_ack(detector, command).await
    }

    async fn read_ack_time(
        &self,
        detector: &str,
        command: crate::model::CommandKind,
        host: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.read_ack_time(detector, command, host).await
    }

    async fn read_tracked_commands(
        &self,
        detector: &str,
    ) -> Result<Vec<(crate::model::CommandKind, DateTime<Utc>, AckMap)>> {
        self.inner.read_tracked_commands(detector).await
    }

    async fn create_run_doc(&self, doc: &RunDoc) -> Result<()> {
        self.inner.create_run_doc(doc).await
    }

    async fn set_run_end(&self, number: i64, end_time: DateTime<Utc>, messy: bool) -> Result<()> {
        self.inner.set_run_end(number, end_time, messy).await
    }

    async fn annotate_run_rate(&self, number: i64, rate: RunRate) -> Result<()> {
        self.inner.annotate_run_rate(number, rate).await
    }

    async fn set_run_start(&self, number: i64, start_time: DateTime<Utc>, messy: bool) -> Result<()> {
        self.inner.set_run_start(number, start_time, messy).await
    }

    async fn get_run_start(&self, number: i64) -> Result<Option<DateTime<Utc>>> {
        self.inner.get_run_start(number).await
    }

    async fn write_aggregate_snapshot(&self, snap: &AggregateSnapshot) -> Result<()> {
        self.inner.write_aggregate_snapshot(snap).await
    }

    async fn aggregate_run_rate(&self, run_number: i64) -> Result<Option<RunRate>> {
        self.inner.aggregate_run_rate(run_number).await
    }

    async fn write_log(&self, message: &str, priority: LogPriority, error_type: ErrorType) -> Result<()> {
        self.inner.write_log(message, priority, error_type).await
    }

    async fn enqueue_durable(&self, cmd: &QueuedCommand) -> Result<i64> {
        self.inner.enqueue_durable(cmd).await
    }

    async fn dequeue_durable(&self, id: i64) -> Result<()> {
        self.inner.dequeue_durable(id).await
    }

    async fn load_durable_queue(&self) -> Result<Vec<(i64, QueuedCommand)>> {
        self.inner.load_durable_queue().await
    }
}
