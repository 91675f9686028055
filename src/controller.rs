//! Controller — the reconciliation state machine, `spec.md` §4.4.
//!
//! Runs once per tick for each logical detector, consuming aggregated status
//! and goal state and emitting at most one command (O1). Owns every piece of
//! per-detector mutable state (`error_stop_count`, `can_force_stop`,
//! `last_command_time`, the command tracker) itself, constructed once and
//! never duplicated — `spec.md` §9's "Global mutable state" design note,
//! the same single-owner pattern the teacher's `Fleet` uses for its worker
//! registry instead of reaching for a process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::Cli;
use crate::model::{
    AggregatedStatusMap, CommandKind, GoalStateMap, RunDoc, RunModeDoc, Status,
};
use crate::status::split_hosts_by_type;
use crate::store::{ErrorType, StoreGateway};

use crate::pipeline::Pipeline;

/// Seconds the run-end/run-start bookkeeping tasks wait before reading the
/// crate controller's ack time, per `spec.md` §4.4 ("the crate controller
/// polls on a similar cadence").
const BOOKKEEPING_WAIT: std::time::Duration = std::time::Duration::from_secs(2);
const STOP_DELAY_SECONDS: i64 = 5;

pub struct Controller {
    store: Arc<dyn StoreGateway>,
    pipeline: Arc<Pipeline>,
    digi_type: String,
    cc_type: String,
    arm_timeout: Duration,
    start_timeout: Duration,
    stop_timeout: Duration,
    min_gap: Duration,
    stop_retries: u32,

    error_stop_count: HashMap<String, u32>,
    can_force_stop: HashMap<String, bool>,
    last_command_time: HashMap<(String, CommandKind), DateTime<Utc>>,
    last_emitted_command: HashMap<String, CommandKind>,
    /// Run number allocated by the most recent successful `arm`, reused by
    /// the paired `start`'s run-start bookkeeping and by `stop`'s run-end
    /// bookkeeping, rather than re-deriving it from aggregated status.
    current_run_number: HashMap<String, i64>,
    /// Open Question (d), `spec.md` §9: if `arm`'s enqueue fails after a run
    /// number was already allocated, the next attempt reuses this number
    /// instead of calling `allocate_run_number()` again.
    pending_arm_number: HashMap<String, i64>,
}

impl Controller {
    pub fn new(store: Arc<dyn StoreGateway>, pipeline: Arc<Pipeline>, cli: &Cli) -> Self {
        Controller {
            store,
            pipeline,
            digi_type: "V17".to_string(),
            cc_type: "V2718".to_string(),
            arm_timeout: Duration::seconds(cli.arm_command_timeout as i64),
            start_timeout: Duration::seconds(cli.start_command_timeout as i64),
            stop_timeout: Duration::seconds(cli.stop_command_timeout as i64),
            min_gap: Duration::seconds(cli.time_between_commands as i64),
            stop_retries: cli.retry_reset,
            error_stop_count: HashMap::new(),
            can_force_stop: HashMap::new(),
            last_command_time: HashMap::new(),
            last_emitted_command: HashMap::new(),
            current_run_number: HashMap::new(),
            pending_arm_number: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(store: Arc<dyn StoreGateway>, pipeline: Arc<Pipeline>) -> Self {
        Controller {
            store,
            pipeline,
            digi_type: "f17".to_string(),
            cc_type: "f2718".to_string(),
            arm_timeout: Duration::seconds(30),
            start_timeout: Duration::seconds(10),
            stop_timeout: Duration::seconds(10),
            min_gap: Duration::seconds(3),
            stop_retries: 3,
            error_stop_count: HashMap::new(),
            can_force_stop: HashMap::new(),
            last_command_time: HashMap::new(),
            last_emitted_command: HashMap::new(),
            current_run_number: HashMap::new(),
            pending_arm_number: HashMap::new(),
        }
    }

    /// Number of commands currently pending in the pipeline, for the
    /// `dispatcher_queue_depth` gauge.
    pub async fn queue_depth(&self) -> usize {
        self.pipeline.len().await
    }

    fn timeout_for(&self, cmd: CommandKind) -> Duration {
        match cmd {
            CommandKind::Arm => self.arm_timeout,
            CommandKind::Start => self.start_timeout,
            CommandKind::Stop => self.stop_timeout,
        }
    }

    /// One reconciliation pass over every detector the Aggregator reported
    /// this tick (`spec.md` §4.4's decision table, first match wins).
    pub async fn tick(&mut self, aggregated: &AggregatedStatusMap, goal: &GoalStateMap, now: DateTime<Utc>) {
        let mut detectors: Vec<&String> = aggregated.keys().collect();
        detectors.sort();

        for d in detectors {
            let snap = &aggregated[d];
            let Some(g) = goal.get(d) else {
                continue;
            };

            if snap.status == Status::Idle {
                self.error_stop_count.insert(d.clone(), 0);
                self.can_force_stop.insert(d.clone(), true);
            }

            if !g.active {
                match snap.status {
                    Status::Arming | Status::Armed | Status::Running | Status::Error | Status::Unknown => {
                        self.stop_gently(d, snap.status, g, now).await;
                    }
                    Status::Timeout => self.check_timeouts(d, None, g, now).await,
                    Status::Idle => {}
                }
            } else {
                match snap.status {
                    Status::Running => self.check_run_turnover(d, g, snap.run_number, now).await,
                    Status::Armed => {
                        self.control(CommandKind::Start, d, g, false, now).await;
                    }
                    Status::Idle => {
                        self.control(CommandKind::Arm, d, g, false, now).await;
                    }
                    Status::Arming => self.check_timeouts(d, Some(CommandKind::Arm), g, now).await,
                    Status::Error => {
                        let force = *self.can_force_stop.get(d).unwrap_or(&true);
                        self.control(CommandKind::Stop, d, g, force, now).await;
                        self.can_force_stop.insert(d.clone(), false);
                    }
                    Status::Timeout | Status::Unknown => {
                        self.check_timeouts(d, None, g, now).await;
                    }
                }
            }
        }
    }

    async fn stop_gently(&mut self, d: &str, observed: Status, g: &crate::model::GoalState, now: DateTime<Utc>) {
        if observed == Status::Running && g.finish_run_on_stop {
            // Deferred: the rotation check will issue the stop once
            // `stop_after` elapses, same as an active-goal rotation.
            self.check_run_turnover(d, g, None, now).await;
            return;
        }
        self.control(CommandKind::Stop, d, g, false, now).await;
    }

    /// `spec.md` §4.4's `control(cmd, d, force)`. Returns once the gating,
    /// host resolution, enqueue, and post-action bookkeeping for one command
    /// attempt are complete.
    async fn control(
        &mut self,
        cmd: CommandKind,
        d: &str,
        g: &crate::model::GoalState,
        force: bool,
        now: DateTime<Utc>,
    ) {
        if !force && !self.gate_open(cmd, d, now) {
            debug!(detector = %d, command = ?cmd, "command blocked by cooldown");
            return;
        }

        let run_mode = match self.store.read_run_mode(&g.mode).await {
            Ok(rm) => rm,
            Err(e) => {
                warn!(detector = %d, mode = %g.mode, error = %e, "run mode lookup failed, skipping detector this tick");
                let _ = self
                    .store
                    .write_log(&format!("{d}: run mode '{}' error: {e}", g.mode), 2, ErrorType::ModeNotFound)
                    .await;
                return;
            }
        };
        let (readers, controllers) = split_hosts_by_type(&run_mode, &self.digi_type, &self.cc_type);
        if readers.is_empty() && controllers.is_empty() {
            warn!(detector = %d, mode = %g.mode, "run mode resolved no hosts");
            return;
        }

        if cmd == CommandKind::Stop && !force {
            if let Ok(Some(ack)) = self.store.read_ack(d, CommandKind::Stop).await {
                let prev_acked = controllers
                    .iter()
                    .chain(readers.iter())
                    .all(|h| matches!(ack.get(h), Some(Some(_))));
                if !prev_acked {
                    warn!(detector = %d, "previous stop is unacknowledged, refusing to stop again without force");
                    return;
                }
            }
        }

        let delay_seconds = if cmd == CommandKind::Stop && !force { STOP_DELAY_SECONDS } else { 0 };

        let mut run_number_for_arm = None;
        if cmd == CommandKind::Arm {
            let number = if let Some(&pending) = self.pending_arm_number.get(d) {
                pending
            } else {
                match self.store.allocate_run_number().await {
                    Ok(Some(n)) => {
                        self.pending_arm_number.insert(d.to_string(), n);
                        n
                    }
                    Ok(None) | Err(_) => {
                        warn!(detector = %d, "run number allocation failed, aborting arm");
                        return;
                    }
                }
            };
            run_number_for_arm = Some(number);
        }

        // Stop must reach the crate controller first; start/arm are sent as
        // one combined document (delay 0 either way, per `spec.md` §4.4's
        // delay table) so ordering within the document doesn't matter.
        let (first, second) = if cmd == CommandKind::Stop {
            (controllers.clone(), readers.clone())
        } else {
            let mut combined = readers.clone();
            combined.extend(controllers.clone());
            (combined, vec![])
        };

        let enqueue_result = self
            .pipeline
            .enqueue(
                self.store.as_ref(),
                cmd,
                d,
                &g.mode,
                &g.user,
                run_number_for_arm.map(|n| serde_json::json!({ "number": n })),
                first,
                second,
                &controllers,
                delay_seconds,
                now,
            )
            .await;

        if let Err(e) = enqueue_result {
            warn!(detector = %d, command = ?cmd, error = %e, "failed to enqueue command");
            return;
        }

        self.last_command_time.insert((d.to_string(), cmd), now);
        self.last_emitted_command.insert(d.to_string(), cmd);

        match cmd {
            CommandKind::Arm => {
                let number = run_number_for_arm.expect("arm always allocates a run number");
                self.pending_arm_number.remove(d);
                self.current_run_number.insert(d.to_string(), number);
                let doc = RunDoc {
                    number,
                    detectors: run_mode.detectors.clone(),
                    user: g.user.clone(),
                    mode: g.mode.clone(),
                    daq_config: run_mode,
                    start: None,
                    end: None,
                    tags: vec![],
                    comments: g
                        .comment
                        .clone()
                        .map(|c| {
                            vec![crate::model::RunComment {
                                user: g.user.clone(),
                                date: now,
                                comment: c,
                            }]
                        })
                        .unwrap_or_default(),
                    rate: None,
                    data: vec![],
                };
                if let Err(e) = self.store.create_run_doc(&doc).await {
                    warn!(detector = %d, run_number = number, error = %e, "failed to insert run doc");
                }
            }
            CommandKind::Start => {
                if let (Some(&run_number), Some(cc_host)) =
                    (self.current_run_number.get(d), controllers.first())
                {
                    self.spawn_run_start_bookkeeping(d.to_string(), cc_host.clone(), run_number, now);
                }
            }
            CommandKind::Stop => {
                if let (Some(&run_number), Some(cc_host)) =
                    (self.current_run_number.get(d), controllers.first())
                {
                    self.spawn_run_end_bookkeeping(d.to_string(), cc_host.clone(), run_number, force, now);
                }
            }
        }
    }

    /// `dt_since_last[cmd][d] > timeout[cmd] AND dt_since_adjacent > min_gap`,
    /// where *adjacent* is the prior `arm` for a `start` and the prior `stop`
    /// for an `arm`; irrelevant for `stop` (`spec.md` §4.4).
    fn gate_open(&self, cmd: CommandKind, d: &str, now: DateTime<Utc>) -> bool {
        let cmd_cooled_down = match self.last_command_time.get(&(d.to_string(), cmd)) {
            None => true,
            Some(&t) => now - t > self.timeout_for(cmd),
        };
        if !cmd_cooled_down {
            return false;
        }
        let adjacent = match cmd {
            CommandKind::Start => Some(CommandKind::Arm),
            CommandKind::Arm => Some(CommandKind::Stop),
            CommandKind::Stop => None,
        };
        if let Some(adj) = adjacent {
            let adjacent_cleared = match self.last_command_time.get(&(d.to_string(), adj)) {
                None => true,
                Some(&t) => now - t > self.min_gap,
            };
            if !adjacent_cleared {
                return false;
            }
        }
        true
    }

    /// `spec.md` §4.4's `check_timeouts(d, cmd)`.
    async fn check_timeouts(
        &mut self,
        d: &str,
        cmd_hint: Option<CommandKind>,
        g: &crate::model::GoalState,
        now: DateTime<Utc>,
    ) {
        let Some(cmd) = cmd_hint.or_else(|| self.last_emitted_command.get(d).copied()) else {
            return;
        };
        let scale = if cmd == CommandKind::Stop {
            *self.error_stop_count.get(d).unwrap_or(&0) as i32 + 1
        } else {
            1
        };
        let t = self.timeout_for(cmd) * scale;
        let since_last = self
            .last_command_time
            .get(&(d.to_string(), cmd))
            .map(|&lt| now - lt);
        let Some(since_last) = since_last else {
            return;
        };
        if since_last < t {
            return;
        }

        if cmd == CommandKind::Stop {
            let count = *self.error_stop_count.get(d).unwrap_or(&0);
            if count >= self.stop_retries {
                info!(detector = %d, "stop retries exhausted, logging STOP_TIMEOUT and resetting");
                let _ = self
                    .store
                    .write_log(&format!("{d}: STOP_TIMEOUT after {count} retries"), 4, ErrorType::StopTimeout)
                    .await;
                self.error_stop_count.insert(d.to_string(), 0);
            } else {
                self.error_stop_count.insert(d.to_string(), count + 1);
                self.control(CommandKind::Stop, d, g, false, now).await;
            }
        } else {
            let error_type = if cmd == CommandKind::Arm {
                ErrorType::ArmTimeout
            } else {
                ErrorType::StartTimeout
            };
            info!(detector = %d, command = ?cmd, "command timed out, logging and issuing stop");
            let _ = self
                .store
                .write_log(&format!("{d}: {}_TIMEOUT", cmd.to_string().to_uppercase()), 4, error_type)
                .await;
            self.control(CommandKind::Stop, d, g, false, now).await;
        }
    }

    /// `spec.md` §4.4's `check_run_turnover(d)`.
    async fn check_run_turnover(
        &mut self,
        d: &str,
        g: &crate::model::GoalState,
        run_number_hint: Option<i64>,
        now: DateTime<Utc>,
    ) {
        let Some(stop_after) = g.stop_after else {
            return;
        };
        let run_number = match run_number_hint.or_else(|| self.current_run_number.get(d).copied()) {
            Some(n) => n,
            None => return,
        };
        let start = match self.store.get_run_start(run_number).await {
            Ok(Some(s)) => s,
            _ => return,
        };
        if now - start > Duration::minutes(stop_after) {
            self.control(CommandKind::Stop, d, g, false, now).await;
        }
    }

    /// Picks the detector's first crate-controller host as "the" crate
    /// controller to poll for an ack time — a logical (super-)detector can
    /// in principle combine more than one physical detector's crate
    /// controller, but `spec.md` §4.4 describes a single ack read, so this
    /// takes the first consistently with how `control()` orders `stop`'s
    /// host groups (controllers before readers).
    fn spawn_run_end_bookkeeping(&self, d: String, cc_host: String, run_number: i64, force: bool, now: DateTime<Utc>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BOOKKEEPING_WAIT).await;
            let ack = store
                .read_ack_time(&d, CommandKind::Stop, &cc_host)
                .await
                .ok()
                .flatten();
            let end_time = ack.unwrap_or(now - Duration::seconds(1));
            if let Err(e) = store.set_run_end(run_number, end_time, force).await {
                warn!(detector = %d, run_number, error = %e, "failed to set run end time");
            }
            if let Ok(Some(rate)) = store.aggregate_run_rate(run_number).await {
                let _ = store.annotate_run_rate(run_number, rate).await;
            }
        });
    }

    fn spawn_run_start_bookkeeping(&self, d: String, cc_host: String, run_number: i64, now: DateTime<Utc>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BOOKKEEPING_WAIT).await;
            let ack = store
                .read_ack_time(&d, CommandKind::Start, &cc_host)
                .await
                .ok()
                .flatten();
            let messy = ack.is_none();
            let start_time = ack.unwrap_or(now - Duration::from_std(BOOKKEEPING_WAIT).unwrap());
            if let Err(e) = store.set_run_start(run_number, start_time, messy).await {
                warn!(detector = %d, run_number, error = %e, "failed to set run start time");
            }
        });
    }
}
