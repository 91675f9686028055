//! Status Aggregator — `spec.md` §4.2.
//!
//! Pulls the latest heartbeat per known host, classifies per-host status
//! (including promotion to `TIMEOUT`), links physical detectors into logical
//! ones per the current goal modes, and folds host statuses into one
//! aggregated status per logical detector. Structured the way the teacher's
//! `Fleet` (`fleet.rs`) holds an in-memory registry and prunes staleness each
//! tick, generalized from a flat worker map to the two-level
//! physical/logical detector structure this spec requires.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::Cli;
use crate::error::DispatcherError;
use crate::model::{
    AggregatedStatus, AggregatedStatusMap, GoalStateMap, HostStatus, HostTopology, RunModeDoc, Status,
};
use crate::status::{build_logical_detectors, fold_statuses, split_hosts_by_type};
use crate::store::{AggregateSnapshot, StoreGateway};

/// A TPC host has gone quiet long enough (or has a stale unacknowledged
/// command) that the external hypervisor collaborator should consider
/// restarting it. The aggregator only detects and reports this — `spec.md`
/// §4.2 explicitly scopes the hypervisor itself out of this crate.
#[derive(Debug, Clone)]
pub struct TimeoutAction {
    pub host: String,
    pub reason: TimeoutActionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutActionReason {
    StaleHeartbeat,
    StaleUnacknowledgedCommand,
}

pub struct AggregationResult {
    pub statuses: AggregatedStatusMap,
    pub timeout_actions: Vec<TimeoutAction>,
}

pub struct Aggregator {
    topology: HostTopology,
    digi_type: String,
    cc_type: String,
    client_timeout: Duration,
    timeout_action_threshold: Duration,
}

impl Aggregator {
    pub fn new(topology: HostTopology, cli: &Cli) -> Self {
        Aggregator {
            topology,
            digi_type: "V17".to_string(),
            cc_type: "V2718".to_string(),
            client_timeout: Duration::seconds(cli.client_timeout as i64),
            timeout_action_threshold: Duration::seconds(cli.timeout_action_threshold as i64),
        }
    }

    /// Test-mode constructor using the `f17`/`f2718` prefixes `spec.md`
    /// §4.4 calls out for test configs.
    #[cfg(test)]
    pub fn for_tests(topology: HostTopology, client_timeout_secs: i64, timeout_action_secs: i64) -> Self {
        Aggregator {
            topology,
            digi_type: "f17".to_string(),
            cc_type: "f2718".to_string(),
            client_timeout: Duration::seconds(client_timeout_secs),
            timeout_action_threshold: Duration::seconds(timeout_action_secs),
        }
    }

    /// One aggregation pass: fetch heartbeats for every known host,
    /// classify, link, fold, and write the per-detector snapshot.
    pub async fn tick(
        &self,
        store: &dyn StoreGateway,
        goal: &GoalStateMap,
        run_modes: &HashMap<String, RunModeDoc>,
        now: DateTime<Utc>,
    ) -> Result<AggregationResult, DispatcherError> {
        let all_hosts: Vec<String> = self.topology.host_detector.keys().cloned().collect();
        let heartbeats = store.read_heartbeats(&all_hosts, now).await?;
        let by_host: HashMap<&str, &crate::model::Heartbeat> =
            heartbeats.iter().map(|h| (h.host.as_str(), h)).collect();

        let mut host_statuses: HashMap<String, HostStatus> = HashMap::new();
        let mut timeout_actions = Vec::new();
        // Hosts already flagged via condition (a) — `spec.md` §4.2 emits one
        // timeout-action signal per host, not one per triggering condition.
        let mut flagged: std::collections::HashSet<String> = std::collections::HashSet::new();

        for host in &all_hosts {
            let hb = by_host.get(host.as_str()).copied();
            let (status, age_seconds) = match hb {
                None => (Status::Unknown, None),
                Some(hb) => {
                    let age = now - hb.recorded_at;
                    let parsed = Status::from_raw(hb.status_raw);
                    let mut status = parsed.unwrap_or(Status::Unknown);
                    if parsed.is_none() {
                        debug!(host = %host, raw = hb.status_raw, "unparseable heartbeat status");
                    }
                    if age > self.client_timeout {
                        status = Status::Timeout;
                    }
                    (status, Some(age.num_milliseconds() as f64 / 1000.0))
                }
            };

            let is_tpc_host = self.topology.detector_of(host) == Some("tpc");
            if is_tpc_host {
                let stale_heartbeat =
                    hb.map(|hb| now - hb.recorded_at > self.timeout_action_threshold).unwrap_or(true);
                if stale_heartbeat {
                    flagged.insert(host.clone());
                    timeout_actions.push(TimeoutAction {
                        host: host.clone(),
                        reason: TimeoutActionReason::StaleHeartbeat,
                    });
                }
            }

            host_statuses.insert(
                host.clone(),
                HostStatus {
                    host: host.clone(),
                    status,
                    heartbeat: hb.cloned(),
                    age_seconds,
                },
            );
        }

        let known_detectors: Vec<String> = self.topology.detectors.keys().cloned().collect();
        let logical = build_logical_detectors(&known_detectors, goal, run_modes);

        let mut out = AggregatedStatusMap::new();
        for group in logical {
            // Resolve the active host set for this logical detector from the
            // goal mode's merged `boards` list (`spec.md` §4.2's "active
            // hosts... named in the merged RunModeDoc.boards").
            let rep = group
                .physical_detectors
                .iter()
                .find_map(|d| goal.get(d).map(|g| g.mode.clone()));
            let Some(mode_name) = rep else {
                continue;
            };
            let Some(mode_doc) = run_modes.get(&mode_name) else {
                continue;
            };
            let (readers, controllers) = split_hosts_by_type(mode_doc, &self.digi_type, &self.cc_type);
            let active_hosts: Vec<&String> = readers.iter().chain(controllers.iter()).collect();
            if active_hosts.is_empty() {
                continue;
            }

            // Condition (b) of `spec.md` §4.2's timeout-action signal: a TPC
            // host with an unacknowledged outstanding command older than
            // `client_timeout`. Checked against this group's command tracker
            // since commands are tracked per logical detector, not per
            // physical one. Hosts already flagged via condition (a) aren't
            // re-checked.
            let tracked = store.read_tracked_commands(&group.name).await.unwrap_or_default();
            for host in &active_hosts {
                if flagged.contains(host.as_str()) {
                    continue;
                }
                if self.topology.detector_of(host.as_str()) != Some("tpc") {
                    continue;
                }
                let stale_unacked = tracked.iter().any(|(_, created_at, ack)| {
                    matches!(ack.get(host.as_str()), Some(None)) && now - *created_at > self.client_timeout
                });
                if stale_unacked {
                    timeout_actions.push(TimeoutAction {
                        host: (*host).clone(),
                        reason: TimeoutActionReason::StaleUnacknowledgedCommand,
                    });
                }
            }

            let statuses: Vec<Status> = active_hosts
                .iter()
                .filter_map(|h| host_statuses.get(h.as_str()).map(|hs| hs.status))
                .collect();
            let folded = fold_statuses(&statuses);

            // Run number / mode must agree across controller hosts; a
            // disagreement is a recoverable error that skips this detector
            // for the tick (`spec.md` §4.2).
            let cc_numbers: Vec<Option<i64>> = controllers
                .iter()
                .filter_map(|h| host_statuses.get(h.as_str()))
                .filter_map(|hs| hs.heartbeat.as_ref())
                .map(|hb| hb.number)
                .collect();
            let cc_modes: Vec<Option<String>> = controllers
                .iter()
                .filter_map(|h| host_statuses.get(h.as_str()))
                .filter_map(|hs| hs.heartbeat.as_ref())
                .map(|hb| hb.mode.clone())
                .collect();
            if has_disagreement(&cc_numbers) || has_disagreement(&cc_modes) {
                warn!(detector = %group.name, "controller hosts disagree on run number or mode");
                let _ = store
                    .write_log(
                        &format!("{}: hosts disagree on run number/mode", group.name),
                        3,
                        crate::store::ErrorType::HostDisagreement,
                    )
                    .await;
                continue;
            }

            let run_number = cc_numbers.into_iter().flatten().next();
            let mode = cc_modes.into_iter().flatten().next().or(Some(mode_name.clone()));
            let rate: f64 = active_hosts
                .iter()
                .filter_map(|h| host_statuses.get(h.as_str()))
                .filter_map(|hs| hs.heartbeat.as_ref())
                .map(|hb| hb.rate)
                .sum();
            let buffer_bytes: i64 = active_hosts
                .iter()
                .filter_map(|h| host_statuses.get(h.as_str()))
                .filter_map(|hs| hs.heartbeat.as_ref())
                .map(|hb| hb.buffer_size)
                .sum();
            let pll_unlocks: i32 = active_hosts
                .iter()
                .filter_map(|h| host_statuses.get(h.as_str()))
                .filter_map(|hs| hs.heartbeat.as_ref())
                .map(|hb| hb.pll)
                .sum();

            let snap = AggregatedStatus {
                detector: group.name.clone(),
                status: folded,
                run_number,
                mode,
                rate,
                buffer_bytes,
                pll_unlocks,
                timestamp: now,
            };

            let _ = store
                .write_aggregate_snapshot(&AggregateSnapshot {
                    detector: snap.detector.clone(),
                    status: snap.status,
                    run_number: snap.run_number,
                    mode: snap.mode.clone(),
                    rate: snap.rate,
                    buffer_bytes: snap.buffer_bytes,
                    pll_unlocks: snap.pll_unlocks,
                    recorded_at: now,
                })
                .await;

            out.insert(group.name, snap);
        }

        Ok(AggregationResult {
            statuses: out,
            timeout_actions,
        })
    }
}

fn has_disagreement<T: PartialEq>(values: &[Option<T>]) -> bool {
    let present: Vec<&T> = values.iter().filter_map(|v| v.as_ref()).collect();
    present.windows(2).any(|w| w[0] != w[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Board, GoalState, OutgoingCommand, PhysicalDetector};
    use crate::store::fake::FakeStore;
    use std::collections::HashMap as Map;

    fn topology() -> HostTopology {
        let mut detectors = Map::new();
        detectors.insert(
            "tpc".to_string(),
            PhysicalDetector {
                readers: vec!["r0".to_string()],
                controllers: vec!["cc0".to_string()],
            },
        );
        HostTopology::from_master_config(&detectors)
    }

    fn run_mode() -> RunModeDoc {
        RunModeDoc {
            name: "M".to_string(),
            detectors: vec!["tpc".to_string()],
            boards: vec![
                Board {
                    host: "r0".to_string(),
                    board_type: "f1724_17".to_string(),
                },
                Board {
                    host: "cc0".to_string(),
                    board_type: "f2718".to_string(),
                },
            ],
            includes: vec![],
            extra: Default::default(),
        }
    }

    fn goal_map() -> GoalStateMap {
        let mut goal = GoalStateMap::new();
        goal.insert(
            "tpc".to_string(),
            GoalState {
                active: true,
                mode: "M".to_string(),
                user: "u".to_string(),
                comment: None,
                stop_after: None,
                finish_run_on_stop: false,
                written_at: Utc::now(),
            },
        );
        goal
    }

    #[tokio::test]
    async fn idle_hosts_fold_to_idle() {
        let store = FakeStore::new(Utc::now());
        store.set_heartbeat(crate::model::Heartbeat {
            host: "r0".to_string(),
            status_raw: 0,
            rate: 1.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: Utc::now(),
        });
        store.set_heartbeat(crate::model::Heartbeat {
            host: "cc0".to_string(),
            status_raw: 0,
            rate: 0.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: Utc::now(),
        });

        let agg = Aggregator::for_tests(topology(), 10, 60);
        let mut modes = HashMap::new();
        modes.insert("M".to_string(), run_mode());
        let result = agg.tick(&store, &goal_map(), &modes, Utc::now()).await.unwrap();
        assert_eq!(result.statuses["tpc"].status, Status::Idle);
        assert_eq!(result.statuses["tpc"].run_number, Some(5));
    }

    #[tokio::test]
    async fn stale_heartbeat_promotes_to_timeout() {
        let now = Utc::now();
        let store = FakeStore::new(now);
        store.set_heartbeat(crate::model::Heartbeat {
            host: "r0".to_string(),
            status_raw: 0,
            rate: 1.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: now - Duration::seconds(100),
        });
        store.set_heartbeat(crate::model::Heartbeat {
            host: "cc0".to_string(),
            status_raw: 0,
            rate: 0.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: now,
        });

        let agg = Aggregator::for_tests(topology(), 10, 60);
        let mut modes = HashMap::new();
        modes.insert("M".to_string(), run_mode());
        let result = agg.tick(&store, &goal_map(), &modes, now).await.unwrap();
        assert_eq!(result.statuses["tpc"].status, Status::Timeout);
    }

    #[tokio::test]
    async fn stale_unacknowledged_command_triggers_timeout_action() {
        let now = Utc::now();
        let store = FakeStore::new(now);
        // Fresh heartbeats on both hosts so condition (a) never fires.
        store.set_heartbeat(crate::model::Heartbeat {
            host: "r0".to_string(),
            status_raw: 0,
            rate: 1.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: now,
        });
        store.set_heartbeat(crate::model::Heartbeat {
            host: "cc0".to_string(),
            status_raw: 0,
            rate: 0.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: now,
        });

        // A stop command published 20s ago, tracked for logical detector
        // "tpc", still unacknowledged by "cc0" — older than client_timeout
        // (10s), so condition (b) should fire for that host.
        let id = store
            .publish_command(&OutgoingCommand {
                command: crate::model::CommandKind::Stop,
                detector: "tpc".to_string(),
                mode: "M".to_string(),
                user: "dispatcher".to_string(),
                hosts: vec!["r0".to_string(), "cc0".to_string()],
                acknowledged: Map::from([("r0".to_string(), Some(now)), ("cc0".to_string(), None)]),
                created_at: now - Duration::seconds(20),
                options_override: None,
            })
            .await
            .unwrap();
        store
            .write_ack_lookup("tpc", crate::model::CommandKind::Stop, id)
            .await
            .unwrap();

        let agg = Aggregator::for_tests(topology(), 10, 60);
        let mut modes = HashMap::new();
        modes.insert("M".to_string(), run_mode());
        let result = agg.tick(&store, &goal_map(), &modes, now).await.unwrap();

        let hit = result
            .timeout_actions
            .iter()
            .find(|a| a.host == "cc0" && a.reason == TimeoutActionReason::StaleUnacknowledgedCommand);
        assert!(hit.is_some(), "expected a StaleUnacknowledgedCommand action for cc0");
        assert!(!result
            .timeout_actions
            .iter()
            .any(|a| a.host == "r0" && a.reason == TimeoutActionReason::StaleUnacknowledgedCommand));
    }

    #[tokio::test]
    async fn disagreeing_run_numbers_skip_the_detector() {
        let now = Utc::now();
        let store = FakeStore::new(now);
        let mut detectors = Map::new();
        detectors.insert(
            "tpc".to_string(),
            PhysicalDetector {
                readers: vec!["r0".to_string()],
                controllers: vec!["cc0".to_string(), "cc1".to_string()],
            },
        );
        let topo = HostTopology::from_master_config(&detectors);
        let two_cc_mode = RunModeDoc {
            name: "M".to_string(),
            detectors: vec!["tpc".to_string()],
            boards: vec![
                Board {
                    host: "r0".to_string(),
                    board_type: "f1724_17".to_string(),
                },
                Board {
                    host: "cc0".to_string(),
                    board_type: "f2718".to_string(),
                },
                Board {
                    host: "cc1".to_string(),
                    board_type: "f2718".to_string(),
                },
            ],
            includes: vec![],
            extra: Default::default(),
        };
        store.set_heartbeat(crate::model::Heartbeat {
            host: "r0".to_string(),
            status_raw: 0,
            rate: 1.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: now,
        });
        store.set_heartbeat(crate::model::Heartbeat {
            host: "cc0".to_string(),
            status_raw: 0,
            rate: 0.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(5),
            recorded_at: now,
        });
        store.set_heartbeat(crate::model::Heartbeat {
            host: "cc1".to_string(),
            status_raw: 0,
            rate: 0.0,
            buffer_size: 0,
            pll: 1,
            mode: Some("M".to_string()),
            number: Some(6),
            recorded_at: now,
        });

        let agg = Aggregator::for_tests(topo, 10, 60);
        let mut modes = HashMap::new();
        modes.insert("M".to_string(), two_cc_mode);
        let result = agg.tick(&store, &goal_map(), &modes, now).await.unwrap();
        assert!(!result.statuses.contains_key("tpc"));
    }
}
