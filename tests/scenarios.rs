//! End-to-end reconciliation scenarios driven by a clock-controlled
//! `FakeStore`, one test per numbered scenario.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;

use daq_dispatcher::aggregator::Aggregator;
use daq_dispatcher::config::Cli;
use daq_dispatcher::controller::Controller;
use daq_dispatcher::model::{
    Board, GoalState, GoalStateMap, Heartbeat, HostTopology, PhysicalDetector, RunModeDoc, Status,
};
use daq_dispatcher::pipeline::Pipeline;
use daq_dispatcher::store::fake::FakeStore;
use daq_dispatcher::store::StoreGateway;

fn test_cli() -> Cli {
    Cli::parse_from([
        "dispatcher",
        "--master-daq-config",
        "{}",
        "--control-database-url",
        "postgres://unused",
        "--runs-database-url",
        "postgres://unused",
        "--hostname",
        "test-host",
        "--poll-frequency",
        "1",
        "--client-timeout",
        "10",
        "--timeout-action-threshold",
        "60",
        "--arm-command-timeout",
        "5",
        "--start-command-timeout",
        "5",
        "--stop-command-timeout",
        "5",
        "--time-between-commands",
        "2",
        "--retry-reset",
        "3",
    ])
}

fn one_detector_topology() -> HostTopology {
    let mut detectors = HashMap::new();
    detectors.insert(
        "xams".to_string(),
        PhysicalDetector {
            readers: vec!["xams_r0".to_string()],
            controllers: vec!["xams_cc0".to_string()],
        },
    );
    HostTopology::from_master_config(&detectors)
}

fn one_detector_mode() -> RunModeDoc {
    RunModeDoc {
        name: "M".to_string(),
        detectors: vec!["xams".to_string()],
        boards: vec![
            Board { host: "xams_r0".to_string(), board_type: "V1724_17".to_string() },
            Board { host: "xams_cc0".to_string(), board_type: "V2718".to_string() },
        ],
        includes: vec![],
        extra: Default::default(),
    }
}

fn heartbeat(host: &str, status: i32, mode: &str, number: i64, at: chrono::DateTime<Utc>) -> Heartbeat {
    Heartbeat {
        host: host.to_string(),
        status_raw: status,
        rate: 0.0,
        buffer_size: 0,
        pll: 1,
        mode: Some(mode.to_string()),
        number: Some(number),
        recorded_at: at,
    }
}

fn active_goal(mode: &str) -> GoalState {
    GoalState {
        active: true,
        mode: mode.to_string(),
        user: "operator".to_string(),
        comment: None,
        stop_after: None,
        finish_run_on_stop: false,
        written_at: Utc::now(),
    }
}

/// Scenario 1: cold arm/start. IDLE -> arm -> ARMING -> ARMED -> start -> RUNNING.
#[tokio::test]
async fn scenario_1_cold_arm_start() {
    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));
    store.set_run_mode(one_detector_mode());
    store.seed_run_number(41);

    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let pipeline = Arc::new(Pipeline::restore(dyn_store.as_ref()).await.unwrap());
    let cli = test_cli();
    let aggregator = Aggregator::new(one_detector_topology(), &cli);
    let mut controller = Controller::new(dyn_store.clone(), pipeline.clone(), &cli);

    let mut goal = GoalStateMap::new();
    goal.insert("xams".to_string(), active_goal("M"));
    let mut modes = HashMap::new();
    modes.insert("M".to_string(), one_detector_mode());

    // Tick 1: IDLE -> publish arm.
    store.set_heartbeat(heartbeat("xams_r0", 0, "M", 41, now));
    store.set_heartbeat(heartbeat("xams_cc0", 0, "M", 41, now));
    let result = aggregator.tick(dyn_store.as_ref(), &goal, &modes, now).await.unwrap();
    assert_eq!(result.statuses["xams"].status, Status::Idle);
    controller.tick(&result.statuses, &goal, now).await;
    assert_eq!(store.durable_queue_len(), 1);

    // Tick 2: ARMING -> no new command.
    let t2 = now + Duration::seconds(3);
    store.set_heartbeat(heartbeat("xams_r0", 1, "M", 42, t2));
    store.set_heartbeat(heartbeat("xams_cc0", 1, "M", 42, t2));
    let result = aggregator.tick(dyn_store.as_ref(), &goal, &modes, t2).await.unwrap();
    assert_eq!(result.statuses["xams"].status, Status::Arming);
    controller.tick(&result.statuses, &goal, t2).await;
    assert_eq!(store.durable_queue_len(), 1, "still just the original arm, nothing new queued");

    // Tick 3: ARMED -> publish start.
    let t3 = t2 + Duration::seconds(3);
    store.set_heartbeat(heartbeat("xams_r0", 2, "M", 42, t3));
    store.set_heartbeat(heartbeat("xams_cc0", 2, "M", 42, t3));
    let result = aggregator.tick(dyn_store.as_ref(), &goal, &modes, t3).await.unwrap();
    assert_eq!(result.statuses["xams"].status, Status::Armed);
    controller.tick(&result.statuses, &goal, t3).await;
    assert_eq!(store.durable_queue_len(), 2);

    // Tick 4: RUNNING -> no command.
    let t4 = t3 + Duration::seconds(3);
    store.set_heartbeat(heartbeat("xams_r0", 3, "M", 42, t4));
    store.set_heartbeat(heartbeat("xams_cc0", 3, "M", 42, t4));
    let result = aggregator.tick(dyn_store.as_ref(), &goal, &modes, t4).await.unwrap();
    assert_eq!(result.statuses["xams"].status, Status::Running);
    controller.tick(&result.statuses, &goal, t4).await;
    assert_eq!(store.durable_queue_len(), 2);

    // One run doc, numbered one past the previously seeded max.
    let run = store.run_doc(42).expect("run doc for the allocated number");
    assert_eq!(run.number, 42);
}

/// Scenario 2: gentle stop during a run with `finish_run_on_stop` doesn't
/// stop early; it waits for rotation.
#[tokio::test]
async fn scenario_2_gentle_stop_waits_for_rotation() {
    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));
    store.set_run_mode(one_detector_mode());
    store.seed_run_number(9);

    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let pipeline = Arc::new(Pipeline::restore(dyn_store.as_ref()).await.unwrap());
    let cli = test_cli();
    let mut controller = Controller::new(dyn_store.clone(), pipeline, &cli);

    let mut goal = GoalStateMap::new();
    goal.insert(
        "xams".to_string(),
        GoalState {
            active: false,
            mode: "M".to_string(),
            user: "operator".to_string(),
            comment: None,
            stop_after: Some(60),
            finish_run_on_stop: true,
            written_at: now,
        },
    );

    let mut agg_map = daq_dispatcher::model::AggregatedStatusMap::new();
    agg_map.insert(
        "xams".to_string(),
        daq_dispatcher::model::AggregatedStatus {
            detector: "xams".to_string(),
            status: Status::Running,
            run_number: Some(9),
            mode: Some("M".to_string()),
            rate: 1.0,
            buffer_bytes: 0,
            pll_unlocks: 0,
            timestamp: now,
        },
    );

    // Still well within stop_after=60 minutes: no stop published.
    let soon = now + Duration::minutes(5);
    controller.tick(&agg_map, &goal, soon).await;
    assert_eq!(store.durable_queue_len(), 0, "finish_run_on_stop holds off the stop before rotation time");
}

/// Scenario 5: RUNNING with `stop_after=60` and the run started 61 minutes
/// ago -> rotation fires a `stop` even though the goal is still active.
#[tokio::test]
async fn scenario_5_rotation_fires_stop_past_stop_after() {
    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));
    store.set_run_mode(one_detector_mode());
    store.seed_run_number(9);

    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let run_start = now - Duration::minutes(61);
    dyn_store.set_run_start(9, run_start, false).await.unwrap();
    let pipeline = Arc::new(Pipeline::restore(dyn_store.as_ref()).await.unwrap());
    let cli = test_cli();
    let mut controller = Controller::new(dyn_store.clone(), pipeline, &cli);

    let mut goal = GoalStateMap::new();
    goal.insert(
        "xams".to_string(),
        GoalState {
            active: true,
            mode: "M".to_string(),
            user: "operator".to_string(),
            comment: None,
            stop_after: Some(60),
            finish_run_on_stop: false,
            written_at: now,
        },
    );

    let mut agg_map = daq_dispatcher::model::AggregatedStatusMap::new();
    agg_map.insert(
        "xams".to_string(),
        daq_dispatcher::model::AggregatedStatus {
            detector: "xams".to_string(),
            status: Status::Running,
            run_number: Some(9),
            mode: Some("M".to_string()),
            rate: 1.0,
            buffer_bytes: 0,
            pll_unlocks: 0,
            timestamp: now,
        },
    );

    controller.tick(&agg_map, &goal, now).await;
    assert_eq!(store.durable_queue_len(), 1, "rotation issues a stop once stop_after has elapsed");
}

/// Scenario 3: ARMING stays stuck past `ArmCommandTimeout` -> ARM_TIMEOUT
/// log plus a stop, and the log doesn't repeat inside its throttle window.
#[tokio::test]
async fn scenario_3_arm_timeout_logs_and_stops() {
    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));
    store.set_run_mode(one_detector_mode());
    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let pipeline = Arc::new(Pipeline::restore(dyn_store.as_ref()).await.unwrap());
    let cli = test_cli();
    let mut controller = Controller::new(dyn_store.clone(), pipeline, &cli);

    let mut goal = GoalStateMap::new();
    goal.insert("xams".to_string(), active_goal("M"));

    let mut agg_map = daq_dispatcher::model::AggregatedStatusMap::new();
    agg_map.insert(
        "xams".to_string(),
        daq_dispatcher::model::AggregatedStatus {
            detector: "xams".to_string(),
            status: Status::Idle,
            run_number: None,
            mode: Some("M".to_string()),
            rate: 0.0,
            buffer_bytes: 0,
            pll_unlocks: 0,
            timestamp: now,
        },
    );
    // Tick 1: IDLE -> arm published, last_command_time[arm] = now.
    controller.tick(&agg_map, &goal, now).await;
    assert_eq!(store.durable_queue_len(), 1);

    // Now report ARMING for longer than arm_command_timeout (5s).
    let stuck = now + Duration::seconds(6);
    agg_map.get_mut("xams").unwrap().status = Status::Arming;
    controller.tick(&agg_map, &goal, stuck).await;

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].error_type, daq_dispatcher::store::ErrorType::ArmTimeout);
    assert_eq!(store.durable_queue_len(), 2, "the timeout also issues a stop");
}

/// Scenario 4: three consecutive stop publishes without IDLE exhausts
/// RetryReset=3; the 4th attempt logs STOP_TIMEOUT instead of another stop.
#[tokio::test]
async fn scenario_4_stop_retry_exhaustion() {
    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));
    store.set_run_mode(one_detector_mode());
    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let pipeline = Arc::new(Pipeline::restore(dyn_store.as_ref()).await.unwrap());
    let cli = test_cli();
    let mut controller = Controller::new(dyn_store.clone(), pipeline, &cli);

    let mut goal = GoalStateMap::new();
    goal.insert("xams".to_string(), active_goal("M"));

    let mut agg_map = daq_dispatcher::model::AggregatedStatusMap::new();
    agg_map.insert(
        "xams".to_string(),
        daq_dispatcher::model::AggregatedStatus {
            detector: "xams".to_string(),
            status: Status::Error,
            run_number: None,
            mode: Some("M".to_string()),
            rate: 0.0,
            buffer_bytes: 0,
            pll_unlocks: 0,
            timestamp: now,
        },
    );

    // First ERROR tick forces a stop (can_force_stop starts true).
    controller.tick(&agg_map, &goal, now).await;
    assert_eq!(store.durable_queue_len(), 1);

    // Switch to TIMEOUT: with goal still active this hits the decision
    // table's `active | other -> check_timeouts(cmd=auto)` row, which
    // resolves `cmd=stop` via `last_emitted_command` and actually exercises
    // the retry/scaling logic (the ERROR row calls `control` directly and
    // never touches `error_stop_count`).
    agg_map.get_mut("xams").unwrap().status = Status::Timeout;

    // Each retry's timeout is `stop_command_timeout (5s)` scaled by the
    // retry count so far, so the gap before each next tick has to grow to
    // clear it: 6s clears scale=1 (5s), 11s clears scale=2 (10s), 16s
    // clears scale=3 (15s).
    let mut t = now;
    for gap in [6, 11, 16] {
        t += Duration::seconds(gap);
        controller.tick(&agg_map, &goal, t).await;
    }
    assert_eq!(store.durable_queue_len(), 4, "original force-stop plus 3 retries");

    // retry_reset = 3: the budget is now exhausted, so this next check (gap
    // clears scale=4, i.e. 20s) logs STOP_TIMEOUT instead of publishing a
    // 5th stop.
    t += Duration::seconds(21);
    controller.tick(&agg_map, &goal, t).await;
    assert_eq!(store.durable_queue_len(), 4, "exhaustion logs instead of publishing a 5th stop");

    let stop_timeouts: Vec<_> = store
        .logs()
        .into_iter()
        .filter(|l| l.error_type == daq_dispatcher::store::ErrorType::StopTimeout)
        .collect();
    assert_eq!(stop_timeouts.len(), 1);
}

/// Scenario 6: two detectors whose mode's `detectors` list names both link
/// into one logical detector whose status folds jointly.
#[tokio::test]
async fn scenario_6_linking_folds_jointly() {
    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));

    let mut detectors = HashMap::new();
    detectors.insert(
        "tpc".to_string(),
        PhysicalDetector { readers: vec!["r0".to_string()], controllers: vec!["cc0".to_string()] },
    );
    detectors.insert(
        "muon_veto".to_string(),
        PhysicalDetector { readers: vec!["mv_r0".to_string()], controllers: vec!["mv_cc0".to_string()] },
    );
    let topology = HostTopology::from_master_config(&detectors);

    let joint_mode = RunModeDoc {
        name: "joint".to_string(),
        detectors: vec!["tpc".to_string(), "muon_veto".to_string()],
        boards: vec![
            Board { host: "r0".to_string(), board_type: "V1724_17".to_string() },
            Board { host: "cc0".to_string(), board_type: "V2718".to_string() },
            Board { host: "mv_r0".to_string(), board_type: "V1724_17".to_string() },
            Board { host: "mv_cc0".to_string(), board_type: "V2718".to_string() },
        ],
        includes: vec![],
        extra: Default::default(),
    };

    store.set_heartbeat(heartbeat("r0", 3, "joint", 7, now));
    store.set_heartbeat(heartbeat("cc0", 3, "joint", 7, now));
    store.set_heartbeat(heartbeat("mv_r0", 3, "joint", 7, now));
    store.set_heartbeat(heartbeat("mv_cc0", 3, "joint", 7, now));

    let mut goal = GoalStateMap::new();
    goal.insert("tpc".to_string(), active_goal("joint"));
    goal.insert("muon_veto".to_string(), active_goal("joint"));
    let mut modes = HashMap::new();
    modes.insert("joint".to_string(), joint_mode);

    let cli = test_cli();
    let aggregator = Aggregator::new(topology, &cli);
    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let result = aggregator.tick(dyn_store.as_ref(), &goal, &modes, now).await.unwrap();

    assert_eq!(result.statuses.len(), 1, "tpc and muon_veto fold into one logical detector");
    let logical = result.statuses.values().next().unwrap();
    assert_eq!(logical.status, Status::Running);
}

/// Scenario 7: a split `stop` (crate controller published first, readers
/// published ~1s later as their own document — `spec.md` §4.3's delay
/// semantics) must leave the `(detector, stop)` ack-lookup pointing at the
/// crate-controller document even after the later reader-only document
/// publishes. A forced stop (delay 0, one combined document per `spec.md`
/// §4.4) already carries the crate controller, so it's covered here too for
/// contrast.
#[tokio::test]
async fn scenario_7_split_stop_ack_lookup_tracks_crate_controller() {
    use daq_dispatcher::model::CommandKind;

    let now = Utc::now();
    let store = Arc::new(FakeStore::new(now));
    let dyn_store: Arc<dyn StoreGateway> = store.clone();
    let pipeline = Arc::new(Pipeline::restore(dyn_store.as_ref()).await.unwrap());

    let stop_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let worker_pipeline = pipeline.clone();
    let worker_store = dyn_store.clone();
    let worker_stop = stop_flag.clone();
    let handle = tokio::spawn(async move {
        worker_pipeline.run_worker(worker_store, worker_stop).await;
    });

    // Forced stop: `control`'s delay table sends readers and the crate
    // controller as one combined document (delay 0 when force is true).
    pipeline
        .enqueue(
            dyn_store.as_ref(),
            CommandKind::Stop,
            "xams",
            "M",
            "operator",
            None,
            vec!["xams_cc0".to_string()],
            vec!["xams_r0".to_string()],
            &["xams_cc0".to_string()],
            0,
            now,
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ack = store
        .read_ack("xams", CommandKind::Stop)
        .await
        .unwrap()
        .expect("forced stop tracked");
    assert!(
        ack.contains_key("xams_cc0"),
        "forced stop's single combined document includes the crate controller"
    );

    // Unforced stop: the crate controller group is due now; the reader
    // group is queued 1s later as a separate document, mirroring the
    // controller/readers split `control` performs for an unforced stop.
    pipeline
        .enqueue(
            dyn_store.as_ref(),
            CommandKind::Stop,
            "xams",
            "M",
            "operator",
            None,
            vec!["xams_cc0".to_string()],
            vec!["xams_r0".to_string()],
            &["xams_cc0".to_string()],
            1,
            now,
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;

    let stop_commands: Vec<_> = store
        .outgoing_commands()
        .into_iter()
        .filter(|c| c.command == CommandKind::Stop)
        .collect();
    assert_eq!(stop_commands.len(), 3, "forced single doc + unforced split's two docs");

    let ack = store
        .read_ack("xams", CommandKind::Stop)
        .await
        .unwrap()
        .expect("split stop tracked");
    assert!(
        ack.contains_key("xams_cc0"),
        "ack-lookup must still resolve to the crate-controller document after the later reader-only publish"
    );
    assert!(
        !ack.contains_key("xams_r0"),
        "the tracked document is the controller-only one, not the reader-only one published later"
    );

    stop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
    handle.abort();
}
