//! Command Pipeline — `spec.md` §4.3.
//!
//! A single background worker drains an in-memory, due-time-ordered queue of
//! outbound commands, durably mirrored in the `command_queue` table so a
//! dispatcher restart doesn't lose anything still pending (`spec.md` §5).
//! Generalizes the teacher's heartbeat-thread wait/notify idiom (`pg_worker.rs`)
//! from a fixed 10s poll to an async `tokio::sync::Notify` that wakes
//! immediately on enqueue instead of only on a timer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{AckMap, CommandKind, OutgoingCommand, QueuedCommand};
use crate::store::StoreGateway;

/// Upper bound on how long the worker sleeps with an empty queue, per
/// `spec.md` §4.3 ("sleep a bounded max (~10s)").
const MAX_IDLE_SLEEP: Duration = Duration::seconds(10);
/// How close to `due_at` counts as "due now" — `spec.md`'s ε (≈10ms).
const EPSILON: Duration = Duration::milliseconds(10);

struct HeapEntry {
    due_at: DateTime<Utc>,
    seq: u64,
    durable_id: i64,
    cmd: QueuedCommand,
}

// `BinaryHeap` is a max-heap; reverse the ordering so the earliest `due_at`
// (ties broken by insertion order) pops first, keeping P7 (queue ordering).
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

pub struct Pipeline {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
    seq: AtomicU64,
}

impl Pipeline {
    /// Number of commands currently pending in the in-memory queue, exposed
    /// for the `dispatcher_queue_depth` gauge (`metrics.rs`).
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    /// Rebuild the in-memory heap from whatever is still sitting in
    /// `command_queue` (a prior dispatcher instance's unfinished work).
    pub async fn restore(store: &dyn StoreGateway) -> Result<Self> {
        let rows = store.load_durable_queue().await?;
        let pipeline = Pipeline {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        };
        let mut heap = pipeline.heap.lock().await;
        for (id, cmd) in rows {
            let seq = pipeline.seq.fetch_add(1, AtomicOrdering::Relaxed);
            heap.push(HeapEntry {
                due_at: cmd.due_at,
                seq,
                durable_id: id,
                cmd,
            });
        }
        drop(heap);
        Ok(pipeline)
    }

    /// Enqueue a command. `delay_seconds == 0` (or an empty `second_hosts`)
    /// publishes one document covering `first_hosts` at `now`. Otherwise two
    /// documents are queued: `first_hosts` at `now`, `second_hosts` at
    /// `now + delay_seconds` — `spec.md` §4.3's split-group delay semantics,
    /// used to stop readers before the crate controller (and vice versa for
    /// arms). The caller decides which group goes in which slot; this is a
    /// hard ordering contract, not a detail this module infers.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        store: &dyn StoreGateway,
        command: CommandKind,
        detector: &str,
        mode: &str,
        user: &str,
        options_override: Option<serde_json::Value>,
        first_hosts: Vec<String>,
        second_hosts: Vec<String>,
        controller_hosts: &[String],
        delay_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if delay_seconds <= 0 || second_hosts.is_empty() {
            let mut hosts = first_hosts;
            hosts.extend(second_hosts);
            let has_controller_host = hosts.iter().any(|h| controller_hosts.contains(h));
            self.push(
                store,
                command,
                detector,
                mode,
                user,
                options_override,
                hosts,
                has_controller_host,
                now,
            )
            .await?;
        } else {
            let first_has_controller = first_hosts.iter().any(|h| controller_hosts.contains(h));
            let second_has_controller = second_hosts.iter().any(|h| controller_hosts.contains(h));
            self.push(
                store,
                command,
                detector,
                mode,
                user,
                options_override.clone(),
                first_hosts,
                first_has_controller,
                now,
            )
            .await?;
            self.push(
                store,
                command,
                detector,
                mode,
                user,
                options_override,
                second_hosts,
                second_has_controller,
                now + Duration::seconds(delay_seconds),
            )
            .await?;
        }
        self.notify.notify_one();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn push(
        &self,
        store: &dyn StoreGateway,
        command: CommandKind,
        detector: &str,
        mode: &str,
        user: &str,
        options_override: Option<serde_json::Value>,
        hosts: Vec<String>,
        has_controller_host: bool,
        due_at: DateTime<Utc>,
    ) -> Result<()> {
        let cmd = QueuedCommand {
            command,
            detector: detector.to_string(),
            mode: mode.to_string(),
            user: user.to_string(),
            hosts,
            options_override,
            due_at,
            has_controller_host,
        };
        let durable_id = store.enqueue_durable(&cmd).await?;
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().await.push(HeapEntry {
            due_at,
            seq,
            durable_id,
            cmd,
        });
        Ok(())
    }

    /// The worker loop: peek the earliest `due_at`, publish it once it's
    /// (near-)due, record the ack-lookup id, and otherwise sleep until the
    /// next due time or an enqueue notification, whichever comes first.
    /// Exits when `stop` flips to `true`.
    pub async fn run_worker(self: Arc<Self>, store: Arc<dyn StoreGateway>, stop: Arc<std::sync::atomic::AtomicBool>) {
        info!("command pipeline worker starting");
        loop {
            if stop.load(AtomicOrdering::Relaxed) {
                break;
            }
            let next_due = {
                let heap = self.heap.lock().await;
                heap.peek().map(|e| e.due_at)
            };

            let now = Utc::now();
            match next_due {
                Some(due_at) if due_at - now <= EPSILON => {
                    let entry = {
                        let mut heap = self.heap.lock().await;
                        heap.pop()
                    };
                    if let Some(entry) = entry {
                        self.publish_one(store.as_ref(), entry).await;
                    }
                }
                Some(due_at) => {
                    let wait = (due_at - now).max(Duration::zero()).min(MAX_IDLE_SLEEP);
                    self.wait_or_notified(wait).await;
                }
                None => {
                    self.wait_or_notified(MAX_IDLE_SLEEP).await;
                }
            }
        }
        info!("command pipeline worker stopped");
    }

    async fn wait_or_notified(&self, wait: Duration) {
        let wait_std = wait.to_std().unwrap_or(std::time::Duration::from_secs(0));
        tokio::select! {
            _ = tokio::time::sleep(wait_std) => {}
            _ = self.notify.notified() => {}
        }
    }

    async fn publish_one(&self, store: &dyn StoreGateway, entry: HeapEntry) {
        let outgoing = OutgoingCommand {
            command: entry.cmd.command,
            detector: entry.cmd.detector.clone(),
            mode: entry.cmd.mode.clone(),
            user: entry.cmd.user.clone(),
            hosts: entry.cmd.hosts.clone(),
            acknowledged: entry
                .cmd
                .hosts
                .iter()
                .map(|h| (h.clone(), None))
                .collect::<AckMap>(),
            created_at: entry.cmd.due_at,
            options_override: entry.cmd.options_override.clone(),
        };
        match store.publish_command(&outgoing).await {
            Ok(id) => {
                // Only the document carrying a crate-controller host is
                // recorded as the `(detector, command)` ack-lookup target —
                // `spec.md` §4.3: "for any controller host present in
                // `hosts`". A split command's later reader-only document
                // must not clobber the tracker the controller-bearing
                // document already set.
                if entry.cmd.has_controller_host {
                    if let Err(e) = store
                        .write_ack_lookup(&entry.cmd.detector, entry.cmd.command, id)
                        .await
                    {
                        warn!(error = %e, detector = %entry.cmd.detector, "failed to record ack lookup");
                    }
                }
                if let Err(e) = store.dequeue_durable(entry.durable_id).await {
                    debug!(error = %e, "failed to clear durable queue row after publish");
                }
            }
            Err(e) => {
                warn!(error = %e, detector = %entry.cmd.detector, command = ?entry.cmd.command, "failed to publish command, will retry next tick");
            }
        }
    }
}
