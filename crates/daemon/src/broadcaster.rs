//! Diff-based fan-out of task state to real-time subscribers.
//!
//! A 1 Hz loop compares each task's status and progress with what was last
//! sent and publishes only the changed tasks. The loop stops by itself once
//! the last subscriber is gone and restarts on the next subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::registry::TaskRegistry;
use crate::task::{EncodingTask, TaskStatus};

/// Multiplexed feed interval.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Per-task feed poll interval.
pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Smallest progress change worth sending.
pub const PROGRESS_STEP: f64 = 0.1;

const CHANNEL_CAPACITY: usize = 64;

/// What a subscriber last saw for a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentState {
    pub status: TaskStatus,
    pub progress: f64,
}

impl SentState {
    pub fn of(task: &EncodingTask) -> Self {
        Self {
            status: task.status,
            progress: task.progress,
        }
    }
}

/// Whether `task` differs enough from `last` to be sent.
pub fn has_changed(last: Option<&SentState>, task: &EncodingTask) -> bool {
    match last {
        None => true,
        Some(last) => {
            last.status != task.status
                || (task.progress - last.progress).abs() + 1e-9 >= PROGRESS_STEP
        }
    }
}

/// Returns changed tasks and records them in `last`. Entries for tasks that
/// are no longer present are dropped.
pub fn diff_changes(
    last: &mut HashMap<String, SentState>,
    snapshots: &[EncodingTask],
) -> Vec<EncodingTask> {
    let mut changed = Vec::new();
    for task in snapshots {
        if has_changed(last.get(&task.task_id), task) {
            last.insert(task.task_id.clone(), SentState::of(task));
            changed.push(task.clone());
        }
    }
    last.retain(|id, _| snapshots.iter().any(|t| &t.task_id == id));
    changed
}

/// One batch of changed tasks.
pub type ProgressBatch = Arc<Vec<EncodingTask>>;

pub struct Broadcaster {
    registry: Arc<TaskRegistry>,
    sender: broadcast::Sender<ProgressBatch>,
    running: Mutex<bool>,
    interval: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<TaskRegistry>) -> Arc<Self> {
        Self::with_interval(registry, BROADCAST_INTERVAL)
    }

    pub fn with_interval(registry: Arc<TaskRegistry>, interval: Duration) -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            registry,
            sender,
            running: Mutex::new(false),
            interval,
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a subscriber, starting the loop if it is idle.
    pub fn subscribe(self: &Arc<Self>) -> broadcast::Receiver<ProgressBatch> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.sender.subscribe();
        if !*running {
            *running = true;
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run().await });
            info!("progress broadcaster started");
        }
        rx
    }

    async fn run(self: Arc<Self>) {
        let mut last: HashMap<String, SentState> = HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            {
                // Same lock as `subscribe`, so a new subscriber either sees
                // the loop running or restarts it.
                let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                if self.sender.receiver_count() == 0 {
                    *running = false;
                    info!("no subscribers, progress broadcaster stopped");
                    return;
                }
            }

            let snapshots = self.registry.snapshots().await;
            let changed = diff_changes(&mut last, &snapshots);
            if changed.is_empty() {
                continue;
            }
            debug!(count = changed.len(), "broadcasting task changes");
            // Send only fails without receivers; the next tick handles that.
            let _ = self.sender.send(Arc::new(changed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskEntry;
    use crate::task::{Codec, EncodeRequest, EncoderKind, SharedTask};
    use proptest::prelude::*;
    use tokio_util::sync::CancellationToken;

    fn task(id: &str, progress: f64) -> EncodingTask {
        let mut request = EncodeRequest::new("/rec/a.ts", Codec::H264, EncoderKind::Software);
        request.task_id = Some(id.to_string());
        let mut t = EncodingTask::new(&request, 3);
        t.status = TaskStatus::Processing;
        t.progress = progress;
        t
    }

    fn register(registry: &TaskRegistry, t: EncodingTask) -> SharedTask {
        let shared = t.clone().into_shared();
        registry.insert(
            &t.task_id,
            TaskEntry {
                task: shared.clone(),
                cancel: CancellationToken::new(),
            },
        );
        shared
    }

    #[test]
    fn test_diff_only_emits_qualifying_changes() {
        let mut last = HashMap::new();
        let first = diff_changes(&mut last, &[task("a", 10.0), task("b", 10.0)]);
        assert_eq!(first.len(), 2);

        let changed = diff_changes(&mut last, &[task("a", 10.05), task("b", 10.2)]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].task_id, "b");
    }

    #[test]
    fn test_small_steps_accumulate() {
        let mut last = HashMap::new();
        diff_changes(&mut last, &[task("a", 10.0)]);
        assert!(diff_changes(&mut last, &[task("a", 10.05)]).is_empty());
        // Compared with the last sent value, not the last seen one.
        assert_eq!(diff_changes(&mut last, &[task("a", 10.1)]).len(), 1);
    }

    #[test]
    fn test_status_change_always_emitted() {
        let mut last = HashMap::new();
        diff_changes(&mut last, &[task("a", 50.0)]);
        let mut done = task("a", 50.0);
        done.status = TaskStatus::Failed;
        assert_eq!(diff_changes(&mut last, &[done]).len(), 1);
    }

    #[test]
    fn test_removed_tasks_are_forgotten() {
        let mut last = HashMap::new();
        diff_changes(&mut last, &[task("a", 1.0), task("b", 1.0)]);
        diff_changes(&mut last, &[task("a", 1.0)]);
        assert!(!last.contains_key("b"));
    }

    proptest! {
        #[test]
        fn prop_unchanged_snapshot_emits_nothing(progress in 0.0f64..100.0) {
            let mut last = HashMap::new();
            diff_changes(&mut last, &[task("a", progress)]);
            prop_assert!(diff_changes(&mut last, &[task("a", progress)]).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sends_batches_and_stops_without_subscribers() {
        let registry = Arc::new(TaskRegistry::new());
        let shared = register(&registry, task("a", 1.0));
        let broadcaster = Broadcaster::with_interval(registry, Duration::from_millis(100));

        let mut rx = broadcaster.subscribe();
        assert!(broadcaster.is_running());

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);

        shared.write().await.progress = 40.0;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].progress, 40.0);

        drop(rx);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!broadcaster.is_running());

        // Lazily restarted.
        let mut rx = broadcaster.subscribe();
        assert!(broadcaster.is_running());
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
