//! In-memory table of every task the daemon knows about.
//!
//! Finished tasks stay until purged so clients can keep polling them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::task::{EncodingTask, SharedTask, TaskStatus};

/// A registered task and the token that stops its executor.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task: SharedTask,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    /// Status set and token fired; the executor stops and cleans up.
    Requested,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Removed,
    NotFound,
    StillLive,
}

/// Tasks grouped for the queue view. Cancelled tasks count as failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub processing: Vec<EncodingTask>,
    pub queued: Vec<EncodingTask>,
    pub completed: Vec<EncodingTask>,
    pub failed: Vec<EncodingTask>,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a task. Returns `false` if the id is taken.
    pub fn insert(&self, task_id: &str, entry: TaskEntry) -> bool {
        let mut tasks = self.lock();
        if tasks.contains_key(task_id) {
            return false;
        }
        tasks.insert(task_id.to_string(), entry);
        true
    }

    pub fn entry(&self, task_id: &str) -> Option<TaskEntry> {
        self.lock().get(task_id).cloned()
    }

    pub fn get(&self, task_id: &str) -> Option<SharedTask> {
        self.entry(task_id).map(|entry| entry.task)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn entries(&self) -> Vec<TaskEntry> {
        self.lock().values().cloned().collect()
    }

    /// Point-in-time copy of one task.
    pub async fn snapshot(&self, task_id: &str) -> Option<EncodingTask> {
        let task = self.get(task_id)?;
        let snapshot = task.read().await.clone();
        Some(snapshot)
    }

    /// Copies of all tasks, oldest first.
    pub async fn snapshots(&self) -> Vec<EncodingTask> {
        let mut out = Vec::new();
        for entry in self.entries() {
            out.push(entry.task.read().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn statuses(&self) -> Vec<TaskStatus> {
        let mut out = Vec::new();
        for entry in self.entries() {
            out.push(entry.task.read().await.status);
        }
        out
    }

    /// Marks the task cancelled and fires its token. Idempotent.
    ///
    /// The status flips before the executor has stopped the transcoder;
    /// the executor still owns cleanup and bookkeeping.
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let Some(entry) = self.entry(task_id) else {
            return CancelOutcome::NotFound;
        };
        let mut task = entry.task.write().await;
        if task.cancel().is_err() {
            return CancelOutcome::AlreadyTerminal;
        }
        // Fired under the lock: a cancelled token implies a cancelled status.
        entry.cancel.cancel();
        info!(task_id, "cancel requested");
        CancelOutcome::Requested
    }

    /// Cancels every live task; used on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.entries() {
            entry.cancel.cancel();
        }
    }

    /// Drops a finished task.
    pub async fn purge(&self, task_id: &str) -> PurgeOutcome {
        let Some(entry) = self.entry(task_id) else {
            return PurgeOutcome::NotFound;
        };
        if !entry.task.read().await.is_terminal() {
            return PurgeOutcome::StillLive;
        }
        self.lock().remove(task_id);
        info!(task_id, "task purged");
        PurgeOutcome::Removed
    }

    pub async fn queue(&self) -> QueueSummary {
        let mut summary = QueueSummary::default();
        for task in self.snapshots().await {
            match task.status {
                TaskStatus::Processing => summary.processing.push(task),
                TaskStatus::Queued => summary.queued.push(task),
                TaskStatus::Completed => summary.completed.push(task),
                TaskStatus::Failed | TaskStatus::Cancelled => summary.failed.push(task),
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Codec, EncodeRequest, EncoderKind};

    fn entry(id: &str) -> (String, TaskEntry) {
        let mut request = EncodeRequest::new("/rec/a.ts", Codec::H264, EncoderKind::Software);
        request.task_id = Some(id.to_string());
        let task = EncodingTask::new(&request, 3);
        (
            task.task_id.clone(),
            TaskEntry {
                task: task.into_shared(),
                cancel: CancellationToken::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let registry = TaskRegistry::new();
        let (id, e) = entry("t1");
        assert!(registry.insert(&id, e.clone()));
        assert!(!registry.insert(&id, e));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot("t1").await.unwrap().task_id, "t1");
        assert!(registry.snapshot("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let registry = TaskRegistry::new();
        let (id, e) = entry("t1");
        let token = e.cancel.clone();
        let task = e.task.clone();
        registry.insert(&id, e);

        assert_eq!(registry.cancel("missing").await, CancelOutcome::NotFound);
        assert_eq!(registry.cancel("t1").await, CancelOutcome::Requested);
        assert!(token.is_cancelled());
        assert_eq!(task.read().await.status, TaskStatus::Cancelled);

        assert_eq!(registry.cancel("t1").await, CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_cancel_leaves_finished_task_alone() {
        let registry = TaskRegistry::new();
        let (id, e) = entry("t1");
        let token = e.cancel.clone();
        let task = e.task.clone();
        registry.insert(&id, e);
        {
            let mut t = task.write().await;
            t.start().unwrap();
            t.fail("boom").unwrap();
        }

        assert_eq!(registry.cancel("t1").await, CancelOutcome::AlreadyTerminal);
        assert!(!token.is_cancelled());
        assert_eq!(task.read().await.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_purge_only_terminal() {
        let registry = TaskRegistry::new();
        let (id, e) = entry("t1");
        let task = e.task.clone();
        registry.insert(&id, e);

        assert_eq!(registry.purge("t1").await, PurgeOutcome::StillLive);
        task.write().await.fail("boom").unwrap();
        assert_eq!(registry.purge("t1").await, PurgeOutcome::Removed);
        assert_eq!(registry.purge("t1").await, PurgeOutcome::NotFound);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_queue_groups_cancelled_with_failed() {
        let registry = TaskRegistry::new();
        for (id, status) in [
            ("q", TaskStatus::Queued),
            ("p", TaskStatus::Processing),
            ("c", TaskStatus::Completed),
            ("f", TaskStatus::Failed),
            ("x", TaskStatus::Cancelled),
        ] {
            let (id_owned, e) = entry(id);
            e.task.write().await.status = status;
            registry.insert(&id_owned, e);
        }

        let queue = registry.queue().await;
        assert_eq!(queue.queued.len(), 1);
        assert_eq!(queue.processing.len(), 1);
        assert_eq!(queue.completed.len(), 1);
        assert_eq!(queue.failed.len(), 2);
    }
}
