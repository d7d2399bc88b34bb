//! Interfaces to services outside the engine.
//!
//! The recording database, the keyframe/commercial analyzers and the
//! notification sink live elsewhere; the executor only sees these traits.
//! In-memory and logging implementations back the standalone daemon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use crate::task::{Codec, EncodingTask};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Metadata written after a successful re-encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRecordingUpdate {
    pub codec: Codec,
    pub new_path: PathBuf,
    pub encoded_at: DateTime<Utc>,
}

/// Persisted recording metadata.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn recording_exists(&self, recording_id: i64) -> CollaboratorResult<bool>;

    async fn is_already_encoded(&self, recording_id: i64) -> CollaboratorResult<bool>;

    /// Points the recording at the new file. Other metadata stays untouched.
    async fn update_encoded_recording(
        &self,
        recording_id: i64,
        update: EncodedRecordingUpdate,
    ) -> CollaboratorResult<()>;
}

/// Best-effort analysis re-run against the re-encoded file.
#[async_trait]
pub trait MetadataAnalyzer: Send + Sync {
    async fn analyze_keyframes(&self, recording_id: i64, path: &Path) -> CollaboratorResult<()>;

    async fn detect_commercials(&self, recording_id: i64, path: &Path) -> CollaboratorResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub codec: Codec,
    pub message: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> CollaboratorResult<()>;
}

/// The set of external services handed to every executor.
#[derive(Clone)]
pub struct Collaborators {
    pub recordings: Arc<dyn RecordingStore>,
    pub analyzer: Arc<dyn MetadataAnalyzer>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Sends a notification about `task`; delivery failures are only logged.
    pub async fn notify_task(&self, task: &EncodingTask, kind: NotificationKind, message: String) {
        let notification = Notification {
            task_id: task.task_id.clone(),
            kind,
            title: task.title.clone(),
            codec: task.codec,
            message,
        };
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(task_id = %task.task_id, error = %e, "notification failed");
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            recordings: Arc::new(InMemoryRecordingStore::default()),
            analyzer: Arc::new(NoopAnalyzer),
            notifier: Arc::new(LoggingNotifier),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingEntry {
    pub path: PathBuf,
    pub encoded: Option<EncodedRecordingUpdate>,
}

/// Process-local recording table.
#[derive(Debug, Default)]
pub struct InMemoryRecordingStore {
    recordings: Mutex<HashMap<i64, RecordingEntry>>,
}

impl InMemoryRecordingStore {
    pub fn insert(&self, recording_id: i64, path: impl Into<PathBuf>) {
        let entry = RecordingEntry {
            path: path.into(),
            encoded: None,
        };
        self.lock().insert(recording_id, entry);
    }

    pub fn get(&self, recording_id: i64) -> Option<RecordingEntry> {
        self.lock().get(&recording_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, RecordingEntry>> {
        self.recordings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RecordingStore for InMemoryRecordingStore {
    async fn recording_exists(&self, recording_id: i64) -> CollaboratorResult<bool> {
        Ok(self.lock().contains_key(&recording_id))
    }

    async fn is_already_encoded(&self, recording_id: i64) -> CollaboratorResult<bool> {
        Ok(self
            .lock()
            .get(&recording_id)
            .is_some_and(|entry| entry.encoded.is_some()))
    }

    async fn update_encoded_recording(
        &self,
        recording_id: i64,
        update: EncodedRecordingUpdate,
    ) -> CollaboratorResult<()> {
        let mut recordings = self.lock();
        let entry = recordings
            .get_mut(&recording_id)
            .ok_or_else(|| CollaboratorError::new(format!("Recording {} not found", recording_id)))?;
        entry.path = update.new_path.clone();
        entry.encoded = Some(update);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl MetadataAnalyzer for NoopAnalyzer {
    async fn analyze_keyframes(&self, _recording_id: i64, _path: &Path) -> CollaboratorResult<()> {
        Ok(())
    }

    async fn detect_commercials(&self, _recording_id: i64, _path: &Path) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// Emits notifications as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, n: Notification) -> CollaboratorResult<()> {
        match n.kind {
            NotificationKind::Complete => {
                info!(task_id = %n.task_id, title = %n.title, codec = %n.codec, "{}", n.message)
            }
            NotificationKind::Failed => {
                warn!(task_id = %n.task_id, title = %n.title, codec = %n.codec, "{}", n.message)
            }
        }
        Ok(())
    }
}

/// Collects notifications for inspection in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl CollectingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, notification: Notification) -> CollaboratorResult<()> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}
