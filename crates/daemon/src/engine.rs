//! Job submission: validates a request, registers the task and spawns its
//! executor.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broadcaster::Broadcaster;
use crate::classify::ErrorCategory;
use crate::collaborators::{CollaboratorError, NotificationKind};
use crate::job_executor::{failure_message, ExecutorContext, TaskExecutor};
use crate::postprocess::cleanup_failed_output;
use crate::registry::{TaskEntry, TaskRegistry};
use crate::startup::{validate_encoding_settings, EncoderCapabilities, SettingsError};
use crate::task::{EncodeRequest, EncodingTask, SharedTask};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),

    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("Recording {0} is already re-encoded")]
    AlreadyEncoded(i64),

    #[error("Task {0} already exists")]
    DuplicateTask(String),

    #[error("Recording store error: {0}")]
    Store(#[from] CollaboratorError),
}

pub struct TaskEngine {
    registry: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    ctx: Arc<ExecutorContext>,
    capabilities: EncoderCapabilities,
}

impl TaskEngine {
    pub fn new(ctx: ExecutorContext, capabilities: EncoderCapabilities) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            ctx: Arc::new(ctx),
            capabilities,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn context(&self) -> &Arc<ExecutorContext> {
        &self.ctx
    }

    /// Accepts a job and starts its executor. Returns the task id.
    pub async fn submit(&self, request: EncodeRequest) -> Result<String, SubmitError> {
        validate_encoding_settings(
            request.codec,
            request.encoder_kind,
            &request.quality_preset,
            &self.capabilities,
        )?;

        if !tokio::fs::try_exists(&request.input_path).await.unwrap_or(false) {
            return Err(SubmitError::InputMissing(request.input_path.clone()));
        }

        if request.recording_id > 0
            && self
                .ctx
                .collaborators
                .recordings
                .is_already_encoded(request.recording_id)
                .await?
        {
            return Err(SubmitError::AlreadyEncoded(request.recording_id));
        }

        let task = EncodingTask::new(&request, self.ctx.config.retry.max_retry_count);
        let task_id = task.task_id.clone();
        let shared = task.into_shared();
        let cancel = CancellationToken::new();
        let entry = TaskEntry {
            task: Arc::clone(&shared),
            cancel: cancel.clone(),
        };
        if !self.registry.insert(&task_id, entry) {
            return Err(SubmitError::DuplicateTask(task_id));
        }

        info!(
            task_id = %task_id,
            input = %request.input_path.display(),
            codec = %request.codec,
            encoder_kind = %request.encoder_kind,
            "task submitted"
        );

        let executor = TaskExecutor::new(Arc::clone(&shared), cancel, Arc::clone(&self.ctx));
        let handle = tokio::spawn(executor.run());
        let ctx = Arc::clone(&self.ctx);
        let id = task_id.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                error!(task_id = %id, error = %e, "executor aborted");
                fail_aborted_task(&ctx, &shared, &e).await;
            }
        });

        Ok(task_id)
    }

    /// Cancels every live task.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
        if let Some(semaphore) = &self.ctx.admission {
            semaphore.close();
        }
    }
}

/// A panicking executor still has to leave a terminal task behind, with its
/// partial output cleaned up and the failure reported.
async fn fail_aborted_task(ctx: &ExecutorContext, shared: &SharedTask, err: &JoinError) {
    let message = format!("Unexpected error: {}", err);
    let snapshot = {
        let mut task = shared.write().await;
        if task.fail(message.clone()).is_err() {
            return;
        }
        task.clone()
    };

    // A tracked path belongs to another live executor.
    if !ctx.tracker.contains(&snapshot.output_path) {
        cleanup_failed_output(&snapshot.output_path);
    }
    ctx.events.record_error(&snapshot, ErrorCategory::Unknown);
    ctx.metrics.write().await.record_terminal(&snapshot);
    ctx.collaborators
        .notify_task(
            &snapshot,
            NotificationKind::Failed,
            failure_message(ErrorCategory::Unknown, message),
        )
        .await;
}
