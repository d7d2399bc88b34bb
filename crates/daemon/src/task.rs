//! Encoding task model.
//!
//! An [`EncodingTask`] carries the immutable job description plus the mutable
//! execution state the executor drives through
//! `queued -> processing -> {completed | failed | cancelled}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::progress::INITIAL_PROGRESS;

/// Target video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
        }
    }

    /// Name stored in recording metadata.
    pub fn display_name(self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::Hevc => "H.265",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Software (FFmpeg) or hardware encoder path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Software,
    Hardware,
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderKind::Software => write!(f, "software"),
            EncoderKind::Hardware => write!(f, "hardware"),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Edges of the task state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

fn default_quality_preset() -> String {
    "medium".to_string()
}

/// Job submission payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeRequest {
    /// External recording id (0 or negative when there is no backing record)
    #[serde(default)]
    pub recording_id: i64,
    pub input_path: PathBuf,
    pub codec: Codec,
    pub encoder_kind: EncoderKind,
    #[serde(default = "default_quality_preset")]
    pub quality_preset: String,
    #[serde(default)]
    pub delete_original: bool,
    /// Defaults to `<stem>_<codec><ext>` next to the input
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Caller-provided id; a UUID is generated otherwise
    #[serde(default)]
    pub task_id: Option<String>,
}

impl EncodeRequest {
    pub fn new(input_path: impl Into<PathBuf>, codec: Codec, encoder_kind: EncoderKind) -> Self {
        Self {
            recording_id: 0,
            input_path: input_path.into(),
            codec,
            encoder_kind,
            quality_preset: default_quality_preset(),
            delete_original: false,
            output_path: None,
            task_id: None,
        }
    }
}

/// Default output location: `<input dir>/<stem>_<codec><ext>`.
pub fn default_output_path(input: &Path, codec: Codec) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}_{}.{}", stem, codec, ext.to_string_lossy()),
        None => format!("{}_{}", stem, codec),
    };
    input.with_file_name(name)
}

/// The unit of work plus its execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingTask {
    pub task_id: String,
    pub recording_id: i64,
    /// Display title derived from the input file name
    pub title: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub codec: Codec,
    pub encoder_kind: EncoderKind,
    pub quality_preset: String,
    pub delete_original: bool,

    pub status: TaskStatus,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub input_size_bytes: Option<u64>,
    pub output_size_bytes: Option<u64>,
    pub elapsed_seconds: Option<f64>,
    /// Where the finished file was moved to
    pub final_path: Option<PathBuf>,
}

/// Task state shared between its executor and readers.
pub type SharedTask = Arc<RwLock<EncodingTask>>;

impl EncodingTask {
    pub fn new(request: &EncodeRequest, max_retry_count: u32) -> Self {
        let task_id = request
            .task_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let output_path = request
            .output_path
            .clone()
            .unwrap_or_else(|| default_output_path(&request.input_path, request.codec));
        let title = request
            .input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            task_id,
            recording_id: request.recording_id,
            title,
            input_path: request.input_path.clone(),
            output_path,
            codec: request.codec,
            encoder_kind: request.encoder_kind,
            quality_preset: request.quality_preset.clone(),
            delete_original: request.delete_original,
            status: TaskStatus::Queued,
            progress: 0.0,
            retry_count: 0,
            max_retry_count,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_size_bytes: None,
            output_size_bytes: None,
            elapsed_seconds: None,
            final_path: None,
        }
    }

    pub fn into_shared(self) -> SharedTask {
        Arc::new(RwLock::new(self))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `queued -> processing`; progress starts at the initial value.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Processing)?;
        self.started_at = Some(Utc::now());
        if self.progress == 0.0 {
            self.progress = INITIAL_PROGRESS;
        }
        Ok(())
    }

    /// Raises progress while processing. Lower values are ignored.
    pub fn advance_progress(&mut self, value: f64) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }
        let value = value.clamp(0.0, 100.0);
        if value > self.progress {
            self.progress = value;
            true
        } else {
            false
        }
    }

    /// Records the most recent attempt failure without changing status.
    /// Ignored once terminal, so a cancelled task never shows an error.
    pub fn record_error(&mut self, message: impl Into<String>) {
        if !self.is_terminal() {
            self.error_message = Some(message.into());
        }
    }

    pub fn complete(
        &mut self,
        input_size_bytes: u64,
        output_size_bytes: u64,
        final_path: PathBuf,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Completed)?;
        let now = Utc::now();
        self.progress = 100.0;
        self.completed_at = Some(now);
        self.input_size_bytes = Some(input_size_bytes);
        self.output_size_bytes = Some(output_size_bytes);
        self.elapsed_seconds = self
            .started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
        self.final_path = Some(final_path);
        self.error_message = None;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.progress = 0.0;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Cancellation carries no error message.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        self.error_message = None;
        Ok(())
    }

    /// Output size reduction as a percentage of the input.
    pub fn compression_ratio(&self) -> Option<f64> {
        match (self.input_size_bytes, self.output_size_bytes) {
            (Some(input), Some(output)) if input > 0 => {
                Some((1.0 - output as f64 / input as f64) * 100.0)
            }
            _ => None,
        }
    }
}
