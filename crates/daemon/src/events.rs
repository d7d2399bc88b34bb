//! Append-only JSONL records of finished jobs.
//!
//! `encoding.jsonl` gets one line per completed job and `error.jsonl` one
//! line per failed job. Write failures are logged and never affect the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::classify::ErrorCategory;
use crate::task::{Codec, EncoderKind, EncodingTask};

pub const ENCODING_LOG_FILE: &str = "encoding.jsonl";
pub const ERROR_LOG_FILE: &str = "error.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub task_id: String,
    pub recording_id: i64,
    pub codec: Codec,
    pub encoder_kind: EncoderKind,
    pub input_size_bytes: u64,
    pub output_size_bytes: u64,
    pub compression_ratio_percent: f64,
    pub elapsed_seconds: f64,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn from_task(task: &EncodingTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            recording_id: task.recording_id,
            codec: task.codec,
            encoder_kind: task.encoder_kind,
            input_size_bytes: task.input_size_bytes.unwrap_or(0),
            output_size_bytes: task.output_size_bytes.unwrap_or(0),
            compression_ratio_percent: task.compression_ratio().unwrap_or(0.0),
            elapsed_seconds: task.elapsed_seconds.unwrap_or(0.0),
            retry_count: task.retry_count,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub task_id: String,
    pub recording_id: i64,
    pub error_message: String,
    pub category: ErrorCategory,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// JSONL sink; a `None` directory disables it.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    dir: Option<PathBuf>,
}

impl EventLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn record_completion(&self, task: &EncodingTask) {
        self.write(ENCODING_LOG_FILE, &CompletionEvent::from_task(task));
    }

    pub fn record_error(&self, task: &EncodingTask, category: ErrorCategory) {
        let event = ErrorEvent {
            task_id: task.task_id.clone(),
            recording_id: task.recording_id,
            error_message: task.error_message.clone().unwrap_or_default(),
            category,
            retry_count: task.retry_count,
            timestamp: Utc::now(),
        };
        self.write(ERROR_LOG_FILE, &event);
    }

    fn write<T: Serialize>(&self, file_name: &str, event: &T) {
        let Some(dir) = &self.dir else {
            return;
        };
        let path = dir.join(file_name);
        if let Err(e) = append_line(&path, event) {
            warn!(path = %path.display(), error = %e, "failed to write event log");
        }
    }
}

fn append_line<T: Serialize>(path: &Path, event: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(writer, "{}", json)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EncodeRequest;
    use tempfile::TempDir;

    fn finished_task() -> EncodingTask {
        let mut task = EncodingTask::new(
            &EncodeRequest::new("/rec/show.ts", Codec::Hevc, EncoderKind::Hardware),
            3,
        );
        task.start().unwrap();
        task.complete(1000, 400, PathBuf::from("/rec/Encoded/show_hevc.ts"))
            .unwrap();
        task
    }

    #[test]
    fn test_completion_event_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(Some(dir.path().join("logs")));
        let task = finished_task();

        log.record_completion(&task);
        log.record_completion(&task);

        let text = fs::read_to_string(dir.path().join("logs").join(ENCODING_LOG_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let event: CompletionEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event.task_id, task.task_id);
        assert_eq!(event.output_size_bytes, 400);
        assert!((event.compression_ratio_percent - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_event_fields() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(Some(dir.path().to_path_buf()));
        let mut task = EncodingTask::new(
            &EncodeRequest::new("/rec/show.ts", Codec::H264, EncoderKind::Software),
            3,
        );
        task.start().unwrap();
        task.retry_count = 3;
        task.fail("Stream mapping failed").unwrap();

        log.record_error(&task, ErrorCategory::PipelineStream);

        let text = fs::read_to_string(dir.path().join(ERROR_LOG_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["category"], "PIPELINE_STREAM");
        assert_eq!(value["retry_count"], 3);
        assert_eq!(value["error_message"], "Stream mapping failed");
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let log = EventLog::disabled();
        assert!(log.dir().is_none());
        log.record_completion(&finished_task());
    }
}
