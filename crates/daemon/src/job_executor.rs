//! Task executor for the re-encode daemon
//!
//! Drives one task from `queued` to a terminal state: admission, input
//! validation, the attempt/retry loop around the transcoder, post-processing
//! and notification. Errors never escape [`TaskExecutor::run`]; they end up on
//! the task as `error_message`.

use crate::classify::{backoff_secs, classify_error, should_retry, ErrorCategory};
use crate::collaborators::{Collaborators, EncodedRecordingUpdate, NotificationKind};
use crate::config::{Config, EnrichmentFailurePolicy};
use crate::disk::{has_space_for, DiskUsage, SystemDiskUsage};
use crate::encode::command::CommandBuilder;
use crate::encode::probe::inspect_streams;
use crate::encode::supervisor::{ProcessSupervisor, RunOutcome, TERMINATE_TIMEOUT};
use crate::events::EventLog;
use crate::metrics::SharedMetrics;
use crate::postprocess::{
    cleanup_failed_output, delete_original_with_sidecars, move_file, move_to_destination,
    verify_output, PostProcessError, StabilityPolicy,
};
use crate::progress::ProgressEstimator;
use crate::task::{EncodingTask, SharedTask, TaskStatus};
use crate::tracker::EncodingFileTracker;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of stderr kept in a failure message
const ERROR_TAIL_LINES: usize = 20;

/// Errors raised before the first attempt. None of them are retried.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("Insufficient disk space in {dir}: {required} bytes required")]
    InsufficientSpace { dir: PathBuf, required: u64 },

    #[error("Failed to create output directory {path}: {source}")]
    CreateOutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task is not startable: {0}")]
    InvalidState(#[from] crate::task::InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrepareError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PrepareError::InvalidState(_) => ErrorCategory::Unknown,
            _ => ErrorCategory::FileAccess,
        }
    }
}

/// Failure of a single attempt, classified from its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub message: String,
}

impl AttemptFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Failure text for a non-zero exit: the tail of stderr, or the code.
    pub fn from_exit(outcome: &RunOutcome) -> Self {
        let lines: Vec<&str> = outcome
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            return match outcome.exit_code {
                Some(code) => Self::new(format!("Transcoder exited with code {}", code)),
                None => Self::new("Process terminated by signal"),
            };
        }
        let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
        Self::new(lines[start..].join("\n"))
    }

    pub fn category(&self) -> ErrorCategory {
        classify_error(&self.message)
    }
}

impl From<PostProcessError> for AttemptFailure {
    fn from(e: PostProcessError) -> Self {
        Self::new(e.to_string())
    }
}

enum AttemptResult {
    Completed { output_size: u64, final_path: PathBuf },
    Failed(AttemptFailure),
    Cancelled,
}

/// Timing knobs; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorTiming {
    /// Length of one backoff "second"
    pub backoff_unit: Duration,
    pub stability: StabilityPolicy,
    pub terminate_timeout: Duration,
}

impl Default for ExecutorTiming {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(1),
            stability: StabilityPolicy::default(),
            terminate_timeout: TERMINATE_TIMEOUT,
        }
    }
}

/// Everything an executor needs besides its task; shared by all executors.
pub struct ExecutorContext {
    pub config: Arc<Config>,
    pub commands: CommandBuilder,
    pub tracker: Arc<EncodingFileTracker>,
    pub collaborators: Collaborators,
    pub disk: Arc<dyn DiskUsage>,
    pub events: EventLog,
    pub metrics: SharedMetrics,
    /// Bounds running transcodes; `None` is unbounded
    pub admission: Option<Arc<Semaphore>>,
    pub timing: ExecutorTiming,
}

impl ExecutorContext {
    pub fn new(
        config: Config,
        tracker: Arc<EncodingFileTracker>,
        collaborators: Collaborators,
        metrics: SharedMetrics,
    ) -> Self {
        let admission = match config.jobs.max_concurrent_jobs {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n as usize))),
        };
        let timing = ExecutorTiming {
            stability: StabilityPolicy::from(&config.postprocess),
            ..ExecutorTiming::default()
        };
        Self {
            commands: CommandBuilder::new(config.tools.clone(), config.encoder.clone()),
            events: EventLog::new(config.logging.event_log_dir.clone()),
            config: Arc::new(config),
            tracker,
            collaborators,
            disk: Arc::new(SystemDiskUsage),
            metrics,
            admission,
            timing,
        }
    }

    pub fn with_disk(mut self, disk: Arc<dyn DiskUsage>) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_timing(mut self, timing: ExecutorTiming) -> Self {
        self.timing = timing;
        self
    }
}

/// Drives one task to a terminal state.
pub struct TaskExecutor {
    task: SharedTask,
    cancel: CancellationToken,
    ctx: Arc<ExecutorContext>,
    /// Set once this executor has held the tracker entry for the output
    owns_output: bool,
}

impl TaskExecutor {
    pub fn new(task: SharedTask, cancel: CancellationToken, ctx: Arc<ExecutorContext>) -> Self {
        Self {
            task,
            cancel,
            ctx,
            owns_output: false,
        }
    }

    /// Runs the task to completion, failure or cancellation.
    pub async fn run(mut self) {
        let task_id = self.task.read().await.task_id.clone();

        let _permit = match self.admit().await {
            Some(permit) => permit,
            None => {
                self.finish_cancelled().await;
                return;
            }
        };
        if self.cancel.is_cancelled() {
            self.finish_cancelled().await;
            return;
        }

        let input_size = match self.prepare().await {
            Ok(size) => size,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task preparation failed");
                self.finish_failed(e.to_string(), e.category()).await;
                return;
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                self.finish_cancelled().await;
                return;
            }

            let attempt = self.task.read().await.retry_count + 1;
            info!(task_id = %task_id, attempt, "starting attempt");

            match self.attempt(input_size).await {
                AttemptResult::Completed {
                    output_size,
                    final_path,
                } => {
                    self.finish_completed(input_size, output_size, final_path)
                        .await;
                    return;
                }
                AttemptResult::Cancelled => {
                    self.finish_cancelled().await;
                    return;
                }
                AttemptResult::Failed(failure) => {
                    // A cancel that landed during post-processing wins.
                    if self.cancel.is_cancelled() {
                        self.finish_cancelled().await;
                        return;
                    }
                    let category = failure.category();
                    let (retry_count, max_retry_count) = {
                        let mut task = self.task.write().await;
                        task.record_error(failure.message.clone());
                        (task.retry_count, task.max_retry_count)
                    };

                    if !should_retry(category, retry_count, max_retry_count) {
                        warn!(
                            task_id = %task_id,
                            category = %category,
                            attempt,
                            "attempt failed, not retrying"
                        );
                        self.finish_failed(failure.message, category).await;
                        return;
                    }

                    // Checked again right before sleeping so a cancel that
                    // raced the failure is not lost.
                    if self.cancel.is_cancelled() {
                        self.finish_cancelled().await;
                        return;
                    }
                    let retry_index = {
                        let mut task = self.task.write().await;
                        task.retry_count += 1;
                        task.retry_count - 1
                    };
                    let secs = backoff_secs(
                        category,
                        retry_index,
                        self.ctx.config.retry.max_delay_secs,
                    );
                    let delay = self.ctx.timing.backoff_unit * secs as u32;
                    warn!(
                        task_id = %task_id,
                        category = %category,
                        attempt,
                        retry = retry_index + 1,
                        delay_secs = secs,
                        "attempt failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            self.finish_cancelled().await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Waits for an admission slot. `None` means cancelled while waiting.
    async fn admit(&self) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(semaphore) = &self.ctx.admission else {
            return Some(None);
        };
        let semaphore = Arc::clone(semaphore);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            // A closed semaphore only happens on shutdown; run unbounded.
            permit = semaphore.acquire_owned() => Some(permit.ok()),
        }
    }

    /// `queued -> processing`: input check, free space, output directory.
    async fn prepare(&self) -> Result<u64, PrepareError> {
        let (input, output) = {
            let mut task = self.task.write().await;
            task.start()?;
            (task.input_path.clone(), task.output_path.clone())
        };

        let input_size = match tokio::fs::metadata(&input).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrepareError::InputMissing(input))
            }
            Err(e) => return Err(e.into()),
        };

        let out_dir = output
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        if !has_space_for(self.ctx.disk.as_ref(), &out_dir, input_size) {
            return Err(PrepareError::InsufficientSpace {
                dir: out_dir,
                required: input_size.saturating_mul(crate::disk::REQUIRED_SPACE_FACTOR),
            });
        }

        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|source| PrepareError::CreateOutputDir {
                path: out_dir.clone(),
                source,
            })?;

        let mut task = self.task.write().await;
        task.input_size_bytes = Some(input_size);
        Ok(input_size)
    }

    async fn attempt(&mut self, input_size: u64) -> AttemptResult {
        let snapshot = self.task.read().await.clone();

        let Some(_tracked) = self.ctx.tracker.try_track(&snapshot.output_path) else {
            return AttemptResult::Failed(AttemptFailure::new(format!(
                "Output file is already being encoded: {}",
                snapshot.output_path.display()
            )));
        };
        self.owns_output = true;

        let layout = inspect_streams(&self.ctx.config.tools.ffprobe_path, &snapshot.input_path).await;
        let command = self.ctx.commands.build(&snapshot, &layout);
        info!(
            task_id = %snapshot.task_id,
            encoder = command.backend.name(),
            command = %command.display(),
            "launching transcoder"
        );

        let supervisor = match ProcessSupervisor::spawn(&command) {
            Ok(s) => s.with_terminate_timeout(self.ctx.timing.terminate_timeout),
            Err(e) => return AttemptResult::Failed(AttemptFailure::new(e.to_string())),
        };

        let mut estimator = ProgressEstimator::new(input_size, snapshot.progress, Instant::now());
        let (progress_tx, progress_rx) = watch::channel(snapshot.progress);
        let forwarder = tokio::spawn(forward_progress(progress_rx, Arc::clone(&self.task)));

        let result = supervisor
            .run(&mut estimator, &progress_tx, &self.cancel)
            .await;
        drop(progress_tx);
        let _ = forwarder.await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return AttemptResult::Failed(AttemptFailure::new(e.to_string())),
        };
        if outcome.cancelled {
            return AttemptResult::Cancelled;
        }
        if !outcome.success() {
            return AttemptResult::Failed(AttemptFailure::from_exit(&outcome));
        }
        debug!(
            task_id = %snapshot.task_id,
            completion_detected = outcome.completion_detected,
            "transcoder finished"
        );

        let verified = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptResult::Cancelled,
            r = verify_output(&snapshot.output_path, self.ctx.timing.stability) => r,
        };
        let output_size = match verified {
            Ok(size) => size,
            Err(e) => return AttemptResult::Failed(e.into()),
        };

        match self.finalize_output(&snapshot).await {
            Ok(final_path) => AttemptResult::Completed {
                output_size,
                final_path,
            },
            Err(e) => AttemptResult::Failed(e.into()),
        }
    }

    /// Move, enrichment and metadata update, then original deletion.
    ///
    /// The metadata update is the commit point. A failure before it moves the
    /// file back to the working path; nothing after it fails the attempt.
    async fn finalize_output(&self, task: &EncodingTask) -> Result<PathBuf, PostProcessError> {
        let output = task.output_path.clone();
        let output_cfg = self.ctx.config.output.clone();
        let final_path = run_blocking(move || move_to_destination(&output, &output_cfg)).await?;

        if task.recording_id > 0 {
            let committed = async {
                self.enrich(task, &final_path).await?;
                self.update_recording(task, &final_path).await
            }
            .await;
            if let Err(e) = committed {
                self.restore_output(task, &final_path).await;
                return Err(e);
            }
        }

        if task.delete_original {
            let original = task.input_path.clone();
            if let Err(e) = run_blocking(move || delete_original_with_sidecars(&original)).await {
                warn!(task_id = %task.task_id, error = %e, "could not delete original recording");
            }
        }

        Ok(final_path)
    }

    /// Undoes the move so a failed attempt leaves nothing in the destination.
    async fn restore_output(&self, task: &EncodingTask, final_path: &std::path::Path) {
        if final_path == task.output_path {
            return;
        }
        let (from, to) = (final_path.to_path_buf(), task.output_path.clone());
        let result = run_blocking(move || move_file(&from, &to).map_err(PostProcessError::from)).await;
        match result {
            Ok(()) => debug!(task_id = %task.task_id, "moved output back to working path"),
            Err(e) => error!(
                task_id = %task.task_id,
                path = %final_path.display(),
                error = %e,
                "could not move output back after failed post-processing"
            ),
        }
    }

    async fn update_recording(
        &self,
        task: &EncodingTask,
        final_path: &std::path::Path,
    ) -> Result<(), PostProcessError> {
        let store = &self.ctx.collaborators.recordings;
        let exists = store
            .recording_exists(task.recording_id)
            .await
            .map_err(|e| PostProcessError::Metadata(e.to_string()))?;
        if !exists {
            warn!(
                task_id = %task.task_id,
                recording_id = task.recording_id,
                "recording not found, skipping metadata update"
            );
            return Ok(());
        }

        let update = EncodedRecordingUpdate {
            codec: task.codec,
            new_path: final_path.to_path_buf(),
            encoded_at: Utc::now(),
        };
        store
            .update_encoded_recording(task.recording_id, update)
            .await
            .map_err(|e| PostProcessError::Metadata(e.to_string()))?;
        info!(task_id = %task.task_id, recording_id = task.recording_id, "recording metadata updated");
        Ok(())
    }

    /// Keyframe and commercial analysis; each runs regardless of the other.
    async fn enrich(&self, task: &EncodingTask, final_path: &std::path::Path) -> Result<(), PostProcessError> {
        let analyzer = &self.ctx.collaborators.analyzer;
        let mut failures = Vec::new();

        if let Err(e) = analyzer.analyze_keyframes(task.recording_id, final_path).await {
            warn!(task_id = %task.task_id, error = %e, "keyframe analysis failed");
            failures.push(format!("keyframe analysis: {}", e));
        }
        if let Err(e) = analyzer.detect_commercials(task.recording_id, final_path).await {
            warn!(task_id = %task.task_id, error = %e, "commercial detection failed");
            failures.push(format!("commercial detection: {}", e));
        }

        match self.ctx.config.jobs.enrichment_failure {
            EnrichmentFailurePolicy::FailAttempt if !failures.is_empty() => {
                Err(PostProcessError::Enrichment(failures.join("; ")))
            }
            _ => Ok(()),
        }
    }

    async fn finish_completed(&self, input_size: u64, output_size: u64, final_path: PathBuf) {
        let snapshot = {
            let mut task = self.task.write().await;
            match task.complete(input_size, output_size, final_path) {
                Ok(()) => Some(task.clone()),
                Err(e) if e.from == TaskStatus::Cancelled => {
                    warn!(task_id = %task.task_id, "cancelled after the output was committed");
                    None
                }
                Err(e) => {
                    error!(task_id = %task.task_id, error = %e, "could not mark task completed");
                    return;
                }
            }
        };
        let Some(snapshot) = snapshot else {
            self.finish_cancelled().await;
            return;
        };

        info!(
            task_id = %snapshot.task_id,
            retries = snapshot.retry_count,
            output_size,
            elapsed_secs = snapshot.elapsed_seconds.unwrap_or_default(),
            "task completed"
        );
        self.ctx.events.record_completion(&snapshot);
        self.ctx.metrics.write().await.record_terminal(&snapshot);

        let ratio = snapshot.compression_ratio().unwrap_or_default();
        self.notify(
            &snapshot,
            NotificationKind::Complete,
            format!(
                "Re-encode to {} completed ({:.1}% smaller)",
                snapshot.codec.display_name(),
                ratio
            ),
        )
        .await;
    }

    async fn finish_failed(&self, message: String, category: ErrorCategory) {
        let snapshot = {
            let mut task = self.task.write().await;
            match task.fail(message.clone()) {
                Ok(()) => Some(task.clone()),
                Err(e) if e.from == TaskStatus::Cancelled => None,
                Err(e) => {
                    debug!(task_id = %task.task_id, error = %e, "task already terminal");
                    return;
                }
            }
        };
        let Some(snapshot) = snapshot else {
            self.finish_cancelled().await;
            return;
        };
        self.cleanup(&snapshot);

        error!(
            task_id = %snapshot.task_id,
            category = %category,
            retries = snapshot.retry_count,
            error = %message,
            "task failed"
        );
        self.ctx.events.record_error(&snapshot, category);
        self.ctx.metrics.write().await.record_terminal(&snapshot);

        self.notify(&snapshot, NotificationKind::Failed, failure_message(category, message))
            .await;
    }

    /// Cancellation is not an error: no notification, no error event.
    async fn finish_cancelled(&self) {
        let snapshot = {
            let mut task = self.task.write().await;
            // The registry may have flipped the status already.
            if task.status != TaskStatus::Cancelled {
                if let Err(e) = task.cancel() {
                    debug!(task_id = %task.task_id, error = %e, "task already terminal");
                    return;
                }
            }
            task.clone()
        };
        self.cleanup(&snapshot);
        info!(task_id = %snapshot.task_id, "task cancelled");
        self.ctx.metrics.write().await.record_terminal(&snapshot);
    }

    fn cleanup(&self, task: &EncodingTask) {
        if self.owns_output {
            cleanup_failed_output(&task.output_path);
        }
    }

    async fn notify(&self, task: &EncodingTask, kind: NotificationKind, message: String) {
        self.ctx.collaborators.notify_task(task, kind, message).await;
    }
}

/// Runs blocking filesystem work off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, PostProcessError>
where
    F: FnOnce() -> Result<T, PostProcessError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PostProcessError::Io(std::io::Error::other(e)))?
}

/// Failure notification text: the category hint, if any, then the message.
pub fn failure_message(category: ErrorCategory, message: String) -> String {
    match category.hint() {
        Some(hint) => format!("{} {}", hint, message),
        None => message,
    }
}

/// Copies estimator output into the task until the sender is dropped.
async fn forward_progress(mut rx: watch::Receiver<f64>, task: SharedTask) {
    while rx.changed().await.is_ok() {
        let value = *rx.borrow_and_update();
        task.write().await.advance_progress(value);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::collaborators::{
        CollaboratorError, CollaboratorResult, CollectingNotifier, InMemoryRecordingStore,
        MetadataAnalyzer,
    };
    use crate::disk::testing::FixedDiskUsage;
    use crate::metrics::new_shared_metrics;
    use crate::registry::{TaskEntry, TaskRegistry};
    use crate::task::{Codec, EncodeRequest, EncoderKind};
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Mock transcoder: counts invocations in `count`, then runs `body` with
    /// `$out` set to the `-o` argument.
    fn write_mock(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("mock-tsreplace.sh");
        let script = format!(
            "#!/bin/sh\n\
             out=\"\"\n\
             while [ $# -gt 0 ]; do\n\
               case \"$1\" in\n\
                 -o) if [ -z \"$out\" ]; then out=\"$2\"; fi; shift 2 ;;\n\
                 *) shift ;;\n\
               esac\n\
             done\n\
             n=$(cat '{count}' 2>/dev/null || echo 0)\n\
             n=$((n + 1))\n\
             echo $n > '{count}'\n\
             {body}\n",
            count = dir.join("count").display(),
            body = body,
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const SUCCEED: &str = "echo 'frames: 50/100 (50%)'\n\
         echo 'frames: 100/100 (100%)'\n\
         head -c 4096 /dev/zero > \"$out\"\n\
         exit 0";

    fn attempts(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("count"))
            .map(|s| s.trim().parse().unwrap())
            .unwrap_or(0)
    }

    fn fast_timing() -> ExecutorTiming {
        ExecutorTiming {
            backoff_unit: Duration::from_millis(1),
            stability: StabilityPolicy {
                timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(20),
                required_stable: Duration::from_millis(60),
            },
            terminate_timeout: Duration::from_millis(500),
        }
    }

    struct Harness {
        dir: TempDir,
        ctx: Arc<ExecutorContext>,
        notifier: Arc<CollectingNotifier>,
    }

    fn harness_with(body: &str, configure: impl FnOnce(&mut Config), collaborators: Option<Collaborators>) -> Harness {
        let dir = TempDir::new().unwrap();
        let mock = write_mock(dir.path(), body);
        std::fs::write(dir.path().join("a.ts"), vec![7u8; 2048]).unwrap();

        let mut config = Config::default();
        config.tools.tsreplace_path = mock;
        config.tools.ffprobe_path = PathBuf::from("/nonexistent/ffprobe");
        config.retry.max_retry_count = 3;
        configure(&mut config);

        let notifier = Arc::new(CollectingNotifier::default());
        let mut collaborators = collaborators.unwrap_or_default();
        collaborators.notifier = notifier.clone();

        let ctx = ExecutorContext::new(
            config,
            EncodingFileTracker::shared(),
            collaborators,
            new_shared_metrics(),
        )
        .with_disk(Arc::new(FixedDiskUsage(None)))
        .with_timing(fast_timing());

        Harness {
            dir,
            ctx: Arc::new(ctx),
            notifier,
        }
    }

    fn harness(body: &str) -> Harness {
        harness_with(body, |_| {}, None)
    }

    impl Harness {
        fn task(&self) -> SharedTask {
            self.task_for("a.ts")
        }

        fn task_for(&self, name: &str) -> SharedTask {
            let request = EncodeRequest::new(self.dir.path().join(name), Codec::H264, EncoderKind::Software);
            EncodingTask::new(&request, self.ctx.config.retry.max_retry_count).into_shared()
        }

        async fn run(&self, task: &SharedTask) {
            TaskExecutor::new(task.clone(), CancellationToken::new(), self.ctx.clone())
                .run()
                .await;
        }
    }

    async fn wait_for(task: &SharedTask, pred: impl Fn(&EncodingTask) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !pred(&*task.read().await) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let h = harness(SUCCEED);
        let task = h.task();

        // Observe progress while the task runs.
        let observer = {
            let task = task.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let t = task.read().await.clone();
                    seen.push(t.progress);
                    if t.is_terminal() {
                        return seen;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        h.run(&task).await;
        let seen = observer.await.unwrap();

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100.0);
        assert_eq!(t.retry_count, 0);
        assert_eq!(t.input_size_bytes, Some(2048));
        assert_eq!(t.output_size_bytes, Some(4096));
        assert!(t.completed_at.is_some());
        assert!(t.final_path.as_ref().unwrap().exists());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
        assert_eq!(attempts(h.dir.path()), 1);
        assert!(h.ctx.tracker.is_empty());

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Complete);
        assert_eq!(h.ctx.metrics.read().await.completed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_recovery() {
        let body = format!(
            "if [ \"$n\" -eq 1 ]; then echo 'Out of memory' >&2; exit 1; fi\n{}",
            SUCCEED
        );
        let h = harness(&body);
        let task = h.task();

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.retry_count, 1);
        assert_eq!(attempts(h.dir.path()), 2);
        assert!(h.ctx.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let h = harness("echo 'Stream mapping failed' >&2\nexit 1");
        let task = h.task();

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 3);
        assert_eq!(t.progress, 0.0);
        assert!(t.error_message.unwrap().contains("Stream mapping failed"));
        assert_eq!(attempts(h.dir.path()), 4);
        assert!(h.ctx.tracker.is_empty());

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Failed);
        let m = h.ctx.metrics.read().await;
        assert_eq!((m.failed, m.total_retries), (1, 3));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_short_circuits() {
        let h = harness("echo 'open failed: Permission denied' >&2\nexit 1");
        let task = h.task();

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 0);
        assert_eq!(attempts(h.dir.path()), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_cleans_small_output() {
        let h = harness("echo partial > \"$out\"\ntouch \"$out.part\"\necho 'Permission denied' >&2\nexit 1");
        let task = h.task();
        let output = task.read().await.output_path.clone();

        h.run(&task).await;

        assert!(!output.exists());
        assert!(!PathBuf::from(format!("{}.part", output.display())).exists());
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_attempt() {
        let h = harness(SUCCEED);
        let task = h.task_for("missing.ts");

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 0);
        assert!(t.error_message.unwrap().contains("Input file not found"));
        assert_eq!(attempts(h.dir.path()), 0);
    }

    #[tokio::test]
    async fn test_insufficient_disk_space_fails() {
        let h = harness(SUCCEED);
        let ctx = ExecutorContext::new(
            (*h.ctx.config).clone(),
            EncodingFileTracker::shared(),
            Collaborators::default(),
            new_shared_metrics(),
        )
        .with_disk(Arc::new(FixedDiskUsage(Some(crate::disk::DiskSpace {
            total_bytes: 10_000,
            free_bytes: 100,
        }))))
        .with_timing(fast_timing());
        let task = h.task();

        TaskExecutor::new(task.clone(), CancellationToken::new(), Arc::new(ctx))
            .run()
            .await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.error_message.unwrap().contains("Insufficient disk space"));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let h = harness("echo 'Out of memory' >&2\nexit 1");
        // RESOURCE backs off 30 units; make that long.
        let ctx = ExecutorContext::new(
            (*h.ctx.config).clone(),
            h.ctx.tracker.clone(),
            Collaborators {
                notifier: h.notifier.clone(),
                ..Collaborators::default()
            },
            new_shared_metrics(),
        )
        .with_disk(Arc::new(FixedDiskUsage(None)))
        .with_timing(ExecutorTiming {
            backoff_unit: Duration::from_secs(1),
            ..fast_timing()
        });
        let task = h.task();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            TaskExecutor::new(task.clone(), cancel.clone(), Arc::new(ctx)).run(),
        );

        wait_for(&task, |t| t.retry_count == 1).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("executor did not stop")
            .unwrap();

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.error_message.is_none());
        assert_eq!(attempts(h.dir.path()), 1);
        assert!(h.notifier.sent().is_empty());
        assert!(h.ctx.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_process() {
        let h = harness("echo 'frames: 10/100 (10%)'\nexec sleep 30");
        let task = h.task();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            TaskExecutor::new(task.clone(), cancel.clone(), h.ctx.clone()).run(),
        );

        wait_for(&task, |t| t.progress >= 10.0).await;
        assert_eq!(h.ctx.tracker.len(), 1);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("executor did not stop")
            .unwrap();

        assert_eq!(task.read().await.status, TaskStatus::Cancelled);
        assert!(h.ctx.tracker.is_empty());
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_admission_limit_queues_and_cancels_waiting_task() {
        let h = harness_with(
            "echo 'frames: 10/100 (10%)'\nexec sleep 30",
            |c| c.jobs.max_concurrent_jobs = 1,
            None,
        );
        std::fs::write(h.dir.path().join("b.ts"), vec![1u8; 1024]).unwrap();

        let first = h.task();
        let second = h.task_for("b.ts");
        let (c1, c2) = (CancellationToken::new(), CancellationToken::new());
        let h1 = tokio::spawn(TaskExecutor::new(first.clone(), c1.clone(), h.ctx.clone()).run());
        wait_for(&first, |t| t.status == TaskStatus::Processing).await;
        let h2 = tokio::spawn(TaskExecutor::new(second.clone(), c2.clone(), h.ctx.clone()).run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(second.read().await.status, TaskStatus::Queued);

        c2.cancel();
        h2.await.unwrap();
        assert_eq!(second.read().await.status, TaskStatus::Cancelled);

        c1.cancel();
        h1.await.unwrap();
        assert_eq!(first.read().await.status, TaskStatus::Cancelled);
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl MetadataAnalyzer for FailingAnalyzer {
        async fn analyze_keyframes(&self, _id: i64, _path: &Path) -> CollaboratorResult<()> {
            Err(CollaboratorError::new("keyframe analysis crashed"))
        }

        async fn detect_commercials(&self, _id: i64, _path: &Path) -> CollaboratorResult<()> {
            Ok(())
        }
    }

    fn store_with_recording(dir: &Path) -> Arc<InMemoryRecordingStore> {
        let store = Arc::new(InMemoryRecordingStore::default());
        store.insert(42, dir.join("a.ts"));
        store
    }

    #[tokio::test]
    async fn test_metadata_updated_and_enrichment_failure_logged() {
        let recordings_dir = TempDir::new().unwrap();
        let store = store_with_recording(recordings_dir.path());
        let collaborators = Collaborators {
            recordings: store.clone(),
            analyzer: Arc::new(FailingAnalyzer),
            ..Collaborators::default()
        };
        let h = harness_with(SUCCEED, |_| {}, Some(collaborators));
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::Hevc, EncoderKind::Software);
        request.recording_id = 42;
        let task = EncodingTask::new(&request, 3).into_shared();

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Completed);
        let entry = store.get(42).unwrap();
        assert_eq!(Some(entry.path), t.final_path);
        assert_eq!(entry.encoded.unwrap().codec, Codec::Hevc);
    }

    #[tokio::test]
    async fn test_enrichment_failure_can_fail_attempt() {
        let recordings_dir = TempDir::new().unwrap();
        let collaborators = Collaborators {
            recordings: store_with_recording(recordings_dir.path()),
            analyzer: Arc::new(FailingAnalyzer),
            ..Collaborators::default()
        };
        let h = harness_with(
            SUCCEED,
            |c| c.jobs.enrichment_failure = EnrichmentFailurePolicy::FailAttempt,
            Some(collaborators),
        );
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::H264, EncoderKind::Software);
        request.recording_id = 42;
        let task = EncodingTask::new(&request, 3).into_shared();

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.error_message.unwrap().contains("keyframe analysis crashed"));
    }

    /// Keyframe analysis fails; commercial detection calls are counted.
    #[derive(Default)]
    struct CountingAnalyzer {
        commercial_runs: AtomicUsize,
    }

    #[async_trait]
    impl MetadataAnalyzer for CountingAnalyzer {
        async fn analyze_keyframes(&self, _id: i64, _path: &Path) -> CollaboratorResult<()> {
            Err(CollaboratorError::new("keyframe analysis crashed"))
        }

        async fn detect_commercials(&self, _id: i64, _path: &Path) -> CollaboratorResult<()> {
            self.commercial_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commercial_detection_runs_after_keyframe_failure() {
        let recordings_dir = TempDir::new().unwrap();
        let analyzer = Arc::new(CountingAnalyzer::default());
        let collaborators = Collaborators {
            recordings: store_with_recording(recordings_dir.path()),
            analyzer: analyzer.clone(),
            ..Collaborators::default()
        };
        let h = harness_with(SUCCEED, |_| {}, Some(collaborators));
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::H264, EncoderKind::Software);
        request.recording_id = 42;
        let task = EncodingTask::new(&request, 3).into_shared();

        h.run(&task).await;

        assert_eq!(task.read().await.status, TaskStatus::Completed);
        assert_eq!(analyzer.commercial_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_enrichment_rolls_back_move_and_keeps_original() {
        let recordings_dir = TempDir::new().unwrap();
        let store = store_with_recording(recordings_dir.path());
        let collaborators = Collaborators {
            recordings: store.clone(),
            analyzer: Arc::new(FailingAnalyzer),
            ..Collaborators::default()
        };
        let h = harness_with(SUCCEED, |_| {}, Some(collaborators));
        let encoded = h.dir.path().join("Encoded");
        let ctx = {
            let mut config = (*h.ctx.config).clone();
            config.jobs.enrichment_failure = EnrichmentFailurePolicy::FailAttempt;
            config.output.encoded_folder = Some(encoded.clone());
            ExecutorContext::new(
                config,
                h.ctx.tracker.clone(),
                h.ctx.collaborators.clone(),
                new_shared_metrics(),
            )
            .with_disk(Arc::new(FixedDiskUsage(None)))
            .with_timing(fast_timing())
        };
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::H264, EncoderKind::Software);
        request.recording_id = 42;
        request.delete_original = true;
        let task = EncodingTask::new(&request, 0).into_shared();

        TaskExecutor::new(task.clone(), CancellationToken::new(), Arc::new(ctx))
            .run()
            .await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.final_path.is_none());
        assert!(!encoded.join("a_h264.ts").exists());
        assert!(store.get(42).unwrap().encoded.is_none());
        assert!(h.dir.path().join("a.ts").exists());
        // Large enough to survive failed-output cleanup.
        assert_eq!(std::fs::metadata(h.dir.path().join("a_h264.ts")).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_delete_failure_after_commit_still_completes() {
        let recordings_dir = TempDir::new().unwrap();
        let store = store_with_recording(recordings_dir.path());
        let collaborators = Collaborators {
            recordings: store.clone(),
            ..Collaborators::default()
        };
        // The transcoder removes its own input, so the later delete fails.
        let body = format!("rm -f \"$(dirname \"$0\")/a.ts\"\n{}", SUCCEED);
        let h = harness_with(&body, |_| {}, Some(collaborators));
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::H264, EncoderKind::Software);
        request.recording_id = 42;
        request.delete_original = true;
        let task = EncodingTask::new(&request, 0).into_shared();

        h.run(&task).await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(store.get(42).unwrap().encoded.is_some());
    }

    /// Cancels every registered task from inside post-processing, then fails.
    struct CancellingAnalyzer {
        registry: Arc<TaskRegistry>,
    }

    #[async_trait]
    impl MetadataAnalyzer for CancellingAnalyzer {
        async fn analyze_keyframes(&self, _id: i64, _path: &Path) -> CollaboratorResult<()> {
            for t in self.registry.snapshots().await {
                self.registry.cancel(&t.task_id).await;
            }
            Err(CollaboratorError::new("keyframe analysis crashed"))
        }

        async fn detect_commercials(&self, _id: i64, _path: &Path) -> CollaboratorResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_during_post_processing_wins_over_failure() {
        let recordings_dir = TempDir::new().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let collaborators = Collaborators {
            recordings: store_with_recording(recordings_dir.path()),
            analyzer: Arc::new(CancellingAnalyzer {
                registry: registry.clone(),
            }),
            ..Collaborators::default()
        };
        let h = harness_with(
            SUCCEED,
            |c| c.jobs.enrichment_failure = EnrichmentFailurePolicy::FailAttempt,
            Some(collaborators),
        );
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::H264, EncoderKind::Software);
        request.recording_id = 42;
        let task = EncodingTask::new(&request, 0).into_shared();
        let cancel = CancellationToken::new();
        let task_id = task.read().await.task_id.clone();
        registry.insert(
            &task_id,
            TaskEntry {
                task: task.clone(),
                cancel: cancel.clone(),
            },
        );

        TaskExecutor::new(task.clone(), cancel, h.ctx.clone()).run().await;

        let t = task.read().await.clone();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.error_message.is_none());
        assert!(h.notifier.sent().is_empty());
        assert!(h.ctx.tracker.is_empty());
        let metrics = h.ctx.metrics.read().await;
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn test_delete_original_removes_input() {
        let h = harness(SUCCEED);
        let mut request = EncodeRequest::new(h.dir.path().join("a.ts"), Codec::H264, EncoderKind::Software);
        request.delete_original = true;
        let task = EncodingTask::new(&request, 3).into_shared();

        h.run(&task).await;

        assert_eq!(task.read().await.status, TaskStatus::Completed);
        assert!(!h.dir.path().join("a.ts").exists());
    }

    #[test]
    fn test_attempt_failure_from_exit() {
        let outcome = RunOutcome {
            exit_code: Some(3),
            stderr: String::new(),
            cancelled: false,
            completion_detected: false,
        };
        assert_eq!(
            AttemptFailure::from_exit(&outcome).message,
            "Transcoder exited with code 3"
        );

        let outcome = RunOutcome {
            stderr: "line one\n\nOut of memory\n".to_string(),
            ..outcome
        };
        let failure = AttemptFailure::from_exit(&outcome);
        assert_eq!(failure.message, "line one\nOut of memory");
        assert_eq!(failure.category(), ErrorCategory::Resource);
    }
}
