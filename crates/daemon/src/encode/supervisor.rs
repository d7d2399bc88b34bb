//! Transcoder process supervision.
//!
//! One supervisor owns one child process. Two reader tasks forward stdout and
//! stderr lines over a channel; the supervisor loop feeds them to the
//! [`ProgressEstimator`], keeps a bounded stderr tail for error
//! classification, and ticks time-based estimates while output is quiet.

use crate::encode::command::TranscodeCommand;
use crate::progress::ProgressEstimator;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period between the stop signal and a forced kill.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the time-based progress tick.
pub const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// How long to wait for buffered output after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const STDERR_TAIL_LINES: usize = 200;
const MAX_LINE_BYTES: usize = 64 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for transcoder: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
struct OutputLine {
    stream: OutputStream,
    text: String,
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `None` when the process was killed by a signal or cancelled
    pub exit_code: Option<i32>,
    /// Trailing stderr lines joined with newlines
    pub stderr: String,
    pub cancelled: bool,
    pub completion_detected: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

pub struct ProcessSupervisor {
    child: Child,
    lines_rx: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    stderr_tail: VecDeque<String>,
    terminate_timeout: Duration,
}

impl ProcessSupervisor {
    /// Spawns the transcoder with stdin closed and both outputs piped.
    pub fn spawn(cmd: &TranscodeCommand) -> Result<Self, SupervisorError> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: cmd.program.display().to_string(),
                source,
            })?;

        let (tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx)));
        }

        info!(pid = ?child.id(), command = %cmd.display(), "transcoder started");

        Ok(Self {
            child,
            lines_rx,
            readers,
            stderr_tail: VecDeque::new(),
            terminate_timeout: TERMINATE_TIMEOUT,
        })
    }

    pub fn with_terminate_timeout(mut self, terminate_timeout: Duration) -> Self {
        self.terminate_timeout = terminate_timeout;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Drives the process to exit or cancellation.
    ///
    /// Progress changes are published on `progress_tx`. On return the child
    /// has exited and every reader task has finished.
    pub async fn run(
        mut self,
        estimator: &mut ProgressEstimator,
        progress_tx: &watch::Sender<f64>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SupervisorError> {
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let waited: Option<std::io::Result<ExitStatus>> = loop {
            tokio::select! {
                status = self.child.wait() => break Some(status),
                Some(line) = self.lines_rx.recv() => {
                    self.handle_line(line, estimator, progress_tx);
                }
                _ = ticker.tick() => {
                    if let Some(p) = estimator.tick(Instant::now()) {
                        progress_tx.send_replace(p);
                    }
                }
                _ = cancel.cancelled() => break None,
            }
        };

        let outcome = match waited {
            Some(status) => {
                let status = match status {
                    Ok(status) => status,
                    Err(e) => {
                        self.terminate().await;
                        self.stop_readers().await;
                        return Err(SupervisorError::Wait(e));
                    }
                };
                self.drain(estimator, progress_tx).await;
                self.terminate().await;
                self.stop_readers().await;
                debug!(status = %status, "transcoder exited");
                RunOutcome {
                    exit_code: status.code(),
                    stderr: self.stderr_text(),
                    cancelled: false,
                    completion_detected: estimator.completion_detected(),
                }
            }
            None => {
                info!(pid = ?self.pid(), "cancelling transcoder");
                self.terminate().await;
                self.stop_readers().await;
                RunOutcome {
                    exit_code: None,
                    stderr: self.stderr_text(),
                    cancelled: true,
                    completion_detected: estimator.completion_detected(),
                }
            }
        };

        Ok(outcome)
    }

    /// Graceful stop, then kill after the grace period. No-op once exited.
    pub async fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }

        send_stop_signal(&mut self.child);
        match timeout(self.terminate_timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "transcoder stopped"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for transcoder to stop"),
            Err(_) => {
                warn!(
                    timeout_secs = self.terminate_timeout.as_secs(),
                    "transcoder ignored stop signal, killing"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill transcoder");
                }
            }
        }
    }

    fn handle_line(
        &mut self,
        line: OutputLine,
        estimator: &mut ProgressEstimator,
        progress_tx: &watch::Sender<f64>,
    ) {
        if line.stream == OutputStream::Stderr {
            if self.stderr_tail.len() == STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.text.clone());
        }

        if looks_like_error(&line.text) {
            warn!(stream = ?line.stream, "{}", line.text);
        } else {
            debug!(stream = ?line.stream, "{}", line.text);
        }

        if let Some(p) = estimator.observe_line(&line.text, Instant::now()) {
            progress_tx.send_replace(p);
        }
    }

    /// Consumes output still buffered after exit.
    async fn drain(&mut self, estimator: &mut ProgressEstimator, progress_tx: &watch::Sender<f64>) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.lines_rx.recv()).await {
                Ok(Some(line)) => self.handle_line(line, estimator, progress_tx),
                Ok(None) => break,
                Err(_) => {
                    // A grandchild may still hold the pipes open.
                    debug!("output drain timed out");
                    break;
                }
            }
        }
    }

    async fn stop_readers(&mut self) {
        self.lines_rx.close();
        for reader in self.readers.drain(..) {
            reader.abort();
            let _ = reader.await;
        }
    }

    fn stderr_text(&self) -> String {
        self.stderr_tail
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[cfg(unix)]
fn send_stop_signal(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, "SIGTERM delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn send_stop_signal(child: &mut Child) {
    let _ = child.start_kill();
}

fn looks_like_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("failed")
}

/// Splits raw output on `\n` and `\r` and forwards non-empty lines.
async fn forward_lines<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(stream = ?stream, error = %e, "output read failed");
                break;
            }
        };

        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' || pending.len() >= MAX_LINE_BYTES {
                if !emit(&mut pending, stream, &tx).await {
                    return;
                }
                if byte == b'\n' || byte == b'\r' {
                    continue;
                }
            }
            pending.push(byte);
        }
    }

    emit(&mut pending, stream, &tx).await;
}

async fn emit(pending: &mut Vec<u8>, stream: OutputStream, tx: &mpsc::Sender<OutputLine>) -> bool {
    let text = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    if text.is_empty() {
        return true;
    }
    tx.send(OutputLine { stream, text }).await.is_ok()
}
