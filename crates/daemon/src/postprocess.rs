//! File handling after a successful transcode and after failures.
//!
//! Covers output stabilization, moving the result to its destination folder,
//! deleting the original with its sidecars, and removing partial outputs.

use crate::config::{OutputConfig, PostProcessConfig};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Outputs smaller than this are suspicious but still accepted.
pub const SMALL_OUTPUT_WARN_BYTES: u64 = 1024 * 1024;

/// Partial outputs smaller than this are deleted after a failure.
pub const INCOMPLETE_OUTPUT_BYTES: u64 = 1024;

/// Name of the subfolder created under a recording folder.
pub const ENCODED_SUBFOLDER: &str = "Encoded";

/// Sidecar suffixes removed together with the original recording.
const ORIGINAL_SIDECARS: &[&str] = &[".program.txt", ".err"];

/// Temporary siblings a transcoder may leave next to its output.
const TEMP_SIBLINGS: &[&str] = &[".tmp", ".part", ".temp", ".lock"];

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("Output file not found: {0}")]
    MissingOutput(PathBuf),

    #[error("Output file is empty: {0}")]
    EmptyOutput(PathBuf),

    #[error("Failed to create destination folder {path}: {source}")]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Metadata update failed: {0}")]
    Metadata(String),

    #[error("Metadata analysis failed: {0}")]
    Enrichment(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Timings for the output stabilization poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub required_stable: Duration,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            required_stable: Duration::from_secs(3),
        }
    }
}

impl From<&PostProcessConfig> for StabilityPolicy {
    fn from(cfg: &PostProcessConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.stability_timeout_secs),
            poll_interval: Duration::from_secs(cfg.stability_poll_secs.max(1)),
            required_stable: Duration::from_secs(cfg.stability_required_secs),
        }
    }
}

/// Result of waiting for an output file to stop growing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// Size stayed unchanged and non-zero for the required window.
    Stable { size: u64 },
    /// Timeout elapsed before the size settled.
    TimedOut { last_size: u64 },
}

/// Consecutive-observation counter behind [`wait_for_stable_size`].
#[derive(Debug, Clone, Default)]
pub struct StabilityWindow {
    last_size: Option<u64>,
    stable_for: Duration,
}

impl StabilityWindow {
    /// Records one size sample taken `interval` after the previous one and
    /// returns how long the size has been unchanged.
    pub fn observe(&mut self, size: u64, interval: Duration) -> Duration {
        if size > 0 && self.last_size == Some(size) {
            self.stable_for += interval;
        } else {
            self.stable_for = Duration::ZERO;
        }
        self.last_size = Some(size);
        self.stable_for
    }
}

/// Polls the file size until it is stable or the timeout elapses.
pub async fn wait_for_stable_size(
    path: &Path,
    policy: StabilityPolicy,
) -> Result<StabilityResult, io::Error> {
    let deadline = Instant::now() + policy.timeout;
    let mut window = StabilityWindow::default();
    let mut size = tokio::fs::metadata(path).await?.len();
    window.observe(size, Duration::ZERO);

    loop {
        if window.stable_for >= policy.required_stable && size > 0 {
            return Ok(StabilityResult::Stable { size });
        }
        if Instant::now() >= deadline {
            return Ok(StabilityResult::TimedOut { last_size: size });
        }
        sleep(policy.poll_interval).await;
        size = tokio::fs::metadata(path).await?.len();
        window.observe(size, policy.poll_interval);
    }
}

/// Checks that the output exists and is non-empty, then waits for it to
/// settle. A timeout only logs a warning.
pub async fn verify_output(path: &Path, policy: StabilityPolicy) -> Result<u64, PostProcessError> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PostProcessError::MissingOutput(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if size == 0 {
        return Err(PostProcessError::EmptyOutput(path.to_path_buf()));
    }
    if size < SMALL_OUTPUT_WARN_BYTES {
        warn!(path = %path.display(), size, "encoded output is unusually small");
    }

    match wait_for_stable_size(path, policy).await? {
        StabilityResult::Stable { size } => {
            debug!(path = %path.display(), size, "output size stable");
            Ok(size)
        }
        StabilityResult::TimedOut { last_size } => {
            warn!(path = %path.display(), last_size, "output size did not settle before timeout");
            if last_size == 0 {
                return Err(PostProcessError::EmptyOutput(path.to_path_buf()));
            }
            Ok(last_size)
        }
    }
}

/// Destination folder for a finished file, or `None` to leave it in place.
///
/// An explicit `encoded_folder` wins. Otherwise the `Encoded` subfolder of
/// the recorded folder containing `file` is used, falling back to the first
/// recorded folder.
pub fn resolve_destination_dir(file: &Path, output: &OutputConfig) -> Option<PathBuf> {
    if let Some(folder) = &output.encoded_folder {
        if !folder.as_os_str().is_empty() {
            return Some(folder.clone());
        }
    }

    let root = output
        .recorded_folders
        .iter()
        .find(|root| file.starts_with(root))
        .or_else(|| output.recorded_folders.first())?;
    Some(root.join(ENCODED_SUBFOLDER))
}

/// `dir/name`, or `dir/stem_N.ext` for the first free N.
pub fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Renames `from` to `to`, copying across filesystems when needed.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    if let Err(e) = fs::remove_file(from) {
        // Keep the copy; a leftover source is preferable to data loss.
        warn!(path = %from.display(), error = %e, "moved file but could not remove source");
    }
    Ok(())
}

/// Moves the finished output into its destination and returns the final path.
pub fn move_to_destination(output: &Path, cfg: &OutputConfig) -> Result<PathBuf, PostProcessError> {
    let Some(dir) = resolve_destination_dir(output, cfg) else {
        debug!(path = %output.display(), "no destination configured, keeping output in place");
        return Ok(output.to_path_buf());
    };

    fs::create_dir_all(&dir).map_err(|source| PostProcessError::CreateDestination {
        path: dir.clone(),
        source,
    })?;

    let Some(file_name) = output.file_name() else {
        return Err(PostProcessError::MissingOutput(output.to_path_buf()));
    };
    if output.parent() == Some(dir.as_path()) {
        return Ok(output.to_path_buf());
    }

    let destination = unique_destination(&dir, Path::new(file_name));
    move_file(output, &destination).map_err(|source| PostProcessError::Move {
        from: output.to_path_buf(),
        to: destination.clone(),
        source,
    })?;
    info!(from = %output.display(), to = %destination.display(), "moved encoded file");
    Ok(destination)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Deletes the original recording and its sidecars. Returns deleted paths.
pub fn delete_original_with_sidecars(original: &Path) -> Result<Vec<PathBuf>, PostProcessError> {
    let mut deleted = Vec::new();
    fs::remove_file(original)?;
    deleted.push(original.to_path_buf());

    for suffix in ORIGINAL_SIDECARS {
        let sidecar = with_suffix(original, suffix);
        match fs::remove_file(&sidecar) {
            Ok(()) => deleted.push(sidecar),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %sidecar.display(), error = %e, "failed to delete sidecar"),
        }
    }
    info!(path = %original.display(), "deleted original recording");
    Ok(deleted)
}

/// Removes an incomplete output and transcoder temp files after a failure.
pub fn cleanup_failed_output(output: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    if let Ok(meta) = fs::metadata(output) {
        if meta.len() < INCOMPLETE_OUTPUT_BYTES {
            match fs::remove_file(output) {
                Ok(()) => removed.push(output.to_path_buf()),
                Err(e) => warn!(path = %output.display(), error = %e, "failed to remove incomplete output"),
            }
        } else {
            warn!(path = %output.display(), size = meta.len(), "keeping partial output");
        }
    }

    for suffix in TEMP_SIBLINGS {
        let temp = with_suffix(output, suffix);
        if fs::remove_file(&temp).is_ok() {
            removed.push(temp);
        }
    }

    if !removed.is_empty() {
        debug!(count = removed.len(), "cleaned up failed output files");
    }
    removed
}
