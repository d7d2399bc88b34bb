//! Stream inspection with ffprobe.
//!
//! Only stream counts are needed (to pick default stream-mapping arguments),
//! so any probe failure degrades to a fixed layout instead of failing the job.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// ffprobe could not be started.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Number of streams per type in a transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLayout {
    pub video: u32,
    pub audio: u32,
    pub data: u32,
}

impl Default for StreamLayout {
    /// Typical broadcast recording: one video, two audio, one data stream.
    fn default() -> Self {
        Self {
            video: 1,
            audio: 2,
            data: 1,
        }
    }
}

mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }
}

/// Parses `ffprobe -show_streams` JSON into stream counts.
pub fn parse_stream_layout(json_str: &str) -> Result<StreamLayout, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let mut layout = StreamLayout {
        video: 0,
        audio: 0,
        data: 0,
    };
    for stream in ffprobe.streams.unwrap_or_default() {
        match stream
            .codec_type
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("video") => layout.video += 1,
            Some("audio") => layout.audio += 1,
            Some("data") => layout.data += 1,
            _ => {}
        }
    }
    Ok(layout)
}

/// Runs `ffprobe -v quiet -print_format json -show_streams <path>`.
pub async fn probe_streams(ffprobe: &Path, input: &Path) -> Result<StreamLayout, ProbeError> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(input)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_stream_layout(&String::from_utf8_lossy(&output.stdout))
}

/// [`probe_streams`] falling back to [`StreamLayout::default`].
pub async fn inspect_streams(ffprobe: &Path, input: &Path) -> StreamLayout {
    match probe_streams(ffprobe, input).await {
        Ok(layout) => {
            info!(
                video = layout.video,
                audio = layout.audio,
                data = layout.data,
                "stream analysis"
            );
            layout
        }
        Err(e) => {
            warn!(path = %input.display(), error = %e, "stream analysis failed, using default layout");
            StreamLayout::default()
        }
    }
}
