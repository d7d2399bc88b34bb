//! Startup checks and encoding-settings validation
//!
//! Verifies that the external tools can be launched and probes the configured
//! hardware encoder once, so job submissions can be validated without
//! spawning a probe per request.

use crate::config::Config;
use crate::encode::command::EncoderBackend;
use crate::task::{Codec, EncoderKind};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Quality presets accepted for every backend
pub const QUALITY_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Upper bound for `--check-hw`
const HW_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available at {path}: {reason}")]
    ToolUnavailable {
        tool: &'static str,
        path: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected job settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("Hardware encoder is not available; use software encoding")]
    HardwareUnavailable,

    #[error("Codec {codec} is not available. Available codecs: {available}")]
    CodecUnavailable { codec: String, available: String },

    #[error("Invalid quality preset '{0}'. Valid values: {valid}", valid = QUALITY_PRESETS.join(", "))]
    InvalidPreset(String),
}

/// What `--check-hw` reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareSupport {
    pub h264: bool,
    pub hevc: bool,
}

impl HardwareSupport {
    pub fn available(&self) -> bool {
        self.h264
    }

    pub fn supports(&self, codec: Codec) -> bool {
        match codec {
            Codec::H264 => self.h264,
            Codec::Hevc => self.hevc,
        }
    }
}

/// Parses `--check-hw` output from the QSV/NV/VCE encoders
///
/// `reader:` lines are log noise. Any `unavailable.` line means no hardware
/// path at all.
pub fn parse_check_hw_output(stdout: &str) -> HardwareSupport {
    let relevant: Vec<&str> = stdout
        .lines()
        .filter(|line| !line.contains("reader:"))
        .collect();

    if relevant.iter().any(|line| line.contains("unavailable.")) {
        return HardwareSupport::default();
    }

    HardwareSupport {
        h264: relevant.iter().any(|line| line.contains("H.264/AVC")),
        hevc: relevant.iter().any(|line| line.contains("H.265/HEVC")),
    }
}

/// Codec support of the configured encoders, probed once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderCapabilities {
    /// Backend used for hardware jobs
    pub hardware_backend: EncoderBackend,
    pub hardware: HardwareSupport,
}

impl EncoderCapabilities {
    /// Assumes everything works; used when checks are skipped.
    pub fn unchecked(cfg: &Config) -> Self {
        let backend = EncoderBackend::from_name(&cfg.encoder.hardware_encoder);
        let supported = backend.is_hardware();
        Self {
            hardware_backend: backend,
            hardware: HardwareSupport {
                h264: supported,
                hevc: supported,
            },
        }
    }

    /// Codecs usable with `kind`. Software FFmpeg handles both.
    pub fn available_codecs(&self, kind: EncoderKind) -> Vec<Codec> {
        match kind {
            EncoderKind::Software => vec![Codec::H264, Codec::Hevc],
            EncoderKind::Hardware => [Codec::H264, Codec::Hevc]
                .into_iter()
                .filter(|c| self.hardware.supports(*c))
                .collect(),
        }
    }
}

/// Checks codec, encoder kind and preset of a job submission
pub fn validate_encoding_settings(
    codec: Codec,
    kind: EncoderKind,
    quality_preset: &str,
    caps: &EncoderCapabilities,
) -> Result<(), SettingsError> {
    if kind == EncoderKind::Hardware
        && (!caps.hardware_backend.is_hardware() || !caps.hardware.available())
    {
        return Err(SettingsError::HardwareUnavailable);
    }

    let available = caps.available_codecs(kind);
    if !available.contains(&codec) {
        return Err(SettingsError::CodecUnavailable {
            codec: codec.as_str().to_uppercase(),
            available: available
                .iter()
                .map(|c| c.as_str().to_uppercase())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }

    if !QUALITY_PRESETS.contains(&quality_preset) {
        return Err(SettingsError::InvalidPreset(quality_preset.to_string()));
    }

    Ok(())
}

/// Check that a tool can be launched with `<tool> <arg>`
///
/// A non-zero exit only warns; some tools exit non-zero on `--version`.
pub async fn check_tool_available(
    tool: &'static str,
    path: &Path,
    arg: &str,
) -> Result<(), StartupError> {
    let output = Command::new(path)
        .arg(arg)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StartupError::ToolUnavailable {
            tool,
            path: path.display().to_string(),
            reason: format!("is it installed and in PATH? Error: {}", e),
        })?;

    if !output.status.success() {
        warn!(tool, status = %output.status, "version probe exited with failure");
    }
    Ok(())
}

/// Runs `<encoder> --check-hw`; failures and timeouts mean unsupported.
pub async fn check_hardware_encoder(path: &Path) -> HardwareSupport {
    let run = Command::new(path)
        .arg("--check-hw")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(HW_CHECK_TIMEOUT, run).await {
        Ok(Ok(output)) => parse_check_hw_output(&String::from_utf8_lossy(&output.stdout)),
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "hardware encoder check failed");
            HardwareSupport::default()
        }
        Err(_) => {
            warn!(path = %path.display(), "hardware encoder check timed out");
            HardwareSupport::default()
        }
    }
}

/// Run all startup checks in order
///
/// 1. tsreplace can be launched
/// 2. ffmpeg can be launched
/// 3. the configured hardware encoder is probed (if any)
pub async fn run_startup_checks(cfg: &Config) -> Result<EncoderCapabilities, StartupError> {
    check_tool_available("tsreplace", &cfg.tools.tsreplace_path, "--version").await?;
    check_tool_available("ffmpeg", &cfg.tools.ffmpeg_path, "-version").await?;

    let backend = EncoderBackend::from_name(&cfg.encoder.hardware_encoder);
    let hardware = if backend.is_hardware() {
        check_hardware_encoder(backend.program_path(&cfg.tools)).await
    } else {
        HardwareSupport::default()
    };

    info!(
        encoder = backend.name(),
        h264 = hardware.h264,
        hevc = hardware.hevc,
        "hardware encoder support"
    );

    Ok(EncoderCapabilities {
        hardware_backend: backend,
        hardware,
    })
}
