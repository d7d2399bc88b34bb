//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Locations of the external programs the engine drives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_tsreplace_path")]
    pub tsreplace_path: PathBuf,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    #[serde(default = "default_qsvencc_path")]
    pub qsvencc_path: PathBuf,
    #[serde(default = "default_nvencc_path")]
    pub nvencc_path: PathBuf,
    #[serde(default = "default_vceencc_path")]
    pub vceencc_path: PathBuf,
}

fn default_tsreplace_path() -> PathBuf {
    PathBuf::from("tsreplace")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_qsvencc_path() -> PathBuf {
    PathBuf::from("QSVEncC")
}

fn default_nvencc_path() -> PathBuf {
    PathBuf::from("NVEncC")
}

fn default_vceencc_path() -> PathBuf {
    PathBuf::from("VCEEncC")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tsreplace_path: default_tsreplace_path(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            qsvencc_path: default_qsvencc_path(),
            nvencc_path: default_nvencc_path(),
            vceencc_path: default_vceencc_path(),
        }
    }
}

/// Encoder selection and per-backend option overrides
///
/// A non-blank option string replaces the built-in argument template for
/// that backend and codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Hardware encoder used for `hardware` jobs (QSVEncC, NVEncC or VCEEncC)
    #[serde(default = "default_hardware_encoder")]
    pub hardware_encoder: String,
    #[serde(default)]
    pub ffmpeg_h264_options: String,
    #[serde(default)]
    pub ffmpeg_hevc_options: String,
    #[serde(default)]
    pub intel_h264_options: String,
    #[serde(default)]
    pub intel_hevc_options: String,
    #[serde(default)]
    pub nvidia_h264_options: String,
    #[serde(default)]
    pub nvidia_hevc_options: String,
    #[serde(default)]
    pub amd_h264_options: String,
    #[serde(default)]
    pub amd_hevc_options: String,
}

fn default_hardware_encoder() -> String {
    "QSVEncC".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hardware_encoder: default_hardware_encoder(),
            ffmpeg_h264_options: String::new(),
            ffmpeg_hevc_options: String::new(),
            intel_h264_options: String::new(),
            intel_hevc_options: String::new(),
            nvidia_h264_options: String::new(),
            nvidia_hevc_options: String::new(),
            amd_h264_options: String::new(),
            amd_hevc_options: String::new(),
        }
    }
}

/// Where finished files end up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OutputConfig {
    /// Explicit destination directory for re-encoded files
    #[serde(default)]
    pub encoded_folder: Option<PathBuf>,
    /// Recording roots; an `Encoded` subfolder of the matching root is used
    /// when `encoded_folder` is unset
    #[serde(default)]
    pub recorded_folders: Vec<PathBuf>,
}

/// Retry policy limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_max_delay_secs() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// What happens when keyframe or commercial analysis fails after a
/// successful transcode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentFailurePolicy {
    /// Log and keep the job successful
    #[default]
    Log,
    /// Treat the failure as a failed attempt
    FailAttempt,
}

/// Job admission settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobsConfig {
    /// Maximum concurrently running transcodes (0 = unbounded)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub enrichment_failure: EnrichmentFailurePolicy,
}

/// Output stabilization timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostProcessConfig {
    #[serde(default = "default_stability_timeout_secs")]
    pub stability_timeout_secs: u64,
    #[serde(default = "default_stability_poll_secs")]
    pub stability_poll_secs: u64,
    #[serde(default = "default_stability_required_secs")]
    pub stability_required_secs: u64,
}

fn default_stability_timeout_secs() -> u64 {
    30
}

fn default_stability_poll_secs() -> u64 {
    1
}

fn default_stability_required_secs() -> u64 {
    3
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            stability_timeout_secs: default_stability_timeout_secs(),
            stability_poll_secs: default_stability_poll_secs(),
            stability_required_secs: default_stability_required_secs(),
        }
    }
}

/// In-flight file tracker housekeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_stale_timeout_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: default_stale_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// JSONL event log location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggingConfig {
    /// Directory receiving `encoding.jsonl` and `error.jsonl` (disabled if unset)
    #[serde(default)]
    pub event_log_dir: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub postprocess: PostProcessConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - REENCODE_TSREPLACE_PATH -> tools.tsreplace_path
    /// - REENCODE_FFMPEG_PATH -> tools.ffmpeg_path
    /// - REENCODE_FFPROBE_PATH -> tools.ffprobe_path
    /// - REENCODE_HARDWARE_ENCODER -> encoder.hardware_encoder
    /// - REENCODE_ENCODED_FOLDER -> output.encoded_folder (empty clears it)
    /// - REENCODE_MAX_RETRY_COUNT -> retry.max_retry_count
    /// - REENCODE_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - REENCODE_BIND_ADDRESS -> server.bind_address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REENCODE_TSREPLACE_PATH") {
            if !val.trim().is_empty() {
                self.tools.tsreplace_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("REENCODE_FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.tools.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("REENCODE_FFPROBE_PATH") {
            if !val.trim().is_empty() {
                self.tools.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("REENCODE_HARDWARE_ENCODER") {
            if !val.trim().is_empty() {
                self.encoder.hardware_encoder = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("REENCODE_ENCODED_FOLDER") {
            self.output.encoded_folder = if val.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = env::var("REENCODE_MAX_RETRY_COUNT") {
            if let Ok(count) = val.parse::<u32>() {
                self.retry.max_retry_count = count;
            }
        }

        if let Ok(val) = env::var("REENCODE_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("REENCODE_BIND_ADDRESS") {
            if !val.trim().is_empty() {
                self.server.bind_address = val.trim().to_string();
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
