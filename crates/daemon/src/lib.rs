//! Recording re-encode daemon
//!
//! Background service that runs re-encode tasks with retries, tracks their
//! progress, and serves the HTTP/WebSocket API and metrics.

pub mod broadcaster;
pub mod classify;
pub mod collaborators;
pub mod daemon;
pub mod disk;
pub mod encode;
pub mod engine;
pub mod events;
pub mod job_executor;
pub mod metrics;
pub mod postprocess;
pub mod progress;
pub mod registry;
pub mod server;
pub mod startup;
pub mod task;
pub mod tracker;

pub use reencode_daemon_config as config;
pub use reencode_daemon_config::Config;
pub use broadcaster::{Broadcaster, ProgressBatch};
pub use classify::{classify_error, should_retry, ErrorCategory};
pub use collaborators::{
    Collaborators, MetadataAnalyzer, Notification, NotificationKind, Notifier, RecordingStore,
};
pub use daemon::{Daemon, DaemonError};
pub use engine::{SubmitError, TaskEngine};
pub use job_executor::{ExecutorContext, TaskExecutor};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, MetricsSnapshot, SharedMetrics, SystemMetrics,
};
pub use progress::ProgressEstimator;
pub use registry::TaskRegistry;
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{run_startup_checks, validate_encoding_settings, EncoderCapabilities, StartupError};
pub use task::{Codec, EncodeRequest, EncoderKind, EncodingTask, TaskStatus};
pub use tracker::EncodingFileTracker;
