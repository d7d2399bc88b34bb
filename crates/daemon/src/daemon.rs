//! Daemon startup and background loops
//!
//! Wires the engine, the HTTP server, and the periodic maintenance tasks
//! together.

use crate::collaborators::Collaborators;
use crate::config::{Config, ConfigError};
use crate::engine::TaskEngine;
use crate::job_executor::ExecutorContext;
use crate::metrics::{collect_system_metrics, new_shared_metrics, SharedMetrics};
use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, EncoderCapabilities, StartupError};
use crate::tracker::EncodingFileTracker;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Metrics refresh period
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Arc<Config>,
    pub capabilities: EncoderCapabilities,
    pub metrics: SharedMetrics,
    pub tracker: Arc<EncodingFileTracker>,
    pub engine: Arc<TaskEngine>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Load config, run startup checks and build the engine
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Build from an already loaded config, running startup checks
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        let capabilities = run_startup_checks(&config).await?;
        Ok(Self::assemble(config, capabilities, Collaborators::default()))
    }

    /// Build without probing external tools
    pub fn new_without_checks(config: Config) -> Self {
        let capabilities = EncoderCapabilities::unchecked(&config);
        Self::assemble(config, capabilities, Collaborators::default())
    }

    /// Build with explicit collaborators, e.g. a real recording store.
    pub fn assemble(
        config: Config,
        capabilities: EncoderCapabilities,
        collaborators: Collaborators,
    ) -> Self {
        let metrics = new_shared_metrics();
        let tracker = EncodingFileTracker::shared();
        let ctx = ExecutorContext::new(
            config,
            Arc::clone(&tracker),
            collaborators,
            metrics.clone(),
        );
        let config = Arc::clone(&ctx.config);
        let engine = Arc::new(TaskEngine::new(ctx, capabilities));

        Self {
            config,
            capabilities,
            metrics,
            tracker,
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server and background loops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Periodically refreshes system metrics and the live task gauges.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let system = collect_system_metrics();
                let statuses = engine.registry().statuses().await;
                let mut snapshot = metrics.write().await;
                snapshot.system = system;
                snapshot.set_live_counts(&statuses);
                snapshot.timestamp_unix_ms = timestamp_ms();
            }
        })
    }

    /// Drops tracker entries whose owners never released them.
    pub fn start_tracker_cleanup(&self) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let interval = Duration::from_secs(self.config.tracker.cleanup_interval_secs.max(1));
        let stale = Duration::from_secs(self.config.tracker.stale_timeout_secs);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let removed = tracker.cleanup_stale(stale);
                if removed > 0 {
                    warn!(removed, "dropped stale tracked outputs");
                }
            }
        })
    }

    /// Serves until ctrl-c or `shutdown_token` fires, then cancels every
    /// live task.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let updater = self.start_metrics_updater();
        let cleanup = self.start_tracker_cleanup();

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });

        let state = AppState {
            engine: Arc::clone(&self.engine),
            metrics: self.metrics.clone(),
        };
        let result = run_server(&self.config.server.bind_address, state, self.shutdown.clone()).await;

        self.shutdown.cancel();
        self.engine.shutdown();
        updater.abort();
        cleanup.abort();
        info!("daemon stopped");

        result.map_err(DaemonError::from)
    }
}

/// Current Unix time in milliseconds
fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
