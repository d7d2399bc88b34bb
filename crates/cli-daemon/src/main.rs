//! CLI entry point for the recording re-encode daemon
//!
//! Parses command line arguments, sets up logging and runs the daemon.

use clap::Parser;
use reencode_daemon::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Re-encodes recordings to H.264/HEVC on request
#[derive(Parser, Debug)]
#[command(name = "reencode-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (tsreplace, ffmpeg, hardware encoder). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(config = %args.config.display(), "reencode daemon starting");

    let daemon_result = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map(Daemon::new_without_checks)
            .map_err(DaemonError::from)
    } else {
        Daemon::new(&args.config).await
    };

    match daemon_result {
        Ok(daemon) => {
            info!(
                bind = %daemon.config.server.bind_address,
                max_concurrent_jobs = daemon.config.jobs.max_concurrent_jobs,
                hardware_encoder = daemon.capabilities.hardware_backend.name(),
                "daemon initialized"
            );

            if let Err(e) = daemon.run().await {
                error!(error = %e, "daemon error");
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
