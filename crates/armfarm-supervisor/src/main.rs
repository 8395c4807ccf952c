// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use armfarm_architect::{NullUpstreamIndex, UpstreamIndex};
use armfarm_config::{load_config, validate_config};
use armfarm_supervisor::Supervisor;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Coordination plane for an armv6l/armv7l wheel build farm.
#[derive(Parser, Debug)]
#[command(name = "armfarm", version, about = "armfarm master: task mesh supervisor")]
struct Args {
    /// Path to a TOML configuration file. Falls back to built-in
    /// defaults (overridable by `ARMFARM_*` environment variables) when
    /// omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds the supervisor waits for each task to join once `QUIT`
    /// has been broadcast.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("loading configuration")?;
    let warnings = validate_config(&config).context("validating configuration")?;

    let filter = config
        .log_level
        .as_deref()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }

    tracing::info!(
        database_dsn_set = !config.database_dsn.is_empty(),
        output_path = %config.output_path,
        slave_bind = %config.slave_bind,
        file_bind = %config.file_bind,
        oracle_worker_count = config.oracle_worker_count,
        "starting armfarm master"
    );

    let upstream: Arc<dyn UpstreamIndex> = Arc::new(NullUpstreamIndex);
    let supervisor = Supervisor::start(&config, upstream)
        .await
        .context("starting task mesh")?;
    tracing::info!(tasks = supervisor.task_count(), "task mesh running");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    supervisor
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await
        .context("shutting down task mesh")?;

    tracing::info!("armfarm master exited cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
