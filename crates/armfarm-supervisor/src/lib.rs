// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-supervisor
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Starts every long-running task in dependency order (oracle workers and
//! the Seraph broker that fans requests to them, then the architect, the
//! index scribe, the file juggler, and the slave driver), holds their
//! [`tokio::task::JoinHandle`]s, and broadcasts `QUIT` on a shared control
//! channel when asked to shut down. A task that does not join within its
//! bounded timeout is a [`SupervisorError::UnjoinableWorker`] — a fatal
//! condition the caller (`main`) turns into a non-zero exit code, never a
//! silently ignored one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use armfarm_architect::{Architect, UpstreamIndex};
use armfarm_config::ArmfarmConfig;
use armfarm_core::BuildTarget;
use armfarm_juggler::Juggler;
use armfarm_oracle::{Oracle, OracleError};
use armfarm_protocol::coordination::{TransferRegistry, TransferRouter};
use armfarm_scribe::{Scribe, ScribeError};
use armfarm_seraph::Seraph;
use armfarm_slave_driver::SlaveDriver;
use armfarm_transport::TransportError;
use chrono::Duration as ChronoDuration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Errors arising from starting or stopping the task mesh.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Connecting the oracle's database pool failed.
    #[error("oracle connect failed: {0}")]
    Oracle(#[from] OracleError),

    /// The scribe's start-of-day `once()` routine failed.
    #[error("scribe startup failed: {0}")]
    Scribe(#[from] ScribeError),

    /// A configured bind address could not be parsed as a socket address.
    #[error("invalid bind address {addr:?}: {source}")]
    InvalidBindAddr {
        /// The offending configuration value.
        addr: String,
        /// The underlying parse error.
        source: std::net::AddrParseError,
    },

    /// Binding a listener socket failed.
    #[error("transport bind failed: {0}")]
    Transport(#[from] TransportError),

    /// A background task did not join within its shutdown bound, or
    /// panicked while running.
    #[error("task {task} could not be joined")]
    UnjoinableWorker {
        /// Name of the task that failed to join.
        task: &'static str,
    },
}

fn parse_bind(addr: &str) -> Result<SocketAddr, SupervisorError> {
    addr.parse().map_err(|source| SupervisorError::InvalidBindAddr {
        addr: addr.to_string(),
        source,
    })
}

/// A started task mesh: a handle to every spawned task plus the shared
/// control channel's sending half.
///
/// Tasks are not restarted automatically if they exit early — a task
/// mesh is meant to run for the lifetime of the process. If a task
/// panics, its `JoinHandle` will surface that on [`Supervisor::shutdown`].
pub struct Supervisor {
    control_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    /// Start every task in dependency order: oracle workers (and the
    /// Seraph broker that fans requests to them) first, then the
    /// architect, the index scribe (which runs its start-of-day `once()`
    /// synchronously before its task is spawned), the file juggler, and
    /// finally the slave driver.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] if the database cannot be reached, a
    /// configured bind address is invalid or already in use, or the
    /// scribe's initial index render fails.
    pub async fn start(
        config: &ArmfarmConfig,
        upstream: Arc<dyn UpstreamIndex>,
    ) -> Result<Self, SupervisorError> {
        let oracle = Oracle::connect(&config.database_dsn).await?;

        let mut worker_txs = Vec::with_capacity(config.oracle_worker_count);
        let mut handles = Vec::new();
        for _ in 0..config.oracle_worker_count {
            let (tx, rx) = mpsc::channel(64);
            let worker = oracle.clone();
            handles.push(("oracle-worker", tokio::spawn(async move { worker.run(rx).await })));
            worker_txs.push(tx);
        }
        let seraph = Seraph::build(worker_txs);
        tracing::info!(workers = seraph.worker_count(), "oracle workers ready");

        let (control_tx, _) = broadcast::channel(config.control_queue_capacity);
        let transfers = Arc::new(TransferRegistry::new());
        let router = Arc::new(TransferRouter::new());

        // The build queue mirrors the original's hwm=1 REP socket: at most
        // one target in flight between the architect and the driver.
        let (build_tx, build_rx) = mpsc::channel::<oneshot::Sender<Option<BuildTarget>>>(1);
        let (index_tx, index_rx) = mpsc::channel(config.index_queue_capacity);

        let scribe = Arc::new(Scribe::new(Arc::clone(&seraph), config.output_path.clone()));
        scribe.once().await?;
        tracing::info!("index scribe seeded from oracle");
        handles.push((
            "index-scribe",
            tokio::spawn({
                let scribe = Arc::clone(&scribe);
                let control_rx = control_tx.subscribe();
                async move { scribe.run(index_rx, control_rx).await }
            }),
        ));

        let architect = Arc::new(Architect::new(
            Arc::clone(&seraph),
            upstream,
            StdDuration::from_secs(config.architect_poll_secs),
        ));
        handles.push((
            "architect",
            tokio::spawn({
                let architect = Arc::clone(&architect);
                let control_rx = control_tx.subscribe();
                async move { architect.run(build_rx, control_rx).await }
            }),
        ));

        let file_listener = armfarm_transport::bind(
            parse_bind(&config.file_bind)?,
            config.connection_high_water_mark,
        )
        .await?;
        let juggler = Arc::new(Juggler::new(
            Arc::clone(&transfers),
            Arc::clone(&router),
            config.output_path.clone(),
            armfarm_juggler::DEFAULT_CHUNK_SIZE,
        ));
        handles.push((
            "file-juggler",
            tokio::spawn({
                let juggler = Arc::clone(&juggler);
                let control_rx = control_tx.subscribe();
                async move { juggler.run(file_listener, control_rx).await }
            }),
        ));

        let slave_listener = armfarm_transport::bind(
            parse_bind(&config.slave_bind)?,
            config.connection_high_water_mark,
        )
        .await?;
        let driver = Arc::new(SlaveDriver::new(
            seraph,
            build_tx,
            index_tx,
            transfers,
            router,
            ChronoDuration::seconds(config.slave_idle_timeout_secs as i64),
            ChronoDuration::seconds(config.slave_building_timeout_secs as i64),
            config.file_retry_limit,
        ));
        handles.push((
            "slave-driver",
            tokio::spawn({
                let driver = Arc::clone(&driver);
                let control_rx = control_tx.subscribe();
                async move { driver.run(slave_listener, StdDuration::from_secs(30), control_rx).await }
            }),
        ));

        tracing::info!(
            slave_bind = %config.slave_bind,
            file_bind = %config.file_bind,
            "armfarm task mesh started"
        );

        Ok(Self { control_tx, handles })
    }

    /// Broadcast `QUIT` and join every task, each bounded by
    /// `join_timeout`. Tasks are joined in the order they were started;
    /// a task that panics or overruns its bound is reported and joining
    /// continues for the rest so one slow task doesn't mask another's
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`SupervisorError::UnjoinableWorker`] encountered,
    /// after attempting to join every task.
    pub async fn shutdown(self, join_timeout: StdDuration) -> Result<(), SupervisorError> {
        tracing::info!("broadcasting quit to task mesh");
        let _ = self.control_tx.send(());

        let mut first_failure = None;
        for (name, handle) in self.handles {
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => tracing::info!(task = name, "joined cleanly"),
                Ok(Err(join_err)) => {
                    tracing::error!(task = name, error = %join_err, "task panicked");
                    first_failure.get_or_insert(SupervisorError::UnjoinableWorker { task: name });
                }
                Err(_) => {
                    tracing::error!(task = name, timeout = ?join_timeout, "task did not join in time");
                    first_failure.get_or_insert(SupervisorError::UnjoinableWorker { task: name });
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of tasks currently tracked by this supervisor.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bind_rejects_garbage() {
        let err = parse_bind("not-an-address").unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidBindAddr { .. }));
    }

    #[test]
    fn parse_bind_accepts_host_port() {
        let addr = parse_bind("127.0.0.1:5555").unwrap();
        assert_eq!(addr.port(), 5555);
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_succeeds() {
        let (control_tx, _) = broadcast::channel(1);
        let supervisor = Supervisor { control_tx, handles: Vec::new() };
        assert_eq!(supervisor.task_count(), 0);
        supervisor.shutdown(StdDuration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_reports_unjoinable_worker_on_timeout() {
        let (control_tx, _control_rx) = broadcast::channel(1);
        // Ignores the control channel entirely, so it never joins in time.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_secs(5)).await;
        });
        let supervisor = Supervisor {
            control_tx,
            handles: vec![("stub", handle)],
        };
        let err = supervisor.shutdown(StdDuration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnjoinableWorker { task: "stub" }));
    }

    #[tokio::test]
    async fn shutdown_joins_a_cooperative_task() {
        let (control_tx, mut control_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            let _ = control_rx.recv().await;
        });
        let supervisor = Supervisor {
            control_tx,
            handles: vec![("stub", handle)],
        };
        supervisor.shutdown(StdDuration::from_secs(1)).await.unwrap();
    }
}
