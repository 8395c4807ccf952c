// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-architect
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The task that decides what to build next. It owns no persistent
//! state of its own — every fact it acts on (known packages, buildable
//! targets, the PyPI serial watermark, the farm-wide pause switch) lives
//! in the oracle; the architect just polls it on a schedule and answers
//! the slave driver's requests from a short-lived in-memory queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use armfarm_core::{BuildTarget, PypiSerial};
use armfarm_protocol::{OracleReply, OracleRequest, OracleValue};
use armfarm_seraph::{Seraph, SeraphError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Errors arising from a tick of the architect's scheduling loop.
#[derive(Debug, Error)]
pub enum ArchitectError {
    /// Dispatching a request to the oracle failed.
    #[error("oracle dispatch failed: {0}")]
    Seraph(#[from] SeraphError),

    /// The oracle answered with `ERR`.
    #[error("oracle error [{code}]: {message}")]
    Oracle {
        /// Stable error code string.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// The oracle answered with a value of the wrong shape for the verb
    /// that was sent — a programming error in this crate, not a runtime
    /// fault, but handled the same way other integrity failures are.
    #[error("unexpected oracle reply shape for {verb}")]
    UnexpectedReply {
        /// The verb whose reply didn't match its expected shape.
        verb: &'static str,
    },
}

// ---------------------------------------------------------------------------
// UpstreamIndex
// ---------------------------------------------------------------------------

/// A discovered package and its newly-seen versions, reported by an
/// [`UpstreamIndex`] since some previously recorded serial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamChanges {
    /// Packages not previously known to the oracle.
    pub new_packages: Vec<String>,
    /// `(package, version)` pairs not previously known to the oracle.
    pub new_versions: Vec<(String, String)>,
    /// The serial to advance to once these changes are recorded.
    pub new_serial: PypiSerial,
}

/// The upstream package index's change-feed, keyed by a scalar serial
/// watermark (PyPI's `changelog_since_serial` contract, in the system
/// this specification describes).
///
/// This is a seam rather than a finished integration: the exact delta
/// contract is this specification's one open question (see
/// `DESIGN.md`), so the trait is deliberately narrow and the bundled
/// [`NullUpstreamIndex`] never reports any changes.
#[async_trait::async_trait]
pub trait UpstreamIndex: Send + Sync {
    /// Report every package/version discovered since `serial`.
    async fn changes_since(&self, serial: PypiSerial) -> UpstreamChanges;
}

/// An [`UpstreamIndex`] that never reports any changes.
///
/// Lets the rest of the mesh run (and be tested) without a live upstream
/// service configured; a real deployment supplies its own implementation
/// once the delta contract is confirmed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullUpstreamIndex;

#[async_trait::async_trait]
impl UpstreamIndex for NullUpstreamIndex {
    async fn changes_since(&self, serial: PypiSerial) -> UpstreamChanges {
        UpstreamChanges {
            new_serial: serial,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Architect
// ---------------------------------------------------------------------------

/// A reply channel the slave driver uses to ask for the next buildable
/// target; mirrors the original's bounded (`hwm=1`) `REP` socket, where
/// at most one pair is in flight per consumer.
pub type BuildRequest = oneshot::Sender<Option<BuildTarget>>;

/// The task that decides what to build next.
pub struct Architect {
    seraph: Arc<Seraph>,
    upstream: Arc<dyn UpstreamIndex>,
    poll_interval: Duration,
    queue: Mutex<VecDeque<BuildTarget>>,
}

impl Architect {
    /// Construct an architect polling `upstream` and the oracle (reached
    /// through `seraph`) every `poll_interval`.
    #[must_use]
    pub fn new(seraph: Arc<Seraph>, upstream: Arc<dyn UpstreamIndex>, poll_interval: Duration) -> Self {
        Self {
            seraph,
            upstream,
            poll_interval,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    async fn dispatch(&self, request: OracleRequest) -> Result<OracleValue, ArchitectError> {
        match self.seraph.dispatch(request).await? {
            OracleReply::Ok { value } => Ok(value),
            OracleReply::Err { code, message } => Err(ArchitectError::Oracle { code, message }),
        }
    }

    /// Run one scheduling tick: pull upstream changes, record them,
    /// advance the serial, and refill the buildable-target queue.
    ///
    /// Skips the upstream scrape and refill entirely while the farm-wide
    /// pause switch (`BUILDACTIVE`) is off, matching `build_active()` in
    /// the database this mirrors.
    ///
    /// # Errors
    ///
    /// Returns [`ArchitectError`] if any oracle call fails; the caller
    /// (the run loop) logs and continues to the next tick rather than
    /// treating this as fatal.
    pub async fn tick(&self) -> Result<(), ArchitectError> {
        let active = match self.dispatch(OracleRequest::BuildActive).await? {
            OracleValue::Bool(b) => b,
            _ => return Err(ArchitectError::UnexpectedReply { verb: "BUILDACTIVE" }),
        };
        if !active {
            tracing::debug!("build farm paused, skipping tick");
            return Ok(());
        }

        let serial = match self.dispatch(OracleRequest::GetPypi).await? {
            OracleValue::Serial(s) => s,
            _ => return Err(ArchitectError::UnexpectedReply { verb: "GETPYPI" }),
        };

        let changes = self.upstream.changes_since(serial).await;
        for package in &changes.new_packages {
            self.dispatch(OracleRequest::NewPkg { package: package.clone() }).await?;
        }
        for (package, version) in &changes.new_versions {
            self.dispatch(OracleRequest::NewVer {
                package: package.clone(),
                version: version.clone(),
            })
            .await?;
        }
        if changes.new_serial != serial {
            self.dispatch(OracleRequest::SetPypi { serial: changes.new_serial }).await?;
            tracing::info!(serial = %changes.new_serial, "advanced pypi serial");
        }

        let targets = match self.dispatch(OracleRequest::BuildableTargets).await? {
            OracleValue::Targets(t) => t,
            _ => return Err(ArchitectError::UnexpectedReply { verb: "BUILDABLETARGETS" }),
        };
        let count = targets.len();
        *self.queue.lock().await = targets.into_iter().collect();
        tracing::debug!(count, "refilled buildable-target queue");
        Ok(())
    }

    /// Answer one `BuildRequest`: pop the next buildable target, or
    /// `None` (which the slave driver turns into `SLEEP`) if the queue is
    /// currently empty.
    pub async fn next_build(&self) -> Option<BuildTarget> {
        self.queue.lock().await.pop_front()
    }

    /// Drive the scheduling loop: tick on `poll_interval`, answer
    /// `build_queue_rx` requests as they arrive, and exit once `control`
    /// broadcasts shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut build_queue_rx: mpsc::Receiver<BuildRequest>,
        mut control: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        // The first tick fires immediately; that's wanted here.
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "architect tick failed");
                    }
                }
                req = build_queue_rx.recv() => {
                    match req {
                        Some(reply_tx) => {
                            let target = self.next_build().await;
                            let _ = reply_tx.send(target);
                        }
                        None => {
                            tracing::info!("build queue closed, architect shutting down");
                            break;
                        }
                    }
                }
                _ = control.recv() => {
                    tracing::info!("architect received quit signal");
                    break;
                }
            }
        }
    }
}
