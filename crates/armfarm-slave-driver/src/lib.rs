// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-slave-driver
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The slave lifecycle state machine: `UNKNOWN -> IDLE -> (BUILDING ->
//! SENDING -> DONE) -> IDLE | GONE`. Every request/reply pair on a
//! slave's connection is strictly lock-step, so each connected slave is
//! driven entirely by its own task; the only state shared across tasks
//! is the slave registry (read by the reaper) and the two small
//! coordination registries the file juggler also holds a handle to.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use armfarm_core::{BuildTarget, BuiltFile, SlaveRecord, SlaveState};
use armfarm_protocol::coordination::{PendingTransfer, TransferOutcome, TransferRegistry, TransferRouter};
use armfarm_protocol::{IndexRequest, OracleReply, OracleRequest, OracleValue, SlaveReply, SlaveRequest};
use armfarm_seraph::{Seraph, SeraphError};
use armfarm_transport::{BoundedListener, Connection, TransportError};
use chrono::{Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Errors arising from handling one slave request or from a background
/// maintenance pass.
#[derive(Debug, Error)]
pub enum SlaveDriverError {
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
    /// that was sent.
    #[error("unexpected oracle reply shape for {verb}")]
    UnexpectedReply {
        /// The verb whose reply didn't match its expected shape.
        verb: &'static str,
    },
}

/// A request the slave driver sends to the architect: "give me the next
/// buildable target, or tell me there isn't one."
pub type BuildRequest = oneshot::Sender<Option<BuildTarget>>;

struct SlaveEntry {
    record: SlaveRecord,
    pending: VecDeque<BuiltFile>,
    build_id: Option<i64>,
    retries: u32,
    transfer_rx: Option<mpsc::Receiver<TransferOutcome>>,
}

impl SlaveEntry {
    fn fresh(slave_id: u64, now: chrono::DateTime<Utc>, transfer_rx: mpsc::Receiver<TransferOutcome>) -> Self {
        Self {
            record: SlaveRecord::new(slave_id, now),
            pending: VecDeque::new(),
            build_id: None,
            retries: 0,
            transfer_rx: Some(transfer_rx),
        }
    }
}

/// The task that terminates the slave lifecycle protocol.
pub struct SlaveDriver {
    seraph: Arc<Seraph>,
    build_queue_tx: mpsc::Sender<BuildRequest>,
    index_tx: mpsc::Sender<IndexRequest>,
    transfers: Arc<TransferRegistry>,
    router: Arc<TransferRouter>,
    slaves: Mutex<HashMap<u64, SlaveEntry>>,
    next_id: AtomicU64,
    idle_timeout: ChronoDuration,
    building_timeout: ChronoDuration,
    file_retry_limit: u32,
}

impl SlaveDriver {
    /// Construct a driver. `file_retry_limit` bounds how many times a
    /// mismatched chunk transfer is re-requested via `SEND` before the
    /// build is abandoned.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seraph: Arc<Seraph>,
        build_queue_tx: mpsc::Sender<BuildRequest>,
        index_tx: mpsc::Sender<IndexRequest>,
        transfers: Arc<TransferRegistry>,
        router: Arc<TransferRouter>,
        idle_timeout: ChronoDuration,
        building_timeout: ChronoDuration,
        file_retry_limit: u32,
    ) -> Self {
        Self {
            seraph,
            build_queue_tx,
            index_tx,
            transfers,
            router,
            slaves: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            idle_timeout,
            building_timeout,
            file_retry_limit,
        }
    }

    async fn dispatch(&self, request: OracleRequest) -> Result<OracleValue, SlaveDriverError> {
        match self.seraph.dispatch(request).await? {
            OracleReply::Ok { value } => Ok(value),
            OracleReply::Err { code, message } => Err(SlaveDriverError::Oracle { code, message }),
        }
    }

    async fn purge(&self, slave_id: u64) {
        self.slaves.lock().await.remove(&slave_id);
        self.transfers.clear(slave_id);
        self.router.unregister(slave_id);
    }

    // -- Per-verb handlers ----------------------------------------------------

    /// Mint a fresh monotonic id for a newly connected slave. `HELLO`
    /// carries no id of its own (spec.md:82, spec.md:128) — every slave
    /// that says hello gets a new one, reconnect or not.
    async fn handle_hello(&self) -> u64 {
        let now = Utc::now();
        let mut slaves = self.slaves.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let rx = self.router.register(id);
        slaves.insert(id, SlaveEntry::fresh(id, now, rx));
        tracing::info!(slave_id = id, "slave registered");
        id
    }

    async fn handle_idle(&self, slave_id: u64) -> Option<SlaveReply> {
        {
            let mut slaves = self.slaves.lock().await;
            let entry = slaves.get_mut(&slave_id)?;
            if entry.record.state != SlaveState::Idle {
                return None;
            }
            entry.record.last_heard = Utc::now();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.build_queue_tx.send(reply_tx).await.is_err() {
            tracing::warn!("build queue closed; answering SLEEP");
            return Some(SlaveReply::Sleep);
        }
        let target = reply_rx.await.ok().flatten();

        let mut slaves = self.slaves.lock().await;
        let entry = slaves.get_mut(&slave_id)?;
        match target {
            Some(target) => {
                entry.record.state = SlaveState::Building;
                entry.record.current = Some((target.package.clone(), target.version.clone()));
                entry.pending.clear();
                entry.build_id = None;
                entry.retries = 0;
                tracing::info!(slave_id, package = %target.package, version = %target.version, "build assigned");
                Some(SlaveReply::Build {
                    package: target.package,
                    version: target.version,
                })
            }
            None => Some(SlaveReply::Sleep),
        }
    }

    async fn handle_built(
        &self,
        slave_id: u64,
        status: armfarm_core::BuildStatus,
        duration: f64,
        output: String,
        files: Vec<BuiltFile>,
    ) -> Result<Option<SlaveReply>, SlaveDriverError> {
        let target = {
            let slaves = self.slaves.lock().await;
            match slaves.get(&slave_id) {
                Some(entry) if entry.record.state == SlaveState::Building => entry.record.current.clone(),
                _ => return Ok(None),
            }
        };
        let Some((package, version)) = target else {
            return Ok(None);
        };

        let value = self
            .dispatch(OracleRequest::LogBuild {
                package: package.clone(),
                version: version.clone(),
                status,
                duration,
                output,
                built_by: slave_id,
                files: files.clone(),
            })
            .await?;
        let build_id = match value {
            OracleValue::BuildId(id) => id,
            _ => return Err(SlaveDriverError::UnexpectedReply { verb: "LOGBUILD" }),
        };

        let mut slaves = self.slaves.lock().await;
        let Some(entry) = slaves.get_mut(&slave_id) else {
            return Ok(None);
        };
        entry.build_id = Some(build_id);

        if status.is_success() && !files.is_empty() {
            entry.pending = files.into_iter().collect();
            entry.record.state = SlaveState::Sending;
            let first = entry.pending.front().expect("just populated").clone();
            self.transfers.announce(
                slave_id,
                PendingTransfer {
                    package,
                    filename: first.filename.clone(),
                    filesize: first.filesize,
                    filehash: first.filehash,
                },
            );
            tracing::info!(slave_id, filename = %first.filename, "requesting file transfer");
            Ok(Some(SlaveReply::Send { filename: first.filename }))
        } else {
            entry.record.state = SlaveState::Idle;
            entry.record.current = None;
            tracing::info!(slave_id, success = status.is_success(), "build recorded, nothing to send");
            Ok(Some(SlaveReply::Done))
        }
    }

    async fn handle_sent(&self, slave_id: u64, filename: String) -> Result<Option<SlaveReply>, SlaveDriverError> {
        {
            let slaves = self.slaves.lock().await;
            match slaves.get(&slave_id) {
                Some(entry)
                    if entry.record.state == SlaveState::Sending
                        && entry.pending.front().is_some_and(|f| f.filename == filename) => {}
                _ => return Ok(None),
            }
        }

        let mut rx = {
            let mut slaves = self.slaves.lock().await;
            match slaves.get_mut(&slave_id).and_then(|e| e.transfer_rx.take()) {
                Some(rx) => rx,
                None => return Ok(None),
            }
        };
        let outcome = rx.recv().await;
        {
            let mut slaves = self.slaves.lock().await;
            if let Some(entry) = slaves.get_mut(&slave_id) {
                entry.transfer_rx = Some(rx);
            }
        }

        match outcome {
            Some(TransferOutcome::Matched) => self.advance_after_match(slave_id).await,
            Some(TransferOutcome::Mismatched) => self.retry_or_fail(slave_id).await,
            None => Ok(None),
        }
    }

    async fn advance_after_match(&self, slave_id: u64) -> Result<Option<SlaveReply>, SlaveDriverError> {
        self.transfers.clear(slave_id);
        let mut slaves = self.slaves.lock().await;
        let Some(entry) = slaves.get_mut(&slave_id) else {
            return Ok(None);
        };
        entry.retries = 0;
        entry.pending.pop_front();
        if let Some(next) = entry.pending.front().cloned() {
            let package = entry
                .record
                .current
                .as_ref()
                .map(|(p, _)| p.clone())
                .unwrap_or_default();
            drop(slaves);
            self.transfers.announce(
                slave_id,
                PendingTransfer {
                    package,
                    filename: next.filename.clone(),
                    filesize: next.filesize,
                    filehash: next.filehash,
                },
            );
            Ok(Some(SlaveReply::Send { filename: next.filename }))
        } else {
            let package = entry.record.current.as_ref().map(|(p, _)| p.clone());
            entry.record.state = SlaveState::Idle;
            entry.record.current = None;
            drop(slaves);
            if let Some(package) = package {
                let _ = self.index_tx.send(IndexRequest::Pkg { package }).await;
            }
            Ok(Some(SlaveReply::Done))
        }
    }

    async fn retry_or_fail(&self, slave_id: u64) -> Result<Option<SlaveReply>, SlaveDriverError> {
        let (exceeded, build_id, filename, current) = {
            let mut slaves = self.slaves.lock().await;
            let Some(entry) = slaves.get_mut(&slave_id) else {
                return Ok(None);
            };
            entry.retries += 1;
            let exceeded = entry.retries > self.file_retry_limit;
            let filename = entry.pending.front().map(|f| f.filename.clone());
            (exceeded, entry.build_id, filename, entry.record.current.clone())
        };

        if exceeded {
            if let Some(build_id) = build_id {
                self.dispatch(OracleRequest::DelBuild { build_id }).await?;
            }
            tracing::warn!(slave_id, "file retry limit exceeded, build abandoned");
            let mut slaves = self.slaves.lock().await;
            if let Some(entry) = slaves.get_mut(&slave_id) {
                entry.record.state = SlaveState::Idle;
                entry.record.current = None;
                entry.pending.clear();
            }
            Ok(Some(SlaveReply::Done))
        } else {
            let Some(filename) = filename else {
                return Ok(None);
            };
            if let Some((package, _)) = current {
                let (filesize, filehash) = {
                    let slaves = self.slaves.lock().await;
                    slaves
                        .get(&slave_id)
                        .and_then(|e| e.pending.front())
                        .map(|f| (f.filesize, f.filehash.clone()))
                        .unwrap_or((0, String::new()))
                };
                self.transfers.announce(
                    slave_id,
                    PendingTransfer {
                        package,
                        filename: filename.clone(),
                        filesize,
                        filehash,
                    },
                );
            }
            tracing::info!(slave_id, filename = %filename, "re-requesting mismatched transfer");
            Ok(Some(SlaveReply::Send { filename }))
        }
    }

    /// Handle one [`SlaveRequest`], returning the reply to send (or
    /// `None` when the request violates its precondition, in which case
    /// the caller answers `BYE` and closes the connection).
    async fn handle(&self, request: SlaveRequest) -> Result<(Option<u64>, Option<SlaveReply>), SlaveDriverError> {
        match request {
            SlaveRequest::Hello { .. } => {
                let id = self.handle_hello().await;
                Ok((Some(id), Some(SlaveReply::Hello { slave_id: id })))
            }
            SlaveRequest::Idle { slave_id } => Ok((Some(slave_id), self.handle_idle(slave_id).await)),
            SlaveRequest::Built {
                slave_id,
                status,
                duration,
                output,
                files,
            } => {
                let reply = self.handle_built(slave_id, status, duration, output, files).await?;
                Ok((Some(slave_id), reply))
            }
            SlaveRequest::Sent { slave_id, filename } => {
                let reply = self.handle_sent(slave_id, filename).await?;
                Ok((Some(slave_id), reply))
            }
            SlaveRequest::Done { slave_id } => {
                tracing::warn!(slave_id, "unexpected DONE from slave");
                Ok((Some(slave_id), None))
            }
            SlaveRequest::Bye { slave_id } => {
                self.purge(slave_id).await;
                tracing::info!(slave_id, "slave said goodbye");
                Ok((Some(slave_id), None))
            }
        }
    }

    /// Drive one accepted connection end to end.
    pub async fn handle_connection(self: Arc<Self>, mut conn: Connection) {
        loop {
            let request: SlaveRequest = match conn.read_message().await {
                Ok(req) => req,
                Err(TransportError::PeerClosed) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "slave connection read failed");
                    return;
                }
            };

            let is_bye = matches!(request, SlaveRequest::Bye { .. });
            let outcome = self.handle(request).await;
            let (slave_id, reply) = match outcome {
                Ok((id, reply)) => (id, reply),
                Err(e) => {
                    tracing::warn!(error = %e, "slave driver error handling request");
                    (None, None)
                }
            };

            if is_bye {
                return;
            }

            let reply = reply.unwrap_or_else(|| {
                if let Some(id) = slave_id {
                    tracing::warn!(slave_id = id, "protocol precondition violated");
                }
                SlaveReply::Bye
            });
            let close = matches!(reply, SlaveReply::Bye);
            if conn.write_message(&reply).await.is_err() {
                return;
            }
            if close {
                if let Some(id) = slave_id {
                    self.purge(id).await;
                }
                return;
            }
        }
    }

    /// Sweep the registry once, reaping any slave silent past its
    /// applicable timeout.
    pub async fn reap_expired(&self) {
        let now = Utc::now();
        let expired: Vec<u64> = {
            let slaves = self.slaves.lock().await;
            slaves
                .iter()
                .filter(|(_, entry)| entry.record.is_expired(now, self.idle_timeout, self.building_timeout))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            tracing::info!(slave_id = id, "reaping silent slave");
            self.purge(id).await;
        }
    }

    /// Accept connections on `listener` until `control` broadcasts
    /// shutdown, spawning one task per connection and a background
    /// reaper sweeping every `reap_interval`.
    pub async fn run(
        self: Arc<Self>,
        listener: BoundedListener,
        reap_interval: StdDuration,
        mut control: broadcast::Receiver<()>,
    ) {
        let reaper_driver = Arc::clone(&self);
        let mut reaper_control = control.resubscribe();
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reaper_driver.reap_expired().await,
                    _ = reaper_control.recv() => break,
                }
            }
        });

        loop {
            tokio::select! {
                accepted = armfarm_transport::accept(&listener) => {
                    match accepted {
                        Ok(conn) => {
                            let driver = Arc::clone(&self);
                            tokio::spawn(async move { driver.handle_connection(conn).await; });
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to accept slave connection"),
                    }
                }
                _ = control.recv() => {
                    tracing::info!("slave driver received quit signal");
                    break;
                }
            }
        }
        let _ = reaper.await;
    }
}
