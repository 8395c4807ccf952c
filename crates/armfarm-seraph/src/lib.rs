// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-seraph
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! A ready-queue broker: every registered oracle worker starts in the
//! ready queue, a client's [`Seraph::dispatch`] pops the front of it,
//! forwards the request, and the worker rejoins the back of the queue
//! once it replies. Requests queue in arrival order whenever every
//! worker is busy, so no client starves another.

use armfarm_protocol::{OracleReply, OracleRequest};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

/// One unit of work handed to an oracle worker: the request, and where to
/// send the reply once it's ready.
pub type WorkItem = (OracleRequest, oneshot::Sender<OracleReply>);

/// Errors arising from dispatching a request through the broker.
#[derive(Debug, Error)]
pub enum SeraphError {
    /// No oracle workers were ever registered.
    #[error("no oracle workers are registered")]
    NoWorkers,

    /// The worker's channel was closed before it accepted the request
    /// (the worker task has exited).
    #[error("worker channel closed before accepting a request")]
    WorkerGone,

    /// The worker accepted the request but was dropped before replying.
    #[error("the oracle dropped a request before replying")]
    WorkerDropped,
}

struct Worker {
    tx: mpsc::Sender<WorkItem>,
}

/// Broker that fans client requests out to whichever registered oracle
/// worker is next in the ready queue.
///
/// Construct with [`Seraph::build`], then share the returned `Arc` with
/// every client task; each one calls [`Seraph::dispatch`] independently.
pub struct Seraph {
    workers: Vec<Worker>,
    ready: Mutex<VecDeque<usize>>,
    notify: Notify,
}

impl Seraph {
    /// Build a broker over `workers`, one channel per oracle worker task.
    /// Every worker starts ready.
    #[must_use]
    pub fn build(workers: Vec<mpsc::Sender<WorkItem>>) -> Arc<Self> {
        let ready = (0..workers.len()).collect();
        Arc::new(Self {
            workers: workers.into_iter().map(|tx| Worker { tx }).collect(),
            ready: Mutex::new(ready),
            notify: Notify::new(),
        })
    }

    /// Send `request` to the next available worker and wait for its reply.
    ///
    /// Calls queue fairly: a client that arrives while every worker is
    /// busy is served in the order it asked, not reordered behind later
    /// arrivals.
    ///
    /// # Errors
    ///
    /// Returns [`SeraphError::NoWorkers`] if no workers were registered,
    /// or [`SeraphError::WorkerGone`]/[`SeraphError::WorkerDropped`] if the
    /// assigned worker task has exited.
    pub async fn dispatch(&self, request: OracleRequest) -> Result<OracleReply, SeraphError> {
        if self.workers.is_empty() {
            return Err(SeraphError::NoWorkers);
        }

        let worker_id = self.acquire_worker().await;
        let worker = &self.workers[worker_id];

        let (reply_tx, reply_rx) = oneshot::channel();
        let send_result = worker.tx.send((request, reply_tx)).await;
        if send_result.is_err() {
            self.release_worker(worker_id).await;
            return Err(SeraphError::WorkerGone);
        }

        let reply = reply_rx.await.map_err(|_| SeraphError::WorkerDropped);
        self.release_worker(worker_id).await;
        reply
    }

    async fn acquire_worker(&self) -> usize {
        loop {
            {
                let mut ready = self.ready.lock().await;
                if let Some(id) = ready.pop_front() {
                    return id;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn release_worker(&self, id: usize) {
        self.ready.lock().await.push_back(id);
        self.notify.notify_one();
    }

    /// Number of registered workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
