// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process handoff between the slave driver and the file juggler.
//!
//! The two tasks partition the upload: the driver decides *which* file a
//! slave sends next (and where it belongs), the juggler decides *how* the
//! bytes get there. Neither holds a reference into the other's state —
//! they only exchange messages through the two small registries below,
//! which the supervisor constructs once and hands to both tasks.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Everything the juggler needs to know about the file a slave is about
/// to send, handed over by the driver before the slave ever connects to
/// the upload port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    /// Owning package name (used to place the file under `simple/<pkg>/`).
    pub package: String,
    /// Filename being transferred.
    pub filename: String,
    /// Declared size in bytes.
    pub filesize: i64,
    /// Expected SHA-256 hex digest.
    pub filehash: String,
}

/// Registry of in-flight transfers, keyed by slave id.
///
/// A slave has at most one file in flight at a time, so the key is the
/// slave id alone — the driver inserts an entry when it replies `SEND`,
/// and removes it once the juggler reports an outcome.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    entries: Mutex<HashMap<u64, PendingTransfer>>,
}

impl TransferRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `slave_id` is about to transfer `transfer`.
    pub fn announce(&self, slave_id: u64, transfer: PendingTransfer) {
        self.entries.lock().unwrap().insert(slave_id, transfer);
    }

    /// Look up the file currently expected from `slave_id`.
    #[must_use]
    pub fn lookup(&self, slave_id: u64) -> Option<PendingTransfer> {
        self.entries.lock().unwrap().get(&slave_id).cloned()
    }

    /// Clear the entry for `slave_id` once its outcome has been reported.
    pub fn clear(&self, slave_id: u64) {
        self.entries.lock().unwrap().remove(&slave_id);
    }
}

/// How a file transfer ended, as reported by the juggler back to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The completed file's hash matched and it was published.
    Matched,
    /// The completed file's hash did not match; the driver should
    /// re-request via `SEND`, up to its retry bound.
    Mismatched,
}

/// Per-slave mailbox the juggler uses to tell the driver how a transfer
/// ended, since the two events (the slave's wire-level `SENT` and the
/// juggler's hash verification) race on independent connections.
#[derive(Debug, Default)]
pub struct TransferRouter {
    senders: Mutex<HashMap<u64, mpsc::Sender<TransferOutcome>>>,
}

impl TransferRouter {
    /// An empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slave_id` to receive at most one pending outcome at a
    /// time and return the receiving half the driver should await on.
    pub fn register(&self, slave_id: u64) -> mpsc::Receiver<TransferOutcome> {
        let (tx, rx) = mpsc::channel(1);
        self.senders.lock().unwrap().insert(slave_id, tx);
        rx
    }

    /// Drop `slave_id`'s mailbox (the slave disconnected or was reaped).
    pub fn unregister(&self, slave_id: u64) {
        self.senders.lock().unwrap().remove(&slave_id);
    }

    /// Deliver an outcome to `slave_id`'s mailbox, if it is still
    /// registered. Silently drops the outcome otherwise — the driver has
    /// already given up on this slave.
    pub async fn notify(&self, slave_id: u64, outcome: TransferOutcome) {
        let sender = self.senders.lock().unwrap().get(&slave_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(outcome).await;
        }
    }
}
