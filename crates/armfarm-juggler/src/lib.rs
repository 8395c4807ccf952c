// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-juggler
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Terminates the file upload protocol: `HELLO` in, `FETCH`/`DONE`/`ERROR`
//! out, accumulating `CHUNK` replies into a temporary file until the
//! declared size is reached, then verifying the hash before publishing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use armfarm_protocol::coordination::{TransferOutcome, TransferRegistry, TransferRouter};
use armfarm_protocol::{TransferReply, TransferRequest};
use armfarm_transport::{BoundedListener, Connection, TransportError};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};

/// Chunk size requested per `FETCH`, absent an explicit override.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

struct ActiveTransfer {
    file: fs::File,
    temp_path: PathBuf,
    offset: u64,
}

/// The task that accepts chunked file uploads on the dedicated upload
/// port, one slave connection at a time.
pub struct Juggler {
    transfers: Arc<TransferRegistry>,
    router: Arc<TransferRouter>,
    output_root: PathBuf,
    chunk_size: u64,
    active: Mutex<HashMap<u64, ActiveTransfer>>,
}

impl Juggler {
    /// Construct a juggler publishing under `output_root/simple/<pkg>/`.
    #[must_use]
    pub fn new(
        transfers: Arc<TransferRegistry>,
        router: Arc<TransferRouter>,
        output_root: impl Into<PathBuf>,
        chunk_size: u64,
    ) -> Self {
        Self {
            transfers,
            router,
            output_root: output_root.into(),
            chunk_size,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn final_path(&self, package: &str, filename: &str) -> PathBuf {
        self.output_root.join("simple").join(package).join(filename)
    }

    fn temp_path(&self, package: &str, filename: &str, slave_id: u64) -> PathBuf {
        self.output_root
            .join("simple")
            .join(package)
            .join(format!(".{filename}.{slave_id}.part"))
    }

    async fn handle_hello(&self, slave_id: u64) -> TransferReply {
        let Some(pending) = self.transfers.lookup(slave_id) else {
            tracing::warn!(slave_id, "HELLO for a slave with no announced transfer");
            return TransferReply::Error {
                message: "no transfer pending for this slave".into(),
            };
        };
        let filesize = pending.filesize.max(0) as u64;
        let temp_path = self.temp_path(&pending.package, &pending.filename, slave_id);

        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(&slave_id) {
            if existing.temp_path == temp_path {
                let offset = existing.offset;
                tracing::debug!(slave_id, offset, "repeated HELLO, resuming in place");
                return TransferReply::Fetch {
                    offset,
                    size: self.chunk_size.min(filesize.saturating_sub(offset)),
                };
            }
        }

        if let Some(parent) = temp_path.parent()
            && let Err(e) = fs::create_dir_all(parent).await
        {
            tracing::warn!(error = %e, "failed to create output directory");
            return TransferReply::Error {
                message: "server storage error".into(),
            };
        }
        let file = match OpenOptions::new().create(true).write(true).truncate(true).open(&temp_path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open temporary upload file");
                return TransferReply::Error {
                    message: "server storage error".into(),
                };
            }
        };
        active.insert(slave_id, ActiveTransfer { file, temp_path, offset: 0 });
        tracing::info!(slave_id, filename = %pending.filename, "upload started");
        TransferReply::Fetch {
            offset: 0,
            size: self.chunk_size.min(filesize),
        }
    }

    async fn handle_chunk(&self, slave_id: u64, offset: u64, data: Vec<u8>) -> TransferReply {
        let Some(pending) = self.transfers.lookup(slave_id) else {
            return TransferReply::Error {
                message: "no transfer pending for this slave".into(),
            };
        };
        let filesize = pending.filesize.max(0) as u64;

        {
            let mut active = self.active.lock().await;
            let Some(entry) = active.get_mut(&slave_id) else {
                return TransferReply::Error {
                    message: "no upload in progress for this slave".into(),
                };
            };
            if offset != entry.offset {
                tracing::warn!(slave_id, expected = entry.offset, got = offset, "chunk offset mismatch");
                return TransferReply::Error {
                    message: "unexpected chunk offset".into(),
                };
            }
            if let Err(e) = entry.file.seek(std::io::SeekFrom::Start(offset)).await {
                tracing::warn!(error = %e, "failed to seek upload file");
                return TransferReply::Error {
                    message: "server storage error".into(),
                };
            }
            if let Err(e) = entry.file.write_all(&data).await {
                tracing::warn!(error = %e, "failed to write chunk");
                return TransferReply::Error {
                    message: "server storage error".into(),
                };
            }
            entry.offset += data.len() as u64;
            if entry.offset < filesize {
                return TransferReply::Fetch {
                    offset: entry.offset,
                    size: self.chunk_size.min(filesize - entry.offset),
                };
            }
            if let Err(e) = entry.file.flush().await {
                tracing::warn!(error = %e, "failed to flush upload file");
                return TransferReply::Error {
                    message: "server storage error".into(),
                };
            }
        }

        let temp_path = {
            let mut active = self.active.lock().await;
            active.remove(&slave_id).map(|entry| entry.temp_path)
        };
        let Some(temp_path) = temp_path else {
            return TransferReply::Error {
                message: "no upload in progress for this slave".into(),
            };
        };

        self.finish_upload(slave_id, &pending.package, &pending.filename, &pending.filehash, &temp_path)
            .await
    }

    async fn finish_upload(
        &self,
        slave_id: u64,
        package: &str,
        filename: &str,
        expected_hash: &str,
        temp_path: &Path,
    ) -> TransferReply {
        let hash = match hash_file(temp_path).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(error = %e, "failed to hash completed upload");
                let _ = fs::remove_file(temp_path).await;
                self.transfers.clear(slave_id);
                self.router.notify(slave_id, TransferOutcome::Mismatched).await;
                return TransferReply::Error {
                    message: "server storage error".into(),
                };
            }
        };

        if hash != expected_hash {
            tracing::warn!(slave_id, filename, "upload hash mismatch, discarding");
            let _ = fs::remove_file(temp_path).await;
            self.transfers.clear(slave_id);
            self.router.notify(slave_id, TransferOutcome::Mismatched).await;
            return TransferReply::Error {
                message: "hash mismatch".into(),
            };
        }

        let final_path = self.final_path(package, filename);
        if let Err(e) = fs::rename(temp_path, &final_path).await {
            tracing::warn!(error = %e, "failed to publish completed upload");
            self.transfers.clear(slave_id);
            self.router.notify(slave_id, TransferOutcome::Mismatched).await;
            return TransferReply::Error {
                message: "server storage error".into(),
            };
        }

        tracing::info!(slave_id, filename, "file published");
        self.transfers.clear(slave_id);
        self.router.notify(slave_id, TransferOutcome::Matched).await;
        TransferReply::Done
    }

    /// Handle one [`TransferRequest`], returning the reply to send.
    pub async fn handle(&self, request: TransferRequest) -> TransferReply {
        match request {
            TransferRequest::Hello { slave_id } => self.handle_hello(slave_id).await,
            TransferRequest::Chunk { slave_id, offset, data } => self.handle_chunk(slave_id, offset, data).await,
        }
    }

    /// Drive one accepted connection end to end: a connection carries
    /// exactly one file, closing once it reaches `DONE` or `ERROR`.
    pub async fn handle_connection(self: Arc<Self>, mut conn: Connection) {
        loop {
            let request: TransferRequest = match conn.read_message().await {
                Ok(req) => req,
                Err(TransportError::PeerClosed) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "upload connection read failed");
                    return;
                }
            };
            let reply = self.handle(request).await;
            let close = matches!(reply, TransferReply::Done | TransferReply::Error { .. });
            if conn.write_message(&reply).await.is_err() {
                return;
            }
            if close {
                return;
            }
        }
    }

    /// Accept connections on `listener` until `control` broadcasts
    /// shutdown, spawning one task per connection.
    pub async fn run(self: Arc<Self>, listener: BoundedListener, mut control: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = armfarm_transport::accept(&listener) => {
                    match accepted {
                        Ok(conn) => {
                            let juggler = Arc::clone(&self);
                            tokio::spawn(async move { juggler.handle_connection(conn).await; });
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to accept upload connection"),
                    }
                }
                _ = control.recv() => {
                    tracing::info!("juggler received quit signal");
                    break;
                }
            }
        }
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armfarm_protocol::coordination::PendingTransfer;

    fn new_juggler(output_root: &Path) -> Arc<Juggler> {
        Arc::new(Juggler::new(
            Arc::new(TransferRegistry::new()),
            Arc::new(TransferRouter::new()),
            output_root,
            16,
        ))
    }

    fn announce(juggler: &Juggler, slave_id: u64, package: &str, filename: &str, data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let filehash = format!("{:x}", hasher.finalize());
        juggler.transfers.announce(
            slave_id,
            PendingTransfer {
                package: package.into(),
                filename: filename.into(),
                filesize: data.len() as i64,
                filehash: filehash.clone(),
            },
        );
        filehash
    }

    #[tokio::test]
    async fn hello_without_an_announced_transfer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let juggler = new_juggler(dir.path());
        let reply = juggler.handle(TransferRequest::Hello { slave_id: 1 }).await;
        assert!(matches!(reply, TransferReply::Error { .. }));
    }

    #[tokio::test]
    async fn full_upload_round_trips_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let juggler = new_juggler(dir.path());
        let data = b"wheel file contents".to_vec();
        announce(&juggler, 1, "numpy", "numpy-1.0.whl", &data);

        let reply = juggler.handle(TransferRequest::Hello { slave_id: 1 }).await;
        let (mut offset, mut size) = match reply {
            TransferReply::Fetch { offset, size } => (offset, size),
            other => panic!("expected Fetch, got {other:?}"),
        };

        loop {
            let chunk = data[offset as usize..(offset as usize + size as usize).min(data.len())].to_vec();
            let reply = juggler
                .handle(TransferRequest::Chunk {
                    slave_id: 1,
                    offset,
                    data: chunk,
                })
                .await;
            match reply {
                TransferReply::Fetch { offset: next_offset, size: next_size } => {
                    offset = next_offset;
                    size = next_size;
                }
                TransferReply::Done => break,
                other => panic!("unexpected reply: {other:?}"),
            }
        }

        let published = dir.path().join("simple").join("numpy").join("numpy-1.0.whl");
        assert_eq!(fs::read(&published).await.unwrap(), data);
        assert!(juggler.transfers.lookup(1).is_none());
    }

    #[tokio::test]
    async fn hash_mismatch_discards_and_reports_mismatched() {
        let dir = tempfile::tempdir().unwrap();
        let juggler = new_juggler(dir.path());
        juggler.transfers.announce(
            2,
            PendingTransfer {
                package: "flask".into(),
                filename: "flask-1.0.whl".into(),
                filesize: 4,
                filehash: "deadbeef".into(),
            },
        );
        let mut rx = juggler.router.register(2);

        juggler.handle(TransferRequest::Hello { slave_id: 2 }).await;
        let reply = juggler
            .handle(TransferRequest::Chunk {
                slave_id: 2,
                offset: 0,
                data: b"nope".to_vec(),
            })
            .await;
        assert!(matches!(reply, TransferReply::Error { .. }));
        assert_eq!(rx.recv().await, Some(TransferOutcome::Mismatched));

        let temp = dir.path().join("simple").join("flask").join(".flask-1.0.whl.2.part");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn chunk_with_wrong_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let juggler = new_juggler(dir.path());
        announce(&juggler, 3, "numpy", "numpy-1.0.whl", b"0123456789abcdef");
        juggler.handle(TransferRequest::Hello { slave_id: 3 }).await;
        let reply = juggler
            .handle(TransferRequest::Chunk {
                slave_id: 3,
                offset: 99,
                data: vec![0; 4],
            })
            .await;
        assert!(matches!(reply, TransferReply::Error { .. }));
    }

    #[tokio::test]
    async fn repeated_hello_resumes_at_current_offset() {
        let dir = tempfile::tempdir().unwrap();
        let juggler = new_juggler(dir.path());
        let data = b"0123456789abcdef".to_vec();
        announce(&juggler, 4, "numpy", "numpy-1.0.whl", &data);

        juggler.handle(TransferRequest::Hello { slave_id: 4 }).await;
        juggler
            .handle(TransferRequest::Chunk {
                slave_id: 4,
                offset: 0,
                data: data[0..8].to_vec(),
            })
            .await;

        let reply = juggler.handle(TransferRequest::Hello { slave_id: 4 }).await;
        match reply {
            TransferReply::Fetch { offset, .. } => assert_eq!(offset, 8),
            other => panic!("expected Fetch resuming at offset 8, got {other:?}"),
        }
    }
}
