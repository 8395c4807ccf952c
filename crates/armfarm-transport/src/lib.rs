// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-transport
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Both wire protocols armfarm speaks (the slave lifecycle protocol and
//! the file upload protocol) are strict request/reply: a peer sends
//! exactly one message and then blocks until exactly one reply arrives.
//! This crate carries that discipline over TCP with newline-delimited
//! JSON framing rather than a ZMQ transport (see [`BoundedListener`]'s
//! docs for why, and for how the ZMQ HWM/backpressure contract spec.md
//! §4.1/§6 asks for is reproduced here), so that `armfarm-slave-driver`
//! and `armfarm-juggler` only have to implement the verb-level state
//! machine.

use armfarm_protocol::{JsonlCodec, ProtocolError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Errors arising from accepting connections or exchanging framed messages.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listener could not bind its configured address.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// Address that failed to bind.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Underlying I/O error on an accepted connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before a complete line arrived.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The line that arrived could not be decoded as the expected message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One accepted TCP connection, framed as newline-delimited JSON.
///
/// `Connection` is generic over the request type `Req` a peer sends and the
/// reply type `Rep` this side sends back; `armfarm-slave-driver` uses
/// `Connection<SlaveRequest, SlaveReply>` and `armfarm-juggler` uses
/// `Connection<TransferRequest, TransferReply>`.
pub struct Connection {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    peer_addr: SocketAddr,
    // Held for the connection's lifetime when accepted through a
    // `BoundedListener`; dropping the connection releases the permit and
    // lets the listener's accept loop admit the next one. `None` for
    // connections built directly with `Connection::new` (client-side
    // dials, and tests that don't go through a listener).
    _hwm_permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    /// Wrap an accepted [`TcpStream`] with no high-water-mark accounting.
    /// Used client-side and for connections not accepted through a
    /// [`BoundedListener`].
    #[must_use]
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            _hwm_permit: None,
        }
    }

    fn with_permit(stream: TcpStream, peer_addr: SocketAddr, permit: OwnedSemaphorePermit) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            _hwm_permit: Some(permit),
        }
    }

    /// The remote address this connection was accepted from.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one JSON line and decode it as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PeerClosed`] if the connection is closed
    /// before a line arrives, or [`TransportError::Protocol`] if the line
    /// is not valid JSON for `T`.
    pub async fn read_message<T>(&mut self) -> Result<T, TransportError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::PeerClosed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(JsonlCodec::decode(trimmed)?);
        }
    }

    /// Encode `message` and write it as one newline-terminated JSON line,
    /// flushing immediately — every reply in these protocols is
    /// latency-sensitive, so writes are never batched.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] if `message` cannot be
    /// serialized, or [`TransportError::Io`] on a write failure.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let line = JsonlCodec::encode(message)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// A [`TcpListener`] whose concurrently accepted connections are capped at
/// a configured high-water mark.
///
/// spec.md §4.1 describes every mesh queue as carrying a bounded
/// high-water mark: once reached, sends on push/dealer queues block the
/// cooperative poller, and reps hold back, rather than growing the queue
/// without limit. Neither of the two protocols this crate's callers speak
/// (the slave lifecycle req/rep on port 5555, the file-upload dealer/router
/// on port 5556) is carried over an actual ZMQ socket here — both run over
/// one TCP connection per peer with newline-delimited JSON framing instead,
/// since every caller in this workspace lives in a single process and the
/// pack's one ZMQ precedent (`zeromq` in `sl224-casparianflow`) is a pure
/// Rust reimplementation that exposes neither HWM nor `ROUTER_MANDATORY`
/// as socket options to configure, only the bind/connect/send/recv surface
/// already captured by accepting and framing a `TcpStream` directly. The
/// one piece of that contract a plain listener doesn't reproduce on its
/// own — the bound on how much concurrently-in-flight work a poller
/// admits before it blocks — is reproduced here with a
/// [`tokio::sync::Semaphore`]: `accept` acquires a permit before taking
/// the next connection off the kernel backlog, so once `high_water_mark`
/// connections are open at a time, the accept loop (a single task per
/// `armfarm-slave-driver`/`armfarm-juggler`, per spec §5's "one poller,
/// blocking work is avoided" scheduling model) stalls exactly the way a
/// push/dealer send would stall against a full queue — the task's own
/// await point suspends, not the process. The permit is held for the
/// connection's lifetime and released when it drops, admitting the next
/// one. Identity-based dealer/router multiplexing (the `ROUTER` side's
/// explicit peer-identity frame) has no separate wire representation here
/// either: since each peer already gets its own TCP connection, the
/// connection itself is the identity, so there is no frame to forward or
/// a mandatory-delivery failure to report — a peer that has disappeared
/// shows up as a failed `accept`/read, which is already loud rather than
/// silently dropped.
pub struct BoundedListener {
    listener: TcpListener,
    limiter: Arc<Semaphore>,
}

impl BoundedListener {
    /// The address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the underlying socket cannot
    /// report its local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Bind a [`BoundedListener`] at `addr`, admitting at most
/// `high_water_mark` concurrently accepted connections at a time.
///
/// # Errors
///
/// Returns [`TransportError::BindFailed`] if the address cannot be bound.
pub async fn bind(addr: SocketAddr, high_water_mark: usize) -> Result<BoundedListener, TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::BindFailed { addr, source })?;
    Ok(BoundedListener {
        listener,
        limiter: Arc::new(Semaphore::new(high_water_mark.max(1))),
    })
}

/// Accept one connection from `listener`, returning a framed [`Connection`].
///
/// Blocks (suspending only the calling task, per spec §5) once
/// `high_water_mark` connections accepted from this listener are still
/// open, until one of them closes.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if accepting fails.
pub async fn accept(listener: &BoundedListener) -> Result<Connection, TransportError> {
    let permit = Arc::clone(&listener.limiter)
        .acquire_owned()
        .await
        .expect("BoundedListener's semaphore is never closed");
    let (stream, peer_addr) = listener.listener.accept().await?;
    Ok(Connection::with_permit(stream, peer_addr, permit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armfarm_protocol::{SlaveReply, SlaveRequest};

    #[tokio::test]
    async fn roundtrips_one_request_one_reply() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await.unwrap();
            let req: SlaveRequest = conn.read_message().await.unwrap();
            assert!(matches!(req, SlaveRequest::Idle { slave_id: 9 }));
            conn.write_message(&SlaveReply::Sleep).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = stream.peer_addr().unwrap();
        let mut client = Connection::new(stream, peer);
        client
            .write_message(&SlaveRequest::Idle { slave_id: 9 })
            .await
            .unwrap();
        let reply: SlaveReply = client.read_message().await.unwrap();
        assert!(matches!(reply, SlaveReply::Sleep));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_message_reports_peer_closed() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await.unwrap();
            let err = conn.read_message::<SlaveRequest>().await.unwrap_err();
            assert!(matches!(err, TransportError::PeerClosed));
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_message_skips_blank_lines() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await.unwrap();
            let req: SlaveRequest = conn.read_message().await.unwrap();
            assert!(matches!(req, SlaveRequest::Done { slave_id: 1 }));
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"\n   \n").await.unwrap();
        let line = JsonlCodec::encode(&SlaveRequest::Done { slave_id: 1 }).unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn accept_blocks_once_high_water_mark_is_reached() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let first_client = TcpStream::connect(addr).await.unwrap();
        let first = accept(&listener).await.unwrap();

        // A second peer completes its TCP handshake and sits in the
        // kernel backlog, but with the one permit held by `first`, our
        // `accept` must not resolve until `first` is dropped and releases
        // it back to the semaphore.
        let second_client = TcpStream::connect(addr).await.unwrap();
        tokio::select! {
            _ = accept(&listener) => panic!("accept resolved past the high-water mark"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }

        drop(first);
        drop(first_client);
        let second = accept(&listener).await.unwrap();
        drop(second);
        drop(second_client);
    }
}
