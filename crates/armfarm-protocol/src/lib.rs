// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Wire formats for the two protocols that cross a process boundary in
//! armfarm: the slave lifecycle protocol (req/rep, port 5555) and the file
//! upload protocol (dealer/router, port 5556). Everything else in the
//! master (oracle calls routed through Seraph, build targets handed from
//! the architect to the slave driver, index updates handed to the scribe)
//! travels over in-process channels using the same message types, so they
//! are defined here too even though they never touch a socket.
//!
//! Every message family is a single tagged enum, one variant per verb.
//! Decoding an unrecognised tag is a [`ProtocolError::Json`], never a
//! silent no-op — there is deliberately no string-to-handler dispatch
//! table anywhere in this crate.

pub mod codec;
pub mod coordination;

use armfarm_core::{BuildStatus, BuildTarget, BuiltFile, FileRecord, Package, PypiSerial, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors arising from JSONL encoding/decoding or protocol-level violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization or deserialization failure.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message arrived while its sender was in the wrong state.
    #[error("wrong state: {0}")]
    WrongState(String),
}

// ---------------------------------------------------------------------------
// JsonlCodec — generic newline-delimited JSON framing
// ---------------------------------------------------------------------------

/// Stateless codec for encoding/decoding any `Serialize`/`Deserialize` type
/// as newline-delimited JSON.
///
/// # Examples
///
/// ```
/// use armfarm_protocol::{JsonlCodec, SlaveRequest};
///
/// let req = SlaveRequest::Idle { slave_id: 7 };
/// let line = JsonlCodec::encode(&req).unwrap();
/// assert!(line.ends_with('\n'));
///
/// let decoded: SlaveRequest = JsonlCodec::decode(line.trim()).unwrap();
/// assert!(matches!(decoded, SlaveRequest::Idle { slave_id: 7 }));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct JsonlCodec;

impl JsonlCodec {
    /// Serialize a message to a newline-terminated JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if the message cannot be serialized.
    pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
        let mut s = serde_json::to_string(msg)?;
        s.push('\n');
        Ok(s)
    }

    /// Deserialize a single JSON line into a message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if the line is not valid JSON or does
    /// not match the target type's tag.
    pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
        Ok(serde_json::from_str::<T>(line)?)
    }
}

// ---------------------------------------------------------------------------
// Slave lifecycle protocol (req/rep, port 5555)
// ---------------------------------------------------------------------------

/// A request sent by a slave to the slave driver.
///
/// Every variant names the verb it carries; an unknown `verb` tag on the
/// wire fails to deserialize rather than falling through to a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveRequest {
    /// First message from a newly connected slave. Carries no id: the
    /// master always mints a fresh monotonic one in reply (spec.md:82,
    /// spec.md:128) — a slave never supplies its own.
    Hello {
        /// Seconds the slave will wait for a reply before resending.
        timeout_secs: u64,
        /// Python implementation tag this slave builds for (e.g. `cp34`).
        py_version_tag: String,
        /// ABI tag this slave builds for (e.g. `cp34m`).
        abi_tag: String,
        /// Platform tag this slave builds for (e.g. `linux_armv7l`).
        platform_tag: String,
    },
    /// The slave has nothing in progress and is ready for work.
    Idle {
        /// This slave's id.
        slave_id: u64,
    },
    /// The slave finished a build and reports its outcome.
    Built {
        /// This slave's id.
        slave_id: u64,
        /// Success or failure.
        status: BuildStatus,
        /// Wall-clock build duration, in seconds.
        duration: f64,
        /// Captured build tool output.
        output: String,
        /// Files produced, if `status` is [`BuildStatus::Success`].
        files: Vec<BuiltFile>,
    },
    /// One file has finished transferring over the file upload protocol.
    Sent {
        /// This slave's id.
        slave_id: u64,
        /// The filename that finished transferring.
        filename: String,
    },
    /// All files for the current build have been sent (or there were none).
    Done {
        /// This slave's id.
        slave_id: u64,
    },
    /// The slave is shutting down cleanly.
    Bye {
        /// This slave's id.
        slave_id: u64,
    },
}

/// A reply sent by the slave driver back to a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveReply {
    /// Acknowledges a `HELLO`, assigning (or confirming) a slave id.
    Hello {
        /// The id this slave should use on every subsequent request.
        slave_id: u64,
    },
    /// No work available right now; the slave should re-send `IDLE` later.
    Sleep,
    /// Assigns a (package, version) to build.
    Build {
        /// Package name.
        package: String,
        /// Version string.
        version: String,
    },
    /// Instructs the slave to transfer the named file next.
    Send {
        /// Filename to transfer.
        filename: String,
    },
    /// Acknowledges that every file has been accounted for; the slave
    /// should return to `IDLE`.
    Done,
    /// Tells the slave to disconnect — sent whenever the driver cannot make
    /// sense of a request, so the slave never hangs waiting on a reply.
    Bye,
}

// ---------------------------------------------------------------------------
// File upload protocol (dealer/router, port 5556)
// ---------------------------------------------------------------------------

/// A request sent by a slave to the juggler while transferring one file.
///
/// The juggler tracks "the currently expected file" per slave itself (set
/// by the slave driver before the slave ever connects), so neither frame
/// here names a filename — that matches the four wire frames §6 names:
/// `HELLO`, `FETCH`, `CHUNK`, `DONE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferRequest {
    /// Announces (or re-announces, after a 5s silence) that this slave is
    /// ready to send its currently assigned file.
    Hello {
        /// Sending slave's id.
        slave_id: u64,
    },
    /// One chunk of file data at the given byte offset, sent in response
    /// to a [`TransferReply::Fetch`].
    Chunk {
        /// Sending slave's id.
        slave_id: u64,
        /// Byte offset this chunk starts at.
        offset: u64,
        /// Raw chunk bytes.
        data: Vec<u8>,
    },
}

/// A reply sent by the juggler back to a slave mid-transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferReply {
    /// Requests the next chunk: `offset` is `0` for a fresh transfer,
    /// nonzero after a reconnect mid-file; `size` bounds how many bytes
    /// the slave should read and send.
    Fetch {
        /// Offset to read from.
        offset: u64,
        /// Maximum chunk size to send.
        size: u64,
    },
    /// The file's hash matched the build record; the slave should stop
    /// sending and close this connection.
    Done,
    /// The completed file's hash did not match, or too many chunk retries
    /// have happened; the slave should abandon this file.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Database oracle protocol (in-process, fronted by Seraph)
// ---------------------------------------------------------------------------

/// A request routed through Seraph to a database oracle worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OracleRequest {
    /// Every known package, including skipped ones.
    AllPkgs,
    /// Every known version of every package.
    AllVers,
    /// Record a newly discovered package.
    NewPkg {
        /// Package name.
        package: String,
    },
    /// Record a newly discovered version of a package.
    NewVer {
        /// Package name.
        package: String,
        /// Version string.
        version: String,
    },
    /// Mark a package as permanently skipped.
    SkipPkg {
        /// Package name.
        package: String,
        /// Human-readable reason, stored for operator visibility.
        reason: String,
    },
    /// Mark one version of a package as permanently skipped.
    SkipVer {
        /// Package name.
        package: String,
        /// Version string.
        version: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Whether a package is already known.
    PkgExists {
        /// Package name.
        package: String,
    },
    /// Record a file download.
    LogDownload {
        /// Filename downloaded.
        filename: String,
        /// Coarse originating host family.
        host_family: String,
    },
    /// Record the outcome of a build attempt; idempotent on `build_id`
    /// collision (unexpected, since ids are assigned by the oracle itself).
    LogBuild {
        /// Package name.
        package: String,
        /// Version string.
        version: String,
        /// Outcome.
        status: BuildStatus,
        /// Duration, in seconds.
        duration: f64,
        /// Build tool output.
        output: String,
        /// Id of the slave that performed the build.
        built_by: u64,
        /// Files produced, if `status` is [`BuildStatus::Success`].
        files: Vec<BuiltFile>,
    },
    /// Delete a previously recorded build and its files (used when a
    /// transfer fails after `LOGBUILD` already succeeded).
    DelBuild {
        /// Build id to delete.
        build_id: i64,
    },
    /// Every file belonging to a package.
    PkgFiles {
        /// Package name.
        package: String,
    },
    /// Every file belonging to one version of a package.
    VerFiles {
        /// Package name.
        package: String,
        /// Version string.
        version: String,
    },
    /// Every distinct ABI tag ever built.
    GetAbis,
    /// (package, version) pairs with no successful build, where neither the
    /// package nor the version carries a skip flag.
    BuildableTargets,
    /// Current PyPI `serial` watermark.
    GetPypi,
    /// Advance the PyPI `serial` watermark.
    SetPypi {
        /// New watermark value.
        serial: PypiSerial,
    },
    /// Aggregate build/file statistics.
    GetStats,
    /// Per-package build summary (builds attempted, last status, file count).
    PkgSummary {
        /// Package name.
        package: String,
    },
    /// Number of distinct packages with at least one successful build —
    /// the `packages_built` field the homepage template needs.
    PackagesBuiltCount,
    /// Total number of published files — the `files_count` field the
    /// homepage template needs.
    FilesCount,
    /// Downloads recorded in the trailing 30 days — the
    /// `downloads_last_month` field the homepage template needs.
    DownloadsLastMonth,
    /// Download counts per package, used to rank the search index.
    SearchCounts,
    /// Timestamp of the most recent successful build of any package.
    LastBuilt,
    /// Total wall-clock time spent building, in seconds.
    BuildTime,
    /// The single longest build ever recorded.
    LongestBuild,
    /// Total size of every published file, in bytes.
    TotalSize,
    /// Whether the build farm is currently accepting new build assignments.
    BuildActive,
    /// Flip the farm-wide pause switch.
    SetActive {
        /// New value.
        active: bool,
    },
}

/// A successful reply payload from the oracle.
///
/// Grouped by shape rather than by verb, since several verbs return the
/// same kind of value (for example `ALLPKGS`/`PKGFILES` both return a list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleValue {
    /// No payload beyond success (e.g. `NEWPKG`, `SETPYPI`).
    Ack,
    /// A single boolean (e.g. `PKGEXISTS`, `BUILDACTIVE`).
    Bool(bool),
    /// A single 64-bit float (e.g. `BUILDTIME`, `TOTALSIZE`).
    Number(f64),
    /// Aggregate build counts: `(success, fail, total)`.
    Stats {
        /// Successful builds.
        success: i64,
        /// Failed builds.
        fail: i64,
        /// Total builds (success + fail).
        total: i64,
    },
    /// The packages known to the oracle.
    Packages(Vec<Package>),
    /// The versions known to the oracle.
    Versions(Vec<Version>),
    /// A list of published files.
    Files(Vec<FileRecord>),
    /// A list of distinct tag strings (e.g. `GETABIS`).
    Tags(Vec<String>),
    /// (package, version) pairs selected for building.
    Targets(Vec<BuildTarget>),
    /// The PyPI serial watermark.
    Serial(PypiSerial),
    /// Id assigned to a newly recorded build.
    BuildId(i64),
    /// `(package, download count)` pairs, ordered for the search index.
    Counts(Vec<(String, i64)>),
}

/// A reply from the oracle: either a value, or a failure tagged with the
/// error code that [`armfarm_error::ErrorCode`] would have assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OracleReply {
    /// The request succeeded.
    Ok {
        /// The returned value.
        value: OracleValue,
    },
    /// The request failed.
    Err {
        /// Stable error code string (mirrors `ErrorCode::as_str()`).
        code: String,
        /// Human-readable detail.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Index scribe protocol (in-process)
// ---------------------------------------------------------------------------

/// A request to update or query the published index tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexRequest {
    /// Rebuild the per-package index page and its entry in `simple/index.html`.
    Pkg {
        /// Package name.
        package: String,
    },
    /// Rebuild the home page (package count, build statistics).
    Home,
    /// Rebuild the search index page.
    Search,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_request_roundtrips_through_jsonl() {
        let req = SlaveRequest::Hello {
            timeout_secs: 120,
            py_version_tag: "cp34".into(),
            abi_tag: "cp34m".into(),
            platform_tag: "linux_armv7l".into(),
        };
        let line = JsonlCodec::encode(&req).unwrap();
        assert!(line.ends_with('\n'));
        let decoded: SlaveRequest = JsonlCodec::decode(line.trim()).unwrap();
        match decoded {
            SlaveRequest::Hello { py_version_tag, .. } => {
                assert_eq!(py_version_tag, "cp34");
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn slave_reply_tags_are_stable() {
        let line = JsonlCodec::encode(&SlaveReply::Sleep).unwrap();
        assert!(line.contains("\"verb\":\"SLEEP\""));
    }

    #[test]
    fn unknown_verb_fails_to_decode() {
        let line = r#"{"verb":"NONSENSE"}"#;
        let err = JsonlCodec::decode::<SlaveRequest>(line).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn transfer_chunk_carries_raw_bytes() {
        let req = TransferRequest::Chunk {
            slave_id: 3,
            offset: 1024,
            data: vec![1, 2, 3, 4],
        };
        let line = JsonlCodec::encode(&req).unwrap();
        let decoded: TransferRequest = JsonlCodec::decode(line.trim()).unwrap();
        match decoded {
            TransferRequest::Chunk { offset, data, .. } => {
                assert_eq!(offset, 1024);
                assert_eq!(data, vec![1, 2, 3, 4]);
            }
            other => panic!("expected Chunk, got {other:?}"),
        }
    }

    #[test]
    fn oracle_reply_err_roundtrips() {
        let reply = OracleReply::Err {
            code: "STORAGE_QUERY_FAILED".into(),
            message: "duplicate key".into(),
        };
        let line = JsonlCodec::encode(&reply).unwrap();
        let decoded: OracleReply = JsonlCodec::decode(line.trim()).unwrap();
        match decoded {
            OracleReply::Err { code, .. } => assert_eq!(code, "STORAGE_QUERY_FAILED"),
            other => panic!("expected Err, got {other:?}"),
        }
    }

    #[test]
    fn index_request_pkg_roundtrips() {
        let req = IndexRequest::Pkg { package: "numpy".into() };
        let line = JsonlCodec::encode(&req).unwrap();
        let decoded: IndexRequest = JsonlCodec::decode(line.trim()).unwrap();
        assert!(matches!(decoded, IndexRequest::Pkg { package } if package == "numpy"));
    }
}
