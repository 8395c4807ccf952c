// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The data model shared by every task in the armfarm master: packages,
//! versions, builds, files, downloads, and the in-memory slave record.
//! If you only take one dependency from this workspace, take this one.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A package name as known to the upstream index.
///
/// Created by the Architect when first discovered; never destroyed. The
/// `skip` flag, when set, excludes every version of the package from
/// future build selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Package {
    /// Unique package identifier (the name used by the upstream index).
    pub name: String,
    /// When set, no version of this package is ever selected for a build.
    pub skip: bool,
}

impl Package {
    /// Construct a freshly discovered, unskipped package.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skip: false,
        }
    }
}

/// One version of a [`Package`].
///
/// Immutable after creation except for the `skip` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Version {
    /// Owning package name.
    pub package: String,
    /// Version string, as published by the upstream index.
    pub version: String,
    /// When set, this version is never selected for a build.
    pub skip: bool,
}

impl Version {
    /// Construct a freshly discovered, unskipped version.
    #[must_use]
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            skip: false,
        }
    }
}

/// Outcome of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// The build produced at least the archives the slave declared.
    Success,
    /// The build failed; no files are attached.
    Failure,
}

impl BuildStatus {
    /// `true` for [`BuildStatus::Success`].
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

/// A single recorded build of a (package, version) pair.
///
/// A (package, version) has at most one successful build at any time.
/// Superseding a build (recording a new success) is the Oracle's
/// responsibility and deletes the prior build plus its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildRecord {
    /// Unique build id, assigned by the Oracle on insert.
    pub build_id: i64,
    /// Package name.
    pub package: String,
    /// Version string.
    pub version: String,
    /// Success or failure.
    pub status: BuildStatus,
    /// Wall-clock duration of the build, in seconds.
    pub duration: f64,
    /// Captured stdout/stderr of the build tool.
    pub output: String,
    /// Id of the slave that produced this build.
    pub built_by: i64,
    /// Timestamp the build was recorded.
    pub built_at: DateTime<Utc>,
}

/// One archive file produced by a successful [`BuildRecord`].
///
/// `filename` is globally unique; `filehash` is the canonical integrity
/// anchor and always matches the bytes on disk at the published path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileRecord {
    /// Globally unique archive filename.
    pub filename: String,
    /// Owning build id.
    pub build_id: i64,
    /// Size in bytes.
    pub filesize: i64,
    /// SHA-256 hex digest of the archive bytes.
    pub filehash: String,
    /// Package-version tag component of the filename (e.g. `1.0`).
    pub package_version_tag: String,
    /// Python-version tag component (e.g. `cp34`).
    pub py_version_tag: String,
    /// ABI tag component (e.g. `cp34m`).
    pub abi_tag: String,
    /// Platform tag component (e.g. `linux_armv7l`).
    pub platform_tag: String,
}

impl FileRecord {
    /// The href piwheels publishes for this file: `<filename>#sha256=<hash>`.
    #[must_use]
    pub fn href(&self) -> String {
        format!("{}#sha256={}", self.filename, self.filehash)
    }
}

/// An append-only record of a file download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Download {
    /// Filename that was downloaded.
    pub filename: String,
    /// When the download was recorded.
    pub accessed_at: DateTime<Utc>,
    /// Coarse originating host family (e.g. `armv6l`, `armv7l`, `unknown`).
    pub host_family: String,
}

/// Driver-side view of a connected slave's lifecycle state.
///
/// Transitions as `Unknown -> Idle -> (Building -> Sending -> Done) ->
/// Idle | Gone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlaveState {
    /// No `HELLO` received yet.
    Unknown,
    /// Registered, waiting for work.
    Idle,
    /// A build has been assigned and is in progress.
    Building,
    /// The build completed; files are being transferred.
    Sending,
    /// All files transferred (or none to transfer); about to return to Idle.
    Done,
    /// The slave disconnected or was reaped.
    Gone,
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Sending => "sending",
            Self::Done => "done",
            Self::Gone => "gone",
        })
    }
}

/// A transient, in-memory record of one connected slave.
///
/// Destroyed on `BYE` or timeout — never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SlaveRecord {
    /// Monotonic id assigned at `HELLO`.
    pub slave_id: u64,
    /// Last time any request was heard from this slave.
    pub last_heard: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: SlaveState,
    /// The (package, version) currently assigned, if any.
    pub current: Option<(String, String)>,
}

impl SlaveRecord {
    /// Construct a freshly greeted slave in the `Idle` state.
    #[must_use]
    pub fn new(slave_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            slave_id,
            last_heard: now,
            state: SlaveState::Idle,
            current: None,
        }
    }

    /// The timeout that applies to this slave's current state: the idle
    /// bound while idle, the (longer) building bound while building or
    /// sending.
    #[must_use]
    pub fn applicable_timeout(
        &self,
        idle: chrono::Duration,
        building: chrono::Duration,
    ) -> chrono::Duration {
        match self.state {
            SlaveState::Building | SlaveState::Sending => building,
            _ => idle,
        }
    }

    /// Whether `now - last_heard` exceeds the applicable timeout.
    #[must_use]
    pub fn is_expired(
        &self,
        now: DateTime<Utc>,
        idle: chrono::Duration,
        building: chrono::Duration,
    ) -> bool {
        now - self.last_heard > self.applicable_timeout(idle, building)
    }
}

/// The upstream index's scalar watermark (PyPI `serial` cursor).
///
/// Stored as a key/value metadata row; the Architect advances it after each
/// successful scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct PypiSerial(pub i64);

impl PypiSerial {
    /// The initial serial before any scrape has happened.
    pub const ZERO: PypiSerial = PypiSerial(0);
}

impl fmt::Display for PypiSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (package, version) pair selected by the Architect for building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildTarget {
    /// Package name.
    pub package: String,
    /// Version string.
    pub version: String,
}

impl BuildTarget {
    /// Construct a new build target.
    #[must_use]
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
        }
    }
}

/// Per-file metadata a slave reports in its `BUILT` message, keyed by
/// filename on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuiltFile {
    /// Archive filename.
    pub filename: String,
    /// Size in bytes.
    pub filesize: i64,
    /// SHA-256 hex digest, as computed by the slave-side builder.
    pub filehash: String,
    /// Package-version tag.
    pub package_version_tag: String,
    /// Python-version tag.
    pub py_version_tag: String,
    /// ABI tag.
    pub abi_tag: String,
    /// Platform tag.
    pub platform_tag: String,
}
