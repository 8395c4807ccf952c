// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! armfarm-error
//!
//! Every armfarm error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Every code falls into one of five broad
//! [`ErrorCategory`] kinds: `Protocol`, `Storage`, `Integrity`, `Timeout`,
//! `Fatal`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown verb, wrong arity, or a message received in the wrong state.
    Protocol,
    /// A SQL statement failed; the owning transaction was rolled back.
    Storage,
    /// A hash mismatch or a missing field when rendering a template.
    Integrity,
    /// A peer went silent beyond its allotted bound.
    Timeout,
    /// An unjoinable worker or a bind failure; the process must exit.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Storage => "storage",
            Self::Integrity => "integrity",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Protocol --
    /// An unrecognised verb was received on a mesh queue.
    ProtocolUnknownVerb,
    /// A verb's argument list did not match its expected arity.
    ProtocolWrongArity,
    /// A message arrived while its sender was in the wrong state.
    ProtocolWrongState,

    // -- Storage --
    /// A SQL statement failed and its transaction was rolled back.
    StorageQueryFailed,
    /// The oracle's connection pool could not provide a connection.
    StoragePoolExhausted,

    // -- Integrity --
    /// A transferred file's SHA-256 did not match the declared hash.
    IntegrityHashMismatch,
    /// A required template field was missing when rendering an index page.
    IntegrityMissingField,
    /// A value could not be serialised to JSON (e.g. `packages.json`).
    IntegrityNotSerializable,

    // -- Timeout --
    /// A slave was silent beyond its idle or building timeout and was reaped.
    TimeoutSlaveReaped,
    /// A file-upload peer was silent beyond the chunk wait bound.
    TimeoutChunkWait,

    // -- Fatal --
    /// A background task could not be joined within its shutdown bound.
    FatalUnjoinableWorker,
    /// A transport failed to bind its configured address.
    FatalBindFailed,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ProtocolUnknownVerb | Self::ProtocolWrongArity | Self::ProtocolWrongState => {
                ErrorCategory::Protocol
            }
            Self::StorageQueryFailed | Self::StoragePoolExhausted => ErrorCategory::Storage,
            Self::IntegrityHashMismatch
            | Self::IntegrityMissingField
            | Self::IntegrityNotSerializable => ErrorCategory::Integrity,
            Self::TimeoutSlaveReaped | Self::TimeoutChunkWait => ErrorCategory::Timeout,
            Self::FatalUnjoinableWorker | Self::FatalBindFailed => ErrorCategory::Fatal,
        }
    }

    /// Stable `&'static str` representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolUnknownVerb => "PROTOCOL_UNKNOWN_VERB",
            Self::ProtocolWrongArity => "PROTOCOL_WRONG_ARITY",
            Self::ProtocolWrongState => "PROTOCOL_WRONG_STATE",
            Self::StorageQueryFailed => "STORAGE_QUERY_FAILED",
            Self::StoragePoolExhausted => "STORAGE_POOL_EXHAUSTED",
            Self::IntegrityHashMismatch => "INTEGRITY_HASH_MISMATCH",
            Self::IntegrityMissingField => "INTEGRITY_MISSING_FIELD",
            Self::IntegrityNotSerializable => "INTEGRITY_NOT_SERIALIZABLE",
            Self::TimeoutSlaveReaped => "TIMEOUT_SLAVE_REAPED",
            Self::TimeoutChunkWait => "TIMEOUT_CHUNK_WAIT",
            Self::FatalUnjoinableWorker => "FATAL_UNJOINABLE_WORKER",
            Self::FatalBindFailed => "FATAL_BIND_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ArmfarmError
// ---------------------------------------------------------------------------

/// Unified armfarm error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use armfarm_error::{ArmfarmError, ErrorCode};
///
/// let err = ArmfarmError::new(ErrorCode::TimeoutSlaveReaped, "no request in 600s")
///     .with_context("slave_id", 7);
/// assert_eq!(err.code, ErrorCode::TimeoutSlaveReaped);
/// ```
pub struct ArmfarmError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ArmfarmError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for ArmfarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ArmfarmError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for ArmfarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ArmfarmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
