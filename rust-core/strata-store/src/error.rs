// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types for the Strata store adapter.
//
// Two layers of errors exist. `EngineError` is what an engine client reports:
// a coarse `EngineErrorKind` classification plus the engine's own message.
// `StoreError` is what callers of the adapter see. The adapter only ever
// inspects the kind, never the engine-specific text, and there is no
// `StoreError` counterpart for a uniqueness conflict: that kind is consumed
// by the upsert loop and cannot reach a caller.

use std::fmt;

use thiserror::Error;

/// Result type for store adapter operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced to callers of a [`crate::KeyValueStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transport to the backing engine failed. The adapter has already
    /// replaced its engine client by the time this is returned.
    #[error("connection error: {0}")]
    Connection(String),

    /// Schema bootstrap failed for a reason other than "already exists".
    #[error("schema bootstrap failed: {0}")]
    Schema(String),

    /// The key exceeds the maximum allowed size.
    #[error("key too long: {size} bytes (max: {max})")]
    KeyTooLong {
        /// Actual key size in bytes.
        size: usize,
        /// Maximum allowed key size in bytes.
        max: usize,
    },

    /// A batch failed and was rolled back. Carries the first error.
    #[error("transaction rolled back: {0}")]
    Transaction(String),

    /// The backing engine broke a contract the adapter relies on, e.g. two
    /// rows for one primary key.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A point statement failed inside the engine.
    #[error("statement failed: {0}")]
    Statement(String),

    /// An operation was issued before `init` completed.
    #[error("store is not initialized")]
    NotInitialized,

    /// An operation was issued after `close`.
    #[error("store is closed")]
    Closed,

    /// Configuration could not be loaded or names an engine that is not
    /// compiled in.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to serialize or deserialize a value.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred outside the engine (e.g. reading a config file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for transport-level failures.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    /// Convert an engine error raised by a point operation.
    pub(crate) fn from_statement(err: EngineError) -> Self {
        match err.kind {
            EngineErrorKind::Connection => StoreError::Connection(err.message),
            _ => StoreError::Statement(err.to_string()),
        }
    }

    /// Convert an engine error raised by a bootstrap statement.
    pub(crate) fn from_bootstrap(err: EngineError) -> Self {
        match err.kind {
            EngineErrorKind::Connection => StoreError::Connection(err.message),
            _ => StoreError::Schema(err.to_string()),
        }
    }

    /// Convert the first error raised inside a batch.
    pub(crate) fn from_batch(err: EngineError) -> Self {
        match err.kind {
            EngineErrorKind::Connection => StoreError::Connection(err.message),
            _ => StoreError::Transaction(err.to_string()),
        }
    }
}

/// Coarse classification of engine failures.
///
/// Every engine maps its native error codes onto these kinds so the adapter
/// can make decisions without parsing engine-specific messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// Transport or connection failure.
    Connection,
    /// Insert collided with an existing primary key.
    UniqueViolation,
    /// A bootstrap object (table, routine) already exists.
    AlreadyExists,
    /// The engine does not implement the requested capability.
    Unsupported,
    /// Anything else the engine rejected.
    Statement,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineErrorKind::Connection => "connection",
            EngineErrorKind::UniqueViolation => "unique violation",
            EngineErrorKind::AlreadyExists => "already exists",
            EngineErrorKind::Unsupported => "unsupported",
            EngineErrorKind::Statement => "statement",
        };
        f.write_str(label)
    }
}

/// An error reported by an [`crate::engine::EngineClient`].
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    kind: EngineErrorKind,
    message: String,
}

impl EngineError {
    /// Build an error of the given kind.
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Connection, message)
    }

    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::UniqueViolation, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::AlreadyExists, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Unsupported, message)
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Statement, message)
    }

    /// The classification of this error.
    pub fn kind(&self) -> EngineErrorKind {
        self.kind
    }

    /// The engine's own message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_connection(&self) -> bool {
        self.kind == EngineErrorKind::Connection
    }
}
