//! Error types for the ctxmem core library.

use std::fmt;

use thiserror::Error;

use crate::types::{MemoryId, SessionId};

/// Stable, machine-readable classification of a [`CtxMemError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A session, record, or backend is absent.
    NotFound,
    /// A backend was initialized twice.
    AlreadyInitialized,
    /// A backend was used before `initialize` or after `close`.
    NotInitialized,
    /// A backend operation failed.
    StorageFailure,
    /// Malformed query, record, or configuration.
    ValidationFailure,
}

impl ErrorKind {
    /// The wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyInitialized => "already_initialized",
            Self::NotInitialized => "not_initialized",
            Self::StorageFailure => "storage_failure",
            Self::ValidationFailure => "validation_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for all ctxmem operations.
#[derive(Error, Debug)]
pub enum CtxMemError {
    /// The session id is unknown to the session manager.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// No backend holds a memory with the given id.
    #[error("Memory not found: {0}")]
    MemoryNotFound(MemoryId),

    /// No backend is registered under the given name.
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// `initialize` was called on a backend that is already running.
    #[error("Backend already initialized: {0}")]
    AlreadyInitialized(String),

    /// The backend has not been initialized, or has been closed.
    #[error("Backend not initialized: {0}")]
    NotInitialized(String),

    /// A backend operation failed during a (possibly multi-backend) call.
    ///
    /// `succeeded` lists the backends that completed the operation before
    /// the failure. Those writes are not rolled back.
    #[error("Storage failure in backend '{backend}': {reason} (succeeded: {succeeded:?})")]
    StorageFailure {
        /// Backend that failed.
        backend: String,
        /// Backends that completed before the failure.
        succeeded: Vec<String>,
        /// Underlying failure description.
        reason: String,
    },

    /// A record, query, or patch carried invalid field values.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite backend error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CtxMemError {
    /// The stable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) | Self::MemoryNotFound(_) | Self::BackendNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::Validation(_) | Self::Config(_) => ErrorKind::ValidationFailure,
            Self::StorageFailure { .. }
            | Self::Serialization(_)
            | Self::Database(_)
            | Self::Io(_) => ErrorKind::StorageFailure,
        }
    }

    /// Wrap a single-backend error as a fan-out [`CtxMemError::StorageFailure`].
    ///
    /// Lookup errors (`MemoryNotFound`) and lifecycle errors keep their own
    /// variant when nothing succeeded, so callers still see the precise kind.
    #[must_use]
    pub fn into_fan_out(self, backend: &str, succeeded: Vec<String>) -> Self {
        if succeeded.is_empty() && !matches!(self.kind(), ErrorKind::StorageFailure) {
            return self;
        }
        match self {
            Self::StorageFailure { reason, .. } => Self::StorageFailure {
                backend: backend.to_string(),
                succeeded,
                reason,
            },
            other => Self::StorageFailure {
                backend: backend.to_string(),
                succeeded,
                reason: other.to_string(),
            },
        }
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, CtxMemError>;
