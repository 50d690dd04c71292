//! Common error types for VaultSync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for VaultSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No network connection; the operation was deferred.
    #[error("Offline: {0}")]
    Offline(String),

    /// Another sync is already running.
    #[error("Sync already in progress")]
    AlreadyInProgress,

    /// Remote call was rejected or errored.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The isolated key worker crashed or answered with an error.
    #[error("Worker fault: {0}")]
    WorkerFault(String),

    /// Malformed input (empty password, wrong key length, ...).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// An operation exceeded its configured deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category, detached from the message so it can be copied into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Offline,
    AlreadyInProgress,
    Transport,
    WorkerFault,
    Validation,
    Storage,
    Crypto,
    Timeout,
    Serialization,
    Io,
}

impl ErrorKind {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Offline
                | ErrorKind::AlreadyInProgress
                | ErrorKind::Transport
                | ErrorKind::WorkerFault
                | ErrorKind::Timeout
                | ErrorKind::Io
        )
    }
}

impl Error {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Offline(_) => ErrorKind::Offline,
            Error::AlreadyInProgress => ErrorKind::AlreadyInProgress,
            Error::Transport(_) => ErrorKind::Transport,
            Error::WorkerFault(_) => ErrorKind::WorkerFault,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
