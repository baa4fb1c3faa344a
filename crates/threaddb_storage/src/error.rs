//! Error types for datastore operations.

use std::io;
use thiserror::Error;

/// Result type for datastore operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during datastore operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The datastore file is corrupted.
    #[error("datastore corrupted: {0}")]
    Corrupted(String),

    /// The datastore has not been opened, or has been closed.
    #[error("datastore is not open")]
    NotOpen,

    /// A key was malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
