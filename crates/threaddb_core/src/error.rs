//! Error types for threaddb core.

use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// A single failed schema constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// JSON pointer to the offending value (`""` for the root).
    pub path: String,
    /// The schema keyword that failed, e.g. `required` or `minimum`.
    pub keyword: String,
    /// Human readable description.
    pub message: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {} ({})", self.message, self.keyword)
    }
}

/// Formats a list of validation failures for display.
fn join_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by the replication collaborator.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The remote service could not be reached or failed transiently.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The requested thread does not exist.
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// The identity was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The service rejected the request.
    #[error("service error: {0}")]
    Service(String),
}

impl NetworkError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Transport { retryable, .. } => *retryable,
            NetworkError::Service(_) => true,
            _ => false,
        }
    }
}

/// Errors that can occur in threaddb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Datastore error.
    #[error("storage error: {0}")]
    Storage(#[from] threaddb_storage::StorageError),

    /// CBOR or JSON codec error.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// Replication collaborator error.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// An instance does not conform to its collection's schema.
    #[error("validation failed in collection {collection}: {}", join_failures(.failures))]
    Validation {
        /// The collection whose schema was violated.
        collection: String,
        /// Every failing constraint.
        failures: Vec<ValidationFailure>,
    },

    /// An insert targeted an id that already exists.
    #[error("existing key: {id} in collection {collection}")]
    ExistingKey {
        /// The collection.
        collection: String,
        /// The conflicting instance id.
        id: String,
    },

    /// An instance was not found.
    #[error("instance not found: {id} in collection {collection}")]
    NotFound {
        /// The collection searched.
        collection: String,
        /// The missing instance id.
        id: String,
    },

    /// A named lock could not be acquired in time.
    #[error("acquire lock timeout: {lock} after {timeout_ms}ms")]
    LockTimeout {
        /// Name of the lock.
        lock: String,
        /// The timeout that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// A thread id conflicts with the one persisted locally.
    #[error("thread mismatch: persisted {persisted}, requested {requested}")]
    ThreadMismatch {
        /// The thread id already stored.
        persisted: String,
        /// The thread id that was asked for.
        requested: String,
    },

    /// A collection with that name is already live.
    #[error("duplicate collection: {name}")]
    DuplicateCollection {
        /// Name of the collection.
        name: String,
    },

    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the collection.
        name: String,
    },

    /// A component was used before `open`.
    #[error("{component} is not open")]
    NotOpen {
        /// The component that was not open.
        component: &'static str,
    },

    /// The database has no active thread.
    #[error("database not started")]
    NotStarted,

    /// No usable identity was supplied.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Description of the failure.
        message: String,
    },

    /// A query document could not be parsed.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// Description of the problem.
        message: String,
    },

    /// A schema document could not be compiled.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// A patch could not be applied.
    #[error("invalid patch: {message}")]
    InvalidPatch {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a not-open error for `component`.
    pub fn not_open(component: &'static str) -> Self {
        Self::NotOpen { component }
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates an invalid patch error.
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a thread mismatch error.
    pub fn thread_mismatch(persisted: impl ToString, requested: impl ToString) -> Self {
        Self::ThreadMismatch {
            persisted: persisted.to_string(),
            requested: requested.to_string(),
        }
    }

    /// Returns true if this error came from a retryable network failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Network(e) if e.is_retryable())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::codec(e.to_string())
    }
}
