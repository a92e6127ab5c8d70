//! Error taxonomy shared by the index, the context tree, and the content store.
//!
//! Every variant carries the operation that failed plus the id, checksum,
//! label, path, or backend involved, so callers can render a useful message
//! without re-deriving context.

use thiserror::Error;

/// A single backend failure inside a multi-backend operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend: String,
    pub message: String,
}

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.backend, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("{operation}: validation failed: {message}")]
    Validation {
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: checksum {algorithm}:{digest} already maps to document {existing_id}, not {requested_id}")]
    ChecksumConflict {
        operation: &'static str,
        algorithm: String,
        digest: String,
        existing_id: u32,
        requested_id: u32,
    },

    #[error("{operation}: {what} not found: {key}")]
    NotFound {
        operation: &'static str,
        what: &'static str,
        key: String,
    },

    #[error("{operation}: capacity exceeded: {message}")]
    CapacityExceeded {
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: backend '{backend}' failed for {key}: {message}")]
    Backend {
        operation: &'static str,
        backend: String,
        key: String,
        message: String,
    },

    #[error("{operation}: backend '{backend}' timed out after {timeout_ms}ms for {key}")]
    Timeout {
        operation: &'static str,
        backend: String,
        key: String,
        timeout_ms: u64,
    },

    #[error("{operation}: layer '{layer}' is locked")]
    LayerLocked {
        operation: &'static str,
        layer: String,
    },

    #[error("{operation}: '{path}' is not empty")]
    NotEmpty {
        operation: &'static str,
        path: String,
    },

    #[error("{operation}: partial failure for {key}: {} succeeded, {} failed ({})", .succeeded.len(), .failures.len(), join_failures(.failures))]
    PartialFailure {
        operation: &'static str,
        key: String,
        succeeded: Vec<String>,
        failures: Vec<BackendFailure>,
    },

    #[error("{operation}: every backend failed for {key} ({})", join_failures(.failures))]
    AllBackendsFailed {
        operation: &'static str,
        key: String,
        failures: Vec<BackendFailure>,
    },

    #[error("{operation}: serialization error: {message}")]
    Serialization {
        operation: &'static str,
        message: String,
    },
}

fn join_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for index, tree, and store operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl IndexError {
    pub fn validation<S: Into<String>>(operation: &'static str, message: S) -> Self {
        Self::Validation {
            operation,
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(operation: &'static str, what: &'static str, key: S) -> Self {
        Self::NotFound {
            operation,
            what,
            key: key.into(),
        }
    }

    pub fn capacity<S: Into<String>>(operation: &'static str, message: S) -> Self {
        Self::CapacityExceeded {
            operation,
            message: message.into(),
        }
    }

    pub fn serialization<S: Into<String>>(operation: &'static str, message: S) -> Self {
        Self::Serialization {
            operation,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Timeout { .. })
    }

    /// Name of the backend involved, when the error came from one.
    pub fn backend_name(&self) -> Option<&str> {
        match self {
            Self::Backend { backend, .. } | Self::Timeout { backend, .. } => Some(backend),
            _ => None,
        }
    }
}
