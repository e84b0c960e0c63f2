//! Error types for leann.

use std::time::Duration;

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Errors that can occur while building, querying, or maintaining an index.
#[derive(Debug, Error)]
pub enum LeannError {
    /// Invalid configuration value. Raised at load time, never defaulted.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The in-progress build failed. The active generation is untouched.
    #[error("build failed: {0}")]
    Build(String),

    /// Malformed or unsatisfiable query request.
    #[error("query failed: {0}")]
    Query(String),

    /// Vector dimension does not match the index.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// No generation is active, or the active one holds no anchors.
    #[error("index is empty")]
    EmptyIndex,

    /// A collaborator call or query exceeded its deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// A collaborator (embedding or rerank service) could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage failure.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Coarse classification used by validation tooling to pick an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network-ish failures that may succeed on retry.
    Transient,
    /// Corrupt or missing on-disk state.
    Structural,
    /// Caller supplied something invalid.
    Invalid,
    /// Everything else that aborted an operation.
    Fatal,
}

impl LeannError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    pub(crate) fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Classify this error for exit-status purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            LeannError::Timeout { .. } | LeannError::Unavailable(_) => ErrorClass::Transient,
            LeannError::Persistence(e) if e.is_structural() => ErrorClass::Structural,
            LeannError::Configuration(_)
            | LeannError::Query(_)
            | LeannError::DimensionMismatch { .. } => ErrorClass::Invalid,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, LeannError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let e = LeannError::Timeout {
            operation: "embed",
            elapsed: Duration::from_millis(10),
        };
        assert_eq!(e.class(), ErrorClass::Transient);
        assert!(e.is_retryable());
    }

    #[test]
    fn checksum_mismatch_is_structural() {
        let e = LeannError::from(PersistenceError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        });
        assert_eq!(e.class(), ErrorClass::Structural);
        assert!(!e.is_retryable());
    }

    #[test]
    fn display_mentions_dimensions() {
        let e = LeannError::DimensionMismatch {
            expected: 128,
            actual: 64,
        };
        assert_eq!(e.to_string(), "dimension mismatch: expected 128, got 64");
    }
}
