//! Error types for persistence operations.

use thiserror::Error;

/// Errors that can occur while reading or writing index generations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// I/O error (file operations, disk I/O)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Format error (invalid magic bytes, version mismatch, truncation)
    #[error("format error: {0}")]
    Format(String),

    /// Serialization error (postcard, serde_json)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Checksum mismatch (data corruption detected)
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid state (e.g. appending to a sealed segment)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Resource not found (generation directory, blob file, pointer)
    #[error("resource not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    /// Corrupt or missing on-disk state, as opposed to an environmental I/O failure.
    pub fn is_structural(&self) -> bool {
        match self {
            PersistenceError::Format(_)
            | PersistenceError::Serialization(_)
            | PersistenceError::ChecksumMismatch { .. }
            | PersistenceError::NotFound(_) => true,
            PersistenceError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
                )
            }
            PersistenceError::InvalidState(_) => false,
        }
    }
}

impl From<postcard::Error> for PersistenceError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(format!("postcard error: {}", e))
    }
}

impl From<durability::PersistenceError> for PersistenceError {
    fn from(e: durability::PersistenceError) -> Self {
        match e {
            durability::PersistenceError::Io(e) => Self::Io(e),
            durability::PersistenceError::Format(s) => Self::Format(s),
            durability::PersistenceError::FormatDetail {
                message,
                expected,
                actual,
            } => {
                let mut s = message;
                if expected.is_some() || actual.is_some() {
                    s.push_str(&format!(" (expected={expected:?}, actual={actual:?})"));
                }
                Self::Format(s)
            }
            durability::PersistenceError::CrcMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            durability::PersistenceError::Encode(s) | durability::PersistenceError::Decode(s) => {
                Self::Serialization(s)
            }
            durability::PersistenceError::InvalidState(s)
            | durability::PersistenceError::InvalidConfig(s)
            | durability::PersistenceError::NotSupported(s) => Self::InvalidState(s),
            durability::PersistenceError::LockFailed { resource, reason } => {
                Self::InvalidState(format!("lock on {resource} failed: {reason}"))
            }
            durability::PersistenceError::NotFound(s) => Self::NotFound(s),
            durability::PersistenceError::MissingPath(p) => {
                Self::NotFound(p.to_string_lossy().to_string())
            }
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(format!("json error: {}", e))
    }
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_structural() {
        let e = PersistenceError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(e.is_structural());
    }

    #[test]
    fn wal_crc_mismatch_is_structural() {
        let e = PersistenceError::from(durability::PersistenceError::CrcMismatch {
            expected: 1,
            actual: 2,
        });
        assert!(matches!(e, PersistenceError::ChecksumMismatch { expected: 1, actual: 2 }));
        assert!(e.is_structural());
    }

    #[test]
    fn permission_denied_is_not_structural() {
        let e =
            PersistenceError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!e.is_structural());
    }
}
