//! # Store Errors
//!
//! Failures raised by document and blob stores. The retry policy only
//! retries the transient connectivity variants; everything else propagates
//! on first occurrence.

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Document/blob store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    // Transient connectivity
    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Server selection failed: {0}")]
    ServerSelection(String),

    // Business-level
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Operation '{operation}' failed after {attempts} retries: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    // I/O and encoding
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this failure is a transient connectivity failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::ServerSelection(_)
        )
    }

    /// Whether the target of the operation did not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => StoreError::Timeout(e.to_string()),
            _ => StoreError::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Connection("reset".into()).is_transient());
        assert!(StoreError::Timeout("5s".into()).is_transient());
        assert!(StoreError::ServerSelection("no primary".into()).is_transient());

        assert!(!StoreError::DuplicateKey("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::TransactionConflict("x".into()).is_transient());
        assert!(!StoreError::Io("disk".into()).is_transient());
    }

    #[test]
    fn test_exhausted_keeps_cause() {
        let err = StoreError::RetriesExhausted {
            operation: "blob.put".into(),
            attempts: 3,
            source: Box::new(StoreError::Connection("reset".into())),
        };
        assert!(!err.is_transient());
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("reset"));
        assert!(err.to_string().contains("blob.put"));
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(StoreError::from(io).is_not_found());
    }
}
