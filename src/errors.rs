//! Core error taxonomy
//!
//! Every failed core call returns exactly one `VaultError`. Store failures
//! that are not business-level are surfaced as `Database`, which always
//! carries its cause in the `source()` chain.

use thiserror::Error;

use crate::store::StoreError;

/// Result type for core operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Core errors
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed or missing input, detected before any write.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// `create` against an identity that already has an active record.
    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    /// Operation on an absent or inactive identity or version.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Unclassified store failure, retry exhaustion or transaction abort.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Blob-level put/get/delete failure.
    #[error("Blob store error: {message}")]
    BlobStore {
        message: String,
        #[source]
        source: StoreError,
    },

    /// Export-time integrity failure naming every failing part.
    #[error("Checksum verification failed for {}", .parts.join(", "))]
    ChecksumMismatch { parts: Vec<String> },
}

impl VaultError {
    /// Wrap any cause as a `Database` error.
    pub fn database<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        VaultError::Database {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a blob-store failure.
    pub fn blob(message: impl Into<String>, source: StoreError) -> Self {
        VaultError::BlobStore {
            message: message.into(),
            source,
        }
    }

    /// Stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::Validation(_) => "DOCVAULT_VALIDATION",
            VaultError::DuplicateRecord(_) => "DOCVAULT_DUPLICATE_RECORD",
            VaultError::RecordNotFound(_) => "DOCVAULT_RECORD_NOT_FOUND",
            VaultError::Database { .. } => "DOCVAULT_DATABASE",
            VaultError::BlobStore { .. } => "DOCVAULT_BLOB_STORE",
            VaultError::ChecksumMismatch { .. } => "DOCVAULT_CHECKSUM_MISMATCH",
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RetriesExhausted { .. } => VaultError::database("retries exhausted", e),
            other => VaultError::database("store operation failed", other),
        }
    }
}
