//! # Blob Store
//!
//! Opaque binary content (sql files, templates) stored by generated id in one
//! of two namespaces. Blobs are immutable once written.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{StoreError, StoreResult};
use crate::errors::{VaultError, VaultResult};
use crate::retry::RetryPolicy;

/// Generated blob identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(value: impl Into<String>) -> Self {
        BlobId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blob namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobNamespace {
    Sql,
    Template,
}

impl BlobNamespace {
    /// Directory / bucket name of the namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobNamespace::Sql => "sqlfiles",
            BlobNamespace::Template => "templates",
        }
    }
}

impl fmt::Display for BlobNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata stored alongside blob content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub original_filename: String,
    pub content_type: String,
    pub checksum: String,
    pub identity: String,
    pub version: u32,
}

/// A blob as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    pub id: BlobId,
    pub data: Vec<u8>,
    pub metadata: BlobMetadata,
    pub uploaded_at: DateTime<Utc>,
}

/// Backend trait for blob storage
pub trait BlobStore: Send + Sync {
    /// Store `data` and return its generated id.
    fn put(&self, namespace: BlobNamespace, data: &[u8], metadata: &BlobMetadata)
        -> StoreResult<BlobId>;

    /// Read a blob. `StoreError::NotFound` if absent.
    fn get(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<StoredBlob>;

    /// Delete a blob. Deleting an absent blob succeeds.
    fn delete(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<()>;

    /// Check if a blob exists
    fn exists(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<bool>;
}

/// Blob store access with every call routed through a retry policy.
///
/// Retry exhaustion surfaces as `VaultError::Database`; every other store
/// failure as `VaultError::BlobStore`.
#[derive(Clone, Copy)]
pub struct RetryingBlobs<'a> {
    inner: &'a dyn BlobStore,
    retry: &'a RetryPolicy,
}

impl<'a> RetryingBlobs<'a> {
    pub fn new(inner: &'a dyn BlobStore, retry: &'a RetryPolicy) -> Self {
        Self { inner, retry }
    }

    pub fn inner(&self) -> &'a dyn BlobStore {
        self.inner
    }

    pub fn put(
        &self,
        namespace: BlobNamespace,
        data: &[u8],
        metadata: &BlobMetadata,
    ) -> VaultResult<BlobId> {
        self.retry
            .run("blob.put", || self.inner.put(namespace, data, metadata))
            .map_err(|e| {
                blob_failure(
                    format!("failed to upload '{}' to {}", metadata.original_filename, namespace),
                    e,
                )
            })
    }

    pub fn get(&self, namespace: BlobNamespace, id: &BlobId) -> VaultResult<StoredBlob> {
        self.retry
            .run("blob.get", || self.inner.get(namespace, id))
            .map_err(|e| blob_failure(format!("failed to download {}/{}", namespace, id), e))
    }

    pub fn delete(&self, namespace: BlobNamespace, id: &BlobId) -> VaultResult<()> {
        self.retry
            .run("blob.delete", || self.inner.delete(namespace, id))
            .map_err(|e| blob_failure(format!("failed to delete {}/{}", namespace, id), e))
    }

    pub fn exists(&self, namespace: BlobNamespace, id: &BlobId) -> VaultResult<bool> {
        self.retry
            .run("blob.exists", || self.inner.exists(namespace, id))
            .map_err(|e| blob_failure(format!("failed to stat {}/{}", namespace, id), e))
    }
}

fn blob_failure(message: String, e: StoreError) -> VaultError {
    match e {
        StoreError::RetriesExhausted { .. } => VaultError::database(message, e),
        other => VaultError::blob(message, other),
    }
}
