//! Orphan compensation for multi-step writes
//!
//! A write that creates a config document and blobs before inserting the
//! metadata record registers each created resource here. On success the
//! list is cleared; on failure every entry is deleted in registration order.
//! A failed deletion is logged and the remaining entries are still processed.

use crate::errors::VaultResult;
use crate::observability::Logger;
use crate::store::{BlobId, BlobNamespace, RetryingBlobs, RetryingDocuments};

/// Capability to delete one kind of resource by id.
pub trait OrphanDeleter {
    /// Short resource kind used in log events (`config`, `sqlfiles`, ...).
    fn kind(&self) -> &'static str;

    fn delete_orphan(&self, id: &str) -> VaultResult<()>;
}

/// Deletes config documents.
pub struct ConfigDeleter<'a> {
    docs: RetryingDocuments<'a>,
}

impl<'a> ConfigDeleter<'a> {
    pub fn new(docs: RetryingDocuments<'a>) -> Self {
        Self { docs }
    }
}

impl OrphanDeleter for ConfigDeleter<'_> {
    fn kind(&self) -> &'static str {
        "config"
    }

    fn delete_orphan(&self, id: &str) -> VaultResult<()> {
        self.docs.delete_config(id)
    }
}

/// Deletes blobs of one namespace.
pub struct BlobDeleter<'a> {
    blobs: RetryingBlobs<'a>,
    namespace: BlobNamespace,
}

impl<'a> BlobDeleter<'a> {
    pub fn new(blobs: RetryingBlobs<'a>, namespace: BlobNamespace) -> Self {
        Self { blobs, namespace }
    }
}

impl OrphanDeleter for BlobDeleter<'_> {
    fn kind(&self) -> &'static str {
        self.namespace.as_str()
    }

    fn delete_orphan(&self, id: &str) -> VaultResult<()> {
        self.blobs.delete(self.namespace, &BlobId::new(id))
    }
}

/// Pending-orphan registry of one multi-step write.
#[derive(Default)]
pub struct OrphanCompensator<'a> {
    pending: Vec<(Box<dyn OrphanDeleter + 'a>, String)>,
}

impl<'a> OrphanCompensator<'a> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Register a newly created resource.
    pub fn register(&mut self, deleter: Box<dyn OrphanDeleter + 'a>, id: impl Into<String>) {
        self.pending.push((deleter, id.into()));
    }

    pub fn register_config(&mut self, docs: RetryingDocuments<'a>, id: &str) {
        self.register(Box::new(ConfigDeleter::new(docs)), id);
    }

    pub fn register_blob(&mut self, blobs: RetryingBlobs<'a>, namespace: BlobNamespace, id: &BlobId) {
        self.register(Box::new(BlobDeleter::new(blobs, namespace)), id.as_str());
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Delete every registered resource. Returns how many were deleted.
    pub fn cleanup(&mut self) -> usize {
        let mut cleaned = 0;
        for (deleter, id) in self.pending.drain(..) {
            match deleter.delete_orphan(&id) {
                Ok(()) => {
                    Logger::info(
                        "compensator.orphan_cleaned",
                        &[("kind", deleter.kind()), ("id", &id)],
                    );
                    cleaned += 1;
                }
                Err(e) => {
                    Logger::error(
                        "compensator.orphan_cleanup_failed",
                        &[("kind", deleter.kind()), ("id", &id), ("error", &e.to_string())],
                    );
                }
            }
        }
        cleaned
    }

    /// Forget every registered resource without deleting it.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
