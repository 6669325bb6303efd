//! # Document Store
//!
//! Hosts the metadata collection and the config collection.
//!
//! The metadata collection enforces "at most one active record per identity"
//! at insert time. Transactions exist only on topologies that support them:
//! `begin()` returns `TransactionScope::Unsupported` otherwise, and callers
//! fall back to sequential writes with compensation.

use chrono::{DateTime, Utc};

use super::errors::StoreResult;
use crate::errors::VaultResult;
use crate::identity::Identity;
use crate::model::{AuditEntry, ConfigDocument, MetadataRecord};
use crate::retry::RetryPolicy;

/// An open multi-document transaction.
///
/// Not `Clone`: the handle is consumed by exactly one of `commit` or `abort`.
#[derive(Debug, PartialEq, Eq)]
pub struct TxnHandle {
    id: u64,
}

impl TxnHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Result of `DocumentStore::begin`.
#[derive(Debug, PartialEq, Eq)]
pub enum TransactionScope {
    /// Writes passed this handle are applied atomically on commit.
    Transaction(TxnHandle),
    /// The topology has no transactions; writes apply immediately.
    Unsupported,
}

/// Metadata query filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub identity: Option<Identity>,
    pub csi_id: Option<String>,
    pub region: Option<String>,
    pub regulation: Option<String>,
    pub active: Option<bool>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: &Identity) -> Self {
        self.identity = Some(identity.clone());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn uploaded_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.uploaded_before = Some(cutoff);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` satisfies every set field (limit aside).
    pub fn matches(&self, record: &MetadataRecord) -> bool {
        self.identity.as_ref().map_or(true, |i| &record.identity == i)
            && self.csi_id.as_ref().map_or(true, |c| &record.csi_id == c)
            && self.region.as_ref().map_or(true, |r| &record.region == r)
            && self.regulation.as_ref().map_or(true, |r| &record.regulation == r)
            && self.active.map_or(true, |a| record.active == a)
            && self.uploaded_before.map_or(true, |t| record.uploaded_at < t)
    }
}

/// Trait for metadata and config persistence.
///
/// Every read and write accepts an optional transaction handle.
pub trait DocumentStore: Send + Sync {
    /// Whether `begin` can return a real transaction.
    fn supports_transactions(&self) -> bool;

    /// Open a transaction, or report that none is available.
    fn begin(&self) -> StoreResult<TransactionScope>;

    /// Apply every write made under `txn`. Fails with
    /// `StoreError::TransactionConflict` if a concurrent commit interfered.
    fn commit(&self, txn: TxnHandle) -> StoreResult<()>;

    /// Discard every write made under `txn`.
    fn abort(&self, txn: TxnHandle) -> StoreResult<()>;

    /// The active record of an identity, if any.
    fn find_active(
        &self,
        identity: &Identity,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>>;

    /// A specific version of an identity, active or not.
    fn find_version(
        &self,
        identity: &Identity,
        version: u32,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>>;

    /// Records matching `filter`, ordered by identity then ascending version.
    fn find_records(
        &self,
        filter: &RecordFilter,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Vec<MetadataRecord>>;

    /// Every identity with at least one record, sorted.
    fn distinct_identities(&self) -> StoreResult<Vec<Identity>>;

    /// Insert a new record. `StoreError::DuplicateKey` if the record id
    /// exists, or if `record.active` and the identity already has an
    /// active record.
    fn insert_record(&self, record: &MetadataRecord, scope: Option<&TxnHandle>) -> StoreResult<()>;

    /// Flip record `record_id` to inactive and append `entry`, but only if it
    /// is still active at `expected_version`. Returns whether it matched.
    fn deactivate_record(
        &self,
        record_id: &str,
        expected_version: u32,
        entry: &AuditEntry,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<bool>;

    /// Delete a record. Deleting an absent record succeeds.
    fn delete_record(&self, record_id: &str, scope: Option<&TxnHandle>) -> StoreResult<()>;

    /// Insert a config document under its own id.
    fn insert_config(&self, doc: &ConfigDocument, scope: Option<&TxnHandle>) -> StoreResult<()>;

    fn get_config(
        &self,
        id: &str,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<ConfigDocument>>;

    /// Delete a config document. Deleting an absent document succeeds.
    fn delete_config(&self, id: &str, scope: Option<&TxnHandle>) -> StoreResult<()>;
}

/// Document store access with every call routed through a retry policy.
///
/// Transaction control (`begin`/`commit`/`abort`) is not retried:
/// a conflicting commit is surfaced to the caller.
#[derive(Clone, Copy)]
pub struct RetryingDocuments<'a> {
    inner: &'a dyn DocumentStore,
    retry: &'a RetryPolicy,
}

impl<'a> RetryingDocuments<'a> {
    pub fn new(inner: &'a dyn DocumentStore, retry: &'a RetryPolicy) -> Self {
        Self { inner, retry }
    }

    pub fn inner(&self) -> &'a dyn DocumentStore {
        self.inner
    }

    pub fn find_active(
        &self,
        identity: &Identity,
        scope: Option<&TxnHandle>,
    ) -> VaultResult<Option<MetadataRecord>> {
        Ok(self
            .retry
            .run("metadata.find_active", || self.inner.find_active(identity, scope))?)
    }

    pub fn find_version(
        &self,
        identity: &Identity,
        version: u32,
        scope: Option<&TxnHandle>,
    ) -> VaultResult<Option<MetadataRecord>> {
        Ok(self.retry.run("metadata.find_version", || {
            self.inner.find_version(identity, version, scope)
        })?)
    }

    pub fn find_records(&self, filter: &RecordFilter) -> VaultResult<Vec<MetadataRecord>> {
        Ok(self
            .retry
            .run("metadata.find", || self.inner.find_records(filter, None))?)
    }

    pub fn distinct_identities(&self) -> VaultResult<Vec<Identity>> {
        Ok(self
            .retry
            .run("metadata.distinct", || self.inner.distinct_identities())?)
    }

    pub fn insert_record(
        &self,
        record: &MetadataRecord,
        scope: Option<&TxnHandle>,
    ) -> VaultResult<()> {
        Ok(self
            .retry
            .run("metadata.insert", || self.inner.insert_record(record, scope))?)
    }

    pub fn deactivate_record(
        &self,
        record_id: &str,
        expected_version: u32,
        entry: &AuditEntry,
        scope: Option<&TxnHandle>,
    ) -> VaultResult<bool> {
        Ok(self.retry.run("metadata.deactivate", || {
            self.inner
                .deactivate_record(record_id, expected_version, entry, scope)
        })?)
    }

    pub fn delete_record(&self, record_id: &str) -> VaultResult<()> {
        Ok(self
            .retry
            .run("metadata.delete", || self.inner.delete_record(record_id, None))?)
    }

    pub fn insert_config(&self, doc: &ConfigDocument, scope: Option<&TxnHandle>) -> VaultResult<()> {
        Ok(self
            .retry
            .run("config.insert", || self.inner.insert_config(doc, scope))?)
    }

    pub fn get_config(&self, id: &str) -> VaultResult<Option<ConfigDocument>> {
        Ok(self.retry.run("config.get", || self.inner.get_config(id, None))?)
    }

    pub fn delete_config(&self, id: &str) -> VaultResult<()> {
        Ok(self
            .retry
            .run("config.delete", || self.inner.delete_config(id, None))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Checksums, FileReferences, FileSizes, OriginalFiles};
    use crate::store::BlobId;

    fn record(identity: &str, version: u32, active: bool) -> MetadataRecord {
        MetadataRecord {
            id: format!("{}-{}", identity, version),
            identity: Identity::from_existing(identity),
            csi_id: "CSI-1".into(),
            region: "APAC".into(),
            regulation: "MAS".into(),
            name: "n".into(),
            out_file_name: "o".into(),
            version,
            active,
            original_files: OriginalFiles {
                json_config: "c.json".into(),
                sql_file: "q.sql".into(),
                template: None,
            },
            file_references: FileReferences {
                json_config_id: "cfg".into(),
                sql_blob_id: BlobId::new("sql"),
                template_blob_id: None,
            },
            checksums: Checksums {
                json_config: "sha256:a".into(),
                sql_file: "sha256:b".into(),
                template: None,
            },
            file_sizes: FileSizes {
                json_config: 1,
                sql_file: 1,
                template: None,
            },
            uploaded_at: Utc::now(),
            audit_log: Vec::new(),
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(RecordFilter::new().matches(&record("a", 1, true)));
        assert!(RecordFilter::new().matches(&record("b", 2, false)));
    }

    #[test]
    fn test_filter_fields_combine() {
        let filter = RecordFilter::new()
            .identity(&Identity::from_existing("a"))
            .active(false);
        assert!(filter.matches(&record("a", 1, false)));
        assert!(!filter.matches(&record("a", 2, true)));
        assert!(!filter.matches(&record("b", 1, false)));
    }

    #[test]
    fn test_uploaded_before_is_strict() {
        let r = record("a", 1, false);
        assert!(!RecordFilter::new().uploaded_before(r.uploaded_at).matches(&r));
        let later = r.uploaded_at + chrono::Duration::seconds(1);
        assert!(RecordFilter::new().uploaded_before(later).matches(&r));
    }
}
