//! Read-side queries over metadata records.

use crate::errors::{VaultError, VaultResult};
use crate::identity::Identity;
use crate::model::MetadataRecord;
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, RecordFilter, RetryingDocuments};

/// Upper bound on records returned by a listing without an explicit limit.
pub const DEFAULT_LIMIT: usize = 500;

pub struct FetchService<'a> {
    docs: RetryingDocuments<'a>,
}

impl<'a> FetchService<'a> {
    pub fn new(docs: &'a dyn DocumentStore, retry: &'a RetryPolicy) -> Self {
        Self {
            docs: RetryingDocuments::new(docs, retry),
        }
    }

    /// The active record of `identity`.
    pub fn active(&self, identity: &Identity) -> VaultResult<MetadataRecord> {
        self.docs.find_active(identity, None)?.ok_or_else(|| {
            VaultError::RecordNotFound(format!("no active record with identity '{}'", identity))
        })
    }

    /// A specific version, active or not.
    pub fn version(&self, identity: &Identity, version: u32) -> VaultResult<MetadataRecord> {
        self.docs.find_version(identity, version, None)?.ok_or_else(|| {
            VaultError::RecordNotFound(format!(
                "no record with identity '{}' and version {}",
                identity, version
            ))
        })
    }

    /// Every version of `identity`, oldest first. Empty history is an error.
    pub fn history(&self, identity: &Identity) -> VaultResult<Vec<MetadataRecord>> {
        let records = self
            .docs
            .find_records(&RecordFilter::new().identity(identity))?;
        if records.is_empty() {
            return Err(VaultError::RecordNotFound(format!(
                "no records with identity '{}'",
                identity
            )));
        }
        Ok(records)
    }

    /// Active records across all identities.
    pub fn list_active(&self, limit: Option<usize>) -> VaultResult<Vec<MetadataRecord>> {
        self.find(RecordFilter::new(), true, limit)
    }

    /// Records matching `filter`, optionally restricted to active ones.
    pub fn find(
        &self,
        filter: RecordFilter,
        active_only: bool,
        limit: Option<usize>,
    ) -> VaultResult<Vec<MetadataRecord>> {
        let limit = limit.or(filter.limit).unwrap_or(DEFAULT_LIMIT);
        let mut filter = filter.limit(limit);
        if active_only {
            filter = filter.active(true);
        }
        self.docs.find_records(&filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Checksums, FileReferences, FileSizes, OriginalFiles};
    use crate::store::{BlobId, MemoryDocumentStore};
    use chrono::Utc;

    fn record(identity: &str, version: u32, active: bool) -> MetadataRecord {
        MetadataRecord {
            id: format!("{}-{}", identity, version),
            identity: Identity::from_existing(identity),
            csi_id: "csi".into(),
            region: "apac".into(),
            regulation: "mas".into(),
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
                json_config_id: format!("cfg-{}-{}", identity, version),
                sql_blob_id: BlobId::new(format!("sql-{}-{}", identity, version)),
                template_blob_id: None,
            },
            checksums: Checksums {
                json_config: "sha256:00".into(),
                sql_file: "sha256:11".into(),
                template: None,
            },
            file_sizes: FileSizes {
                json_config: 2,
                sql_file: 3,
                template: None,
            },
            uploaded_at: Utc::now(),
            audit_log: Vec::new(),
        }
    }

    fn seeded() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::standalone();
        store.insert_raw(record("a", 2, true));
        store.insert_raw(record("a", 1, false));
        store.insert_raw(record("b", 1, true));
        store
    }

    #[test]
    fn test_history_is_ascending() {
        let store = seeded();
        let retry = RetryPolicy::none();
        let fetch = FetchService::new(&store, &retry);

        let versions: Vec<u32> = fetch
            .history(&Identity::from_existing("a"))
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_active_and_missing() {
        let store = seeded();
        let retry = RetryPolicy::none();
        let fetch = FetchService::new(&store, &retry);

        assert_eq!(fetch.active(&Identity::from_existing("a")).unwrap().version, 2);
        let err = fetch.active(&Identity::from_existing("zzz")).unwrap_err();
        assert!(matches!(err, VaultError::RecordNotFound(_)));
        let err = fetch.history(&Identity::from_existing("zzz")).unwrap_err();
        assert!(matches!(err, VaultError::RecordNotFound(_)));
    }

    #[test]
    fn test_list_active_respects_limit() {
        let store = seeded();
        let retry = RetryPolicy::none();
        let fetch = FetchService::new(&store, &retry);

        assert_eq!(fetch.list_active(None).unwrap().len(), 2);
        assert_eq!(fetch.list_active(Some(1)).unwrap().len(), 1);
        assert_eq!(
            fetch.find(RecordFilter::new(), false, None).unwrap().len(),
            3
        );
    }
}
