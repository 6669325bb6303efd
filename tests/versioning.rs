//! Versioning engine tests
//!
//! Covers:
//! - create / modify state transitions and audit trail
//! - gap-free, strictly increasing versions
//! - compensation of orphans on failed writes (transactional and standalone)
//! - recovery of an identity left without an active version
//! - compare-and-swap deactivate under a concurrent modify

mod support;

use std::sync::Mutex;

use docvault::model::{AuditAction, AuditEntry, ConfigDocument, MetadataRecord};
use docvault::store::{
    BlobNamespace, DocumentStore, MemoryBlobStore, MemoryDocumentStore, RecordFilter, StoreError,
    StoreResult, TransactionScope, TxnHandle,
};
use docvault::{
    FetchService, Identity, PartialBundle, RetryPolicy, StandaloneModify, VaultError,
    VersioningEngine,
};

use support::*;

fn versions(docs: &dyn DocumentStore, identity: &Identity) -> Vec<(u32, bool)> {
    docs.find_records(&RecordFilter::new().identity(identity), None)
        .unwrap()
        .iter()
        .map(|r| (r.version, r.active))
        .collect()
}

// =============================================================================
// create / modify
// =============================================================================

#[test]
fn test_reference_scenario_create_then_modify_sql() {
    let docs = MemoryDocumentStore::transactional();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);

    let identity = engine.create(&reference_bundle()).unwrap();
    assert_eq!(identity.as_str(), REFERENCE_IDENTITY);
    assert_eq!(versions(&docs, &identity), vec![(1, true)]);

    let version = engine.modify(&identity, &sql_only(SQL_V2)).unwrap();
    assert_eq!(version, 2);
    assert_eq!(versions(&docs, &identity), vec![(1, false), (2, true)]);

    let fetch = FetchService::new(&docs, &retry);
    let v1 = fetch.version(&identity, 1).unwrap();
    let v2 = fetch.active(&identity).unwrap();

    // Unchanged parts carry over by reference.
    assert_eq!(v2.checksums.json_config, v1.checksums.json_config);
    assert_eq!(v2.checksums.template, v1.checksums.template);
    assert_eq!(v2.file_references.json_config_id, v1.file_references.json_config_id);
    assert_eq!(v2.file_references.template_blob_id, v1.file_references.template_blob_id);
    assert_ne!(v2.checksums.sql_file, v1.checksums.sql_file);
    assert_eq!(v2.name, "Compliance Report");
    assert_eq!(v2.csi_id, "CSI-100");

    // Audit trail.
    assert_eq!(v1.audit_log[0].action, AuditAction::Created);
    assert_eq!(v1.audit_log[0].details, "Initial seed");
    let superseded = v1.audit_log.last().unwrap();
    assert_eq!(superseded.action, AuditAction::Deactivated);
    assert_eq!(superseded.details, "Superseded by version 2");
    assert_eq!(v2.audit_log[0].action, AuditAction::Modified);
    assert!(v2.audit_log[0].details.contains("sql_file"));
    assert!(v2.audit_log[0].details.contains("v1 → v2"));

    // Only the new sql blob was written.
    assert_eq!(blobs.count(BlobNamespace::Sql), 2);
    assert_eq!(blobs.count(BlobNamespace::Template), 1);
    assert_eq!(docs.config_count(), 1);
    assert_eq!(docs.open_transactions(), 0);
}

#[test]
fn test_create_rejects_active_duplicate() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);

    engine.create(&reference_bundle()).unwrap();
    let err = engine.create(&reference_bundle()).unwrap_err();
    assert!(matches!(err, VaultError::DuplicateRecord(_)), "{}", err);

    // Nothing was written by the rejected call.
    assert_eq!(docs.record_count(), 1);
    assert_eq!(docs.config_count(), 1);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);
}

#[test]
fn test_modify_preconditions() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    let err = engine.modify(&identity, &PartialBundle::default()).unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));

    let err = engine
        .modify(&Identity::from_existing("nope"), &sql_only(SQL_V2))
        .unwrap_err();
    assert!(matches!(err, VaultError::RecordNotFound(_)));

    // A config that resolves to another identity is rejected before writing.
    let renamed = PartialBundle {
        config: Some(config_part(r#"{"name": "Other", "outFileName": "mas_output"}"#)),
        ..PartialBundle::default()
    };
    let err = engine.modify(&identity, &renamed).unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert_eq!(versions(&docs, &identity), vec![(1, true)]);
}

#[test]
fn test_versions_strictly_increase_without_gaps() {
    let docs = MemoryDocumentStore::transactional();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    for i in 0..5 {
        let version = engine
            .modify(&identity, &sql_only(&format!("SELECT {};", i)))
            .unwrap();
        assert_eq!(version, i + 2);
    }

    let all = versions(&docs, &identity);
    let numbers: Vec<u32> = all.iter().map(|(v, _)| *v).collect();
    assert_eq!(numbers, (1..=6).collect::<Vec<_>>());
    assert_eq!(all.iter().filter(|(_, active)| *active).count(), 1);
    assert!(all.last().unwrap().1);
}

#[test]
fn test_modify_can_drop_template() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    let partial = PartialBundle {
        clear_template: true,
        ..PartialBundle::default()
    };
    engine.modify(&identity, &partial).unwrap();

    let active = FetchService::new(&docs, &retry).active(&identity).unwrap();
    assert!(active.file_references.template_blob_id.is_none());
    assert!(active.checksums.template.is_none());
    assert!(active.audit_log[0].details.contains("template (removed)"));

    // Nothing left to remove.
    let err = engine.modify(&identity, &partial).unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)), "{}", err);
    assert_eq!(FetchService::new(&docs, &retry).active(&identity).unwrap().version, 2);
}

// =============================================================================
// Compensation
// =============================================================================

#[test]
fn test_failed_create_leaves_no_orphans() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);

    // The sql upload fails after the config document was written.
    blobs.fail_next("blob.put", StoreError::Io("disk full".into()));
    let docs2 = MemoryDocumentStore::standalone();
    let blobs2 = MemoryBlobStore::new();
    let engine2 = VersioningEngine::new(&docs2, &blobs2, &retry);

    let err = engine.create(&reference_bundle()).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }), "{}", err);
    assert_eq!(docs.config_count(), 0);
    assert_eq!(docs.record_count(), 0);
    assert_eq!(blobs.count(BlobNamespace::Sql), 0);

    docs2.fail_next("metadata.insert", StoreError::Internal("write rejected".into()));
    let err = engine2.create(&reference_bundle()).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }));
    assert_eq!(docs2.config_count(), 0);
    assert_eq!(docs2.record_count(), 0);
    assert_eq!(blobs2.count(BlobNamespace::Sql), 0);
    assert_eq!(blobs2.count(BlobNamespace::Template), 0);

    // The identity is still free.
    engine2.create(&reference_bundle()).unwrap();
}

#[test]
fn test_failed_transactional_modify_restores_prior_state() {
    let docs = MemoryDocumentStore::transactional();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    docs.fail_next("metadata.insert", StoreError::Internal("write rejected".into()));
    let err = engine.modify(&identity, &sql_only(SQL_V2)).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }));

    assert_eq!(versions(&docs, &identity), vec![(1, true)]);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);
    assert_eq!(docs.config_count(), 1);
    assert_eq!(docs.open_transactions(), 0);
}

#[test]
fn test_commit_conflict_surfaces_as_database_error() {
    let docs = MemoryDocumentStore::transactional();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    docs.fail_next(
        "txn.commit",
        StoreError::TransactionConflict("write conflict".into()),
    );
    let err = engine.modify(&identity, &sql_only(SQL_V2)).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }));
    assert_eq!(versions(&docs, &identity), vec![(1, true)]);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);

    // The caller may retry.
    assert_eq!(engine.modify(&identity, &sql_only(SQL_V2)).unwrap(), 2);
}

#[test]
fn test_failed_standalone_modify_compensates_new_parts() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    let partial = PartialBundle {
        config: Some(config_part(CONFIG_SOURCE.replace("balance", "total").as_str())),
        sql: Some(sql_part(SQL_V2)),
        ..PartialBundle::default()
    };
    docs.fail_next("metadata.insert", StoreError::Internal("write rejected".into()));
    let err = engine.modify(&identity, &partial).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }));

    assert_eq!(docs.config_count(), 1);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);
}

#[test]
fn test_failed_part_write_leaves_standalone_version_active() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    blobs.fail_next("blob.put", StoreError::Internal("bucket full".into()));
    engine.modify(&identity, &sql_only(SQL_V2)).unwrap_err();

    // Parts are written before the current version is touched.
    assert_eq!(versions(&docs, &identity), vec![(1, true)]);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);
    assert_eq!(engine.modify(&identity, &sql_only(SQL_V2)).unwrap(), 2);
}

#[test]
fn test_seed_after_failed_standalone_insert_continues_numbering() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    docs.fail_next("metadata.insert", StoreError::Connection("reset".into()));
    engine.modify(&identity, &sql_only(SQL_V2)).unwrap_err();
    assert_eq!(versions(&docs, &identity), vec![(1, false)]);
    assert!(matches!(
        engine.modify(&identity, &sql_only(SQL_V2)),
        Err(VaultError::RecordNotFound(_))
    ));

    // Re-seeding restores an active version without reusing version 1.
    assert_eq!(
        engine.seed_one(&reference_bundle()).unwrap(),
        docvault::SeedOutcome::Created
    );
    assert_eq!(versions(&docs, &identity), vec![(1, false), (2, true)]);

    let fetch = FetchService::new(&docs, &retry);
    let v2 = fetch.active(&identity).unwrap();
    assert_eq!(v2.audit_log[0].action, AuditAction::Created);
    assert!(v2.audit_log[0].details.contains("after version 1"));

    assert_eq!(engine.modify(&identity, &sql_only(SQL_V2)).unwrap(), 3);
    assert_eq!(
        versions(&docs, &identity),
        vec![(1, false), (2, false), (3, true)]
    );
}

#[test]
fn test_refuse_mode_rejects_standalone_modify() {
    let docs = MemoryDocumentStore::standalone();
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine =
        VersioningEngine::new(&docs, &blobs, &retry).with_standalone_modify(StandaloneModify::Refuse);
    let identity = engine.create(&reference_bundle()).unwrap();

    let err = engine.modify(&identity, &sql_only(SQL_V2)).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }));
    assert_eq!(versions(&docs, &identity), vec![(1, true)]);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);
}

// =============================================================================
// Concurrent standalone modify
// =============================================================================

type Hook = Box<dyn FnOnce(&MemoryDocumentStore, &str, u32) + Send>;

/// Standalone store that lets a competing writer win right before the
/// first deactivate call.
struct RacingStore {
    inner: MemoryDocumentStore,
    hook: Mutex<Option<Hook>>,
}

impl DocumentStore for RacingStore {
    fn supports_transactions(&self) -> bool {
        false
    }
    fn begin(&self) -> StoreResult<TransactionScope> {
        Ok(TransactionScope::Unsupported)
    }
    fn commit(&self, txn: TxnHandle) -> StoreResult<()> {
        self.inner.commit(txn)
    }
    fn abort(&self, txn: TxnHandle) -> StoreResult<()> {
        self.inner.abort(txn)
    }
    fn find_active(
        &self,
        identity: &Identity,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>> {
        self.inner.find_active(identity, scope)
    }
    fn find_version(
        &self,
        identity: &Identity,
        version: u32,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>> {
        self.inner.find_version(identity, version, scope)
    }
    fn find_records(
        &self,
        filter: &RecordFilter,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Vec<MetadataRecord>> {
        self.inner.find_records(filter, scope)
    }
    fn distinct_identities(&self) -> StoreResult<Vec<Identity>> {
        self.inner.distinct_identities()
    }
    fn insert_record(&self, record: &MetadataRecord, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.inner.insert_record(record, scope)
    }
    fn deactivate_record(
        &self,
        record_id: &str,
        expected_version: u32,
        entry: &AuditEntry,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<bool> {
        if let Some(hook) = self.hook.lock().unwrap().take() {
            hook(&self.inner, record_id, expected_version);
        }
        self.inner
            .deactivate_record(record_id, expected_version, entry, scope)
    }
    fn delete_record(&self, record_id: &str, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.inner.delete_record(record_id, scope)
    }
    fn insert_config(&self, doc: &ConfigDocument, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.inner.insert_config(doc, scope)
    }
    fn get_config(
        &self,
        id: &str,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<ConfigDocument>> {
        self.inner.get_config(id, scope)
    }
    fn delete_config(&self, id: &str, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.inner.delete_config(id, scope)
    }
}

#[test]
fn test_concurrent_standalone_modify_cannot_both_succeed() {
    let docs = RacingStore {
        inner: MemoryDocumentStore::standalone(),
        hook: Mutex::new(None),
    };
    let blobs = MemoryBlobStore::new();
    let retry = RetryPolicy::none();
    let engine = VersioningEngine::new(&docs, &blobs, &retry);
    let identity = engine.create(&reference_bundle()).unwrap();

    // The competitor supersedes version 1 between our read and our deactivate.
    *docs.hook.lock().unwrap() = Some(Box::new(
        |store: &MemoryDocumentStore, record_id: &str, version: u32| {
        let entry = AuditEntry::now(AuditAction::Deactivated, "Superseded by version 2");
        assert!(store.deactivate_record(record_id, version, &entry, None).unwrap());
        let mut winner = store
            .find_version(&Identity::from_existing(REFERENCE_IDENTITY), version, None)
            .unwrap()
            .unwrap();
        winner.id = "competitor-v2".to_string();
        winner.version = version + 1;
        winner.active = true;
        store.insert_record(&winner, None).unwrap();
        },
    ));

    let err = engine.modify(&identity, &sql_only(SQL_V2)).unwrap_err();
    assert!(matches!(err, VaultError::Database { .. }), "{}", err);
    let cause = std::error::Error::source(&err).unwrap();
    assert!(cause.to_string().contains("concurrent modification"), "{}", cause);

    // Exactly one active record: the competitor's. Our sql blob was compensated.
    assert_eq!(versions(&docs, &identity), vec![(1, false), (2, true)]);
    assert_eq!(blobs.count(BlobNamespace::Sql), 1);
}
