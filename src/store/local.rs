//! # Local Filesystem Stores
//!
//! Layout under the data directory:
//!
//! ```text
//! LOCK
//! metadata/<record-id>.json
//! configs/<config-id>.json
//! blobs/sqlfiles/<blob-id>.bin   + <blob-id>.meta.json
//! blobs/templates/<blob-id>.bin  + <blob-id>.meta.json
//! ```
//!
//! Standalone topology: no transactions. Writes go to a temp file that is
//! fsynced, renamed into place, and followed by an fsync of the directory.
//! Metadata inserts and deactivates hold an exclusive `fs2` lock on `LOCK`,
//! so the unique active index and the deactivate compare-and-swap hold
//! across every process sharing the data directory.
//!
//! A record file that cannot be read or parsed is logged and skipped; it
//! never hides the rest of the store.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::blob::{BlobId, BlobMetadata, BlobNamespace, BlobStore, StoredBlob};
use super::document::{DocumentStore, RecordFilter, TransactionScope, TxnHandle};
use super::errors::{StoreError, StoreResult};
use crate::identity::Identity;
use crate::model::{AuditEntry, ConfigDocument, MetadataRecord};
use crate::observability::Logger;

fn fsync_dir(dir: &Path) -> StoreResult<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()?;
    Ok(())
}

/// Write `data` to a temp file, fsync it, rename it over `path`, then fsync
/// the directory so the rename survives a crash.
fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Internal(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    fsync_dir(parent)
}

fn remove_if_present(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reject ids that would escape their directory.
fn check_id(id: &str) -> StoreResult<()> {
    if id.is_empty() || id.contains(|c| c == '/' || c == '\\') || id.contains("..") {
        return Err(StoreError::NotFound(format!("invalid id '{}'", id)));
    }
    Ok(())
}

fn no_transactions(scope: Option<&TxnHandle>) -> StoreResult<()> {
    match scope {
        Some(txn) => Err(StoreError::Internal(format!(
            "local store has no transactions (got handle {})",
            txn.id()
        ))),
        None => Ok(()),
    }
}

/// Exclusive lock on `<data dir>/LOCK`, released on drop.
///
/// Every acquisition opens its own handle, so two stores on the same
/// directory exclude each other whether they live in one process or two.
struct WriteLock {
    file: File,
}

impl WriteLock {
    const LOCK_FILE: &'static str = "LOCK";

    fn acquire(root: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(root.join(Self::LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Filesystem-backed document store
#[derive(Debug)]
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("metadata"))?;
        fs::create_dir_all(root.join("configs"))?;
        Ok(Self { root })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join("metadata").join(format!("{}.json", id))
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.root.join("configs").join(format!("{}.json", id))
    }

    fn load_records(&self) -> StoreResult<Vec<MetadataRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join("metadata"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<MetadataRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => Logger::warn(
                    "store.record_unreadable",
                    &[
                        ("path", &path.display().to_string()),
                        ("error", &e.to_string()),
                    ],
                ),
            }
        }
        records.sort_by(|a, b| (&a.identity, a.version).cmp(&(&b.identity, b.version)));
        Ok(records)
    }

    fn save_record(&self, record: &MetadataRecord) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(&record.id), &bytes)
    }
}

impl DocumentStore for LocalDocumentStore {
    fn supports_transactions(&self) -> bool {
        false
    }

    fn begin(&self) -> StoreResult<TransactionScope> {
        Ok(TransactionScope::Unsupported)
    }

    fn commit(&self, txn: TxnHandle) -> StoreResult<()> {
        no_transactions(Some(&txn))
    }

    fn abort(&self, txn: TxnHandle) -> StoreResult<()> {
        no_transactions(Some(&txn))
    }

    fn find_active(
        &self,
        identity: &Identity,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>> {
        no_transactions(scope)?;
        Ok(self
            .load_records()?
            .into_iter()
            .find(|r| &r.identity == identity && r.active))
    }

    fn find_version(
        &self,
        identity: &Identity,
        version: u32,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>> {
        no_transactions(scope)?;
        Ok(self
            .load_records()?
            .into_iter()
            .find(|r| &r.identity == identity && r.version == version))
    }

    fn find_records(
        &self,
        filter: &RecordFilter,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Vec<MetadataRecord>> {
        no_transactions(scope)?;
        let mut found: Vec<_> = self
            .load_records()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn distinct_identities(&self) -> StoreResult<Vec<Identity>> {
        Ok(self
            .load_records()?
            .into_iter()
            .map(|r| r.identity)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    fn insert_record(&self, record: &MetadataRecord, scope: Option<&TxnHandle>) -> StoreResult<()> {
        no_transactions(scope)?;
        check_id(&record.id)?;
        let _lock = WriteLock::acquire(&self.root)?;

        if self.record_path(&record.id).exists() {
            return Err(StoreError::DuplicateKey(format!("record id {}", record.id)));
        }
        if record.active
            && self
                .load_records()?
                .iter()
                .any(|r| r.identity == record.identity && r.active)
        {
            return Err(StoreError::DuplicateKey(format!(
                "active record already exists for identity '{}'",
                record.identity
            )));
        }
        self.save_record(record)
    }

    fn deactivate_record(
        &self,
        record_id: &str,
        expected_version: u32,
        entry: &AuditEntry,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<bool> {
        no_transactions(scope)?;
        check_id(record_id)?;
        let _lock = WriteLock::acquire(&self.root)?;

        match read_json::<MetadataRecord>(&self.record_path(record_id))? {
            Some(mut record) if record.active && record.version == expected_version => {
                record.active = false;
                record.audit_log.push(entry.clone());
                self.save_record(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_record(&self, record_id: &str, scope: Option<&TxnHandle>) -> StoreResult<()> {
        no_transactions(scope)?;
        check_id(record_id)?;
        remove_if_present(&self.record_path(record_id))
    }

    fn insert_config(&self, doc: &ConfigDocument, scope: Option<&TxnHandle>) -> StoreResult<()> {
        no_transactions(scope)?;
        check_id(&doc.id)?;
        let path = self.config_path(&doc.id);
        if path.exists() {
            return Err(StoreError::DuplicateKey(format!("config id {}", doc.id)));
        }
        write_atomic(&path, &serde_json::to_vec_pretty(doc)?)
    }

    fn get_config(
        &self,
        id: &str,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<ConfigDocument>> {
        no_transactions(scope)?;
        check_id(id)?;
        read_json(&self.config_path(id))
    }

    fn delete_config(&self, id: &str, scope: Option<&TxnHandle>) -> StoreResult<()> {
        no_transactions(scope)?;
        check_id(id)?;
        remove_if_present(&self.config_path(id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobSidecar {
    metadata: BlobMetadata,
    uploaded_at: DateTime<Utc>,
}

/// Filesystem-backed blob store
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().join("blobs");
        for ns in [BlobNamespace::Sql, BlobNamespace::Template] {
            fs::create_dir_all(root.join(ns.as_str()))?;
        }
        Ok(Self { root })
    }

    fn data_path(&self, namespace: BlobNamespace, id: &BlobId) -> PathBuf {
        self.root
            .join(namespace.as_str())
            .join(format!("{}.bin", id))
    }

    fn sidecar_path(&self, namespace: BlobNamespace, id: &BlobId) -> PathBuf {
        self.root
            .join(namespace.as_str())
            .join(format!("{}.meta.json", id))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(
        &self,
        namespace: BlobNamespace,
        data: &[u8],
        metadata: &BlobMetadata,
    ) -> StoreResult<BlobId> {
        let id = BlobId::new(Uuid::new_v4().to_string());
        let sidecar = BlobSidecar {
            metadata: metadata.clone(),
            uploaded_at: Utc::now(),
        };
        write_atomic(&self.data_path(namespace, &id), data)?;
        if let Err(e) = write_atomic(
            &self.sidecar_path(namespace, &id),
            &serde_json::to_vec_pretty(&sidecar)?,
        ) {
            let _ = remove_if_present(&self.data_path(namespace, &id));
            return Err(e);
        }
        Ok(id)
    }

    fn get(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<StoredBlob> {
        check_id(id.as_str())?;
        let sidecar: BlobSidecar = read_json(&self.sidecar_path(namespace, id))?
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", namespace, id)))?;
        let data = fs::read(self.data_path(namespace, id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("{}/{}", namespace, id))
            } else {
                StoreError::Io(e.to_string())
            }
        })?;
        Ok(StoredBlob {
            id: id.clone(),
            data,
            metadata: sidecar.metadata,
            uploaded_at: sidecar.uploaded_at,
        })
    }

    fn delete(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<()> {
        check_id(id.as_str())?;
        remove_if_present(&self.data_path(namespace, id))?;
        remove_if_present(&self.sidecar_path(namespace, id))
    }

    fn exists(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<bool> {
        check_id(id.as_str())?;
        Ok(self.data_path(namespace, id).exists() && self.sidecar_path(namespace, id).exists())
    }
}
