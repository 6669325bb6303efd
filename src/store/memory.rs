//! # In-Memory Stores
//!
//! Used by tests and embedders. `MemoryDocumentStore` can run as a
//! standalone topology (no transactions) or a transactional one, where each
//! transaction works on a private copy that replaces the committed state on
//! commit, provided nothing else committed in between.
//!
//! Both stores support fault injection: `fail_times(op, n, err)` makes the
//! next `n` calls of operation `op` fail with `err` before touching state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use uuid::Uuid;

use super::blob::{BlobId, BlobMetadata, BlobNamespace, BlobStore, StoredBlob};
use super::document::{DocumentStore, RecordFilter, TransactionScope, TxnHandle};
use super::errors::{StoreError, StoreResult};
use crate::identity::Identity;
use crate::model::{AuditEntry, ConfigDocument, MetadataRecord};

/// Queue of injected failures keyed by operation name.
#[derive(Debug, Default)]
struct Faults {
    pending: Mutex<Vec<(String, StoreError, u32)>>,
}

impl Faults {
    fn push(&self, op: &str, times: u32, error: StoreError) {
        if times == 0 {
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((op.to_string(), error, times));
        }
    }

    fn check(&self, op: &str) -> StoreResult<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
        if let Some(idx) = pending.iter().position(|(name, _, _)| name == op) {
            let error = pending[idx].1.clone();
            pending[idx].2 -= 1;
            if pending[idx].2 == 0 {
                pending.remove(idx);
            }
            return Err(error);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Collections {
    records: BTreeMap<String, MetadataRecord>,
    configs: HashMap<String, ConfigDocument>,
}

#[derive(Debug, Default)]
struct Committed {
    data: Collections,
    revision: u64,
}

#[derive(Debug)]
struct OpenTxn {
    base_revision: u64,
    working: Collections,
}

/// In-memory document store
#[derive(Debug)]
pub struct MemoryDocumentStore {
    transactional: bool,
    committed: RwLock<Committed>,
    txns: Mutex<HashMap<u64, OpenTxn>>,
    next_txn: AtomicU64,
    faults: Faults,
}

impl MemoryDocumentStore {
    /// A store without transaction support.
    pub fn standalone() -> Self {
        Self::with_topology(false)
    }

    /// A store whose `begin` opens real transactions.
    pub fn transactional() -> Self {
        Self::with_topology(true)
    }

    fn with_topology(transactional: bool) -> Self {
        Self {
            transactional,
            committed: RwLock::new(Committed::default()),
            txns: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            faults: Faults::default(),
        }
    }

    /// Make the next `times` calls of `op` fail with `error`.
    ///
    /// Operation names: `metadata.find`, `metadata.insert`,
    /// `metadata.deactivate`, `metadata.delete`, `config.insert`,
    /// `config.get`, `config.delete`, `txn.commit`.
    pub fn fail_times(&self, op: &str, times: u32, error: StoreError) {
        self.faults.push(op, times, error);
    }

    pub fn fail_next(&self, op: &str, error: StoreError) {
        self.fail_times(op, 1, error);
    }

    /// Insert a record directly, bypassing the unique index. Test setup only.
    pub fn insert_raw(&self, record: MetadataRecord) {
        if let Ok(mut committed) = self.committed.write() {
            committed.data.records.insert(record.id.clone(), record);
            committed.revision += 1;
        }
    }

    /// Number of committed config documents.
    pub fn config_count(&self) -> usize {
        self.committed
            .read()
            .map(|c| c.data.configs.len())
            .unwrap_or(0)
    }

    /// Number of committed metadata records.
    pub fn record_count(&self) -> usize {
        self.committed
            .read()
            .map(|c| c.data.records.len())
            .unwrap_or(0)
    }

    /// Number of transactions neither committed nor aborted.
    pub fn open_transactions(&self) -> usize {
        self.txns.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn read<T>(
        &self,
        scope: Option<&TxnHandle>,
        f: impl FnOnce(&Collections) -> T,
    ) -> StoreResult<T> {
        match scope {
            Some(txn) => {
                let txns = self
                    .txns
                    .lock()
                    .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
                let open = txns.get(&txn.id()).ok_or_else(|| unknown_txn(txn))?;
                Ok(f(&open.working))
            }
            None => {
                let committed = self
                    .committed
                    .read()
                    .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
                Ok(f(&committed.data))
            }
        }
    }

    fn write<T>(
        &self,
        scope: Option<&TxnHandle>,
        f: impl FnOnce(&mut Collections) -> StoreResult<T>,
    ) -> StoreResult<T> {
        match scope {
            Some(txn) => {
                let mut txns = self
                    .txns
                    .lock()
                    .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
                let open = txns.get_mut(&txn.id()).ok_or_else(|| unknown_txn(txn))?;
                f(&mut open.working)
            }
            None => {
                let mut committed = self
                    .committed
                    .write()
                    .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
                let out = f(&mut committed.data)?;
                committed.revision += 1;
                Ok(out)
            }
        }
    }
}

fn unknown_txn(txn: &TxnHandle) -> StoreError {
    StoreError::Internal(format!("unknown transaction {}", txn.id()))
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::standalone()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn begin(&self) -> StoreResult<TransactionScope> {
        if !self.transactional {
            return Ok(TransactionScope::Unsupported);
        }
        let committed = self
            .committed
            .read()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        let open = OpenTxn {
            base_revision: committed.revision,
            working: committed.data.clone(),
        };
        self.txns
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .insert(id, open);
        Ok(TransactionScope::Transaction(TxnHandle::new(id)))
    }

    fn commit(&self, txn: TxnHandle) -> StoreResult<()> {
        let open = self
            .txns
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .remove(&txn.id())
            .ok_or_else(|| unknown_txn(&txn))?;
        self.faults.check("txn.commit")?;

        let mut committed = self
            .committed
            .write()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?;
        if committed.revision != open.base_revision {
            return Err(StoreError::TransactionConflict(format!(
                "transaction {} started at revision {}, store is at {}",
                txn.id(),
                open.base_revision,
                committed.revision
            )));
        }
        committed.data = open.working;
        committed.revision += 1;
        Ok(())
    }

    fn abort(&self, txn: TxnHandle) -> StoreResult<()> {
        self.txns
            .lock()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .remove(&txn.id());
        Ok(())
    }

    fn find_active(
        &self,
        identity: &Identity,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>> {
        self.faults.check("metadata.find")?;
        self.read(scope, |data| {
            data.records
                .values()
                .find(|r| &r.identity == identity && r.active)
                .cloned()
        })
    }

    fn find_version(
        &self,
        identity: &Identity,
        version: u32,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<MetadataRecord>> {
        self.faults.check("metadata.find")?;
        self.read(scope, |data| {
            data.records
                .values()
                .find(|r| &r.identity == identity && r.version == version)
                .cloned()
        })
    }

    fn find_records(
        &self,
        filter: &RecordFilter,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Vec<MetadataRecord>> {
        self.faults.check("metadata.find")?;
        self.read(scope, |data| {
            let mut found: Vec<MetadataRecord> = data
                .records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            found.sort_by(|a, b| (&a.identity, a.version).cmp(&(&b.identity, b.version)));
            if let Some(limit) = filter.limit {
                found.truncate(limit);
            }
            found
        })
    }

    fn distinct_identities(&self) -> StoreResult<Vec<Identity>> {
        self.faults.check("metadata.find")?;
        self.read(None, |data| {
            data.records
                .values()
                .map(|r| r.identity.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        })
    }

    fn insert_record(&self, record: &MetadataRecord, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.faults.check("metadata.insert")?;
        self.write(scope, |data| {
            if data.records.contains_key(&record.id) {
                return Err(StoreError::DuplicateKey(format!("record id {}", record.id)));
            }
            if record.active
                && data
                    .records
                    .values()
                    .any(|r| r.identity == record.identity && r.active)
            {
                return Err(StoreError::DuplicateKey(format!(
                    "active record already exists for identity '{}'",
                    record.identity
                )));
            }
            data.records.insert(record.id.clone(), record.clone());
            Ok(())
        })
    }

    fn deactivate_record(
        &self,
        record_id: &str,
        expected_version: u32,
        entry: &AuditEntry,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<bool> {
        self.faults.check("metadata.deactivate")?;
        self.write(scope, |data| match data.records.get_mut(record_id) {
            Some(r) if r.active && r.version == expected_version => {
                r.active = false;
                r.audit_log.push(entry.clone());
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn delete_record(&self, record_id: &str, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.faults.check("metadata.delete")?;
        self.write(scope, |data| {
            data.records.remove(record_id);
            Ok(())
        })
    }

    fn insert_config(&self, doc: &ConfigDocument, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.faults.check("config.insert")?;
        self.write(scope, |data| {
            if data.configs.contains_key(&doc.id) {
                return Err(StoreError::DuplicateKey(format!("config id {}", doc.id)));
            }
            data.configs.insert(doc.id.clone(), doc.clone());
            Ok(())
        })
    }

    fn get_config(
        &self,
        id: &str,
        scope: Option<&TxnHandle>,
    ) -> StoreResult<Option<ConfigDocument>> {
        self.faults.check("config.get")?;
        self.read(scope, |data| data.configs.get(id).cloned())
    }

    fn delete_config(&self, id: &str, scope: Option<&TxnHandle>) -> StoreResult<()> {
        self.faults.check("config.delete")?;
        self.write(scope, |data| {
            data.configs.remove(id);
            Ok(())
        })
    }
}

/// In-memory blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(BlobNamespace, BlobId), StoredBlob>>,
    faults: Faults,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with `error`.
    ///
    /// Operation names: `blob.put`, `blob.get`, `blob.delete`, `blob.exists`.
    pub fn fail_times(&self, op: &str, times: u32, error: StoreError) {
        self.faults.push(op, times, error);
    }

    pub fn fail_next(&self, op: &str, error: StoreError) {
        self.fail_times(op, 1, error);
    }

    /// Overwrite stored bytes out-of-band, leaving metadata untouched.
    pub fn corrupt(&self, namespace: BlobNamespace, id: &BlobId, data: &[u8]) -> bool {
        match self.blobs.write() {
            Ok(mut blobs) => match blobs.get_mut(&(namespace, id.clone())) {
                Some(blob) => {
                    blob.data = data.to_vec();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Number of blobs in a namespace.
    pub fn count(&self, namespace: BlobNamespace) -> usize {
        self.blobs
            .read()
            .map(|b| b.keys().filter(|(ns, _)| *ns == namespace).count())
            .unwrap_or(0)
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        namespace: BlobNamespace,
        data: &[u8],
        metadata: &BlobMetadata,
    ) -> StoreResult<BlobId> {
        self.faults.check("blob.put")?;
        let id = BlobId::new(Uuid::new_v4().to_string());
        let blob = StoredBlob {
            id: id.clone(),
            data: data.to_vec(),
            metadata: metadata.clone(),
            uploaded_at: Utc::now(),
        };
        self.blobs
            .write()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .insert((namespace, id.clone()), blob);
        Ok(id)
    }

    fn get(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<StoredBlob> {
        self.faults.check("blob.get")?;
        self.blobs
            .read()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .get(&(namespace, id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", namespace, id)))
    }

    fn delete(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<()> {
        self.faults.check("blob.delete")?;
        self.blobs
            .write()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .remove(&(namespace, id.clone()));
        Ok(())
    }

    fn exists(&self, namespace: BlobNamespace, id: &BlobId) -> StoreResult<bool> {
        self.faults.check("blob.exists")?;
        Ok(self
            .blobs
            .read()
            .map_err(|_| StoreError::Internal("Lock poisoned".to_string()))?
            .contains_key(&(namespace, id.clone())))
    }
}
