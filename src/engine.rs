//! Versioning engine
//!
//! Per identity the only live states are `absent` and `active(version = N)`.
//!
//! - `create`: absent → active(1)
//! - `modify`: active(N) → active(N + 1); version N is deactivated, never deleted
//! - `seed_one`: create, skip, or modify depending on stored checksums
//!
//! Every new config document and blob is registered with an
//! `OrphanCompensator` before the next step runs. On failure the compensator
//! deletes them and the caller gets a `Database` error wrapping the cause.
//!
//! `modify` runs inside a transaction when the document store offers one.
//! Otherwise it runs sequentially (degraded mode, always logged). New parts
//! are written before the current version is touched, and the deactivate
//! step is a compare-and-swap on (record, version), so two concurrent
//! modifies cannot both succeed. Only a failed insert of the new version
//! can leave the identity without an active record; `create` and
//! `seed_one` then resume numbering after the highest stored version.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bundle::{BundleSpec, ConfigPart, FilePart, PartialBundle, SeedManifest};
use crate::compensator::OrphanCompensator;
use crate::errors::{VaultError, VaultResult};
use crate::identity::Identity;
use crate::model::{
    new_record_id, AuditAction, AuditEntry, Checksums, ConfigDocument, FileReferences, FileSizes,
    MetadataRecord, OriginalFiles, Part,
};
use crate::observability::Logger;
use crate::retry::RetryPolicy;
use crate::store::{
    BlobId, BlobMetadata, BlobNamespace, BlobStore, DocumentStore, RetryingBlobs,
    RecordFilter, RetryingDocuments, StoreError, TransactionScope, TxnHandle,
};

/// What `modify` does when the document store has no transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandaloneModify {
    /// Run sequentially with compensation and a compare-and-swap deactivate.
    #[default]
    CompareAndSwap,
    /// Reject the modify before any write.
    Refuse,
}

/// Result of `seed_one`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOutcome {
    Created,
    Updated,
    Skipped,
}

impl fmt::Display for SeedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SeedOutcome::Created => "created",
            SeedOutcome::Updated => "updated",
            SeedOutcome::Skipped => "skipped",
        })
    }
}

/// Aggregate of a batch seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl SeedSummary {
    fn record(&mut self, outcome: SeedOutcome) {
        match outcome {
            SeedOutcome::Created => self.created += 1,
            SeedOutcome::Updated => self.updated += 1,
            SeedOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Checksums of the supplied parts, computed once before any write.
#[derive(Debug, Clone, Default)]
struct PartSums {
    config: Option<String>,
    sql: Option<String>,
    template: Option<String>,
}

impl PartSums {
    fn of_bundle(bundle: &BundleSpec) -> Self {
        Self {
            config: Some(bundle.config.checksum()),
            sql: Some(bundle.sql.checksum()),
            template: bundle.template.as_ref().map(FilePart::checksum),
        }
    }

    fn of_partial(partial: &PartialBundle) -> Self {
        Self {
            config: partial.config.as_ref().map(ConfigPart::checksum),
            sql: partial.sql.as_ref().map(FilePart::checksum),
            template: partial.template.as_ref().map(FilePart::checksum),
        }
    }
}

fn sum_of(sum: &Option<String>, part: Part) -> VaultResult<String> {
    sum.clone().ok_or_else(|| {
        VaultError::Validation(format!("checksum of supplied part {} was not computed", part))
    })
}

/// Orchestrates create / modify / seed against explicit store handles.
pub struct VersioningEngine<'a> {
    docs: RetryingDocuments<'a>,
    blobs: RetryingBlobs<'a>,
    standalone_modify: StandaloneModify,
}

impl<'a> VersioningEngine<'a> {
    pub fn new(
        docs: &'a dyn DocumentStore,
        blobs: &'a dyn BlobStore,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            docs: RetryingDocuments::new(docs, retry),
            blobs: RetryingBlobs::new(blobs, retry),
            standalone_modify: StandaloneModify::default(),
        }
    }

    pub fn with_standalone_modify(mut self, mode: StandaloneModify) -> Self {
        self.standalone_modify = mode;
        self
    }

    /// Create version 1 of a new bundle.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad identity, `DuplicateRecord` if the identity is
    /// already active, `Database` for any failure while writing.
    pub fn create(&self, bundle: &BundleSpec) -> VaultResult<Identity> {
        let identity = bundle.identity()?;
        let sums = PartSums::of_bundle(bundle);
        self.create_with(&identity, bundle, &sums)?;
        Ok(identity)
    }

    /// Append a new version replacing the supplied parts.
    ///
    /// Returns the new version number.
    ///
    /// # Errors
    ///
    /// `Validation` if no part is supplied or a new config would change the
    /// identity, `RecordNotFound` if the identity has no active record,
    /// `Database` for any failure while writing.
    pub fn modify(&self, identity: &Identity, partial: &PartialBundle) -> VaultResult<u32> {
        if partial.is_empty() {
            return Err(VaultError::Validation(
                "at least one of config, sql or template must be supplied".to_string(),
            ));
        }
        let existing = self.docs.find_active(identity, None)?.ok_or_else(|| {
            VaultError::RecordNotFound(format!("no active record with identity '{}'", identity))
        })?;
        let only_clears = partial.config.is_none() && partial.sql.is_none() && partial.template.is_none();
        if only_clears && existing.file_references.template_blob_id.is_none() {
            return Err(VaultError::Validation(format!(
                "version {} of '{}' has no template to remove",
                existing.version, identity
            )));
        }
        if let Some(config) = &partial.config {
            let derived = Identity::build(
                &existing.regulation,
                config.name(),
                config.out_file_name(),
                &existing.region,
            )?;
            if &derived != identity {
                return Err(VaultError::Validation(format!(
                    "new config resolves to identity '{}', expected '{}'",
                    derived, identity
                )));
            }
        }
        let sums = PartSums::of_partial(partial);
        self.modify_from(&existing, partial, &sums)
    }

    /// Idempotent upsert used by bulk seeding.
    ///
    /// Identical checksums on every part skip the bundle; any difference
    /// appends a version replacing exactly the differing parts.
    pub fn seed_one(&self, bundle: &BundleSpec) -> VaultResult<SeedOutcome> {
        let identity = bundle.identity()?;
        let sums = PartSums::of_bundle(bundle);

        let existing = match self.docs.find_active(&identity, None)? {
            None => {
                self.create_with(&identity, bundle, &sums)?;
                return Ok(SeedOutcome::Created);
            }
            Some(existing) => existing,
        };

        let stored = &existing.checksums;
        let mut changes = PartialBundle::default();
        let mut change_sums = PartSums::default();

        if sums.config.as_deref() != Some(stored.json_config.as_str()) {
            changes.config = Some(bundle.config.clone());
            change_sums.config = sums.config.clone();
        }
        if sums.sql.as_deref() != Some(stored.sql_file.as_str()) {
            changes.sql = Some(bundle.sql.clone());
            change_sums.sql = sums.sql.clone();
        }
        if sums.template != stored.template {
            match &bundle.template {
                Some(template) => {
                    changes.template = Some(template.clone());
                    change_sums.template = sums.template.clone();
                }
                None => changes.clear_template = true,
            }
        }

        if changes.is_empty() {
            Logger::trace(
                "engine.seed_skipped",
                &[("identity", identity.as_str()), ("reason", "checksums_match")],
            );
            return Ok(SeedOutcome::Skipped);
        }

        Logger::info(
            "engine.seed_modifying",
            &[("identity", identity.as_str()), ("reason", "checksums_changed")],
        );
        self.modify_from(&existing, &changes, &change_sums)?;
        Ok(SeedOutcome::Updated)
    }

    /// Seed every bundle; one bundle's failure never stops the others.
    pub fn seed_many(&self, bundles: &[BundleSpec]) -> SeedSummary {
        let mut summary = SeedSummary::default();
        for (i, bundle) in bundles.iter().enumerate() {
            self.seed_labeled(&mut summary, &bundle.label(i), Ok(bundle), i + 1, bundles.len());
        }
        self.log_summary(&summary);
        summary
    }

    /// Seed every entry of a manifest, resolving files relative to it.
    ///
    /// Entries that fail validation are counted as failed.
    pub fn seed_manifest(&self, manifest: &SeedManifest) -> SeedSummary {
        let mut summary = SeedSummary::default();
        let total = manifest.bundles.len();
        for (i, entry) in manifest.bundles.iter().enumerate() {
            let resolved = entry.resolve(&manifest.base_dir);
            self.seed_labeled(&mut summary, &entry.label(i), resolved.as_ref(), i + 1, total);
        }
        self.log_summary(&summary);
        summary
    }

    fn seed_labeled(
        &self,
        summary: &mut SeedSummary,
        label: &str,
        bundle: Result<&BundleSpec, &VaultError>,
        index: usize,
        total: usize,
    ) {
        let position = format!("{}/{}", index, total);
        let outcome = match bundle {
            Ok(bundle) => self.seed_one(bundle).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(outcome) => {
                summary.record(outcome);
                Logger::info(
                    "engine.seed_processed",
                    &[
                        ("index", &position),
                        ("label", label),
                        ("result", &outcome.to_string()),
                    ],
                );
            }
            Err(e) => {
                summary.failed += 1;
                summary.errors.push(format!("{}: {}", label, e));
                Logger::error(
                    "engine.seed_failed",
                    &[("index", &position), ("label", label), ("error", &e)],
                );
            }
        }
    }

    fn log_summary(&self, summary: &SeedSummary) {
        Logger::info(
            "engine.seed_complete",
            &[
                ("created", &summary.created.to_string()),
                ("updated", &summary.updated.to_string()),
                ("skipped", &summary.skipped.to_string()),
                ("failed", &summary.failed.to_string()),
            ],
        );
    }

    fn create_with(
        &self,
        identity: &Identity,
        bundle: &BundleSpec,
        sums: &PartSums,
    ) -> VaultResult<()> {
        let history = self
            .docs
            .find_records(&RecordFilter::new().identity(identity))?;
        if history.iter().any(|r| r.active) {
            return Err(VaultError::DuplicateRecord(format!(
                "an active record already exists with identity '{}'; use modify to update it",
                identity
            )));
        }
        // Inactive history without an active record: a standalone modify
        // failed after deactivating. Keep versions unique and gap-free.
        let last = history.iter().map(|r| r.version).max();
        let version = last.map_or(1, |v| v + 1);
        if let Some(last) = last {
            Logger::warn(
                "engine.create_resumed",
                &[
                    ("identity", identity.as_str()),
                    ("last_version", &last.to_string()),
                    ("version", &version.to_string()),
                ],
            );
        }

        let mut compensator = OrphanCompensator::new();
        match self.write_initial(identity, bundle, sums, version, &mut compensator) {
            Ok(()) => {
                compensator.clear();
                Logger::info(
                    "engine.created",
                    &[
                        ("identity", identity.as_str()),
                        ("version", &version.to_string()),
                        ("csi_id", &bundle.csi_id),
                        ("region", &bundle.region),
                    ],
                );
                Ok(())
            }
            Err(e) => {
                self.compensate(identity, &mut compensator);
                Err(VaultError::database(
                    format!("failed to create record '{}'", identity),
                    e,
                ))
            }
        }
    }

    fn write_initial(
        &self,
        identity: &Identity,
        bundle: &BundleSpec,
        sums: &PartSums,
        version: u32,
        compensator: &mut OrphanCompensator<'a>,
    ) -> VaultResult<()> {
        let config_doc = ConfigDocument::new(
            identity.clone(),
            bundle.config.value.clone(),
            bundle.config.source.clone(),
            version,
        );
        self.docs.insert_config(&config_doc, None)?;
        compensator.register_config(self.docs, &config_doc.id);

        let sql_sum = sum_of(&sums.sql, Part::SqlFile)?;
        let sql_id = self.upload(BlobNamespace::Sql, &bundle.sql, &sql_sum, identity, version, compensator)?;

        let template_id = match &bundle.template {
            Some(template) => {
                let sum = sum_of(&sums.template, Part::Template)?;
                Some(self.upload(BlobNamespace::Template, template, &sum, identity, version, compensator)?)
            }
            None => None,
        };

        let record = MetadataRecord {
            id: new_record_id(),
            identity: identity.clone(),
            csi_id: bundle.csi_id.clone(),
            region: bundle.region.clone(),
            regulation: bundle.regulation.clone(),
            name: bundle.config.name().to_string(),
            out_file_name: bundle.config.out_file_name().to_string(),
            version,
            active: true,
            original_files: OriginalFiles {
                json_config: bundle.config.filename.clone(),
                sql_file: bundle.sql.filename.clone(),
                template: bundle.template.as_ref().map(|t| t.filename.clone()),
            },
            file_references: FileReferences {
                json_config_id: config_doc.id.clone(),
                sql_blob_id: sql_id,
                template_blob_id: template_id,
            },
            checksums: Checksums {
                json_config: sum_of(&sums.config, Part::JsonConfig)?,
                sql_file: sql_sum,
                template: sums.template.clone(),
            },
            file_sizes: FileSizes {
                json_config: bundle.config.size(),
                sql_file: bundle.sql.size(),
                template: bundle.template.as_ref().map(FilePart::size),
            },
            uploaded_at: Utc::now(),
            audit_log: vec![AuditEntry::now(
                AuditAction::Created,
                if version == 1 {
                    "Initial seed".to_string()
                } else {
                    format!("Recreated after version {}", version - 1)
                },
            )],
        };
        self.docs.insert_record(&record, None)
    }

    fn modify_from(
        &self,
        existing: &MetadataRecord,
        partial: &PartialBundle,
        sums: &PartSums,
    ) -> VaultResult<u32> {
        let identity = &existing.identity;
        let new_version = existing.version + 1;
        let scope = self.docs.inner().begin().map_err(|e| {
            VaultError::database(format!("failed to open transaction for '{}'", identity), e)
        })?;

        let mut compensator = OrphanCompensator::new();
        match scope {
            TransactionScope::Transaction(txn) => {
                let applied =
                    self.apply_modify(existing, partial, sums, new_version, Some(&txn), &mut compensator);
                let outcome = match applied {
                    Ok(()) => self.docs.inner().commit(txn).map_err(|e| {
                        VaultError::database(format!("commit failed for '{}'", identity), e)
                    }),
                    Err(e) => {
                        if let Err(abort_err) = self.docs.inner().abort(txn) {
                            Logger::error(
                                "engine.abort_failed",
                                &[("identity", identity.as_str()), ("error", &abort_err.to_string())],
                            );
                        }
                        Err(e)
                    }
                };
                self.finish_modify(existing, new_version, outcome, &mut compensator)
            }
            TransactionScope::Unsupported => {
                if self.standalone_modify == StandaloneModify::Refuse {
                    return Err(VaultError::database(
                        format!("modify of '{}' refused", identity),
                        StoreError::Internal("document store has no transaction support".to_string()),
                    ));
                }
                Logger::warn(
                    "engine.modify_degraded",
                    &[("identity", identity.as_str()), ("transactions", "false")],
                );
                let outcome =
                    self.apply_modify(existing, partial, sums, new_version, None, &mut compensator);
                if outcome.is_err() {
                    let has_active = self
                        .docs
                        .find_active(identity, None)
                        .map(|r| r.is_some())
                        .unwrap_or(false);
                    if !has_active {
                        Logger::error(
                            "engine.modify_left_inactive",
                            &[
                                ("identity", identity.as_str()),
                                ("deactivated_version", &existing.version.to_string()),
                            ],
                        );
                    }
                }
                self.finish_modify(existing, new_version, outcome, &mut compensator)
            }
        }
    }

    fn finish_modify(
        &self,
        existing: &MetadataRecord,
        new_version: u32,
        outcome: VaultResult<()>,
        compensator: &mut OrphanCompensator<'a>,
    ) -> VaultResult<u32> {
        let identity = &existing.identity;
        match outcome {
            Ok(()) => {
                compensator.clear();
                Logger::info(
                    "engine.modified",
                    &[
                        ("identity", identity.as_str()),
                        ("version", &format!("{}->{}", existing.version, new_version)),
                    ],
                );
                Ok(new_version)
            }
            Err(e) => {
                self.compensate(identity, compensator);
                Err(VaultError::database(
                    format!("modify of '{}' failed", identity),
                    e,
                ))
            }
        }
    }

    fn apply_modify(
        &self,
        existing: &MetadataRecord,
        partial: &PartialBundle,
        sums: &PartSums,
        new_version: u32,
        scope: Option<&TxnHandle>,
        compensator: &mut OrphanCompensator<'a>,
    ) -> VaultResult<()> {
        let identity = &existing.identity;

        // write supplied parts first, carry the rest over
        let mut original_files = existing.original_files.clone();
        let mut refs = existing.file_references.clone();
        let mut checksums = existing.checksums.clone();
        let mut sizes = existing.file_sizes.clone();
        let mut name = existing.name.clone();
        let mut out_file_name = existing.out_file_name.clone();
        let mut changed: Vec<&str> = Vec::new();

        if let Some(config) = &partial.config {
            let doc = ConfigDocument::new(
                identity.clone(),
                config.value.clone(),
                config.source.clone(),
                new_version,
            );
            self.docs.insert_config(&doc, scope)?;
            compensator.register_config(self.docs, &doc.id);
            original_files.json_config = config.filename.clone();
            refs.json_config_id = doc.id;
            checksums.json_config = sum_of(&sums.config, Part::JsonConfig)?;
            sizes.json_config = config.size();
            name = config.name().to_string();
            out_file_name = config.out_file_name().to_string();
            changed.push(Part::JsonConfig.as_str());
        }

        if let Some(sql) = &partial.sql {
            let sum = sum_of(&sums.sql, Part::SqlFile)?;
            refs.sql_blob_id =
                self.upload(BlobNamespace::Sql, sql, &sum, identity, new_version, compensator)?;
            original_files.sql_file = sql.filename.clone();
            checksums.sql_file = sum;
            sizes.sql_file = sql.size();
            changed.push(Part::SqlFile.as_str());
        }

        if let Some(template) = &partial.template {
            let sum = sum_of(&sums.template, Part::Template)?;
            refs.template_blob_id = Some(self.upload(
                BlobNamespace::Template,
                template,
                &sum,
                identity,
                new_version,
                compensator,
            )?);
            original_files.template = Some(template.filename.clone());
            checksums.template = Some(sum);
            sizes.template = Some(template.size());
            changed.push(Part::Template.as_str());
        } else if partial.clear_template && refs.template_blob_id.is_some() {
            refs.template_blob_id = None;
            original_files.template = None;
            checksums.template = None;
            sizes.template = None;
            changed.push("template (removed)");
        }

        // deactivate the current version, only if it is still current
        let superseded = AuditEntry::now(
            AuditAction::Deactivated,
            format!("Superseded by version {}", new_version),
        );
        if !self
            .docs
            .deactivate_record(&existing.id, existing.version, &superseded, scope)?
        {
            return Err(VaultError::database(
                format!("concurrent modification of '{}'", identity),
                StoreError::TransactionConflict(format!(
                    "version {} is no longer active",
                    existing.version
                )),
            ));
        }

        // insert the new active version
        let record = MetadataRecord {
            id: new_record_id(),
            identity: identity.clone(),
            csi_id: existing.csi_id.clone(),
            region: existing.region.clone(),
            regulation: existing.regulation.clone(),
            name,
            out_file_name,
            version: new_version,
            active: true,
            original_files,
            file_references: refs,
            checksums,
            file_sizes: sizes,
            uploaded_at: Utc::now(),
            audit_log: vec![AuditEntry::now(
                AuditAction::Modified,
                format!(
                    "Updated files: {} (v{} → v{})",
                    changed.join(", "),
                    existing.version,
                    new_version
                ),
            )],
        };
        self.docs.insert_record(&record, scope)
    }

    fn upload(
        &self,
        namespace: BlobNamespace,
        part: &FilePart,
        checksum: &str,
        identity: &Identity,
        version: u32,
        compensator: &mut OrphanCompensator<'a>,
    ) -> VaultResult<BlobId> {
        let metadata = BlobMetadata {
            original_filename: part.filename.clone(),
            content_type: part.content_type.clone(),
            checksum: checksum.to_string(),
            identity: identity.to_string(),
            version,
        };
        let id = self.blobs.put(namespace, &part.data, &metadata)?;
        compensator.register_blob(self.blobs, namespace, &id);
        Logger::info(
            "engine.blob_uploaded",
            &[
                ("namespace", namespace.as_str()),
                ("file", &part.filename),
                ("id", id.as_str()),
                ("size", &part.size().to_string()),
                ("checksum", checksum),
            ],
        );
        Ok(id)
    }

    fn compensate(&self, identity: &Identity, compensator: &mut OrphanCompensator<'a>) {
        let cleaned = compensator.cleanup();
        if cleaned > 0 {
            Logger::warn(
                "engine.orphan_cleanup",
                &[("identity", identity.as_str()), ("cleaned", &cleaned.to_string())],
            );
        }
    }
}
