//! Retention policies over historical versions
//!
//! Active records are never purged. Purging a record deletes its blobs, its
//! config document and then the record itself. Failures are collected per
//! item and never abort the batch.
//!
//! `modify` carries unchanged parts over by reference, so versions of one
//! identity may share a blob or config document. A shared part is deleted
//! only once no surviving record references it.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::errors::{VaultError, VaultResult};
use crate::identity::Identity;
use crate::model::MetadataRecord;
use crate::observability::Logger;
use crate::retry::RetryPolicy;
use crate::store::{
    BlobNamespace, BlobStore, DocumentStore, RecordFilter, RetryingBlobs, RetryingDocuments,
};

/// Outcome of `purge_by_count` for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub purged: usize,
    pub kept: usize,
    pub freed_blobs: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// Aggregate of `purge_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeAllReport {
    pub records_processed: usize,
    pub total_purged: usize,
    pub total_freed_blobs: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// Outcome of `purge_by_age`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgePurgeReport {
    pub purged: usize,
    pub freed_blobs: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// Tracks which parts may be deleted during one purge.
struct Release {
    /// Ids referenced by records that survive the purge.
    live: HashSet<String>,
    /// Ids already deleted (or counted, in a dry run).
    released: HashSet<String>,
}

impl Release {
    fn new(survivors: &[MetadataRecord]) -> Self {
        let mut live = HashSet::new();
        for record in survivors {
            live.extend(part_ids(record).into_iter().map(str::to_string));
        }
        Self {
            live,
            released: HashSet::new(),
        }
    }

    /// Whether `id` should be deleted now. Each id is released once.
    fn claim(&mut self, id: &str) -> bool {
        !self.live.contains(id) && self.released.insert(id.to_string())
    }

    /// Blobs a dry run would free for `record`.
    fn count_blobs(&mut self, record: &MetadataRecord) -> usize {
        let refs = &record.file_references;
        std::iter::once(&refs.sql_blob_id)
            .chain(refs.template_blob_id.iter())
            .filter(|id| self.claim(id.as_str()))
            .count()
    }
}

fn part_ids(record: &MetadataRecord) -> Vec<&str> {
    let refs = &record.file_references;
    let mut ids = vec![refs.json_config_id.as_str(), refs.sql_blob_id.as_str()];
    if let Some(template) = &refs.template_blob_id {
        ids.push(template.as_str());
    }
    ids
}

pub struct RetentionManager<'a> {
    docs: RetryingDocuments<'a>,
    blobs: RetryingBlobs<'a>,
}

impl<'a> RetentionManager<'a> {
    pub fn new(
        docs: &'a dyn DocumentStore,
        blobs: &'a dyn BlobStore,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            docs: RetryingDocuments::new(docs, retry),
            blobs: RetryingBlobs::new(blobs, retry),
        }
    }

    /// Keep the active record plus the newest inactive ones up to `keep`
    /// versions in total, and purge the older tail.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` if the identity has no records at all.
    pub fn purge_by_count(
        &self,
        identity: &Identity,
        keep: usize,
        dry_run: bool,
    ) -> VaultResult<PurgeReport> {
        let mut records = self
            .docs
            .find_records(&RecordFilter::new().identity(identity))?;
        if records.is_empty() {
            return Err(VaultError::RecordNotFound(format!(
                "no records with identity '{}'",
                identity
            )));
        }
        records.sort_by(|a, b| b.version.cmp(&a.version));

        let (protected, inactive): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.active);
        let slots = keep.saturating_sub(protected.len());
        let keep_inactive = slots.min(inactive.len());
        let to_purge = &inactive[keep_inactive..];

        let mut survivors = protected.clone();
        survivors.extend_from_slice(&inactive[..keep_inactive]);
        let mut release = Release::new(&survivors);

        let mut report = PurgeReport {
            kept: protected.len() + keep_inactive,
            dry_run,
            ..PurgeReport::default()
        };

        if to_purge.is_empty() {
            Logger::trace(
                "retention.noop",
                &[("identity", identity.as_str()), ("keep", &keep.to_string())],
            );
            return Ok(report);
        }

        if dry_run {
            report.purged = to_purge.len();
            report.freed_blobs = to_purge.iter().map(|r| release.count_blobs(r)).sum();
            Logger::info(
                "retention.dry_run",
                &[
                    ("identity", identity.as_str()),
                    ("would_purge", &report.purged.to_string()),
                ],
            );
            return Ok(report);
        }

        for record in to_purge {
            match self.purge_record(record, &mut release, &mut report.errors) {
                Ok(freed) => {
                    report.purged += 1;
                    report.freed_blobs += freed;
                    Logger::info(
                        "retention.purged",
                        &[
                            ("identity", identity.as_str()),
                            ("version", &record.version.to_string()),
                        ],
                    );
                }
                Err(e) => {
                    report
                        .errors
                        .push(format!("version {}: {}", record.version, e));
                    Logger::error(
                        "retention.purge_failed",
                        &[
                            ("identity", identity.as_str()),
                            ("version", &record.version.to_string()),
                            ("error", &e.to_string()),
                        ],
                    );
                }
            }
        }

        Logger::info(
            "retention.complete",
            &[
                ("identity", identity.as_str()),
                ("purged", &report.purged.to_string()),
                ("freed_blobs", &report.freed_blobs.to_string()),
            ],
        );
        Ok(report)
    }

    /// Apply `purge_by_count` to every identity in the store.
    pub fn purge_all(&self, keep: usize, dry_run: bool) -> VaultResult<PurgeAllReport> {
        let identities = self.docs.distinct_identities()?;
        let mut report = PurgeAllReport {
            records_processed: identities.len(),
            dry_run,
            ..PurgeAllReport::default()
        };

        Logger::info(
            "retention.global_start",
            &[
                ("identities", &identities.len().to_string()),
                ("keep", &keep.to_string()),
                ("dry_run", if dry_run { "true" } else { "false" }),
            ],
        );

        for identity in &identities {
            match self.purge_by_count(identity, keep, dry_run) {
                Ok(result) => {
                    report.total_purged += result.purged;
                    report.total_freed_blobs += result.freed_blobs;
                    report.errors.extend(result.errors);
                }
                Err(e) => {
                    report.errors.push(format!("{}: {}", identity, e));
                    Logger::error(
                        "retention.identity_failed",
                        &[("identity", identity.as_str()), ("error", &e.to_string())],
                    );
                }
            }
        }

        Logger::info(
            "retention.global_complete",
            &[
                ("processed", &report.records_processed.to_string()),
                ("purged", &report.total_purged.to_string()),
                ("freed_blobs", &report.total_freed_blobs.to_string()),
            ],
        );
        Ok(report)
    }

    /// Purge inactive records uploaded more than `max_age_days` ago.
    pub fn purge_by_age(&self, max_age_days: u32, dry_run: bool) -> VaultResult<AgePurgeReport> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        self.purge_older_than(cutoff, dry_run)
    }

    /// Purge inactive records uploaded strictly before `cutoff`.
    pub fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> VaultResult<AgePurgeReport> {
        let filter = RecordFilter::new().active(false).uploaded_before(cutoff);
        let records: Vec<MetadataRecord> = self
            .docs
            .find_records(&filter)?
            .into_iter()
            .filter(|r| !r.active)
            .collect();

        let mut report = AgePurgeReport {
            dry_run,
            ..AgePurgeReport::default()
        };
        let cutoff_text = cutoff.to_rfc3339();

        if records.is_empty() {
            Logger::trace("retention.age_noop", &[("cutoff", &cutoff_text)]);
            return Ok(report);
        }

        let mut release = Release::new(&self.survivors_of(&records)?);

        if dry_run {
            report.purged = records.len();
            report.freed_blobs = records.iter().map(|r| release.count_blobs(r)).sum();
            Logger::info(
                "retention.age_dry_run",
                &[
                    ("cutoff", &cutoff_text),
                    ("would_purge", &report.purged.to_string()),
                ],
            );
            return Ok(report);
        }

        for record in &records {
            match self.purge_record(record, &mut release, &mut report.errors) {
                Ok(freed) => {
                    report.purged += 1;
                    report.freed_blobs += freed;
                }
                Err(e) => {
                    report.errors.push(format!("record {}: {}", record.id, e));
                    Logger::error(
                        "retention.age_purge_failed",
                        &[("record_id", &record.id), ("error", &e.to_string())],
                    );
                }
            }
        }

        Logger::info(
            "retention.age_complete",
            &[
                ("cutoff", &cutoff_text),
                ("purged", &report.purged.to_string()),
                ("freed_blobs", &report.freed_blobs.to_string()),
            ],
        );
        Ok(report)
    }

    /// Records of the affected identities that are not being purged.
    fn survivors_of(&self, purging: &[MetadataRecord]) -> VaultResult<Vec<MetadataRecord>> {
        let purge_ids: HashSet<&str> = purging.iter().map(|r| r.id.as_str()).collect();
        let identities: HashSet<&Identity> = purging.iter().map(|r| &r.identity).collect();

        let mut survivors = Vec::new();
        for identity in identities {
            let records = self
                .docs
                .find_records(&RecordFilter::new().identity(identity))?;
            survivors.extend(
                records
                    .into_iter()
                    .filter(|r| !purge_ids.contains(r.id.as_str())),
            );
        }
        Ok(survivors)
    }

    /// Delete the unshared blobs and config of `record`, then the record.
    ///
    /// Part deletion failures go to `errors`; only the record deletion
    /// failing makes the whole purge fail. Returns the number of blobs freed.
    fn purge_record(
        &self,
        record: &MetadataRecord,
        release: &mut Release,
        errors: &mut Vec<String>,
    ) -> VaultResult<usize> {
        let refs = &record.file_references;
        let mut freed = 0;

        let blobs = std::iter::once((BlobNamespace::Sql, &refs.sql_blob_id))
            .chain(refs.template_blob_id.iter().map(|id| (BlobNamespace::Template, id)));
        for (namespace, id) in blobs {
            if !release.claim(id.as_str()) {
                continue;
            }
            match self.blobs.delete(namespace, id) {
                Ok(()) => freed += 1,
                Err(e) => {
                    errors.push(format!("{} id={}: {}", namespace, id, e));
                    Logger::warn(
                        "retention.blob_delete_failed",
                        &[
                            ("namespace", namespace.as_str()),
                            ("id", id.as_str()),
                            ("error", &e.to_string()),
                        ],
                    );
                }
            }
        }

        if release.claim(&refs.json_config_id) {
            if let Err(e) = self.docs.delete_config(&refs.json_config_id) {
                errors.push(format!("config id={}: {}", refs.json_config_id, e));
                Logger::warn(
                    "retention.config_delete_failed",
                    &[("id", &refs.json_config_id), ("error", &e.to_string())],
                );
            }
        }

        self.docs.delete_record(&record.id)?;
        Ok(freed)
    }
}
