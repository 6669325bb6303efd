//! Export a stored bundle version to a directory, verifying checksums
//!
//! Parts are written under their recorded original filenames; a part whose
//! name was already taken by an earlier part of the same export is written
//! as `<part>_<name>` instead. With
//! verification on, each written file is re-hashed from disk. A mismatching
//! part either fails the export closed (its file is removed and
//! `ChecksumMismatch` names every failing part) or, with `force`, is kept
//! and reported as unverified.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checksum::compute_file_checksum;
use crate::errors::{VaultError, VaultResult};
use crate::identity::Identity;
use crate::model::{MetadataRecord, Part};
use crate::observability::Logger;
use crate::retry::RetryPolicy;
use crate::store::{BlobId, BlobNamespace, BlobStore, DocumentStore, RetryingBlobs, RetryingDocuments};

/// Prefix of a `files` entry that records a per-part failure.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Export options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub version: Option<u32>,
    pub verify: bool,
    pub force: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            version: None,
            verify: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub identity: Identity,
    pub version: u32,
    pub output_dir: PathBuf,
    /// Written path, or `ERROR: ...` for a part that could not be exported.
    pub files: BTreeMap<Part, String>,
    /// Per-part checksum result; only parts that were written and verified.
    pub verification: BTreeMap<Part, bool>,
}

impl ExportReport {
    pub fn exported_count(&self) -> usize {
        self.files
            .values()
            .filter(|v| !v.starts_with(ERROR_PREFIX))
            .count()
    }

    pub fn verified_count(&self) -> usize {
        self.verification.values().filter(|v| **v).count()
    }
}

pub struct ExportVerifier<'a> {
    docs: RetryingDocuments<'a>,
    blobs: RetryingBlobs<'a>,
}

struct Mismatch {
    part: Part,
    path: PathBuf,
    expected: String,
    actual: String,
}

impl<'a> ExportVerifier<'a> {
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

    /// Export `identity` (the given version, else the active one) into
    /// `output_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` if the version does not resolve, `Validation` if the
    /// output directory cannot be created, `ChecksumMismatch` on a failed
    /// verification without `force`.
    pub fn export(
        &self,
        identity: &Identity,
        output_dir: &Path,
        options: ExportOptions,
    ) -> VaultResult<ExportReport> {
        let record = self.resolve(identity, options.version)?;
        fs::create_dir_all(output_dir).map_err(|e| {
            VaultError::Validation(format!(
                "cannot create output directory {}: {}",
                output_dir.display(),
                e
            ))
        })?;

        let mut report = ExportReport {
            identity: identity.clone(),
            version: record.version,
            output_dir: output_dir.to_path_buf(),
            files: BTreeMap::new(),
            verification: BTreeMap::new(),
        };
        let mut mismatches = Vec::new();
        let mut taken = BTreeSet::new();

        for part in Part::ALL {
            let content = match self.read_part(&record, part) {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    Logger::error(
                        "export.part_failed",
                        &[("part", part.as_str()), ("error", &e)],
                    );
                    report.files.insert(part, format!("{}{}", ERROR_PREFIX, e));
                    continue;
                }
            };

            let path = match write_part(output_dir, &record, part, &content, &mut taken) {
                Ok(path) => path,
                Err(e) => {
                    report.files.insert(part, format!("{}{}", ERROR_PREFIX, e));
                    continue;
                }
            };
            report.files.insert(part, path.display().to_string());

            if !options.verify {
                continue;
            }
            let Some(expected) = record.checksums.get(part) else {
                continue;
            };
            // Verify what landed on disk, not the buffer that was written.
            let actual = compute_file_checksum(&path).unwrap_or_else(|e| e.to_string());
            let matched = actual == expected;
            report.verification.insert(part, matched);
            if !matched {
                mismatches.push(Mismatch {
                    part,
                    path,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        if !mismatches.is_empty() {
            if !options.force {
                for m in &mismatches {
                    Logger::error(
                        "export.checksum_failed",
                        &[
                            ("part", m.part.as_str()),
                            ("expected", &m.expected),
                            ("actual", &m.actual),
                            ("path", &m.path.display().to_string()),
                        ],
                    );
                    if let Err(e) = fs::remove_file(&m.path) {
                        Logger::error(
                            "export.remove_failed",
                            &[("path", &m.path.display().to_string()), ("error", &e.to_string())],
                        );
                    }
                }
                return Err(VaultError::ChecksumMismatch {
                    parts: mismatches.iter().map(|m| m.part.to_string()).collect(),
                });
            }
            for m in &mismatches {
                Logger::warn(
                    "export.checksum_mismatch_forced",
                    &[
                        ("part", m.part.as_str()),
                        ("expected", &m.expected),
                        ("actual", &m.actual),
                    ],
                );
            }
        }

        Logger::info(
            "export.complete",
            &[
                ("identity", identity.as_str()),
                ("version", &report.version.to_string()),
                ("output", &output_dir.display().to_string()),
                ("files", &report.exported_count().to_string()),
                (
                    "checksums",
                    &format!("{}/{}", report.verified_count(), report.verification.len()),
                ),
            ],
        );
        Ok(report)
    }

    fn resolve(&self, identity: &Identity, version: Option<u32>) -> VaultResult<MetadataRecord> {
        match version {
            Some(version) => self.docs.find_version(identity, version, None)?.ok_or_else(|| {
                VaultError::RecordNotFound(format!(
                    "no record with identity '{}' and version {}",
                    identity, version
                ))
            }),
            None => self.docs.find_active(identity, None)?.ok_or_else(|| {
                VaultError::RecordNotFound(format!(
                    "no active record with identity '{}'",
                    identity
                ))
            }),
        }
    }

    /// Content of one part. `Ok(None)` for an absent template.
    fn read_part(&self, record: &MetadataRecord, part: Part) -> Result<Option<Vec<u8>>, String> {
        let refs = &record.file_references;
        match part {
            Part::JsonConfig => match self.docs.get_config(&refs.json_config_id) {
                Ok(Some(doc)) => Ok(Some(doc.source.into_bytes())),
                Ok(None) => Err(format!("config document {} not found", refs.json_config_id)),
                Err(e) => Err(e.to_string()),
            },
            Part::SqlFile => self.read_blob(BlobNamespace::Sql, &refs.sql_blob_id).map(Some),
            Part::Template => match &refs.template_blob_id {
                Some(id) => self.read_blob(BlobNamespace::Template, id).map(Some),
                None => Ok(None),
            },
        }
    }

    fn read_blob(&self, namespace: BlobNamespace, id: &BlobId) -> Result<Vec<u8>, String> {
        self.blobs
            .get(namespace, id)
            .map(|blob| blob.data)
            .map_err(|e| e.to_string())
    }
}

fn write_part(
    output_dir: &Path,
    record: &MetadataRecord,
    part: Part,
    content: &[u8],
    taken: &mut BTreeSet<OsString>,
) -> Result<PathBuf, String> {
    let recorded = match part {
        Part::JsonConfig => Some(record.original_files.json_config.as_str()),
        Part::SqlFile => Some(record.original_files.sql_file.as_str()),
        Part::Template => record.original_files.template.as_deref(),
    };
    // Only the final component: recorded names never escape the output dir.
    let mut filename: OsString = recorded
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| default_filename(part).into());
    if taken.contains(&filename) {
        let mut renamed = OsString::from(format!("{}_", part.as_str()));
        renamed.push(&filename);
        Logger::warn(
            "export.filename_taken",
            &[
                ("part", part.as_str()),
                ("recorded", &filename.to_string_lossy()),
                ("written_as", &renamed.to_string_lossy()),
            ],
        );
        filename = renamed;
    }
    taken.insert(filename.clone());
    let path = output_dir.join(filename);
    fs::write(&path, content).map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
    Ok(path)
}

fn default_filename(part: Part) -> &'static str {
    match part {
        Part::JsonConfig => "config.json",
        Part::SqlFile => "query.sql",
        Part::Template => "template",
    }
}
