//! Persisted data model
//!
//! A bundle version is one `MetadataRecord` referencing one `ConfigDocument`
//! and one or two blobs. Records are append-only: after insert, the only
//! mutations are flipping `active` true→false and appending audit entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identity::Identity;
use crate::store::BlobId;

/// One of the three parts of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    JsonConfig,
    SqlFile,
    Template,
}

impl Part {
    pub const ALL: [Part; 3] = [Part::JsonConfig, Part::SqlFile, Part::Template];

    pub fn as_str(&self) -> &'static str {
        match self {
            Part::JsonConfig => "json_config",
            Part::SqlFile => "sql_file",
            Part::Template => "template",
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    Modified,
    Deactivated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "CREATED",
            AuditAction::Modified => "MODIFIED",
            AuditAction::Deactivated => "DEACTIVATED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit log entry. Never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

impl AuditEntry {
    pub fn now(action: AuditAction, details: impl Into<String>) -> Self {
        Self {
            action,
            timestamp: Utc::now(),
            details: details.into(),
        }
    }
}

/// Original filenames of each part as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalFiles {
    pub json_config: String,
    pub sql_file: String,
    pub template: Option<String>,
}

/// Storage references of each part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReferences {
    pub json_config_id: String,
    pub sql_blob_id: BlobId,
    pub template_blob_id: Option<BlobId>,
}

/// `sha256:<hex>` checksum of each part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub json_config: String,
    pub sql_file: String,
    pub template: Option<String>,
}

impl Checksums {
    pub fn get(&self, part: Part) -> Option<&str> {
        match part {
            Part::JsonConfig => Some(&self.json_config),
            Part::SqlFile => Some(&self.sql_file),
            Part::Template => self.template.as_deref(),
        }
    }
}

/// Byte size of each part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSizes {
    pub json_config: u64,
    pub sql_file: u64,
    pub template: Option<u64>,
}

/// One version of one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Store-level record id (unique across all identities and versions).
    pub id: String,
    pub identity: Identity,
    pub csi_id: String,
    pub region: String,
    pub regulation: String,
    pub name: String,
    pub out_file_name: String,
    pub version: u32,
    pub active: bool,
    pub original_files: OriginalFiles,
    pub file_references: FileReferences,
    pub checksums: Checksums,
    pub file_sizes: FileSizes,
    pub uploaded_at: DateTime<Utc>,
    pub audit_log: Vec<AuditEntry>,
}

/// Structured config of one bundle version. Immutable once written.
///
/// `config` is the parsed tree; `source` is the exact text it was parsed from,
/// which is what the recorded checksum covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub id: String,
    pub identity: Identity,
    pub config: Value,
    pub source: String,
    pub version: u32,
    pub uploaded_at: DateTime<Utc>,
}

impl ConfigDocument {
    pub fn new(identity: Identity, config: Value, source: String, version: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity,
            config,
            source,
            version,
            uploaded_at: Utc::now(),
        }
    }
}

pub(crate) fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}
