//! Bundle inputs and validation
//!
//! Everything here runs before any store is touched. A `BundleSpec` is a
//! fully loaded, validated bundle: the config is parsed and carries the two
//! fields the identity needs, and every file has been read into memory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::checksum::compute_checksum;
use crate::errors::{VaultError, VaultResult};
use crate::identity::Identity;

/// Content type recorded for sql parts.
pub const SQL_CONTENT_TYPE: &str = "application/sql";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Guess a content type from a file extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("sql") => SQL_CONTENT_TYPE,
        Some("html") | Some("htm") => "text/html",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

fn file_name_of(path: &Path) -> VaultResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| VaultError::Validation(format!("invalid file name: {}", path.display())))
}

/// Require `path` to be an existing regular file.
pub fn validate_file_exists(path: &Path, label: &str) -> VaultResult<PathBuf> {
    if !path.exists() {
        return Err(VaultError::Validation(format!(
            "{} not found: {}",
            label,
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(VaultError::Validation(format!(
            "{} is not a file: {}",
            label,
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

fn read_file(path: &Path, label: &str) -> VaultResult<Vec<u8>> {
    fs::read(path)
        .map_err(|e| VaultError::Validation(format!("cannot read {} {}: {}", label, path.display(), e)))
}

/// Structured config part.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPart {
    pub filename: String,
    /// Exact text as supplied; checksums and exports cover these bytes.
    pub source: String,
    pub value: Value,
}

impl ConfigPart {
    /// Parse a config from its text.
    ///
    /// The config must be a JSON object with non-empty string `name` and
    /// `outFileName` fields.
    pub fn parse(filename: impl Into<String>, source: impl Into<String>) -> VaultResult<Self> {
        let filename = filename.into();
        let source = source.into();
        let value: Value = serde_json::from_str(&source)
            .map_err(|e| VaultError::Validation(format!("invalid JSON in {}: {}", filename, e)))?;

        let object = value.as_object().ok_or_else(|| {
            VaultError::Validation(format!("JSON config {} must be an object", filename))
        })?;

        let missing: Vec<&str> = ["name", "outFileName"]
            .into_iter()
            .filter(|field| {
                object
                    .get(*field)
                    .and_then(Value::as_str)
                    .map_or(true, |s| s.trim().is_empty())
            })
            .collect();
        if !missing.is_empty() {
            return Err(VaultError::Validation(format!(
                "JSON config {} is missing required fields: {}",
                filename,
                missing.join(", ")
            )));
        }

        Ok(Self {
            filename,
            source,
            value,
        })
    }

    /// Load and parse a `.json` config file.
    pub fn load(path: &Path) -> VaultResult<Self> {
        validate_file_exists(path, "JSON config")?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));
        if !is_json {
            return Err(VaultError::Validation(format!(
                "JSON config must be a .json file: {}",
                path.display()
            )));
        }
        let bytes = read_file(path, "JSON config")?;
        let source = String::from_utf8(bytes).map_err(|_| {
            VaultError::Validation(format!("JSON config is not UTF-8: {}", path.display()))
        })?;
        Self::parse(file_name_of(path)?, source)
    }

    pub fn name(&self) -> &str {
        self.value["name"].as_str().unwrap_or_default()
    }

    pub fn out_file_name(&self) -> &str {
        self.value["outFileName"].as_str().unwrap_or_default()
    }

    pub fn checksum(&self) -> String {
        compute_checksum(self.source.as_bytes())
    }

    pub fn size(&self) -> u64 {
        self.source.len() as u64
    }
}

/// Binary part (sql file or template).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl FilePart {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Load an sql file.
    pub fn load_sql(path: &Path) -> VaultResult<Self> {
        validate_file_exists(path, "SQL file")?;
        Ok(Self::new(
            file_name_of(path)?,
            SQL_CONTENT_TYPE,
            read_file(path, "SQL file")?,
        ))
    }

    /// Load a template file, guessing its content type from the extension.
    pub fn load_template(path: &Path) -> VaultResult<Self> {
        validate_file_exists(path, "Template")?;
        let filename = file_name_of(path)?;
        let content_type = content_type_for(&filename);
        Ok(Self::new(filename, content_type, read_file(path, "Template")?))
    }

    pub fn checksum(&self) -> String {
        compute_checksum(&self.data)
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A complete bundle for `create` / `seed_one`.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSpec {
    pub csi_id: String,
    pub regulation: String,
    pub region: String,
    pub config: ConfigPart,
    pub sql: FilePart,
    pub template: Option<FilePart>,
}

impl BundleSpec {
    /// Load a bundle from files on disk.
    pub fn from_paths(
        csi_id: &str,
        region: &str,
        regulation: &str,
        config: &Path,
        sql: &Path,
        template: Option<&Path>,
    ) -> VaultResult<Self> {
        Ok(Self {
            csi_id: csi_id.to_string(),
            regulation: regulation.to_string(),
            region: region.to_string(),
            config: ConfigPart::load(config)?,
            sql: FilePart::load_sql(sql)?,
            template: template.map(FilePart::load_template).transpose()?,
        })
    }

    /// Identity derived from regulation, config name, config outFileName and region.
    pub fn identity(&self) -> VaultResult<Identity> {
        Identity::build(
            &self.regulation,
            self.config.name(),
            self.config.out_file_name(),
            &self.region,
        )
    }

    /// Label used in batch error reports.
    pub fn label(&self, index: usize) -> String {
        batch_label(&self.csi_id, index)
    }
}

/// The csi id, or `bundle-<index>` when it is blank.
fn batch_label(csi_id: &str, index: usize) -> String {
    if csi_id.trim().is_empty() {
        format!("bundle-{}", index)
    } else {
        csi_id.to_string()
    }
}

/// Replacement parts for `modify`. At least one change must be present.
///
/// Absent parts are carried over from the current version. `clear_template`
/// drops the template instead; it is ignored when `template` is supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialBundle {
    pub config: Option<ConfigPart>,
    pub sql: Option<FilePart>,
    pub template: Option<FilePart>,
    pub clear_template: bool,
}

impl PartialBundle {
    pub fn is_empty(&self) -> bool {
        self.config.is_none() && self.sql.is_none() && self.template.is_none() && !self.clear_template
    }

    /// Load replacement parts from whichever paths are given.
    pub fn from_paths(
        config: Option<&Path>,
        sql: Option<&Path>,
        template: Option<&Path>,
    ) -> VaultResult<Self> {
        Ok(Self {
            config: config.map(ConfigPart::load).transpose()?,
            sql: sql.map(FilePart::load_sql).transpose()?,
            template: template.map(FilePart::load_template).transpose()?,
            clear_template: false,
        })
    }
}

/// One bundle entry of a seed manifest. Paths are relative to the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub csi_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub regulation: String,
    #[serde(default)]
    pub json_config: String,
    #[serde(default)]
    pub sql_file: String,
    #[serde(default)]
    pub template: Option<String>,
}

impl ManifestEntry {
    /// Validate required keys and load every referenced file.
    pub fn resolve(&self, base_dir: &Path) -> VaultResult<BundleSpec> {
        let required = [
            ("csi_id", &self.csi_id),
            ("region", &self.region),
            ("regulation", &self.regulation),
            ("json_config", &self.json_config),
            ("sql_file", &self.sql_file),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(VaultError::Validation(format!(
                "seed bundle missing required keys: {}",
                missing.join(", ")
            )));
        }

        let template = self
            .template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| base_dir.join(t));

        BundleSpec::from_paths(
            &self.csi_id,
            &self.region,
            &self.regulation,
            &base_dir.join(&self.json_config),
            &base_dir.join(&self.sql_file),
            template.as_deref(),
        )
    }

    /// Label used in batch error reports.
    pub fn label(&self, index: usize) -> String {
        batch_label(&self.csi_id, index)
    }
}

/// Seed manifest: `{ "bundles": [ ... ] }`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedManifest {
    #[serde(default)]
    pub bundles: Vec<ManifestEntry>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl SeedManifest {
    /// Load a manifest file. Empty or missing `bundles` is a validation error.
    pub fn load(path: &Path) -> VaultResult<Self> {
        validate_file_exists(path, "Manifest")?;
        let bytes = read_file(path, "manifest")?;
        let mut manifest: SeedManifest = serde_json::from_slice(&bytes).map_err(|e| {
            VaultError::Validation(format!("invalid manifest {}: {}", path.display(), e))
        })?;
        if manifest.bundles.is_empty() {
            return Err(VaultError::Validation(
                "manifest 'bundles' must be a non-empty list".to_string(),
            ));
        }
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(manifest)
    }
}
