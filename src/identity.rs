//! Deterministic bundle identity
//!
//! An identity is `regulation_name_outFileName_region`, each component
//! normalized: trimmed, lowercased, whitespace runs collapsed to `_`, then
//! everything outside `[a-z0-9_-]` stripped.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{VaultError, VaultResult};

/// Normalized composite key of a document bundle. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Derive the identity from its four business attributes.
    ///
    /// # Errors
    ///
    /// `Validation` naming the first field that normalizes to an empty string.
    pub fn build(
        regulation: &str,
        name: &str,
        out_file_name: &str,
        region: &str,
    ) -> VaultResult<Self> {
        let parts = [
            ("regulation", normalize(regulation)),
            ("name", normalize(name)),
            ("out_file_name", normalize(out_file_name)),
            ("region", normalize(region)),
        ];

        for (field, value) in &parts {
            if value.is_empty() {
                return Err(VaultError::Validation(format!(
                    "cannot build identity: '{}' is empty after normalization",
                    field
                )));
            }
        }

        Ok(Identity(format!(
            "{}_{}_{}_{}",
            parts[0].1, parts[1].1, parts[2].1, parts[3].1
        )))
    }

    /// Wrap an identity string received from a caller or a stored record.
    pub fn from_existing(value: impl Into<String>) -> Self {
        Identity(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn disallowed_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_\-]").expect("static regex"))
}

fn normalize(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let underscored = whitespace_runs().replace_all(&lowered, "_");
    disallowed_chars().replace_all(&underscored, "").into_owned()
}
