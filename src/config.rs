//! Vault configuration file (`docvault.json`)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::StandaloneModify;
use crate::errors::{VaultError, VaultResult};
use crate::retry::RetryPolicy;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "docvault.json";

/// Retry settings for transient store failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            self.backoff_factor,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root of the local stores (required)
    pub data_dir: PathBuf,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Behavior of `modify` without transaction support
    #[serde(default)]
    pub standalone_modify: StandaloneModify,

    /// `purge` keep count when none is given
    #[serde(default = "default_keep_versions")]
    pub default_keep_versions: usize,

    /// `purge --max-age-days` when none is given
    #[serde(default = "default_max_age_days")]
    pub default_max_age_days: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_keep_versions() -> usize {
    3
}
fn default_max_age_days() -> u32 {
    90
}

impl VaultConfig {
    /// Defaults rooted at `data_dir`.
    pub fn default_at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            retry: RetryConfig::default(),
            standalone_modify: StandaloneModify::default(),
            default_keep_versions: default_keep_versions(),
            default_max_age_days: default_max_age_days(),
        }
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> VaultResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            VaultError::Validation(format!("failed to read config {}: {}", path.display(), e))
        })?;

        let mut config: VaultConfig = serde_json::from_str(&content)
            .map_err(|e| VaultError::Validation(format!("invalid config JSON: {}", e)))?;

        // A relative data_dir is relative to the config file.
        if config.data_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.data_dir = parent.join(&config.data_dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(VaultError::Validation("data_dir must not be empty".to_string()));
        }

        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(VaultError::Validation(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(VaultError::Validation(format!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        if self.default_keep_versions == 0 {
            return Err(VaultError::Validation(
                "default_keep_versions must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }
}
