//! CLI command implementations
//!
//! The CLI owns the store lifecycle: it opens the local stores under the
//! configured data directory and hands explicit handles to the core.

use std::path::Path;

use serde_json::json;

use crate::bundle::{BundleSpec, PartialBundle, SeedManifest};
use crate::config::{VaultConfig, DEFAULT_CONFIG_FILE};
use crate::engine::VersioningEngine;
use crate::export::{ExportOptions, ExportVerifier};
use crate::fetch::FetchService;
use crate::identity::Identity;
use crate::observability::{Logger, Severity};
use crate::retention::RetentionManager;
use crate::retry::RetryPolicy;
use crate::store::{LocalBlobStore, LocalDocumentStore, RecordFilter};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Data directory used when no config file exists at the default path.
const FALLBACK_DATA_DIR: &str = "docvault-data";

/// Open stores plus the settings that drive the core.
pub struct Vault {
    config: VaultConfig,
    docs: LocalDocumentStore,
    blobs: LocalBlobStore,
    retry: RetryPolicy,
}

impl Vault {
    pub fn open(config: VaultConfig) -> CliResult<Self> {
        let docs = LocalDocumentStore::open(&config.data_dir)?;
        let blobs = LocalBlobStore::open(&config.data_dir)?;
        let retry = config.retry_policy();
        Ok(Self {
            config,
            docs,
            blobs,
            retry,
        })
    }

    pub fn engine(&self) -> VersioningEngine<'_> {
        VersioningEngine::new(&self.docs, &self.blobs, &self.retry)
            .with_standalone_modify(self.config.standalone_modify)
    }

    pub fn fetch(&self) -> FetchService<'_> {
        FetchService::new(&self.docs, &self.retry)
    }

    pub fn retention(&self) -> RetentionManager<'_> {
        RetentionManager::new(&self.docs, &self.blobs, &self.retry)
    }

    pub fn exporter(&self) -> ExportVerifier<'_> {
        ExportVerifier::new(&self.docs, &self.blobs, &self.retry)
    }
}

/// Parse arguments, run the command, print the JSON envelope.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();

    Logger::route_all_to_stderr(true);
    Logger::set_min_severity(if cli.verbose {
        Severity::Trace
    } else {
        Severity::Warn
    });

    let result = load_config(&cli.config)
        .and_then(Vault::open)
        .and_then(|vault| run_command(&vault, cli.command));

    if let Err(e) = &result {
        write_error(e.code_str(), e.message())?;
    }
    result
}

/// Load the config file; a missing file at the default path falls back to
/// defaults rooted at `./docvault-data`.
pub fn load_config(path: &Path) -> CliResult<VaultConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_FILE) {
        Logger::warn(
            "cli.config_default",
            &[("config", DEFAULT_CONFIG_FILE), ("data_dir", FALLBACK_DATA_DIR)],
        );
        return Ok(VaultConfig::default_at(FALLBACK_DATA_DIR));
    }
    VaultConfig::load(path).map_err(|e| CliError::config_error(e.to_string()))
}

/// Run a command
pub fn run_command(vault: &Vault, cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Create {
            labels,
            json_config,
            sql_file,
            template,
        } => {
            let bundle = BundleSpec::from_paths(
                &labels.csi_id,
                &labels.region,
                &labels.regulation,
                &json_config,
                &sql_file,
                template.as_deref(),
            )?;
            let identity = vault.engine().create(&bundle)?;
            write_response(&json!({"unique_id": identity, "version": 1}))
        }

        Command::Modify {
            unique_id,
            json_config,
            sql_file,
            template,
            remove_template,
        } => {
            let identity = Identity::from_existing(unique_id);
            let mut partial = PartialBundle::from_paths(
                json_config.as_deref(),
                sql_file.as_deref(),
                template.as_deref(),
            )?;
            partial.clear_template = remove_template;
            let version = vault.engine().modify(&identity, &partial)?;
            write_response(&json!({"unique_id": identity, "version": version}))
        }

        Command::Seed { manifest } => {
            let manifest = SeedManifest::load(&manifest)?;
            let summary = vault.engine().seed_manifest(&manifest);
            write_response(&summary)
        }

        Command::Get { unique_id, version } => {
            let identity = Identity::from_existing(unique_id);
            let record = match version {
                Some(version) => vault.fetch().version(&identity, version)?,
                None => vault.fetch().active(&identity)?,
            };
            write_response(&record)
        }

        Command::History { unique_id } => {
            let records = vault.fetch().history(&Identity::from_existing(unique_id))?;
            write_response(&records)
        }

        Command::List {
            csi_id,
            region,
            regulation,
            all_versions,
            limit,
        } => {
            let filter = RecordFilter {
                csi_id,
                region,
                regulation,
                ..RecordFilter::default()
            };
            let records = vault.fetch().find(filter, !all_versions, limit)?;
            write_response(&records)
        }

        Command::Export {
            unique_id,
            version,
            output_dir,
            no_verify,
            force,
        } => {
            let options = ExportOptions {
                version,
                verify: !no_verify,
                force,
            };
            let report = vault.exporter().export(
                &Identity::from_existing(unique_id),
                &output_dir,
                options,
            )?;
            write_response(&report)
        }

        Command::Purge {
            unique_id,
            all,
            max_age_days,
            keep,
            dry_run,
        } => {
            let keep = keep.unwrap_or(vault.config.default_keep_versions);
            let retention = vault.retention();
            if let Some(unique_id) = unique_id {
                let report =
                    retention.purge_by_count(&Identity::from_existing(unique_id), keep, dry_run)?;
                write_response(&report)
            } else if all {
                write_response(&retention.purge_all(keep, dry_run)?)
            } else if let Some(days) = max_age_days {
                let days = days.unwrap_or(vault.config.default_max_age_days);
                write_response(&retention.purge_by_age(days, dry_run)?)
            } else {
                Err(CliError::usage(
                    "one of --unique-id, --all or --max-age-days is required",
                ))
            }
        }
    }
}
