//! CLI argument definitions using clap
//!
//! Commands:
//! - docvault create / modify / seed
//! - docvault get / history / list
//! - docvault export
//! - docvault purge

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;

/// docvault - versioned storage for config + sql + template bundles
#[derive(Parser, Debug)]
#[command(name = "docvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Emit INFO and TRACE log events (on stderr)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Business labels that, with the config's name and outFileName, form the identity.
#[derive(Args, Debug)]
pub struct Labels {
    /// Project id
    #[arg(long)]
    pub csi_id: String,

    #[arg(long)]
    pub region: String,

    #[arg(long)]
    pub regulation: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store version 1 of a new bundle
    Create {
        #[command(flatten)]
        labels: Labels,

        /// JSON config file (must contain name and outFileName)
        #[arg(long)]
        json_config: PathBuf,

        #[arg(long)]
        sql_file: PathBuf,

        #[arg(long)]
        template: Option<PathBuf>,
    },

    /// Append a new version replacing the given parts
    Modify {
        #[arg(long)]
        unique_id: String,

        #[arg(long)]
        json_config: Option<PathBuf>,

        #[arg(long)]
        sql_file: Option<PathBuf>,

        #[arg(long, conflicts_with = "remove_template")]
        template: Option<PathBuf>,

        /// Drop the template from the new version
        #[arg(long)]
        remove_template: bool,
    },

    /// Create, update or skip every bundle of a JSON manifest
    Seed {
        /// Manifest file: {"bundles": [...]}
        manifest: PathBuf,
    },

    /// Show the active record (or a given version)
    Get {
        #[arg(long)]
        unique_id: String,

        #[arg(long)]
        version: Option<u32>,
    },

    /// Show every version of an identity, oldest first
    History {
        #[arg(long)]
        unique_id: String,
    },

    /// List records
    List {
        #[arg(long)]
        csi_id: Option<String>,

        #[arg(long)]
        region: Option<String>,

        #[arg(long)]
        regulation: Option<String>,

        /// Include inactive versions
        #[arg(long)]
        all_versions: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Write a stored version to a directory, verifying checksums
    Export {
        #[arg(long)]
        unique_id: String,

        #[arg(long)]
        version: Option<u32>,

        #[arg(long, short)]
        output_dir: PathBuf,

        /// Skip checksum verification
        #[arg(long)]
        no_verify: bool,

        /// Keep parts that fail verification
        #[arg(long)]
        force: bool,
    },

    /// Remove historical versions
    Purge {
        #[arg(long, conflicts_with_all = ["all", "max_age_days"])]
        unique_id: Option<String>,

        /// Apply the keep-count policy to every identity
        #[arg(long, conflicts_with = "max_age_days")]
        all: bool,

        /// Purge inactive versions older than this many days
        /// (the configured default when no value is given)
        #[arg(long, num_args = 0..=1)]
        max_age_days: Option<Option<u32>>,

        /// Versions to keep per identity (active included)
        #[arg(long)]
        keep: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "docvault",
            "create",
            "--csi-id",
            "CSI-1",
            "--region",
            "APAC",
            "--regulation",
            "MAS-TRM",
            "--json-config",
            "c.json",
            "--sql-file",
            "q.sql",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        match cli.command {
            Command::Create {
                labels, template, ..
            } => {
                assert_eq!(labels.region, "APAC");
                assert!(template.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_purge_modes_conflict() {
        assert!(Cli::try_parse_from(["docvault", "purge", "--all", "--max-age-days", "5"]).is_err());
        assert!(
            Cli::try_parse_from(["docvault", "purge", "--unique-id", "x", "--all"]).is_err()
        );
        assert!(Cli::try_parse_from(["docvault", "--verbose", "purge", "--all", "--dry-run"]).is_ok());

        let cli = Cli::try_parse_from(["docvault", "purge", "--max-age-days"]).unwrap();
        match cli.command {
            Command::Purge { max_age_days, .. } => assert_eq!(max_age_days, Some(None)),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_modify_template_flags_conflict() {
        assert!(Cli::try_parse_from([
            "docvault",
            "modify",
            "--unique-id",
            "x",
            "--template",
            "t.html",
            "--remove-template",
        ])
        .is_err());
    }
}
