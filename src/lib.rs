//! docvault - versioned storage for config + sql + template bundles
//!
//! A bundle is identified by a deterministic identity built from its
//! regulation, config name, output file name and region. Every change
//! appends a new version; at most one version per identity is active.

pub mod bundle;
pub mod checksum;
pub mod cli;
pub mod compensator;
pub mod config;
pub mod engine;
pub mod errors;
pub mod export;
pub mod fetch;
pub mod identity;
pub mod model;
pub mod observability;
pub mod retention;
pub mod retry;
pub mod store;

pub use bundle::{BundleSpec, ConfigPart, FilePart, PartialBundle, SeedManifest};
pub use config::VaultConfig;
pub use engine::{SeedOutcome, SeedSummary, StandaloneModify, VersioningEngine};
pub use errors::{VaultError, VaultResult};
pub use export::{ExportOptions, ExportReport, ExportVerifier};
pub use fetch::FetchService;
pub use identity::Identity;
pub use retention::{AgePurgeReport, PurgeAllReport, PurgeReport, RetentionManager};
pub use retry::RetryPolicy;
