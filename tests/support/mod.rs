//! Shared fixtures for integration tests

#![allow(dead_code)]

use docvault::bundle::SQL_CONTENT_TYPE;
use docvault::{BundleSpec, ConfigPart, FilePart, PartialBundle, RetryPolicy};

pub const CONFIG_SOURCE: &str = r#"{
  "name": "Compliance Report",
  "outFileName": "mas_output",
  "columns": ["account", "balance"]
}"#;

pub const SQL_V1: &str = "SELECT account, balance FROM ledger;";
pub const SQL_V2: &str = "SELECT account, balance FROM ledger WHERE balance > 0;";
pub const TEMPLATE_V1: &str = "<html><body>{{rows}}</body></html>";

pub const REFERENCE_IDENTITY: &str = "mas-trm_compliance_report_mas_output_apac";

pub fn config_part(source: &str) -> ConfigPart {
    ConfigPart::parse("report.json", source).unwrap()
}

pub fn sql_part(text: &str) -> FilePart {
    FilePart::new("query.sql", SQL_CONTENT_TYPE, text.as_bytes())
}

pub fn template_part(text: &str) -> FilePart {
    FilePart::new("report.html", "text/html", text.as_bytes())
}

/// The reference bundle: MAS-TRM / Compliance Report / mas_output / APAC.
pub fn reference_bundle() -> BundleSpec {
    BundleSpec {
        csi_id: "CSI-100".to_string(),
        regulation: "MAS-TRM".to_string(),
        region: "APAC".to_string(),
        config: config_part(CONFIG_SOURCE),
        sql: sql_part(SQL_V1),
        template: Some(template_part(TEMPLATE_V1)),
    }
}

/// A bundle with its own identity, derived from `name`.
pub fn named_bundle(name: &str) -> BundleSpec {
    let source = format!(r#"{{"name": "{}", "outFileName": "out"}}"#, name);
    BundleSpec {
        csi_id: format!("CSI-{}", name),
        regulation: "GDPR".to_string(),
        region: "EU".to_string(),
        config: config_part(&source),
        sql: sql_part(&format!("SELECT '{}';", name)),
        template: None,
    }
}

pub fn sql_only(text: &str) -> PartialBundle {
    PartialBundle {
        sql: Some(sql_part(text)),
        ..PartialBundle::default()
    }
}

/// Retry policy whose backoff never sleeps.
pub fn instant_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retries,
        std::time::Duration::from_millis(500),
        2.0,
        std::time::Duration::from_secs(10),
    )
    .with_sleeper(|_| {})
}
