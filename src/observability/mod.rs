//! Observability for docvault
//!
//! Structured JSON logging only. Every core operation logs its outcome as a
//! single event; degraded modes (no transactions, compensation failures) are
//! logged at WARN or ERROR and never silently masked.
//!
//! ```ignore
//! use docvault::observability::Logger;
//!
//! Logger::info("engine.created", &[("identity", "mas-trm_report_out_apac"), ("version", "1")]);
//! ```

mod logger;

pub use logger::{Logger, Severity};
