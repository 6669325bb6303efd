//! Structured JSON logger
//!
//! - One log line = one event
//! - `event` first, `severity` second, remaining fields sorted by key
//! - Synchronous, no buffering
//! - TRACE/INFO/WARN go to stdout and ERROR goes to stderr, unless every
//!   severity is routed to stderr (the CLI keeps stdout for results)

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Per-step detail (skips, no-op purges)
    Trace = 0,
    /// Completed operations
    Info = 1,
    /// Retries, degraded modes, forced exports
    Warn = 2,
    /// Failed operations and failed compensation
    Error = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Severity::Trace,
            1 => Severity::Info,
            2 => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);
static ALL_TO_STDERR: AtomicBool = AtomicBool::new(false);

/// Where a line of the given severity goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Stdout,
    Stderr,
}

fn sink_for(severity: Severity, all_to_stderr: bool) -> Sink {
    if all_to_stderr || severity >= Severity::Error {
        Sink::Stderr
    } else {
        Sink::Stdout
    }
}

/// Process-wide structured logger.
///
/// Fields are borrowed `(key, value)` pairs; callers format numbers and
/// errors into strings at the call site.
pub struct Logger;

impl Logger {
    /// Drop every event below `severity`.
    pub fn set_min_severity(severity: Severity) {
        MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
    }

    pub fn min_severity() -> Severity {
        Severity::from_u8(MIN_SEVERITY.load(Ordering::Relaxed))
    }

    /// Send every severity to stderr.
    pub fn route_all_to_stderr(enabled: bool) {
        ALL_TO_STDERR.store(enabled, Ordering::Relaxed);
    }

    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if severity < Self::min_severity() {
            return;
        }
        let line = render(severity, event, fields);
        // Logging never fails the caller.
        let _ = match sink_for(severity, ALL_TO_STDERR.load(Ordering::Relaxed)) {
            Sink::Stdout => io::stdout().lock().write_all(line.as_bytes()),
            Sink::Stderr => io::stderr().lock().write_all(line.as_bytes()),
        };
    }

    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }
}

/// JSON string literal for `s`, quotes included.
fn quoted(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}

/// Render one newline-terminated JSON log line.
fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
    sorted.sort_by_key(|(key, _)| *key);

    let mut line = format!(
        "{{\"event\":{},\"severity\":\"{}\"",
        quoted(event),
        severity
    );
    for (key, value) in sorted {
        line.push(',');
        line.push_str(&quoted(key));
        line.push(':');
        line.push_str(&quoted(value));
    }
    line.push_str("}\n");
    line
}
