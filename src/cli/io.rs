//! JSON output for the CLI
//!
//! - Success: `{"status": "ok", "data": ...}` on stdout
//! - Failure: `{"status": "error", "code": ..., "message": ...}` on stdout
//! - Pretty-printed, UTF-8

use std::io::{self, Write};

use serde::Serialize;
use serde_json::{json, Value};

use super::errors::CliResult;

/// Wrap a result payload in the success envelope.
pub fn ok_envelope<T: Serialize>(data: &T) -> CliResult<Value> {
    Ok(json!({
        "status": "ok",
        "data": serde_json::to_value(data)?,
    }))
}

pub fn error_envelope(code: &str, message: &str) -> Value {
    json!({
        "status": "error",
        "code": code,
        "message": message,
    })
}

/// Write a success response to stdout
pub fn write_response<T: Serialize>(data: &T) -> CliResult<()> {
    write_value(&ok_envelope(data)?)
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_value(&error_envelope(code, message))
}

fn write_value(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelopes() {
        let ok = ok_envelope(&json!({"version": 2})).unwrap();
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["data"]["version"], 2);

        let err = error_envelope("DOCVAULT_VALIDATION", "bad");
        assert_eq!(err["status"], "error");
        assert_eq!(err["code"], "DOCVAULT_VALIDATION");
    }
}
