//! Errors surfaced by the docvault binary
//!
//! Every failure carries a stable code string. Core failures keep the
//! `DOCVAULT_*` code of the underlying `VaultError`; failures that happen
//! before a core call (config, stores, stdout) get a `DOCVAULT_CLI_*` code.

use std::fmt;
use std::io;

use crate::errors::VaultError;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Config file missing, unreadable or invalid
    ConfigError,
    /// Data directory or stdout failure
    IoError,
    /// Arguments that clap accepts but no command can run
    UsageError,
    /// A core operation failed with this code
    OperationFailed(&'static str),
}

impl CliErrorCode {
    pub fn as_str(&self) -> &'static str {
        match *self {
            CliErrorCode::ConfigError => "DOCVAULT_CLI_CONFIG_ERROR",
            CliErrorCode::IoError => "DOCVAULT_CLI_IO_ERROR",
            CliErrorCode::UsageError => "DOCVAULT_CLI_USAGE_ERROR",
            CliErrorCode::OperationFailed(code) => code,
        }
    }
}

/// A coded, human-readable failure printed in the error envelope.
#[derive(Debug)]
pub struct CliError {
    kind: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(kind: CliErrorCode, message: impl Into<String>) -> Self {
        CliError {
            kind,
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        CliError::new(CliErrorCode::ConfigError, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        CliError::new(CliErrorCode::IoError, message)
    }

    pub fn usage(message: impl Into<String>) -> Self {
        CliError::new(CliErrorCode::UsageError, message)
    }

    pub fn kind(&self) -> CliErrorCode {
        self.kind
    }

    pub fn code_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::io_error(format!("cannot encode response: {}", e))
    }
}

impl From<VaultError> for CliError {
    fn from(e: VaultError) -> Self {
        // Keep the cause chain visible on the command line.
        let mut message = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(CliErrorCode::OperationFailed(e.code()), message)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        Self::io_error(format!("cannot open store: {}", e))
    }
}

pub type CliResult<T> = Result<T, CliError>;
