//! CLI module for docvault
//!
//! Presentation layer over the core: parses arguments, opens the local
//! stores named by the config file, runs one operation and prints the
//! result as a JSON envelope.

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, Labels};
pub use commands::{load_config, run, run_command, Vault};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{error_envelope, ok_envelope, write_error, write_response};
