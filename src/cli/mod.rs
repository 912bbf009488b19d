//! CLI module for rescuedb
//!
//! Provides command-line interface for:
//! - repair: salvage a corrupted database into a new one
//! - save-master / scan-leaf: capture recovery material from a healthy one
//! - backup / recover: statement dumps

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, KeyArgs};
pub use commands::{backup, recover, repair, run_command, save_master, scan_leaf, RepairRequest};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};

/// Parse arguments and run the command.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let result = run_command(cli);
    if let Err(ref e) = result {
        // Best effort; the caller reports the error on stderr as well.
        let _ = write_error(e.code_str(), e.message());
    }
    result
}
