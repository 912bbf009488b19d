//! CLI argument definitions using clap
//!
//! Commands:
//! - rescuedb repair <corrupt> <dest> [--master <file>] [--leaf <file>]
//! - rescuedb save-master <db> <out> [--salt-from <encrypted>]
//! - rescuedb scan-leaf <db> <out>
//! - rescuedb backup <db> <out>
//! - rescuedb recover <dump> <dest>

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// rescuedb - salvage rows from corrupted SQLite databases
#[derive(Parser, Debug)]
#[command(name = "rescuedb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (defaults apply without one)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Passphrase options shared by the commands that read or write key
/// material.
#[derive(Args, Debug, Clone, Default)]
pub struct KeyArgs {
    /// Passphrase for an encrypted database or material file
    #[arg(long)]
    pub key: Option<String>,
}

impl KeyArgs {
    pub fn bytes(&self) -> Option<&[u8]> {
        self.key.as_deref().map(str::as_bytes)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy every readable row of a corrupted database into a new one
    Repair {
        /// Corrupted database file
        corrupt: PathBuf,

        /// Destination database, created if missing
        dest: PathBuf,

        /// Schema catalog written by `save-master`
        #[arg(long)]
        master: Option<PathBuf>,

        /// Passphrase of the schema catalog, if different from --key
        #[arg(long)]
        master_key: Option<String>,

        /// Leaf inventory written by `scan-leaf`
        #[arg(long)]
        leaf: Option<PathBuf>,

        /// Restrict recovery to these tables (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Never create tables or indices in the destination
        #[arg(long)]
        no_create: bool,

        /// Recover every table found, ignoring --table and catalog filters
        #[arg(long)]
        all_tables: bool,

        /// Reject rows wider than the recovered CREATE TABLE
        #[arg(long)]
        check_columns: bool,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Save the schema of a healthy database for later repair
    SaveMaster {
        db: PathBuf,
        out: PathBuf,

        /// Encrypted copy of `db` whose KDF salt is recorded in the catalog
        #[arg(long)]
        salt_from: Option<PathBuf>,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Record the leaf pages of each table of a healthy database
    ScanLeaf {
        db: PathBuf,
        out: PathBuf,

        /// Only scan these tables (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,
    },

    /// Dump a healthy database to a compressed statement stream
    Backup {
        db: PathBuf,
        out: PathBuf,

        /// Only dump these tables (repeatable); `name:condition` filters rows
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Leave CREATE TABLE statements out of the dump
        #[arg(long)]
        no_create: bool,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Replay a dump written by `backup` into a database
    Recover {
        dump: PathBuf,
        dest: PathBuf,

        /// Stop at the first failing statement
        #[arg(long)]
        fatal: bool,

        #[command(flatten)]
        key: KeyArgs,
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
    fn test_repair_args() {
        let cli = Cli::try_parse_from([
            "rescuedb", "repair", "bad.db", "new.db", "--master", "app.master", "--table", "a",
            "--table", "b", "--no-create",
        ])
        .unwrap();
        match cli.command {
            Command::Repair {
                master,
                tables,
                no_create,
                all_tables,
                ..
            } => {
                assert_eq!(master, Some(PathBuf::from("app.master")));
                assert_eq!(tables, vec!["a".to_string(), "b".to_string()]);
                assert!(no_create);
                assert!(!all_tables);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_save_master_salt_source() {
        let cli = Cli::try_parse_from([
            "rescuedb", "save-master", "app.db", "app.master", "--salt-from", "app.enc",
        ])
        .unwrap();
        match cli.command {
            Command::SaveMaster { salt_from, .. } => {
                assert_eq!(salt_from, Some(PathBuf::from("app.enc")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["rescuedb", "recover", "a.dump", "b.db", "--config", "c.json"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
    }
}
