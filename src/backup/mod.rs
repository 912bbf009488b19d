//! Statement dumps
//!
//! [`BackupKit`] writes a healthy database out as a compressed stream of
//! statements and bound rows; [`RecoverKit`] replays such a stream into
//! another database. Unlike repair, this path never reads pages: it only
//! works from a dump taken while the source was readable.
//!
//! # Replay order
//!
//! Tables come first, each as its CREATE TABLE followed by its rows.
//! `sqlite_sequence` is cleared and refilled in place. Indices, triggers
//! and views follow the data so they are built once.
//!
//! # Important
//!
//! A replay runs with foreign keys off and commits every
//! [`RECOVER_BATCH_ROWS`] successful rows when it owns the transaction.

mod dump;
mod errors;
mod format;
mod recover;

pub use dump::{BackupKit, TableFilter, FLAG_NO_CREATE_TABLE};
pub use errors::{BackupError, BackupErrorCode, BackupResult, Severity};
pub use format::{DumpHeader, Token, DUMP_MAGIC, DUMP_VERSION};
pub use recover::{RecoverKit, RECOVER_BATCH_ROWS};
