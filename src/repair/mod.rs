//! Corruption repair
//!
//! Salvages rows from a damaged database file into a fresh destination.
//!
//! # Pieces
//!
//! - [`MasterInfo`]: a schema catalog captured from the healthy database
//!   ahead of time, or just a table-name filter
//! - [`LeafInfo`]: an optional inventory of each table's leaf pages that
//!   lets a pass skip damaged interior pages
//! - [`RepairKit`]: the session over the damaged file; `output` copies
//!   rows into a destination connection
//! - [`RepairCursor`]: the read-only row view handed to progress callbacks
//!
//! # Failure model
//!
//! Damage is counted, never fatal. A bad page drops the subtree under it,
//! a bad cell drops one row, a refused insert drops one row. A pass fails
//! only when nothing at all could be written or the destination itself
//! becomes unusable.
//!
//! ```ignore
//! let saved = MasterInfo::save(&live, "app.master", None);
//! // ... later, after corruption
//! let (master, _salt) = MasterInfo::load("app.master", None, None)?;
//! let mut kit = RepairKit::open("app.db", None, Some(&master))?;
//! let outcome = kit.output(&fresh, 0);
//! ```

mod cursor;
mod errors;
mod kit;
mod leaf;
mod master;
mod material;
mod output;
mod scanner;
mod types;

pub use cursor::{RecoveredRow, RepairCursor};
pub use errors::{RepairError, RepairErrorCode, RepairResult, Severity};
pub use kit::RepairKit;
pub use leaf::LeafInfo;
pub use master::{MasterEntry, MasterInfo, SchemaKind};
pub use output::DEFAULT_COMMIT_BATCH_ROWS;
pub use types::{
    Outcome, RowAction, Statistics, FLAG_ALL_TABLES, FLAG_CHECK_TABLE_COLUMNS,
    FLAG_NO_CREATE_TABLES, INTEGRITY_DATA, INTEGRITY_HEADER, INTEGRITY_KDF_SALT,
};
