//! Flags, result codes and statistics of a repair pass

use serde::Serialize;

/// Never run CREATE TABLE / CREATE INDEX against the destination.
pub const FLAG_NO_CREATE_TABLES: u32 = 0x0001;
/// Recover every discoverable table, ignoring name filters.
pub const FLAG_ALL_TABLES: u32 = 0x0002;
/// Reject rows wider than the backed-up CREATE TABLE.
pub const FLAG_CHECK_TABLE_COLUMNS: u32 = 0x0004;

/// Header fields decoded.
pub const INTEGRITY_HEADER: u32 = 0x0001;
/// Schema tree on page 1 walked without damage.
pub const INTEGRITY_DATA: u32 = 0x0002;
/// The file's own KDF salt opened it.
pub const INTEGRITY_KDF_SALT: u32 = 0x0004;

/// Call-level result of `output` and `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Ok,
    Canceled,
    Failed,
}

impl Outcome {
    pub fn code(&self) -> i32 {
        match self {
            Outcome::Ok => 0,
            Outcome::Canceled => 1,
            Outcome::Failed => -1,
        }
    }
}

/// Per-row answer of a progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    /// Write the row
    Accept,
    /// Drop the row and continue
    Ignore,
    /// Stop the whole pass
    Cancel,
}

impl RowAction {
    pub fn code(&self) -> i32 {
        match self {
            RowAction::Accept => 0,
            RowAction::Cancel => 1,
            RowAction::Ignore => 2,
        }
    }
}

/// Page counters of the last pass.
///
/// - `total_pages`: pages in the file
/// - `valid_pages`: pages reached this pass that decoded structurally
/// - `parsed_pages`: table leaves whose cells were decoded
/// - `damaged_pages`: pages reached this pass that failed structural checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total_pages: u32,
    pub valid_pages: u32,
    pub parsed_pages: u32,
    pub damaged_pages: u32,
}
