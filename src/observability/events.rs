//! Observable lifecycle events
//!
//! Events are explicit and typed. Each maps to a stable upper-case name
//! and a default severity.

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Repair sessions
    /// Corrupted source opened
    RepairOpen,
    /// Source could not be opened
    RepairOpenFailed,
    /// output() started
    RepairOutputBegin,
    /// output() finished
    RepairOutputDone,
    /// output() stopped by cancellation
    RepairCanceled,
    /// A b-tree page failed structural checks
    PageDamaged,
    /// A cell could not be decoded into a row
    CellDamaged,
    /// Leaf hints were rejected and the tree was walked instead
    LeafHintRejected,
    /// A table could not be prepared in the destination
    TableSkipped,
    /// A row was rejected by the destination
    RowRejected,
    /// A DDL statement failed against the destination
    DdlFailed,

    // Backup material
    /// MasterInfo written
    MasterSaved,
    /// MasterInfo save failed
    MasterSaveFailed,
    /// MasterInfo loaded
    MasterLoaded,
    /// LeafInfo scan finished
    LeafScanned,

    // Statement dumps
    /// Dump started
    BackupBegin,
    /// Dump finished
    BackupDone,
    /// Replay started
    RecoverBegin,
    /// Replay finished
    RecoverDone,
    /// A replayed statement failed
    RecoverStatementFailed,

    // Checkpointing
    /// Checkpointer attached to a database
    CheckpointAttach,
    /// Checkpointer detached
    CheckpointDetach,
    /// Checkpoint task executed
    CheckpointRun,
    /// Checkpoint task failed
    CheckpointFailed,

    /// Configuration loaded
    ConfigLoaded,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::RepairOpen => "REPAIR_OPEN",
            Event::RepairOpenFailed => "REPAIR_OPEN_FAILED",
            Event::RepairOutputBegin => "REPAIR_OUTPUT_BEGIN",
            Event::RepairOutputDone => "REPAIR_OUTPUT_DONE",
            Event::RepairCanceled => "REPAIR_CANCELED",
            Event::PageDamaged => "PAGE_DAMAGED",
            Event::CellDamaged => "CELL_DAMAGED",
            Event::LeafHintRejected => "LEAF_HINT_REJECTED",
            Event::TableSkipped => "TABLE_SKIPPED",
            Event::RowRejected => "ROW_REJECTED",
            Event::DdlFailed => "DDL_FAILED",

            Event::MasterSaved => "MASTER_SAVED",
            Event::MasterSaveFailed => "MASTER_SAVE_FAILED",
            Event::MasterLoaded => "MASTER_LOADED",
            Event::LeafScanned => "LEAF_SCANNED",

            Event::BackupBegin => "BACKUP_BEGIN",
            Event::BackupDone => "BACKUP_DONE",
            Event::RecoverBegin => "RECOVER_BEGIN",
            Event::RecoverDone => "RECOVER_DONE",
            Event::RecoverStatementFailed => "RECOVER_STATEMENT_FAILED",

            Event::CheckpointAttach => "CHECKPOINT_ATTACH",
            Event::CheckpointDetach => "CHECKPOINT_DETACH",
            Event::CheckpointRun => "CHECKPOINT_RUN",
            Event::CheckpointFailed => "CHECKPOINT_FAILED",

            Event::ConfigLoaded => "CONFIG_LOADED",
        }
    }

    /// Default severity. Cancellation is not a fault and logs at INFO.
    pub fn severity(&self) -> Severity {
        match self {
            Event::PageDamaged
            | Event::LeafHintRejected
            | Event::TableSkipped
            | Event::DdlFailed
            | Event::RecoverStatementFailed => Severity::Warn,
            Event::CellDamaged | Event::RowRejected => Severity::Trace,
            Event::RepairOpenFailed | Event::MasterSaveFailed | Event::CheckpointFailed => {
                Severity::Error
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
