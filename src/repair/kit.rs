//! RepairKit: one session over one corrupted database file
//!
//! Opening reads the header and the schema tree once to set the integrity
//! flags. Each `output` call then resets page statuses, walks the schema
//! tree again, plans the tables and copies every recoverable row into the
//! destination. Statistics describe the most recent pass only, and so does
//! the DATA integrity flag once a pass has run without being canceled.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use uuid::Uuid;

use crate::cancel::{attach_optional, CancellationSignal};
use crate::crypto::CipherSpec;
use crate::observability::{log_event_with_fields, Event};
use crate::pager::{PageStatus, Pager, WalkOutcome};

use super::cursor::{RecoveredRow, RepairCursor};
use super::errors::{RepairError, RepairResult};
use super::leaf::LeafInfo;
use super::master::{MasterCatalog, MasterInfo};
use super::output::{OutputWriter, DEFAULT_COMMIT_BATCH_ROWS};
use super::scanner::{build_plan, parse_schema, scan_table};
use super::types::{
    Outcome, RowAction, Statistics, FLAG_NO_CREATE_TABLES, INTEGRITY_DATA, INTEGRITY_HEADER,
    INTEGRITY_KDF_SALT,
};

struct RepairSession {
    pager: Pager,
    catalog: Option<MasterCatalog>,
    leaves: Option<BTreeMap<u32, Vec<u32>>>,
    integrity: u32,
    /// Schema tree of the current pass decoded without damage
    schema_clean: bool,
}

impl RepairSession {
    fn set_data_intact(&mut self, intact: bool) {
        if intact {
            self.integrity |= INTEGRITY_DATA;
        } else {
            self.integrity &= !INTEGRITY_DATA;
        }
    }

    fn statistics(&self) -> Statistics {
        let statuses = self.pager.statuses();
        Statistics {
            total_pages: self.pager.page_count(),
            valid_pages: statuses.count(PageStatus::Checked),
            parsed_pages: statuses.parsed_leaves(),
            damaged_pages: statuses.count(PageStatus::Damaged),
        }
    }
}

/// Why a pass stopped early.
enum Stop {
    Canceled,
    Fatal(RepairError),
}

pub struct RepairKit {
    session: Option<RepairSession>,
    session_id: Uuid,
    commit_batch_rows: usize,
    statistics: Option<Statistics>,
    success: u64,
    failure: u64,
    last_error: Option<String>,
}

impl std::fmt::Debug for RepairKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairKit")
            .field("session_id", &self.session_id)
            .field("commit_batch_rows", &self.commit_batch_rows)
            .field("success", &self.success)
            .field("failure", &self.failure)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl RepairKit {
    /// Open a corrupted database read-only.
    ///
    /// A `master` catalog narrows and seeds the set of tables to recover,
    /// and its KDF salt stands in for a damaged one in an encrypted file.
    pub fn open(
        path: impl AsRef<Path>,
        cipher: Option<&CipherSpec>,
        master: Option<&MasterInfo>,
    ) -> RepairResult<RepairKit> {
        let path = path.as_ref();
        let session_id = Uuid::new_v4();
        let session_text = session_id.to_string();
        let path_text = path.display().to_string();

        let catalog = match master {
            Some(info) => Some(
                info.catalog()
                    .cloned()
                    .ok_or_else(|| RepairError::released("MasterInfo"))?,
            ),
            None => None,
        };
        let fallback_salt = catalog.as_ref().and_then(|c| c.kdf_salt);

        let mut pager = match Pager::open(path, cipher, fallback_salt) {
            Ok(pager) => pager,
            Err(e) => {
                log_event_with_fields(
                    Event::RepairOpenFailed,
                    &[("error", &e.to_string()), ("path", &path_text), ("session", &session_text)],
                );
                return Err(RepairError::open_failed(format!("open {}", path_text), e));
            }
        };

        let mut integrity = 0;
        if pager.header_ok() {
            integrity |= INTEGRITY_HEADER;
        }
        if pager.salt_ok() {
            integrity |= INTEGRITY_KDF_SALT;
        }
        let never = AtomicBool::new(false);
        if parse_schema(&mut pager, &never).is_clean() {
            integrity |= INTEGRITY_DATA;
        }
        pager.statuses_mut().reset();

        let integrity_text = format!("{:#x}", integrity);
        let pages = pager.page_count().to_string();
        log_event_with_fields(
            Event::RepairOpen,
            &[
                ("integrity", &integrity_text),
                ("pages", &pages),
                ("path", &path_text),
                ("session", &session_text),
            ],
        );

        Ok(RepairKit {
            session: Some(RepairSession {
                pager,
                catalog,
                leaves: None,
                integrity,
                schema_clean: integrity & INTEGRITY_DATA != 0,
            }),
            session_id,
            commit_batch_rows: DEFAULT_COMMIT_BATCH_ROWS,
            statistics: None,
            success: 0,
            failure: 0,
            last_error: None,
        })
    }

    /// Use a leaf inventory for the tables it covers. A released inventory
    /// clears any previously set one.
    pub fn set_leaf_info(&mut self, info: &LeafInfo) {
        if let Some(ref mut session) = self.session {
            session.leaves = info.map().cloned();
        }
    }

    /// Rows per transaction when the writer owns the transaction.
    pub fn set_commit_batch_rows(&mut self, rows: usize) {
        self.commit_batch_rows = rows.max(1);
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Copy every recoverable row into `dest`.
    pub fn output(&mut self, dest: &Connection, flags: u32) -> Outcome {
        self.output_with(dest, flags, None, |_: &str, _: u32, _: &RepairCursor<'_>| {
            RowAction::Accept
        })
    }

    /// Like [`RepairKit::output`], consulting `on_progress` for every row
    /// before it is written and polling `signal` between pages.
    ///
    /// The cursor handed to `on_progress` is only valid for that call.
    pub fn output_with<F>(
        &mut self,
        dest: &Connection,
        flags: u32,
        signal: Option<&CancellationSignal>,
        mut on_progress: F,
    ) -> Outcome
    where
        F: FnMut(&str, u32, &RepairCursor<'_>) -> RowAction,
    {
        let session_text = self.session_id.to_string();
        let Some(session) = self.session.as_mut() else {
            self.last_error = Some(RepairError::released("RepairKit").to_string());
            return Outcome::Failed;
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let _attached = attach_optional(signal, &cancel);

        let flags_text = format!("{:#x}", flags);
        log_event_with_fields(
            Event::RepairOutputBegin,
            &[("flags", &flags_text), ("session", &session_text)],
        );

        let mut writer = OutputWriter::new(
            dest,
            flags & FLAG_NO_CREATE_TABLES == 0,
            self.commit_batch_rows,
        );
        let result = run_pass(session, &mut writer, flags, &cancel, &mut on_progress);

        let outcome = match result {
            Ok(()) if writer.success_count() > 0 => Outcome::Ok,
            Ok(()) => Outcome::Failed,
            Err(Stop::Canceled) => {
                writer.abort();
                log_event_with_fields(Event::RepairCanceled, &[("session", &session_text)]);
                Outcome::Canceled
            }
            Err(Stop::Fatal(e)) => {
                writer.abort();
                writer.note_failure(e.to_string());
                Outcome::Failed
            }
        };

        let stats = session.statistics();
        if outcome != Outcome::Canceled {
            session.set_data_intact(session.schema_clean && stats.damaged_pages == 0);
        }
        self.statistics = Some(stats);
        self.success = writer.success_count();
        self.failure = writer.failure_count();
        self.last_error = writer.last_error().map(str::to_string);

        let fields = [
            ("damaged", stats.damaged_pages.to_string()),
            ("failure", self.failure.to_string()),
            ("outcome", format!("{:?}", outcome)),
            ("parsed", stats.parsed_pages.to_string()),
            ("session", session_text),
            ("success", self.success.to_string()),
            ("valid", stats.valid_pages.to_string()),
        ];
        let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        log_event_with_fields(Event::RepairOutputDone, &borrowed);

        outcome
    }

    /// HEADER and KDF_SALT are fixed at open. DATA starts from the schema
    /// walk at open; every `output` that is not canceled replaces it with
    /// that pass's finding: set only if the schema tree was clean and no
    /// page was marked damaged.
    pub fn integrity_flags(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.integrity)
    }

    pub fn is_header_corrupted(&self) -> bool {
        self.integrity_flags() & INTEGRITY_HEADER == 0
    }

    pub fn is_data_corrupted(&self) -> bool {
        self.integrity_flags() & INTEGRITY_DATA == 0
    }

    pub fn is_salt_corrupted(&self) -> bool {
        self.integrity_flags() & INTEGRITY_KDF_SALT == 0
    }

    /// Counters of the last `output` call, if any.
    pub fn statistics(&self) -> Option<Statistics> {
        self.statistics
    }

    pub fn success_count(&self) -> u64 {
        self.success
    }

    pub fn failure_count(&self) -> u64 {
        self.failure
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Close the source file. Safe to call any number of times; `output`
    /// afterwards fails.
    pub fn release(&mut self) {
        self.session = None;
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }
}

fn run_pass<F>(
    session: &mut RepairSession,
    writer: &mut OutputWriter<'_>,
    flags: u32,
    cancel: &AtomicBool,
    on_progress: &mut F,
) -> Result<(), Stop>
where
    F: FnMut(&str, u32, &RepairCursor<'_>) -> RowAction,
{
    session.pager.statuses_mut().reset();

    let schema = parse_schema(&mut session.pager, cancel);
    if schema.outcome == WalkOutcome::Canceled {
        return Err(Stop::Canceled);
    }
    session.schema_clean = schema.is_clean();
    for _ in 0..schema.rejected {
        writer.note_failure("unreadable schema row");
    }

    let plan = build_plan(session.catalog.as_ref(), &schema.entries, flags);
    for table in &plan.tables {
        if cancel.load(Ordering::SeqCst) {
            return Err(Stop::Canceled);
        }
        writer
            .begin_table(&table.name, &table.sql)
            .map_err(Stop::Fatal)?;

        let hints = session
            .leaves
            .as_ref()
            .and_then(|m| m.get(&table.root))
            .map(Vec::as_slice);
        let mut stop: Option<Stop> = None;
        let mut on_row = |row: &RecoveredRow| {
            if let Some(limit) = table.column_limit {
                if row.values.len() > limit {
                    writer.reject_row(row, "wider than the backed-up table");
                    return ControlFlow::Continue(());
                }
            }
            match on_progress(&table.name, table.root, &RepairCursor::new(row)) {
                RowAction::Accept => match writer.write_row(row) {
                    Ok(_) => ControlFlow::Continue(()),
                    Err(e) => {
                        stop = Some(Stop::Fatal(e));
                        ControlFlow::Break(())
                    }
                },
                RowAction::Ignore => ControlFlow::Continue(()),
                RowAction::Cancel => {
                    stop = Some(Stop::Canceled);
                    ControlFlow::Break(())
                }
            }
        };
        let outcome = scan_table(&mut session.pager, table.root, hints, cancel, &mut on_row);

        if let Some(stop) = stop {
            return Err(stop);
        }
        if outcome == WalkOutcome::Canceled {
            return Err(Stop::Canceled);
        }
        writer.end_table().map_err(Stop::Fatal)?;
    }

    for index in &plan.indices {
        if cancel.load(Ordering::SeqCst) {
            return Err(Stop::Canceled);
        }
        writer.execute_ddl(&index.sql).map_err(Stop::Fatal)?;
    }
    Ok(())
}
