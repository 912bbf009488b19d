//! Row recovery from a damaged file
//!
//! Two walks feed a repair pass:
//! - the schema tree on page 1, which yields the file's own table and index
//!   rows
//! - one table tree per planned table, which yields its rows
//!
//! Page damage is logged and counted by the walker. Cell damage drops the
//! one cell and moves on to its neighbour.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::observability::{log_event_with_fields, Event};
use crate::pager::{
    decode_record, leaves_look_valid, visit_leaves, walk_table, BtreePage, PageDamage, PageStatus,
    Pager, WalkOutcome,
};
use crate::sql::is_internal_name;

use super::cursor::RecoveredRow;
use super::master::{MasterCatalog, MasterEntry, SchemaKind};
use super::types::{FLAG_ALL_TABLES, FLAG_CHECK_TABLE_COLUMNS};

/// Root page of the schema table.
pub(crate) const SCHEMA_ROOT: u32 = 1;

/// Decode cell `index` of a table leaf, following its overflow chain.
pub(crate) fn read_row(
    pager: &mut Pager,
    page: &BtreePage<'_>,
    index: u16,
) -> Result<RecoveredRow, PageDamage> {
    let cell = page.table_cell(index)?;
    let mut payload = cell.local.to_vec();
    let mut complete = true;
    if let Some(first) = cell.overflow {
        let needed = (cell.payload_size as usize).saturating_sub(payload.len());
        complete = pager.read_overflow(first, needed, &mut payload);
    }
    let record = decode_record(&payload, complete)?;
    Ok(RecoveredRow {
        rowid: cell.rowid,
        values: record.values,
        truncated: record.truncated,
    })
}

fn note_cell_damage(pgno: u32, damage: &PageDamage) {
    let page = pgno.to_string();
    let reason = damage.to_string();
    log_event_with_fields(Event::CellDamaged, &[("page", &page), ("reason", &reason)]);
}

/// Schema rows recovered from page 1.
#[derive(Debug)]
pub(crate) struct SchemaScan {
    pub(crate) entries: Vec<MasterEntry>,
    /// Rows that decoded but did not look like schema rows
    pub(crate) rejected: u64,
    /// A page or cell of the schema tree was damaged
    pub(crate) damaged: bool,
    pub(crate) outcome: WalkOutcome,
}

impl SchemaScan {
    pub(crate) fn is_clean(&self) -> bool {
        self.outcome == WalkOutcome::Completed && !self.damaged && self.rejected == 0
    }
}

/// Walk the schema tree and collect table and index rows.
///
/// Views, triggers, virtual tables and engine-internal objects are passed
/// over silently.
pub(crate) fn parse_schema(pager: &mut Pager, cancel: &AtomicBool) -> SchemaScan {
    let damaged_before = pager.statuses().count(PageStatus::Damaged);
    let mut entries = Vec::new();
    let mut rejected = 0u64;
    let mut cell_damage = false;

    let mut visit = |pager: &mut Pager, page: &BtreePage<'_>| {
        for index in 0..page.cell_count() {
            match read_row(pager, page, index) {
                Ok(row) => match schema_entry(&row) {
                    Some(Ok(entry)) => entries.push(entry),
                    Some(Err(())) => rejected += 1,
                    None => {}
                },
                Err(damage) => {
                    note_cell_damage(page.pgno(), &damage);
                    cell_damage = true;
                }
            }
        }
        ControlFlow::Continue(())
    };
    let outcome = walk_table(pager, SCHEMA_ROOT, cancel, &mut visit);

    let damaged = cell_damage || pager.statuses().count(PageStatus::Damaged) > damaged_before;
    SchemaScan {
        entries,
        rejected,
        damaged,
        outcome,
    }
}

/// `None` for rows that are not ours to recover, `Some(Err)` for rows that
/// do not have the schema table's shape.
fn schema_entry(row: &RecoveredRow) -> Option<Result<MasterEntry, ()>> {
    let [Value::Text(kind), Value::Text(name), Value::Text(tbl_name), root, sql] =
        row.values.as_slice()
    else {
        return Some(Err(()));
    };
    let kind = SchemaKind::from_type_name(kind)?;
    if is_internal_name(name) {
        return None;
    }
    let (Value::Integer(root), Value::Text(sql)) = (root, sql) else {
        // Auto-indices carry no DDL.
        return None;
    };
    if *root == 0 {
        return None;
    }
    if *root < 0 || *root > i64::from(u32::MAX) {
        return Some(Err(()));
    }
    Some(Ok(MasterEntry {
        kind,
        name: name.clone(),
        tbl_name: tbl_name.clone(),
        root_page: *root as u32,
        sql: sql.clone(),
    }))
}

/// Walk one table and hand every decodable row to `on_row`.
///
/// With `hints`, the recorded leaves are visited directly if they all
/// still read back as table leaves; otherwise the tree is walked from
/// `root`.
pub(crate) fn scan_table<F>(
    pager: &mut Pager,
    root: u32,
    hints: Option<&[u32]>,
    cancel: &AtomicBool,
    on_row: &mut F,
) -> WalkOutcome
where
    F: FnMut(&RecoveredRow) -> ControlFlow<()>,
{
    let mut visit = |pager: &mut Pager, page: &BtreePage<'_>| {
        let mut flow = ControlFlow::Continue(());
        for index in 0..page.cell_count() {
            match read_row(pager, page, index) {
                Ok(row) => {
                    flow = on_row(&row);
                    if flow.is_break() {
                        break;
                    }
                }
                Err(damage) => note_cell_damage(page.pgno(), &damage),
            }
        }
        pager.statuses_mut().mark_leaf_parsed();
        flow
    };

    match hints {
        Some(leaves) if !leaves.is_empty() && leaves_look_valid(pager, leaves) => {
            visit_leaves(pager, leaves, cancel, &mut visit)
        }
        Some(_) => {
            let root_text = root.to_string();
            log_event_with_fields(Event::LeafHintRejected, &[("root", &root_text)]);
            walk_table(pager, root, cancel, &mut visit)
        }
        None => walk_table(pager, root, cancel, &mut visit),
    }
}

/// One table to recover.
#[derive(Debug, Clone)]
pub(crate) struct TablePlan {
    pub(crate) name: String,
    pub(crate) root: u32,
    pub(crate) sql: String,
    /// Widest row accepted, from the backed-up DDL
    pub(crate) column_limit: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct RecoveryPlan {
    pub(crate) tables: Vec<TablePlan>,
    pub(crate) indices: Vec<MasterEntry>,
}

/// Merge the backed-up catalog with the schema rows found in the file.
///
/// Schema rows refresh backed-up entries of the same kind and name. Under
/// `FLAG_CHECK_TABLE_COLUMNS` a recovered row whose DDL differs and is
/// shorter loses to the backup. Tables are ordered by name.
pub(crate) fn build_plan(
    catalog: Option<&MasterCatalog>,
    schema: &[MasterEntry],
    flags: u32,
) -> RecoveryPlan {
    let all_tables = catalog.is_none() || flags & FLAG_ALL_TABLES != 0;
    let check_columns = flags & FLAG_CHECK_TABLE_COLUMNS != 0;

    let mut merged: BTreeMap<(u8, String), MasterEntry> = BTreeMap::new();
    if let Some(catalog) = catalog {
        for entry in &catalog.entries {
            merged.insert((entry.kind.code(), entry.name.clone()), entry.clone());
        }
    }
    for entry in schema {
        let key = (entry.kind.code(), entry.name.clone());
        match merged.get(&key) {
            Some(backup)
                if check_columns && backup.sql != entry.sql && entry.sql.len() < backup.sql.len() => {}
            _ => {
                merged.insert(key, entry.clone());
            }
        }
    }

    let admits = |tbl_name: &str| all_tables || catalog.map_or(true, |c| c.admits(tbl_name));

    let mut plan = RecoveryPlan::default();
    for entry in merged.into_values() {
        if !admits(&entry.tbl_name) {
            continue;
        }
        match entry.kind {
            SchemaKind::Table => {
                if is_without_rowid(&entry.sql) {
                    log_event_with_fields(
                        Event::TableSkipped,
                        &[("reason", "without rowid"), ("table", &entry.name)],
                    );
                    continue;
                }
                let column_limit = if check_columns {
                    catalog
                        .and_then(|c| c.table(&entry.name))
                        .and_then(|backup| declared_column_count(&backup.sql))
                } else {
                    None
                };
                plan.tables.push(TablePlan {
                    name: entry.name,
                    root: entry.root_page,
                    sql: entry.sql,
                    column_limit,
                });
            }
            SchemaKind::Index => plan.indices.push(entry),
        }
    }

    let planned: Vec<&str> = plan.tables.iter().map(|t| t.name.as_str()).collect();
    plan.indices
        .retain(|index| planned.contains(&index.tbl_name.as_str()));
    plan
}

fn is_without_rowid(sql: &str) -> bool {
    let compact: String = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    compact.contains("WITHOUT ROWID")
}

/// Column count of a CREATE TABLE statement, by compiling it in a scratch
/// in-memory database.
pub(crate) fn declared_column_count(create_sql: &str) -> Option<usize> {
    let scratch = Connection::open_in_memory().ok()?;
    scratch.execute_batch(create_sql).ok()?;
    let name: String = scratch
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok()?;
    let mut stmt = scratch
        .prepare(&format!(
            "PRAGMA table_info({})",
            crate::sql::quote_identifier(&name)
        ))
        .ok()?;
    let rows = stmt.query_map([], |_| Ok(())).ok()?;
    Some(rows.count())
}
