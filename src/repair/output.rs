//! Destination writer for a repair pass
//!
//! Rows go in through one cached `REPLACE INTO` statement per table. When
//! the destination is in autocommit mode the writer owns the transaction
//! and commits in batches; when the caller already holds one, the writer
//! never issues BEGIN or COMMIT.
//!
//! A row the destination refuses is a counted failure. Only errors that
//! leave the destination unusable end the pass.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};

use crate::observability::{log_event_with_fields, Event};
use crate::sql::{column_affinity, quote_identifier, Affinity};

use super::cursor::RecoveredRow;
use super::errors::{RepairError, RepairResult};

/// Rows per destination transaction unless configured otherwise.
pub const DEFAULT_COMMIT_BATCH_ROWS: usize = 256;

#[derive(Debug)]
struct ColumnTarget {
    text_affinity: bool,
    not_null: bool,
    default: Value,
}

#[derive(Debug)]
struct TableTarget {
    name: String,
    insert_sql: String,
    columns: Vec<ColumnTarget>,
    /// Column aliasing the rowid
    rowid_alias: Option<usize>,
}

pub(crate) struct OutputWriter<'c> {
    dest: &'c Connection,
    create_tables: bool,
    batch_rows: usize,
    managed: bool,
    in_txn: bool,
    uncommitted: usize,
    success: u64,
    failure: u64,
    last_error: Option<String>,
    table: Option<TableTarget>,
}

impl<'c> OutputWriter<'c> {
    pub(crate) fn new(dest: &'c Connection, create_tables: bool, batch_rows: usize) -> Self {
        Self {
            dest,
            create_tables,
            batch_rows: batch_rows.max(1),
            managed: dest.is_autocommit(),
            in_txn: false,
            uncommitted: 0,
            success: 0,
            failure: 0,
            last_error: None,
            table: None,
        }
    }

    pub(crate) fn success_count(&self) -> u64 {
        self.success
    }

    pub(crate) fn failure_count(&self) -> u64 {
        self.failure
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn note_failure(&mut self, message: impl Into<String>) {
        self.failure += 1;
        self.last_error = Some(message.into());
    }

    /// Run one DDL statement. Skipped when table creation is disabled.
    pub(crate) fn execute_ddl(&mut self, sql: &str) -> RepairResult<()> {
        if !self.create_tables {
            return Ok(());
        }
        match self.dest.execute_batch(sql) {
            Ok(()) => {
                self.success += 1;
                Ok(())
            }
            Err(e) if is_fatal(&e) => Err(RepairError::database("execute DDL", e)),
            Err(e) => {
                log_event_with_fields(Event::DdlFailed, &[("error", &e.to_string()), ("sql", sql)]);
                self.note_failure(e.to_string());
                Ok(())
            }
        }
    }

    /// Prepare `name` for rows, creating it first if allowed and missing.
    /// Returns false if the destination has no usable table; rows written
    /// until the next `begin_table` then count as failures.
    pub(crate) fn begin_table(&mut self, name: &str, create_sql: &str) -> RepairResult<bool> {
        self.table = None;
        if !self.table_exists(name)? {
            self.execute_ddl(create_sql)?;
        }

        let target = self.describe(name)?;
        if target.columns.is_empty() {
            log_event_with_fields(
                Event::TableSkipped,
                &[("reason", "missing in destination"), ("table", name)],
            );
            return Ok(false);
        }
        self.table = Some(target);
        Ok(true)
    }

    fn table_exists(&self, name: &str) -> RepairResult<bool> {
        self.dest
            .query_row(
                "SELECT count(*) FROM sqlite_master \
                 WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| RepairError::database("inspect destination", e))
    }

    fn describe(&self, name: &str) -> RepairResult<TableTarget> {
        let pragma = format!("PRAGMA table_info({})", quote_identifier(name));
        let mut stmt = self
            .dest
            .prepare(&pragma)
            .map_err(|e| RepairError::database("inspect destination", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(|e| RepairError::database("inspect destination", e))?;

        let mut columns = Vec::new();
        let mut pk_columns = Vec::new();
        for (index, row) in rows.enumerate() {
            let (declared, not_null, default_expr, pk) =
                row.map_err(|e| RepairError::database("inspect destination", e))?;
            if pk > 0 {
                pk_columns.push((index, declared.clone()));
            }
            columns.push(ColumnTarget {
                text_affinity: column_affinity(&declared) == Affinity::Text,
                not_null,
                default: default_expr
                    .map(|expr| self.evaluate_default(&expr))
                    .unwrap_or(Value::Null),
            });
        }

        let rowid_alias = match pk_columns.as_slice() {
            [(index, declared)] if declared.eq_ignore_ascii_case("INTEGER") => Some(*index),
            _ => None,
        };
        let placeholders = vec!["?"; columns.len()].join(",");
        Ok(TableTarget {
            name: name.to_string(),
            insert_sql: format!("REPLACE INTO {} VALUES({})", quote_identifier(name), placeholders),
            columns,
            rowid_alias,
        })
    }

    fn evaluate_default(&self, expr: &str) -> Value {
        self.dest
            .query_row(&format!("SELECT {}", expr), [], |row| row.get::<_, Value>(0))
            .unwrap_or(Value::Null)
    }

    /// Map a recovered row onto the current table's columns.
    fn bind_values(target: &TableTarget, row: &RecoveredRow) -> Result<Vec<Value>, String> {
        if row.values.len() > target.columns.len() {
            return Err(format!(
                "row {} has {} columns, {} has {}",
                row.rowid,
                row.values.len(),
                target.name,
                target.columns.len()
            ));
        }

        let mut bound = Vec::with_capacity(target.columns.len());
        for (index, column) in target.columns.iter().enumerate() {
            let value = match row.values.get(index) {
                None if target.rowid_alias == Some(index) => Value::Integer(row.rowid),
                None => column.default.clone(),
                Some(Value::Null) if target.rowid_alias == Some(index) => {
                    Value::Integer(row.rowid)
                }
                Some(Value::Null) if column.not_null => {
                    return Err(format!("row {}: NULL in NOT NULL column {}", row.rowid, index));
                }
                Some(Value::Integer(_) | Value::Real(_)) if column.text_affinity => {
                    return Err(format!("row {}: number in TEXT column {}", row.rowid, index));
                }
                Some(value) => value.clone(),
            };
            bound.push(value);
        }
        Ok(bound)
    }

    /// Insert one row into the current table. `Ok(false)` is a counted
    /// failure; `Err` means the destination is unusable.
    pub(crate) fn write_row(&mut self, row: &RecoveredRow) -> RepairResult<bool> {
        let Some(ref target) = self.table else {
            self.note_failure("no destination table");
            return Ok(false);
        };
        let insert_sql = target.insert_sql.clone();
        let values = match Self::bind_values(target, row) {
            Ok(values) => values,
            Err(reason) => {
                log_event_with_fields(Event::RowRejected, &[("reason", &reason)]);
                self.note_failure(reason);
                return Ok(false);
            }
        };

        self.ensure_transaction()?;
        let result = self
            .dest
            .prepare_cached(&insert_sql)
            .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())));
        match result {
            Ok(_) => {
                self.success += 1;
                self.uncommitted += 1;
                if self.managed && self.uncommitted >= self.batch_rows {
                    self.commit()?;
                }
                Ok(true)
            }
            Err(e) if is_fatal(&e) => Err(RepairError::database("insert row", e)),
            Err(e) => {
                let reason = e.to_string();
                log_event_with_fields(Event::RowRejected, &[("reason", &reason)]);
                self.note_failure(reason);
                Ok(false)
            }
        }
    }

    /// Count a row refused before it reached the destination.
    pub(crate) fn reject_row(&mut self, row: &RecoveredRow, reason: &str) {
        let reason = format!("row {}: {}", row.rowid, reason);
        log_event_with_fields(Event::RowRejected, &[("reason", &reason)]);
        self.note_failure(reason);
    }

    fn ensure_transaction(&mut self) -> RepairResult<()> {
        if self.managed && !self.in_txn {
            self.dest
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| RepairError::database("begin batch", e))?;
            self.in_txn = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> RepairResult<()> {
        if self.in_txn {
            self.dest
                .execute_batch("COMMIT")
                .map_err(|e| RepairError::database("commit batch", e))?;
            self.in_txn = false;
        }
        self.uncommitted = 0;
        Ok(())
    }

    /// Commit whatever the current table left open.
    pub(crate) fn end_table(&mut self) -> RepairResult<()> {
        self.table = None;
        self.commit()
    }

    /// Drop the open batch. Earlier batches stay committed.
    pub(crate) fn abort(&mut self) {
        self.table = None;
        if self.in_txn {
            // A failed rollback leaves nothing further to undo.
            let _ = self.dest.execute_batch("ROLLBACK");
            self.in_txn = false;
        }
        self.uncommitted = 0;
    }
}

/// Errors after which the destination cannot take more writes.
fn is_fatal(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DiskFull
                | ErrorCode::SystemIoFailure
                | ErrorCode::ReadOnly
                | ErrorCode::CannotOpen
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::OutOfMemory
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(rowid: i64, values: Vec<Value>) -> RecoveredRow {
        RecoveredRow {
            rowid,
            values,
            truncated: false,
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT count(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_creates_table_and_binds_rowid_alias() {
        let dest = Connection::open_in_memory().unwrap();
        let mut writer = OutputWriter::new(&dest, true, 2);
        assert!(writer
            .begin_table("t", "CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap());

        for id in 1..=3 {
            let ok = writer
                .write_row(&row(id, vec![Value::Null, Value::Text(format!("v{}", id))]))
                .unwrap();
            assert!(ok);
        }
        writer.end_table().unwrap();

        assert_eq!(count(&dest, "t"), 3);
        let id: i64 = dest
            .query_row("SELECT id FROM t WHERE v = 'v3'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, 3);
        // One DDL statement and three rows.
        assert_eq!(writer.success_count(), 4);
        assert!(dest.is_autocommit());
    }

    #[test]
    fn test_existing_table_matches_regardless_of_case() {
        let dest = Connection::open_in_memory().unwrap();
        dest.execute_batch("CREATE TABLE Users(id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();

        let mut writer = OutputWriter::new(&dest, true, 10);
        assert!(writer
            .begin_table("users", "CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap());
        assert!(writer
            .write_row(&row(1, vec![Value::Null, Value::Text("a".into())]))
            .unwrap());
        writer.end_table().unwrap();

        // No CREATE was attempted against the differently cased table.
        assert_eq!(writer.failure_count(), 0);
        assert_eq!(writer.success_count(), 1);
        assert_eq!(count(&dest, "USERS"), 1);
    }

    #[test]
    fn test_row_checks() {
        let dest = Connection::open_in_memory().unwrap();
        let mut writer = OutputWriter::new(&dest, true, 256);
        writer
            .begin_table("t", "CREATE TABLE t(a TEXT, b NOT NULL, c DEFAULT 'x')")
            .unwrap();

        // Too wide
        let wide = row(1, vec![Value::Null; 4]);
        assert!(!writer.write_row(&wide).unwrap());
        // Number into TEXT
        let number = row(2, vec![Value::Integer(5), Value::Integer(1)]);
        assert!(!writer.write_row(&number).unwrap());
        // NULL into NOT NULL
        let null = row(3, vec![Value::Text("a".into()), Value::Null]);
        assert!(!writer.write_row(&null).unwrap());
        // Missing trailing column takes its default
        let short = row(4, vec![Value::Text("a".into()), Value::Integer(1)]);
        assert!(writer.write_row(&short).unwrap());
        writer.end_table().unwrap();

        assert_eq!(writer.failure_count(), 3);
        let c: String = dest.query_row("SELECT c FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(c, "x");
    }

    #[test]
    fn test_missing_table_without_create() {
        let dest = Connection::open_in_memory().unwrap();
        let mut writer = OutputWriter::new(&dest, false, 256);
        assert!(!writer.begin_table("t", "CREATE TABLE t(a)").unwrap());
        assert!(!writer.write_row(&row(1, vec![Value::Integer(1)])).unwrap());
        assert_eq!(writer.failure_count(), 1);
        assert_eq!(writer.success_count(), 0);
    }

    #[test]
    fn test_abort_keeps_committed_batches() {
        let dest = Connection::open_in_memory().unwrap();
        let mut writer = OutputWriter::new(&dest, true, 2);
        writer.begin_table("t", "CREATE TABLE t(a)").unwrap();
        for i in 0..3 {
            writer.write_row(&row(i + 1, vec![Value::Integer(i)])).unwrap();
        }
        writer.abort();
        // The first batch of two was committed, the third row rolled back.
        assert_eq!(count(&dest, "t"), 2);
    }

    #[test]
    fn test_caller_transaction_is_left_alone() {
        let dest = Connection::open_in_memory().unwrap();
        dest.execute_batch("CREATE TABLE t(a); BEGIN;").unwrap();
        let mut writer = OutputWriter::new(&dest, true, 1);
        writer.begin_table("t", "CREATE TABLE t(a)").unwrap();
        writer.write_row(&row(1, vec![Value::Integer(1)])).unwrap();
        writer.end_table().unwrap();
        assert!(!dest.is_autocommit());
        dest.execute_batch("COMMIT").unwrap();
        assert_eq!(count(&dest, "t"), 1);
    }
}
