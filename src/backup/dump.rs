//! BackupKit: dump a healthy database as replayable statements

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::cancel::{attach_optional, CancellationSignal};
use crate::crypto::Keystream;
use crate::observability::{log_event_with_fields, Event};
use crate::repair::Outcome;
use crate::sql::{is_internal_name, quote_identifier};

use super::errors::{BackupError, BackupResult};
use super::format::{SectionWriter, Token};

/// Leave DDL out of the dump; rows only.
pub const FLAG_NO_CREATE_TABLE: u32 = 0x0001;

const SEQUENCE_TABLE: &str = "sqlite_sequence";

/// A table to include, with an optional row condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFilter {
    pub name: String,
    /// SQL expression placed after WHERE
    pub condition: Option<String>,
}

impl TableFilter {
    pub fn all_rows(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: None,
        }
    }

    pub fn matching(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: Some(condition.into()),
        }
    }
}

#[derive(Debug)]
struct SchemaRow {
    kind: String,
    name: String,
    tbl_name: String,
    root: i64,
    sql: String,
}

pub struct BackupKit {
    out: PathBuf,
    keystream: Option<Keystream>,
    flags: u32,
    tables: Option<Vec<TableFilter>>,
    rows: u64,
    statements: u64,
}

impl BackupKit {
    /// Dump into `out`, encrypted with `key` if given. `tables` restricts
    /// the dump to the named tables and the objects built on them.
    pub fn new(
        out: impl AsRef<Path>,
        key: Option<&[u8]>,
        flags: u32,
        tables: Option<Vec<TableFilter>>,
    ) -> Self {
        Self {
            out: out.as_ref().to_path_buf(),
            keystream: key.map(Keystream::for_material),
            flags,
            tables,
            rows: 0,
            statements: 0,
        }
    }

    pub fn run(&mut self, conn: &Connection) -> BackupResult<Outcome> {
        self.run_with(conn, None)
    }

    /// Write the dump. A canceled run leaves no output file behind.
    pub fn run_with(
        &mut self,
        conn: &Connection,
        signal: Option<&CancellationSignal>,
    ) -> BackupResult<Outcome> {
        let cancel = Arc::new(AtomicBool::new(false));
        let _attached = attach_optional(signal, &cancel);

        let out_text = self.out.display().to_string();
        log_event_with_fields(Event::BackupBegin, &[("path", &out_text)]);

        let tmp = temp_path(&self.out);
        let file = File::create(&tmp)
            .map_err(|e| BackupError::io(format!("create {}", tmp.display()), e))?;
        let mut writer = SectionWriter::new(BufWriter::new(file), self.keystream.clone())?;

        self.rows = 0;
        self.statements = 0;
        let result = self.write_all(conn, &mut writer, &cancel);
        let finished = match result {
            Ok(true) => writer.finish().map(|_| true),
            Ok(false) => Ok(false),
            Err(e) => Err(e),
        };

        match finished {
            Ok(true) => {
                fs::rename(&tmp, &self.out)
                    .map_err(|e| BackupError::io(format!("rename to {}", out_text), e))?;
                let rows = self.rows.to_string();
                let statements = self.statements.to_string();
                log_event_with_fields(
                    Event::BackupDone,
                    &[("path", &out_text), ("rows", &rows), ("statements", &statements)],
                );
                Ok(Outcome::Ok)
            }
            Ok(false) => {
                let _ = fs::remove_file(&tmp);
                Ok(Outcome::Canceled)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    /// Rows written by the last run.
    pub fn row_count(&self) -> u64 {
        self.rows
    }

    /// Statements (DDL plus one per table) written by the last run.
    pub fn statement_count(&self) -> u64 {
        self.statements
    }

    fn admits(&self, table: &str) -> bool {
        self.tables
            .as_ref()
            .map_or(true, |t| t.iter().any(|f| f.name == table))
    }

    fn condition(&self, table: &str) -> Option<&str> {
        self.tables
            .as_ref()?
            .iter()
            .find(|f| f.name == table)?
            .condition
            .as_deref()
    }

    /// Returns false if canceled.
    fn write_all<W: std::io::Write>(
        &mut self,
        conn: &Connection,
        writer: &mut SectionWriter<W>,
        cancel: &AtomicBool,
    ) -> BackupResult<bool> {
        let schema = read_schema(conn)?;
        let create = self.flags & FLAG_NO_CREATE_TABLE == 0;

        for row in schema.iter().filter(|r| r.kind == "table") {
            if cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }
            if row.name == SEQUENCE_TABLE {
                if self.tables.is_none() {
                    self.emit(writer, Token::OneShot("DELETE FROM sqlite_sequence;".into()))?;
                    if !self.write_rows(conn, writer, SEQUENCE_TABLE, None, cancel)? {
                        return Ok(false);
                    }
                }
                continue;
            }
            if is_internal_name(&row.name) || !self.admits(&row.name) {
                continue;
            }
            if create {
                self.emit(writer, Token::OneShot(row.sql.clone()))?;
            }
            // Virtual tables own no pages of their own.
            if row.root > 0 {
                let condition = self.condition(&row.name).map(str::to_string);
                if !self.write_rows(conn, writer, &row.name, condition.as_deref(), cancel)? {
                    return Ok(false);
                }
            }
        }

        if create {
            for row in schema.iter().filter(|r| r.kind != "table") {
                if is_internal_name(&row.name) {
                    continue;
                }
                let admitted = match row.kind.as_str() {
                    "view" => self.tables.is_none(),
                    _ => self.admits(&row.tbl_name),
                };
                if admitted {
                    self.emit(writer, Token::OneShot(row.sql.clone()))?;
                }
            }
        }
        Ok(true)
    }

    fn emit<W: std::io::Write>(&mut self, writer: &mut SectionWriter<W>, token: Token) -> BackupResult<()> {
        if matches!(token, Token::OneShot(_) | Token::Repeated(_)) {
            self.statements += 1;
        }
        writer.write_token(&token)
    }

    fn write_rows<W: std::io::Write>(
        &mut self,
        conn: &Connection,
        writer: &mut SectionWriter<W>,
        table: &str,
        condition: Option<&str>,
        cancel: &AtomicBool,
    ) -> BackupResult<bool> {
        let quoted = quote_identifier(table);
        let query = match condition {
            Some(cond) => format!("SELECT * FROM {} WHERE {}", quoted, cond),
            None => format!("SELECT * FROM {}", quoted),
        };
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| BackupError::database(format!("read {}", table), e))?;
        let columns = stmt.column_count();
        let placeholders = vec!["?"; columns].join(",");
        self.emit(
            writer,
            Token::Repeated(format!("REPLACE INTO {} VALUES({})", quoted, placeholders)),
        )?;

        let mut rows = stmt
            .query([])
            .map_err(|e| BackupError::database(format!("read {}", table), e))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| BackupError::database(format!("read {}", table), e))?
        {
            if cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }
            for index in 0..columns {
                let value: Value = row
                    .get(index)
                    .map_err(|e| BackupError::database(format!("read {}", table), e))?;
                writer.write_token(&Token::Bind(value))?;
            }
            writer.write_token(&Token::EndRow)?;
            self.rows += 1;
        }
        writer.write_token(&Token::EndSql)?;
        Ok(true)
    }
}

fn read_schema(conn: &Connection) -> BackupResult<Vec<SchemaRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name, tbl_name, rootpage, sql FROM sqlite_master \
             WHERE sql IS NOT NULL ORDER BY rowid",
        )
        .map_err(|e| BackupError::database("read schema", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SchemaRow {
                kind: row.get(0)?,
                name: row.get(1)?,
                tbl_name: row.get(2)?,
                root: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                sql: row.get(4)?,
            })
        })
        .map_err(|e| BackupError::database("read schema", e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| BackupError::database("read schema", e))
}

/// `<out>.tmp`, next to `out`.
fn temp_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_keeps_extension() {
        assert_eq!(temp_path(Path::new("/x/a.dump")), PathBuf::from("/x/a.dump.tmp"));
        assert_ne!(temp_path(Path::new("a.dump")), temp_path(Path::new("a.bak")));
        assert_eq!(temp_path(Path::new("plain")), PathBuf::from("plain.tmp"));
    }
}
