//! MasterInfo: the backed-up schema catalog
//!
//! A catalog is a list of table and index entries (name, owning table,
//! root page, DDL), an optional table-name filter and an optional KDF salt.
//! It comes from one of three places:
//! - [`MasterInfo::make`]: no entries, just a filter
//! - [`MasterInfo::capture`] / [`MasterInfo::save`]: a live, healthy database
//! - [`MasterInfo::load`]: a file written earlier by `save`
//!
//! `save` is meant to run proactively, right after schema creation or a
//! migration, long before anything gets corrupted.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::Connection;

use crate::crypto::SALT_LEN;
use crate::observability::{log_event_with_fields, Event};
use crate::sql::is_internal_name;

use super::errors::{RepairError, RepairResult};
use super::material;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Table,
    Index,
}

impl SchemaKind {
    pub fn code(&self) -> u8 {
        match self {
            SchemaKind::Table => 1,
            SchemaKind::Index => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<SchemaKind> {
        match code {
            1 => Some(SchemaKind::Table),
            2 => Some(SchemaKind::Index),
            _ => None,
        }
    }

    pub fn from_type_name(name: &str) -> Option<SchemaKind> {
        match name {
            "table" => Some(SchemaKind::Table),
            "index" => Some(SchemaKind::Index),
            _ => None,
        }
    }
}

/// One schema row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEntry {
    pub kind: SchemaKind,
    pub name: String,
    pub tbl_name: String,
    pub root_page: u32,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MasterCatalog {
    pub(crate) entries: Vec<MasterEntry>,
    pub(crate) filter: Option<BTreeSet<String>>,
    pub(crate) kdf_salt: Option<[u8; SALT_LEN]>,
}

impl MasterCatalog {
    /// Whether rows owned by `tbl_name` belong to the recovery set.
    pub(crate) fn admits(&self, tbl_name: &str) -> bool {
        match self.filter {
            Some(ref filter) => filter.contains(tbl_name),
            None => self
                .entries
                .iter()
                .any(|e| e.kind == SchemaKind::Table && e.tbl_name == tbl_name),
        }
    }

    pub(crate) fn table(&self, name: &str) -> Option<&MasterEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == SchemaKind::Table && e.name == name)
    }
}

/// Owned handle to a schema catalog. Released explicitly; every operation
/// on a released handle fails cleanly.
#[derive(Debug)]
pub struct MasterInfo {
    inner: Option<MasterCatalog>,
}

impl MasterInfo {
    /// Filter-only catalog: restrict recovery to `tables`.
    pub fn make<I, S>(tables: I) -> MasterInfo
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MasterInfo {
            inner: Some(MasterCatalog {
                entries: Vec::new(),
                filter: Some(tables.into_iter().map(Into::into).collect()),
                kdf_salt: None,
            }),
        }
    }

    /// Read the schema of a live database.
    pub fn capture(conn: &Connection) -> RepairResult<MasterInfo> {
        let entries = read_live_schema(conn)?;
        Ok(MasterInfo {
            inner: Some(MasterCatalog {
                entries,
                filter: None,
                kdf_salt: None,
            }),
        })
    }

    /// Load a catalog saved by [`MasterInfo::save`] and return it with the
    /// KDF salt it carries. With `tables`, only entries owned by those
    /// tables are kept.
    pub fn load(
        path: impl AsRef<Path>,
        key: Option<&[u8]>,
        tables: Option<&[&str]>,
    ) -> RepairResult<(MasterInfo, Option<[u8; SALT_LEN]>)> {
        let path = path.as_ref();
        let material = material::read_master(path, key)?;

        let filter: Option<BTreeSet<String>> =
            tables.map(|names| names.iter().map(|n| n.to_string()).collect());
        let entries: Vec<MasterEntry> = material
            .entries
            .into_iter()
            .filter(|e| filter.as_ref().map_or(true, |f| f.contains(&e.tbl_name)))
            .collect();

        let count = entries.len().to_string();
        log_event_with_fields(
            Event::MasterLoaded,
            &[("entries", &count), ("path", &path.display().to_string())],
        );

        let salt = material.kdf_salt;
        Ok((
            MasterInfo {
                inner: Some(MasterCatalog {
                    entries,
                    filter,
                    kdf_salt: salt,
                }),
            },
            salt,
        ))
    }

    /// Snapshot a healthy database's schema to `path`. Returns false on
    /// any failure; the reason is logged.
    ///
    /// A live connection only ever sees plain pages, so no KDF salt is
    /// recorded here. For an encrypted source, read its salt with
    /// [`crate::pager::read_kdf_salt`] and go through [`MasterInfo::capture`],
    /// [`MasterInfo::set_kdf_salt`] and [`MasterInfo::write`].
    pub fn save(conn: &Connection, path: impl AsRef<Path>, key: Option<&[u8]>) -> bool {
        let path = path.as_ref();
        let result = MasterInfo::capture(conn).and_then(|info| info.write(path, key));
        match result {
            Ok(()) => true,
            Err(e) => {
                log_event_with_fields(
                    Event::MasterSaveFailed,
                    &[("error", &e.to_string()), ("path", &path.display().to_string())],
                );
                false
            }
        }
    }

    /// Write this catalog to `path`.
    pub fn write(&self, path: impl AsRef<Path>, key: Option<&[u8]>) -> RepairResult<()> {
        let catalog = self.catalog().ok_or_else(|| RepairError::released("MasterInfo"))?;
        let path = path.as_ref();
        material::write_master(path, &catalog.entries, catalog.kdf_salt, key)?;

        let count = catalog.entries.len().to_string();
        log_event_with_fields(
            Event::MasterSaved,
            &[("entries", &count), ("path", &path.display().to_string())],
        );
        Ok(())
    }

    pub fn set_kdf_salt(&mut self, salt: [u8; SALT_LEN]) {
        if let Some(ref mut catalog) = self.inner {
            catalog.kdf_salt = Some(salt);
        }
    }

    pub fn kdf_salt(&self) -> Option<[u8; SALT_LEN]> {
        self.inner.as_ref().and_then(|c| c.kdf_salt)
    }

    /// Entries in the catalog; empty once released.
    pub fn entries(&self) -> &[MasterEntry] {
        match self.inner {
            Some(ref catalog) => &catalog.entries,
            None => &[],
        }
    }

    pub fn table_filter(&self) -> Option<&BTreeSet<String>> {
        self.inner.as_ref().and_then(|c| c.filter.as_ref())
    }

    /// Free the catalog. Safe to call any number of times.
    pub fn release(&mut self) {
        self.inner = None;
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    pub(crate) fn catalog(&self) -> Option<&MasterCatalog> {
        self.inner.as_ref()
    }
}

fn read_live_schema(conn: &Connection) -> RepairResult<Vec<MasterEntry>> {
    let query = "SELECT type, name, tbl_name, rootpage, sql FROM sqlite_master \
                 WHERE type IN ('table', 'index') AND sql IS NOT NULL AND rootpage > 0";
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| RepairError::database("read schema", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(|e| RepairError::database("read schema", e))?;

    let mut entries = Vec::new();
    for row in rows {
        let (kind, name, tbl_name, root, sql) =
            row.map_err(|e| RepairError::database("read schema", e))?;
        let Some(kind) = SchemaKind::from_type_name(&kind) else {
            continue;
        };
        if is_internal_name(&name) {
            continue;
        }
        entries.push(MasterEntry {
            kind,
            name,
            tbl_name,
            root_page: root as u32,
            sql,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_is_filter_only() {
        let info = MasterInfo::make(["users"]);
        assert!(info.entries().is_empty());
        let catalog = info.catalog().unwrap();
        assert!(catalog.admits("users"));
        assert!(!catalog.admits("logs"));
    }

    #[test]
    fn test_capture_skips_internal_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT);
             CREATE INDEX t_v ON t(v);
             INSERT INTO t(v) VALUES('a');",
        )
        .unwrap();

        let info = MasterInfo::capture(&conn).unwrap();
        let names: Vec<&str> = info.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["t", "t_v"]);
        assert!(info.catalog().unwrap().admits("t"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut info = MasterInfo::make(["a"]);
        info.release();
        info.release();
        assert!(info.is_released());
        assert!(info.entries().is_empty());
        assert!(info.write("/nonexistent/x", None).is_err());
    }
}
