//! LeafInfo: a captured inventory of table leaf pages per root page
//!
//! Built by walking every interior page of a healthy database. During
//! repair, a root whose recorded leaves all still read back as table leaves
//! is decoded straight from the list; otherwise that table falls back to a
//! full walk. The inventory is only exact for the file state it was taken
//! from.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rusqlite::Connection;

use crate::cancel::{attach_optional, CancellationSignal};
use crate::observability::{log_event_with_fields, Event};
use crate::pager::{walk_table, BtreePage, Pager, WalkOutcome};
use crate::sql::{is_internal_name, is_wal_mode, main_database_path};

use super::errors::{RepairError, RepairResult};
use super::material;

#[derive(Debug)]
pub struct LeafInfo {
    inner: Option<BTreeMap<u32, Vec<u32>>>,
}

impl LeafInfo {
    /// Walk the tables of a live database and record their leaves.
    ///
    /// Expensive: reads every interior and leaf page header. A WAL database
    /// is checkpointed first so the main file holds every committed page.
    /// Cancellation makes the call fail with `RK_CANCELED`.
    pub fn scan(
        conn: &Connection,
        tables: Option<&[&str]>,
        signal: Option<&CancellationSignal>,
    ) -> RepairResult<LeafInfo> {
        let cancel = Arc::new(AtomicBool::new(false));
        let _attached = attach_optional(signal, &cancel);

        if is_wal_mode(conn).map_err(|e| RepairError::database("query journal mode", e))? {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(|e| RepairError::database("checkpoint before scan", e))?;
        }

        let path = main_database_path(conn)
            .map_err(|e| RepairError::database("locate database file", e))?
            .ok_or_else(|| RepairError::material_invalid("database has no backing file"))?;
        let roots = table_roots(conn, tables)?;

        let mut pager = Pager::open(&path, None, None)
            .map_err(|e| RepairError::open_failed("open for scan", e))?;

        let mut map = BTreeMap::new();
        for root in roots {
            let mut leaves = Vec::new();
            let mut record = |_: &mut Pager, page: &BtreePage<'_>| {
                leaves.push(page.pgno());
                ControlFlow::Continue(())
            };
            let outcome = walk_table(&mut pager, root, &cancel, &mut record);
            if outcome == WalkOutcome::Canceled {
                return Err(RepairError::canceled());
            }
            map.insert(root, leaves);
        }

        let roots = map.len().to_string();
        let leaves = map.values().map(Vec::len).sum::<usize>().to_string();
        log_event_with_fields(Event::LeafScanned, &[("leaves", &leaves), ("roots", &roots)]);

        Ok(LeafInfo { inner: Some(map) })
    }

    pub fn load(path: impl AsRef<Path>) -> RepairResult<LeafInfo> {
        Ok(LeafInfo {
            inner: Some(material::read_leaves(path.as_ref())?),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RepairResult<()> {
        let map = self.inner.as_ref().ok_or_else(|| RepairError::released("LeafInfo"))?;
        material::write_leaves(path.as_ref(), map)
    }

    /// Recorded leaves under `root`.
    pub fn leaves(&self, root: u32) -> Option<&[u32]> {
        self.inner.as_ref()?.get(&root).map(Vec::as_slice)
    }

    pub fn roots(&self) -> Vec<u32> {
        self.inner
            .as_ref()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Free the inventory. Safe to call any number of times.
    pub fn release(&mut self) {
        self.inner = None;
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    pub(crate) fn map(&self) -> Option<&BTreeMap<u32, Vec<u32>>> {
        self.inner.as_ref()
    }
}

fn table_roots(conn: &Connection, tables: Option<&[&str]>) -> RepairResult<Vec<u32>> {
    let mut stmt = conn
        .prepare("SELECT name, rootpage FROM sqlite_master WHERE type = 'table' AND rootpage > 0")
        .map_err(|e| RepairError::database("read schema", e))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| RepairError::database("read schema", e))?;

    let mut roots = Vec::new();
    for row in rows {
        let (name, root) = row.map_err(|e| RepairError::database("read schema", e))?;
        if is_internal_name(&name) {
            continue;
        }
        if tables.map_or(true, |t| t.contains(&name.as_str())) {
            roots.push(root as u32);
        }
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_filters_tables() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("live.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE a(x); CREATE TABLE b(y);
             INSERT INTO a VALUES(1); INSERT INTO b VALUES(2);",
        )
        .unwrap();

        let all = LeafInfo::scan(&conn, None, None).unwrap();
        assert_eq!(all.roots().len(), 2);

        let only_a = LeafInfo::scan(&conn, Some(&["a"][..]), None).unwrap();
        assert_eq!(only_a.roots().len(), 1);
        let root = only_a.roots()[0];
        assert_eq!(only_a.leaves(root), Some(&[root][..]));
    }

    #[test]
    fn test_scan_canceled() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("live.db")).unwrap();
        conn.execute_batch("CREATE TABLE a(x); INSERT INTO a VALUES(1);").unwrap();

        let signal = CancellationSignal::new();
        signal.cancel();
        let err = LeafInfo::scan(&conn, None, Some(&signal)).unwrap_err();
        assert!(err.is_canceled());
    }

    #[test]
    fn test_in_memory_database_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(LeafInfo::scan(&conn, None, None).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut info = LeafInfo { inner: Some(BTreeMap::new()) };
        info.release();
        info.release();
        assert!(info.is_released());
        assert!(info.save("/nonexistent/leaf").is_err());
        assert!(info.leaves(2).is_none());
    }
}
