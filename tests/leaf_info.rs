//! LeafInfo inventory tests
//!
//! - a scan lists every leaf of every user table, in key order
//! - save/load is lossless and damage is detected
//! - WAL databases are checkpointed before the scan
//! - a released inventory cannot be saved and clears hints

mod common;

use std::fs;

use common::*;
use rescuedb::repair::{LeafInfo, Outcome, RepairErrorCode, RepairKit};
use rescuedb::CancellationSignal;
use rusqlite::Connection;

// =============================================================================
// Scanning
// =============================================================================

#[test]
fn test_scan_covers_user_tables() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let conn = Connection::open(&source).unwrap();

    let info = LeafInfo::scan(&conn, None, None).unwrap();
    let mut roots = info.roots();
    roots.sort_unstable();
    let mut expected = vec![root_page(&source, "users"), root_page(&source, "notes")];
    expected.sort_unstable();
    assert_eq!(roots, expected);

    let users = info.leaves(root_page(&source, "users")).unwrap();
    assert!(users.len() > 1);
    assert!(!users.contains(&root_page(&source, "users")));
    assert!(info.leaves(root_page(&source, "users_name")).is_none());
}

#[test]
fn test_scan_single_leaf_table_lists_root() {
    let dir = temp_dir();
    let path = dir.path().join("tiny.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE t(a); INSERT INTO t VALUES(1);")
        .unwrap();

    let info = LeafInfo::scan(&conn, None, None).unwrap();
    let root = root_page(&path, "t");
    assert_eq!(info.leaves(root), Some(&[root][..]));
}

#[test]
fn test_scan_checkpoints_wal_first() {
    let dir = temp_dir();
    let path = dir.path().join("wal.db");
    let conn = Connection::open(&path).unwrap();
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())).unwrap();
    conn.execute_batch(
        "CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT);
         WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000)
         INSERT INTO t SELECT x, 'value-' || x FROM c;",
    )
    .unwrap();

    let info = LeafInfo::scan(&conn, None, None).unwrap();
    let root: u32 = conn
        .query_row("SELECT rootpage FROM sqlite_master WHERE name = 't'", [], |r| r.get(0))
        .unwrap();
    assert!(info.leaves(root).unwrap().len() > 1);
}

#[test]
fn test_scan_canceled() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let conn = Connection::open(&source).unwrap();

    let signal = CancellationSignal::new();
    signal.cancel();
    let err = LeafInfo::scan(&conn, None, Some(&signal)).unwrap_err();
    assert_eq!(err.code(), RepairErrorCode::RkCanceled);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_save_load_roundtrip() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let conn = Connection::open(&source).unwrap();
    let path = dir.path().join("source.leaves");

    let info = LeafInfo::scan(&conn, None, None).unwrap();
    info.save(&path).unwrap();
    let loaded = LeafInfo::load(&path).unwrap();

    for root in info.roots() {
        assert_eq!(loaded.leaves(root), info.leaves(root));
    }
}

#[test]
fn test_damaged_inventory_is_corrupt() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let conn = Connection::open(&source).unwrap();
    let path = dir.path().join("source.leaves");
    LeafInfo::scan(&conn, None, None).unwrap().save(&path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[10] ^= 0x40;
    fs::write(&path, bytes).unwrap();

    let err = LeafInfo::load(&path).unwrap_err();
    assert_eq!(err.code(), RepairErrorCode::RkMaterialCorrupt);
}

// =============================================================================
// Handle lifetime
// =============================================================================

#[test]
fn test_released_inventory() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let conn = Connection::open(&source).unwrap();

    let mut info = LeafInfo::scan(&conn, None, None).unwrap();
    info.release();
    info.release();
    assert!(info.is_released());
    assert!(info.roots().is_empty());

    let err = info.save(dir.path().join("x.leaves")).unwrap_err();
    assert_eq!(err.code(), RepairErrorCode::RkReleased);

    // Setting a released inventory leaves the kit walking trees.
    let mut kit = RepairKit::open(&source, None, None).unwrap();
    kit.set_leaf_info(&info);
    let dest = Connection::open_in_memory().unwrap();
    assert_eq!(kit.output(&dest, 0), Outcome::Ok);
    assert_eq!(count(&dest, "users"), USER_ROWS);
}
