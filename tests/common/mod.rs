//! Shared fixtures for the integration tests
//!
//! Source databases are built with rusqlite and then damaged by
//! overwriting whole pages on disk.

#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rescuedb::repair::LeafInfo;
use rusqlite::Connection;
use tempfile::TempDir;

pub const USER_ROWS: i64 = 2000;
pub const NOTE_ROWS: i64 = 20;
pub const PAGE_SIZE: usize = 4096;

pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// `users` spans many leaves under an interior root; `notes` holds
/// overflowing blobs; `users_name` indexes `users`.
pub fn build_source(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("source.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(&format!(
        "PRAGMA page_size = {page};
         CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL);
         CREATE INDEX users_name ON users(name);
         CREATE TABLE notes(id INTEGER PRIMARY KEY, title TEXT, body BLOB);
         WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < {users})
         INSERT INTO users(id, name, score) SELECT x, 'user-' || x, x + 0.25 FROM c;
         WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < {notes})
         INSERT INTO notes(id, title, body) SELECT x, 'note-' || x, randomblob(6000) FROM c;",
        page = PAGE_SIZE,
        users = USER_ROWS,
        notes = NOTE_ROWS,
    ))
    .unwrap();
    path
}

pub fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT count(*) FROM \"{}\"", table), [], |row| {
        row.get(0)
    })
    .unwrap()
}

pub fn table_exists(conn: &Connection, table: &str) -> bool {
    conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, i64>(0),
    )
    .unwrap()
        > 0
}

pub fn root_page(path: &Path, table: &str) -> u32 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(
        "SELECT rootpage FROM sqlite_master WHERE name = ?1",
        [table],
        |row| row.get(0),
    )
    .unwrap()
}

/// Leaf pages of `table`, in key order.
pub fn leaf_pages(path: &Path, table: &str) -> Vec<u32> {
    let conn = Connection::open(path).unwrap();
    let info = LeafInfo::scan(&conn, Some(&[table][..]), None).unwrap();
    let root = root_page(path, table);
    info.leaves(root).unwrap().to_vec()
}

/// Overwrite page `pgno` with zeros.
pub fn zero_page(path: &Path, pgno: u32) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start((u64::from(pgno) - 1) * PAGE_SIZE as u64))
        .unwrap();
    file.write_all(&[0u8; PAGE_SIZE]).unwrap();
    file.sync_all().unwrap();
}

/// Overwrite `len` bytes at `offset` with zeros.
pub fn zero_range(path: &Path, offset: usize, len: usize) {
    let mut bytes = fs::read(path).unwrap();
    bytes[offset..offset + len].fill(0);
    fs::write(path, bytes).unwrap();
}

/// Every row of `table` ordered by rowid, rendered for comparison.
pub fn dump_rows(conn: &Connection, table: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM \"{}\" ORDER BY rowid", table))
        .unwrap();
    let columns = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            let mut parts = Vec::with_capacity(columns);
            for i in 0..columns {
                let value: rusqlite::types::Value = row.get(i)?;
                parts.push(format!("{:?}", value));
            }
            Ok(parts.join("|"))
        })
        .unwrap();
    rows.map(Result::unwrap).collect()
}
