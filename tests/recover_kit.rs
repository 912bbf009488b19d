//! BackupKit / RecoverKit tests
//!
//! A dump of a healthy database replays into an empty one with the same
//! tables, rows and schema objects. Encryption, filters, statement
//! failures and damaged dumps are covered separately.

mod common;

use std::fs;
use std::path::PathBuf;

use common::*;
use rescuedb::backup::{BackupErrorCode, BackupKit, RecoverKit, TableFilter, FLAG_NO_CREATE_TABLE};
use rescuedb::repair::Outcome;
use rescuedb::CancellationSignal;
use rusqlite::Connection;

fn source_with_objects(dir: &tempfile::TempDir) -> PathBuf {
    let path = build_source(dir);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE log(id INTEGER PRIMARY KEY AUTOINCREMENT, msg TEXT);
         INSERT INTO log(msg) VALUES('one'), ('two'), ('three');
         DELETE FROM log WHERE msg = 'three';
         CREATE VIEW rich AS SELECT id, name FROM users WHERE score > 1000;
         CREATE TRIGGER log_users AFTER INSERT ON users BEGIN
             INSERT INTO log(msg) VALUES('user ' || NEW.id);
         END;",
    )
    .unwrap();
    path
}

fn dump(source: &PathBuf, out: &PathBuf, key: Option<&[u8]>) -> BackupKit {
    let conn = Connection::open(source).unwrap();
    let mut kit = BackupKit::new(out, key, 0, None);
    assert_eq!(kit.run(&conn).unwrap(), Outcome::Ok);
    kit
}

fn object_names(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT type || ':' || name FROM sqlite_master ORDER BY type, name")
        .unwrap();
    let rows = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
    rows.map(Result::unwrap).collect()
}

// =============================================================================
// Full round trip
// =============================================================================

#[test]
fn test_dump_replays_into_empty_database() {
    let dir = temp_dir();
    let source = source_with_objects(&dir);
    let out = dir.path().join("source.dump");
    let backup = dump(&source, &out, None);
    assert_eq!(backup.row_count(), (USER_ROWS + NOTE_ROWS + 2 + 1) as u64);
    assert!(!dir.path().join("source.dump.tmp").exists());

    let mut kit = RecoverKit::new(&out, None).unwrap();
    let dest = Connection::open(dir.path().join("dest.db")).unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Ok);
    assert_eq!(kit.failure_count(), 0);
    assert!(kit.is_released());

    let src = Connection::open(&source).unwrap();
    assert_eq!(object_names(&dest), object_names(&src));
    assert_eq!(dump_rows(&dest, "users"), dump_rows(&src, "users"));
    assert_eq!(dump_rows(&dest, "notes"), dump_rows(&src, "notes"));
    assert_eq!(dump_rows(&dest, "log"), dump_rows(&src, "log"));

    // The AUTOINCREMENT high-water mark survives: the next id is 4, not 3.
    dest.execute_batch("INSERT INTO log(msg) VALUES('four')").unwrap();
    let last: i64 = dest
        .query_row("SELECT max(id) FROM log", [], |row| row.get(0))
        .unwrap();
    assert_eq!(last, 4);

    // The trigger was created after the data, so replay did not fire it.
    assert_eq!(count(&dest, "log"), 3);
}

#[test]
fn test_dump_leaves_sibling_tmp_file_alone() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let sibling = dir.path().join("source.tmp");
    fs::write(&sibling, b"unrelated").unwrap();

    let out = dir.path().join("source.dump");
    dump(&source, &out, None);
    assert!(out.exists());
    assert_eq!(fs::read(&sibling).unwrap(), b"unrelated");
}

#[test]
fn test_second_run_is_refused() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");
    dump(&source, &out, None);

    let mut kit = RecoverKit::new(&out, None).unwrap();
    let dest = Connection::open_in_memory().unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Ok);
    assert_eq!(kit.run(&dest, false), Outcome::Failed);
    assert!(kit.last_error().is_some());
}

// =============================================================================
// Encryption
// =============================================================================

#[test]
fn test_encrypted_dump_needs_key() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");
    dump(&source, &out, Some(b"secret".as_slice()));

    let err = RecoverKit::new(&out, None).unwrap_err();
    assert_eq!(err.code(), BackupErrorCode::BkWrongKey);
    let err = RecoverKit::new(&out, Some(b"guess".as_slice())).unwrap_err();
    assert_eq!(err.code(), BackupErrorCode::BkWrongKey);

    let mut kit = RecoverKit::new(&out, Some(b"secret".as_slice())).unwrap();
    let dest = Connection::open_in_memory().unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Ok);
    assert_eq!(count(&dest, "users"), USER_ROWS);
}

#[test]
fn test_missing_and_foreign_files() {
    let dir = temp_dir();
    let err = RecoverKit::new(dir.path().join("absent.dump"), None).unwrap_err();
    assert_eq!(err.code(), BackupErrorCode::BkNotFound);

    let source = build_source(&dir);
    let err = RecoverKit::new(&source, None).unwrap_err();
    assert_eq!(err.code(), BackupErrorCode::BkCorrupt);
}

// =============================================================================
// Filters and flags
// =============================================================================

#[test]
fn test_table_filter_with_condition() {
    let dir = temp_dir();
    let source = source_with_objects(&dir);
    let out = dir.path().join("filtered.dump");

    let conn = Connection::open(&source).unwrap();
    let filters = vec![TableFilter::matching("users", "id <= 10")];
    let mut backup = BackupKit::new(&out, None, 0, Some(filters));
    assert_eq!(backup.run(&conn).unwrap(), Outcome::Ok);
    assert_eq!(backup.row_count(), 10);

    let mut kit = RecoverKit::new(&out, None).unwrap();
    let dest = Connection::open_in_memory().unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Ok);

    assert_eq!(count(&dest, "users"), 10);
    assert!(!table_exists(&dest, "notes"));
    assert!(!table_exists(&dest, "log"));
    let names = object_names(&dest);
    assert!(names.contains(&"index:users_name".to_string()));
    // The trigger is owned by users; the view is dropped under a filter.
    assert!(names.contains(&"trigger:log_users".to_string()));
    assert!(!names.contains(&"view:rich".to_string()));
}

#[test]
fn test_no_create_dump_fills_existing_tables() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("rows.dump");

    let conn = Connection::open(&source).unwrap();
    let filters = vec![TableFilter::all_rows("users")];
    let mut backup = BackupKit::new(&out, None, FLAG_NO_CREATE_TABLE, Some(filters));
    assert_eq!(backup.run(&conn).unwrap(), Outcome::Ok);

    let dest = Connection::open_in_memory().unwrap();
    dest.execute_batch("CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL)")
        .unwrap();
    let mut kit = RecoverKit::new(&out, None).unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Ok);
    assert_eq!(count(&dest, "users"), USER_ROWS);
    assert!(!object_names(&dest).contains(&"index:users_name".to_string()));
}

// =============================================================================
// Failures during replay
// =============================================================================

fn strict_destination() -> Connection {
    let dest = Connection::open_in_memory().unwrap();
    dest.execute_batch(
        "CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL CHECK (score < 1000));",
    )
    .unwrap();
    dest
}

#[test]
fn test_failing_statements_are_counted_and_skipped() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");
    dump(&source, &out, None);

    let dest = strict_destination();
    let mut kit = RecoverKit::new(&out, None).unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Ok);

    // CREATE TABLE users fails (exists), rows with score >= 1000 fail CHECK.
    assert_eq!(count(&dest, "users"), 999);
    assert_eq!(kit.failure_count(), 1 + (USER_ROWS - 999) as u64);
    assert_eq!(count(&dest, "notes"), NOTE_ROWS);
}

#[test]
fn test_fatal_stops_at_first_failure() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");
    dump(&source, &out, None);

    let dest = strict_destination();
    let mut kit = RecoverKit::new(&out, None).unwrap();
    assert_eq!(kit.run(&dest, true), Outcome::Failed);
    assert_eq!(kit.failure_count(), 1);
    assert!(kit.last_error().is_some());
    assert!(dest.is_autocommit());
    assert_eq!(count(&dest, "users"), 0);
}

#[test]
fn test_truncated_dump_keeps_replayed_rows() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");
    dump(&source, &out, None);

    // Drop the end marker.
    let bytes = fs::read(&out).unwrap();
    fs::write(&out, &bytes[..bytes.len() - 8]).unwrap();

    let mut kit = RecoverKit::new(&out, None).unwrap();
    let dest = Connection::open_in_memory().unwrap();
    assert_eq!(kit.run(&dest, false), Outcome::Failed);
    assert!(dest.is_autocommit());
    assert_eq!(count(&dest, "users"), USER_ROWS);
    assert_eq!(count(&dest, "notes"), NOTE_ROWS);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_canceled_backup_leaves_no_file() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");

    let conn = Connection::open(&source).unwrap();
    let signal = CancellationSignal::new();
    signal.cancel();
    let mut kit = BackupKit::new(&out, None, 0, None);
    assert_eq!(kit.run_with(&conn, Some(&signal)).unwrap(), Outcome::Canceled);
    assert!(!out.exists());
    assert!(!dir.path().join("source.dump.tmp").exists());
}

#[test]
fn test_canceled_recover_rolls_back_open_batch() {
    let dir = temp_dir();
    let source = build_source(&dir);
    let out = dir.path().join("source.dump");
    dump(&source, &out, None);

    let signal = CancellationSignal::new();
    signal.cancel();
    let mut kit = RecoverKit::new(&out, None).unwrap();
    let dest = Connection::open_in_memory().unwrap();
    assert_eq!(kit.run_with(&dest, false, Some(&signal)), Outcome::Canceled);
    assert!(dest.is_autocommit());
    assert!(!table_exists(&dest, "users"));
}
