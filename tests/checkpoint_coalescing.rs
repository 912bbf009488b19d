//! AsyncCheckpointer tests
//!
//! - thresholds pick between skipping, PASSIVE and RESTART
//! - one task per database and WAL name is queued or running at a time
//! - attach/detach lowers and restores `synchronous`
//! - the shared pool lives exactly as long as something is attached

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rescuedb::checkpoint::{
    shared_executor_refs, AsyncCheckpointer, CheckpointConfig, CheckpointError, CheckpointMode,
    CheckpointResult, CheckpointTarget, Scheduled, SqliteCheckpointTarget, Synchronous,
};
use rusqlite::Connection;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Test Utilities
// =============================================================================

/// Records every checkpoint; optionally holds each one until released.
struct MockTarget {
    calls: Mutex<Vec<(String, CheckpointMode)>>,
    synchronous: Mutex<Synchronous>,
    gate: Mutex<bool>,
    opened: Condvar,
    fail: bool,
}

impl MockTarget {
    fn new(gated: bool) -> Arc<MockTarget> {
        Arc::new(MockTarget {
            calls: Mutex::new(Vec::new()),
            synchronous: Mutex::new(Synchronous::Full),
            gate: Mutex::new(!gated),
            opened: Condvar::new(),
            fail: false,
        })
    }

    fn failing() -> Arc<MockTarget> {
        Arc::new(MockTarget {
            calls: Mutex::new(Vec::new()),
            synchronous: Mutex::new(Synchronous::Full),
            gate: Mutex::new(true),
            opened: Condvar::new(),
            fail: true,
        })
    }

    fn open_gate(&self) {
        *self.gate.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn calls(&self) -> Vec<(String, CheckpointMode)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CheckpointTarget for MockTarget {
    fn checkpoint(&self, wal_name: &str, mode: CheckpointMode) -> CheckpointResult<()> {
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        self.calls.lock().unwrap().push((wal_name.to_string(), mode));
        if self.fail {
            return Err(CheckpointError::InvalidConfig("mock failure".into()));
        }
        Ok(())
    }

    fn synchronous(&self) -> CheckpointResult<Synchronous> {
        Ok(*self.synchronous.lock().unwrap())
    }

    fn set_synchronous(&self, mode: Synchronous) -> CheckpointResult<()> {
        *self.synchronous.lock().unwrap() = mode;
        Ok(())
    }
}

fn checkpointer(low: u32, high: u32) -> AsyncCheckpointer {
    AsyncCheckpointer::with_config(CheckpointConfig {
        low_watermark: low,
        high_watermark: high,
        workers: 2,
    })
    .unwrap()
}

fn as_target(mock: &Arc<MockTarget>) -> Arc<dyn CheckpointTarget> {
    Arc::clone(mock) as Arc<dyn CheckpointTarget>
}

// =============================================================================
// Thresholds
// =============================================================================

#[test]
fn test_thresholds_select_mode() {
    let cp = checkpointer(10, 50);
    let mock = MockTarget::new(false);
    let target = as_target(&mock);
    cp.attach(&target).unwrap();

    assert_eq!(cp.on_wal_commit(&target, "main", 9).unwrap(), Scheduled::Skipped);
    assert_eq!(
        cp.on_wal_commit(&target, "main", 10).unwrap(),
        Scheduled::Queued { blocking: false }
    );
    assert!(cp.wait_idle(WAIT));
    assert_eq!(
        cp.on_wal_commit(&target, "main", 50).unwrap(),
        Scheduled::Queued { blocking: true }
    );
    assert!(cp.wait_idle(WAIT));

    assert_eq!(
        mock.calls(),
        vec![
            ("main".to_string(), CheckpointMode::Passive),
            ("main".to_string(), CheckpointMode::Restart),
        ]
    );
    assert_eq!(cp.completed(), 2);
    assert_eq!(cp.failed(), 0);
}

#[test]
fn test_unattached_target_is_refused() {
    let cp = checkpointer(1, 2);
    let target = as_target(&MockTarget::new(false));

    assert!(matches!(
        cp.on_wal_commit(&target, "main", 5),
        Err(CheckpointError::NotAttached)
    ));
    // Below the watermark nothing is looked up.
    assert_eq!(cp.on_wal_commit(&target, "main", 0).unwrap(), Scheduled::Skipped);
    assert!(matches!(cp.detach(&target), Err(CheckpointError::NotAttached)));
}

#[test]
fn test_double_attach_is_refused() {
    let cp = checkpointer(1, 2);
    let target = as_target(&MockTarget::new(false));
    cp.attach(&target).unwrap();
    assert!(matches!(cp.attach(&target), Err(CheckpointError::AlreadyAttached)));
    cp.detach(&target).unwrap();
}

// =============================================================================
// Coalescing
// =============================================================================

#[test]
fn test_notifications_coalesce_while_task_pending() {
    let cp = checkpointer(1, 1000);
    let mock = MockTarget::new(true);
    let target = as_target(&mock);
    cp.attach(&target).unwrap();

    assert!(matches!(
        cp.on_wal_commit(&target, "main", 5).unwrap(),
        Scheduled::Queued { .. }
    ));
    for frames in 6..20 {
        assert_eq!(cp.on_wal_commit(&target, "main", frames).unwrap(), Scheduled::Coalesced);
    }
    // A different WAL of the same database is its own key.
    assert!(matches!(
        cp.on_wal_commit(&target, "aux", 5).unwrap(),
        Scheduled::Queued { .. }
    ));
    assert_eq!(cp.pending_len(), 2);

    mock.open_gate();
    assert!(cp.wait_idle(WAIT));
    assert_eq!(cp.pending_len(), 0);

    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().any(|(name, _)| name == "main"));
    assert!(calls.iter().any(|(name, _)| name == "aux"));

    // Once the task is done the key is free again.
    assert!(matches!(
        cp.on_wal_commit(&target, "main", 5).unwrap(),
        Scheduled::Queued { .. }
    ));
    assert!(cp.wait_idle(WAIT));
    assert_eq!(mock.calls().len(), 3);
}

#[test]
fn test_failed_checkpoint_is_counted_and_frees_key() {
    let cp = checkpointer(1, 2);
    let mock = MockTarget::failing();
    let target = as_target(&mock);
    cp.attach(&target).unwrap();

    cp.on_wal_commit(&target, "main", 1).unwrap();
    assert!(cp.wait_idle(WAIT));
    assert_eq!(cp.failed(), 1);
    assert_eq!(cp.completed(), 0);
    assert_eq!(cp.pending_len(), 0);
}

#[test]
fn test_wait_idle_times_out_while_blocked() {
    let cp = checkpointer(1, 2);
    let mock = MockTarget::new(true);
    let target = as_target(&mock);
    cp.attach(&target).unwrap();

    cp.on_wal_commit(&target, "main", 1).unwrap();
    assert!(!cp.wait_idle(Duration::from_millis(50)));
    mock.open_gate();
    assert!(cp.wait_idle(WAIT));
}

// =============================================================================
// Durability level
// =============================================================================

#[test]
fn test_attach_lowers_and_detach_restores_synchronous() {
    let cp = checkpointer(1, 2);
    let mock = MockTarget::new(false);
    let target = as_target(&mock);

    cp.attach(&target).unwrap();
    assert_eq!(target.synchronous().unwrap(), Synchronous::Normal);
    cp.detach(&target).unwrap();
    assert_eq!(target.synchronous().unwrap(), Synchronous::Full);
}

#[test]
fn test_drop_restores_attached_targets() {
    let mock = MockTarget::new(false);
    let target = as_target(&mock);
    {
        let cp = checkpointer(1, 2);
        cp.attach(&target).unwrap();
        assert_eq!(target.synchronous().unwrap(), Synchronous::Normal);
    }
    assert_eq!(target.synchronous().unwrap(), Synchronous::Full);
}

#[test]
fn test_sqlite_target_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("live.db");
    let conn = Connection::open(&path).unwrap();
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())).unwrap();
    conn.execute_batch("PRAGMA synchronous = FULL; CREATE TABLE t(a);")
        .unwrap();

    let sqlite = Arc::new(SqliteCheckpointTarget::new(conn));
    let target: Arc<dyn CheckpointTarget> = sqlite.clone();

    let cp = checkpointer(1, 1000);
    cp.attach(&target).unwrap();
    assert_eq!(target.synchronous().unwrap(), Synchronous::Normal);

    sqlite.with_connection(|conn| {
        for i in 0..50 {
            conn.execute("INSERT INTO t VALUES(?1)", [i]).unwrap();
        }
    });
    cp.on_wal_commit(&target, "main", 50).unwrap();
    assert!(cp.wait_idle(WAIT));
    assert_eq!(cp.completed(), 1);

    cp.detach(&target).unwrap();
    assert_eq!(target.synchronous().unwrap(), Synchronous::Full);

    let rows: i64 = sqlite.with_connection(|conn| {
        conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap()
    });
    assert_eq!(rows, 50);
}

// =============================================================================
// Shared pool
// =============================================================================

#[test]
fn test_shared_pool_follows_attachments() {
    // The only test in this binary that touches the shared pool.
    assert_eq!(shared_executor_refs(), 0);

    let first = AsyncCheckpointer::new();
    let second = AsyncCheckpointer::new();
    let a = as_target(&MockTarget::new(false));
    let b = as_target(&MockTarget::new(false));

    first.attach(&a).unwrap();
    second.attach(&b).unwrap();
    assert_eq!(shared_executor_refs(), 2);

    let frames = first.config().low_watermark;
    first.on_wal_commit(&a, "main", frames).unwrap();
    assert!(first.wait_idle(WAIT));
    assert_eq!(first.completed(), 1);

    first.detach(&a).unwrap();
    assert_eq!(shared_executor_refs(), 1);
    drop(second);
    assert_eq!(shared_executor_refs(), 0);
}
