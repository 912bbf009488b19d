//! What a checkpoint runs against

use std::sync::Mutex;

use rusqlite::Connection;

use super::errors::CheckpointResult;
use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// `PRAGMA synchronous` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronous {
    Off,
    Normal,
    Full,
    Extra,
}

impl Synchronous {
    pub fn level(&self) -> i64 {
        match self {
            Synchronous::Off => 0,
            Synchronous::Normal => 1,
            Synchronous::Full => 2,
            Synchronous::Extra => 3,
        }
    }

    pub fn from_level(level: i64) -> Synchronous {
        match level {
            0 => Synchronous::Off,
            1 => Synchronous::Normal,
            3 => Synchronous::Extra,
            _ => Synchronous::Full,
        }
    }
}

/// A database the checkpointer can be attached to.
///
/// Identity is the `Arc` allocation the target lives in, so one target
/// must be attached and notified through the same `Arc`.
pub trait CheckpointTarget: Send + Sync {
    /// Fold the WAL of schema `wal_name` back into the database file.
    fn checkpoint(&self, wal_name: &str, mode: CheckpointMode) -> CheckpointResult<()>;

    fn synchronous(&self) -> CheckpointResult<Synchronous>;

    fn set_synchronous(&self, mode: Synchronous) -> CheckpointResult<()>;
}

/// A rusqlite connection behind a mutex.
pub struct SqliteCheckpointTarget {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointTarget {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Run `f` with the connection locked.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&lock(&self.conn))
    }
}

impl CheckpointTarget for SqliteCheckpointTarget {
    fn checkpoint(&self, wal_name: &str, mode: CheckpointMode) -> CheckpointResult<()> {
        let pragma = format!(
            "PRAGMA {}.wal_checkpoint({})",
            crate::sql::quote_identifier(wal_name),
            mode.as_str()
        );
        lock(&self.conn).query_row(&pragma, [], |_| Ok(()))?;
        Ok(())
    }

    fn synchronous(&self) -> CheckpointResult<Synchronous> {
        let level: i64 = lock(&self.conn).query_row("PRAGMA synchronous", [], |row| row.get(0))?;
        Ok(Synchronous::from_level(level))
    }

    fn set_synchronous(&self, mode: Synchronous) -> CheckpointResult<()> {
        lock(&self.conn).execute_batch(&format!("PRAGMA synchronous = {}", mode.level()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_target_checkpoint_and_synchronous() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("wal.db")).unwrap();
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())).unwrap();
        conn.execute_batch("CREATE TABLE t(a); INSERT INTO t VALUES(1);")
            .unwrap();

        let target = SqliteCheckpointTarget::new(conn);
        target.set_synchronous(Synchronous::Off).unwrap();
        assert_eq!(target.synchronous().unwrap(), Synchronous::Off);
        target.checkpoint("main", CheckpointMode::Truncate).unwrap();
    }
}
