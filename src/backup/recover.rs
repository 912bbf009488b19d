//! RecoverKit: replay a statement dump into a database

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::cancel::{attach_optional, CancellationSignal};
use crate::crypto::Keystream;
use crate::observability::{log_event_with_fields, Event};
use crate::repair::Outcome;

use super::errors::{BackupError, BackupResult};
use super::format::{DumpHeader, SectionReader, Token, HEADER_LEN};

/// Successful rows per transaction during replay.
pub const RECOVER_BATCH_ROWS: u64 = 256;

struct RecoverSession {
    path: PathBuf,
    reader: SectionReader<BufReader<File>>,
}

/// Why a replay stopped early.
enum Stop {
    Canceled,
    /// A statement failed under `fatal`, or the destination broke
    Aborted(String),
    /// The dump itself is damaged; what was replayed is kept
    Stream(BackupError),
}

pub struct RecoverKit {
    session: Option<RecoverSession>,
    success: u64,
    failure: u64,
    last_error: Option<String>,
}

impl std::fmt::Debug for RecoverKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverKit")
            .field("path", &self.session.as_ref().map(|s| &s.path))
            .field("success", &self.success)
            .field("failure", &self.failure)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl RecoverKit {
    /// Open a dump and check its header and key.
    pub fn new(path: impl AsRef<Path>, key: Option<&[u8]>) -> BackupResult<RecoverKit> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| BackupError::open(path, e))?;
        let mut input = BufReader::new(file);

        let mut raw = [0u8; HEADER_LEN];
        input.read_exact(&mut raw).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => BackupError::corrupt("dump shorter than its header"),
            _ => BackupError::io(format!("read {}", path.display()), e),
        })?;
        let header = DumpHeader::decode(&raw)?;
        let keystream = key.map(Keystream::for_material);
        header.check_key(keystream.as_ref())?;

        Ok(RecoverKit {
            session: Some(RecoverSession {
                path: path.to_path_buf(),
                reader: SectionReader::new(input, keystream),
            }),
            success: 0,
            failure: 0,
            last_error: None,
        })
    }

    pub fn run(&mut self, conn: &Connection, fatal: bool) -> Outcome {
        self.run_with(conn, fatal, None)
    }

    /// Replay every statement into `conn`. One-shot: the session is
    /// released when this returns.
    ///
    /// Without `fatal`, a failing statement is counted and skipped. With
    /// it, the first failure rolls back the open batch and ends the run.
    pub fn run_with(
        &mut self,
        conn: &Connection,
        fatal: bool,
        signal: Option<&CancellationSignal>,
    ) -> Outcome {
        let Some(mut session) = self.session.take() else {
            self.last_error = Some(BackupError::released("RecoverKit").to_string());
            return Outcome::Failed;
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let _attached = attach_optional(signal, &cancel);

        let path_text = session.path.display().to_string();
        log_event_with_fields(Event::RecoverBegin, &[("path", &path_text)]);

        let mut replay = Replay {
            conn,
            fatal,
            owns_txn: conn.is_autocommit(),
            in_txn: false,
            uncommitted: 0,
            success: 0,
            failure: 0,
            last_error: None,
        };
        let result = replay.run(&mut session.reader, &cancel);

        let outcome = match result {
            Ok(()) => match replay.commit() {
                Ok(()) => Outcome::Ok,
                Err(e) => {
                    replay.last_error = Some(e);
                    Outcome::Failed
                }
            },
            Err(Stop::Canceled) => {
                replay.rollback();
                Outcome::Canceled
            }
            Err(Stop::Aborted(reason)) => {
                replay.rollback();
                replay.last_error = Some(reason);
                Outcome::Failed
            }
            Err(Stop::Stream(e)) => {
                if let Err(reason) = replay.commit() {
                    replay.rollback();
                    replay.last_error = Some(reason);
                } else {
                    replay.last_error = Some(e.to_string());
                }
                Outcome::Failed
            }
        };

        self.success = replay.success;
        self.failure = replay.failure;
        self.last_error = replay.last_error;

        let success = self.success.to_string();
        let failure = self.failure.to_string();
        log_event_with_fields(
            Event::RecoverDone,
            &[
                ("failure", &failure),
                ("outcome", &format!("{:?}", outcome)),
                ("path", &path_text),
                ("success", &success),
            ],
        );
        outcome
    }

    pub fn success_count(&self) -> u64 {
        self.success
    }

    pub fn failure_count(&self) -> u64 {
        self.failure
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Close the dump. Safe to call any number of times.
    pub fn release(&mut self) {
        self.session = None;
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }
}

struct Replay<'c> {
    conn: &'c Connection,
    fatal: bool,
    owns_txn: bool,
    in_txn: bool,
    uncommitted: u64,
    success: u64,
    failure: u64,
    last_error: Option<String>,
}

impl Replay<'_> {
    fn run<R: Read>(
        &mut self,
        reader: &mut SectionReader<R>,
        cancel: &AtomicBool,
    ) -> Result<(), Stop> {
        self.conn
            .execute_batch("PRAGMA foreign_keys=OFF")
            .map_err(|e| Stop::Aborted(e.to_string()))?;
        self.begin()?;

        let mut repeated: Option<String> = None;
        let mut binds: Vec<Value> = Vec::new();
        loop {
            let token = match reader.next_token() {
                Ok(Some(token)) => token,
                Ok(None) => return Ok(()),
                Err(e) => return Err(Stop::Stream(e)),
            };
            match token {
                Token::OneShot(sql) => {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(Stop::Canceled);
                    }
                    let result = self.conn.execute_batch(&sql);
                    self.record(result.map(|_| ()), &sql)?;
                }
                Token::Repeated(sql) => {
                    binds.clear();
                    repeated = Some(sql);
                }
                Token::Bind(value) => binds.push(value),
                Token::EndRow => {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(Stop::Canceled);
                    }
                    let Some(ref sql) = repeated else {
                        return Err(Stop::Stream(BackupError::corrupt("row outside a statement")));
                    };
                    let result = self
                        .conn
                        .prepare_cached(sql)
                        .and_then(|mut stmt| stmt.execute(params_from_iter(binds.iter())));
                    binds.clear();
                    if self.record(result.map(|_| ()), sql)? {
                        self.uncommitted += 1;
                        if self.uncommitted >= RECOVER_BATCH_ROWS {
                            self.commit().map_err(Stop::Aborted)?;
                            self.begin()?;
                        }
                    }
                }
                Token::EndSql => {
                    repeated = None;
                    binds.clear();
                }
            }
        }
    }

    /// Count one statement result. Returns whether it succeeded.
    fn record(&mut self, result: rusqlite::Result<()>, sql: &str) -> Result<bool, Stop> {
        match result {
            Ok(()) => {
                self.success += 1;
                Ok(true)
            }
            Err(e) => {
                let reason = e.to_string();
                log_event_with_fields(
                    Event::RecoverStatementFailed,
                    &[("error", &reason), ("sql", sql)],
                );
                self.failure += 1;
                self.last_error = Some(reason.clone());
                if self.fatal {
                    Err(Stop::Aborted(reason))
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn begin(&mut self) -> Result<(), Stop> {
        if self.owns_txn && !self.in_txn {
            self.conn
                .execute_batch("BEGIN")
                .map_err(|e| Stop::Aborted(e.to_string()))?;
            self.in_txn = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), String> {
        if self.in_txn {
            self.conn.execute_batch("COMMIT").map_err(|e| e.to_string())?;
            self.in_txn = false;
        }
        self.uncommitted = 0;
        Ok(())
    }

    fn rollback(&mut self) {
        if self.in_txn {
            // Nothing further to undo if this fails.
            let _ = self.conn.execute_batch("ROLLBACK");
            self.in_txn = false;
        }
        self.uncommitted = 0;
    }
}
