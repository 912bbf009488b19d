//! Asynchronous WAL checkpointing
//!
//! The writer's commit path reports how many frames its WAL holds; the
//! checkpointer decides whether that is worth a checkpoint and, if so,
//! hands one to a background worker. The commit path only ever enqueues.
//!
//! # Thresholds
//!
//! - below `low_watermark`: nothing happens
//! - from `low_watermark`: a PASSIVE checkpoint is queued
//! - from `high_watermark`: the queued checkpoint is RESTART, which waits
//!   out readers and blocks new writers until it completes
//!
//! # Coalescing
//!
//! At most one task per (database, WAL name) is queued or running. The key
//! is registered when a task is queued and cleared when it finishes, so a
//! notification arriving in between is dropped. The task holds a reference
//! to its database for as long as the key is registered.
//!
//! # Durability
//!
//! Attaching records the database's `synchronous` level and drops it to
//! NORMAL; detaching restores the recorded level.

mod config;
mod errors;
mod executor;
mod target;

pub use config::CheckpointConfig;
pub use errors::{CheckpointError, CheckpointResult};
pub use target::{CheckpointMode, CheckpointTarget, SqliteCheckpointTarget, Synchronous};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::observability::{log_event_with_fields, Event};

use executor::{acquire_shared, release_shared, Executor};

/// Lock `mutex`, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What `on_wal_commit` did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// Below the low watermark
    Skipped,
    /// A task was queued
    Queued { blocking: bool },
    /// A task for the same key is already queued or running
    Coalesced,
}

type TaskKey = (usize, String);

struct Attached {
    target: Arc<dyn CheckpointTarget>,
    previous: Synchronous,
    executor: Arc<Executor>,
}

struct TaskState {
    pending: Mutex<HashSet<TaskKey>>,
    drained: Condvar,
    completed: AtomicU64,
    failed: AtomicU64,
}

enum Pool {
    /// Process-wide pool, one reference per attached database
    Shared,
    Dedicated(Arc<Executor>),
}

pub struct AsyncCheckpointer {
    config: CheckpointConfig,
    pool: Pool,
    attached: Mutex<HashMap<usize, Attached>>,
    tasks: Arc<TaskState>,
}

fn identity(target: &Arc<dyn CheckpointTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl AsyncCheckpointer {
    /// Default thresholds on the process-wide background pool.
    pub fn new() -> Self {
        Self::build(CheckpointConfig::default(), Pool::Shared)
    }

    /// Custom thresholds on a pool owned by this checkpointer.
    pub fn with_config(config: CheckpointConfig) -> CheckpointResult<Self> {
        config.validate()?;
        let executor = Executor::new(config.workers)?;
        Ok(Self::build(config, Pool::Dedicated(executor)))
    }

    fn build(config: CheckpointConfig, pool: Pool) -> Self {
        Self {
            config,
            pool,
            attached: Mutex::new(HashMap::new()),
            tasks: Arc::new(TaskState {
                pending: Mutex::new(HashSet::new()),
                drained: Condvar::new(),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Start checkpointing `target`.
    pub fn attach(&self, target: &Arc<dyn CheckpointTarget>) -> CheckpointResult<()> {
        let id = identity(target);
        let mut attached = lock(&self.attached);
        if attached.contains_key(&id) {
            return Err(CheckpointError::AlreadyAttached);
        }

        let previous = target.synchronous()?;
        target.set_synchronous(Synchronous::Normal)?;
        let executor = match self.pool {
            Pool::Shared => match acquire_shared() {
                Ok(executor) => executor,
                Err(e) => {
                    let _ = target.set_synchronous(previous);
                    return Err(e);
                }
            },
            Pool::Dedicated(ref executor) => Arc::clone(executor),
        };
        attached.insert(
            id,
            Attached {
                target: Arc::clone(target),
                previous,
                executor,
            },
        );
        drop(attached);

        let level = previous.level().to_string();
        log_event_with_fields(Event::CheckpointAttach, &[("previous_synchronous", &level)]);
        Ok(())
    }

    /// Stop checkpointing `target` and restore its `synchronous` level.
    /// Tasks already queued for it still run.
    pub fn detach(&self, target: &Arc<dyn CheckpointTarget>) -> CheckpointResult<()> {
        let entry = lock(&self.attached)
            .remove(&identity(target))
            .ok_or(CheckpointError::NotAttached)?;

        let restored = entry.target.set_synchronous(entry.previous);
        drop(entry.executor);
        if let Pool::Shared = self.pool {
            release_shared();
        }
        log_event_with_fields(Event::CheckpointDetach, &[]);
        restored
    }

    /// Commit hook: `frames` is the WAL's current length in frames.
    pub fn on_wal_commit(
        &self,
        target: &Arc<dyn CheckpointTarget>,
        wal_name: &str,
        frames: u32,
    ) -> CheckpointResult<Scheduled> {
        if frames < self.config.low_watermark {
            return Ok(Scheduled::Skipped);
        }

        let id = identity(target);
        let executor = lock(&self.attached)
            .get(&id)
            .map(|a| Arc::clone(&a.executor))
            .ok_or(CheckpointError::NotAttached)?;

        let key: TaskKey = (id, wal_name.to_string());
        if !lock(&self.tasks.pending).insert(key.clone()) {
            return Ok(Scheduled::Coalesced);
        }

        let blocking = frames >= self.config.high_watermark;
        let mode = if blocking {
            CheckpointMode::Restart
        } else {
            CheckpointMode::Passive
        };
        let task_target = Arc::clone(target);
        let tasks = Arc::clone(&self.tasks);
        let task_key = key.clone();
        let job = Box::new(move || {
            let wal = task_key.1.as_str();
            match task_target.checkpoint(wal, mode) {
                Ok(()) => {
                    tasks.completed.fetch_add(1, Ordering::SeqCst);
                    log_event_with_fields(
                        Event::CheckpointRun,
                        &[("mode", mode.as_str()), ("wal", wal)],
                    );
                }
                Err(e) => {
                    tasks.failed.fetch_add(1, Ordering::SeqCst);
                    log_event_with_fields(
                        Event::CheckpointFailed,
                        &[("error", &e.to_string()), ("mode", mode.as_str()), ("wal", wal)],
                    );
                }
            }
            drop(task_target);
            let mut pending = lock(&tasks.pending);
            pending.remove(&task_key);
            if pending.is_empty() {
                tasks.drained.notify_all();
            }
        });

        if let Err(e) = executor.submit(job) {
            lock(&self.tasks.pending).remove(&key);
            return Err(e);
        }
        Ok(Scheduled::Queued { blocking })
    }

    /// Checkpoints that ran successfully.
    pub fn completed(&self) -> u64 {
        self.tasks.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.tasks.failed.load(Ordering::SeqCst)
    }

    /// Keys with a task queued or running.
    pub fn pending_len(&self) -> usize {
        lock(&self.tasks.pending).len()
    }

    /// Wait until no task is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.tasks.pending);
        while !pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = match self.tasks.drained.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Default for AsyncCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncCheckpointer {
    fn drop(&mut self) {
        let entries: Vec<Attached> = lock(&self.attached).drain().map(|(_, a)| a).collect();
        for entry in entries {
            let _ = entry.target.set_synchronous(entry.previous);
            drop(entry.executor);
            if let Pool::Shared = self.pool {
                release_shared();
            }
        }
        if let Pool::Dedicated(ref executor) = self.pool {
            executor.shutdown();
        }
    }
}

/// References held on the process-wide checkpoint pool.
pub fn shared_executor_refs() -> usize {
    executor::shared_refs()
}
