//! Background worker pool for checkpoint tasks
//!
//! A FIFO of boxed jobs under one mutex, drained by a fixed set of named
//! threads. Shutdown lets the workers finish what is queued and joins
//! them.
//!
//! The default checkpointer shares one single-worker pool across the
//! process. It is created by the first attach and shut down when the
//! last attached database detaches.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::errors::{CheckpointError, CheckpointResult};
use super::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

pub(crate) struct Executor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn new(workers: usize) -> CheckpointResult<Arc<Executor>> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let executor = Arc::new(Executor {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::with_capacity(workers)),
        });
        for index in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("rescuedb-checkpoint-{}", index))
                .spawn(move || worker_loop(&shared));
            match handle {
                Ok(handle) => lock(&executor.workers).push(handle),
                Err(e) => {
                    executor.shutdown();
                    return Err(CheckpointError::Spawn(e));
                }
            }
        }
        Ok(executor)
    }

    /// Queue `job`. Never blocks on the job itself.
    pub(crate) fn submit(&self, job: Job) -> CheckpointResult<()> {
        let mut queue = lock(&self.shared.queue);
        if queue.shutdown {
            return Err(CheckpointError::ShutDown);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Run what is queued, then stop and join the workers. Idempotent.
    pub(crate) fn shutdown(&self) {
        lock(&self.shared.queue).shutdown = true;
        self.shared.available.notify_all();

        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            // A job that drops the last reference runs on a worker; that
            // worker exits on its own once the queue is empty.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        lock(&self.shared.queue).shutdown
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutdown {
                    break None;
                }
                queue = match shared.available.wait(queue) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

static SHARED_EXECUTOR: Mutex<Option<(Arc<Executor>, usize)>> = Mutex::new(None);

/// Take a reference on the process-wide executor, creating it if needed.
pub(crate) fn acquire_shared() -> CheckpointResult<Arc<Executor>> {
    let mut slot = lock(&SHARED_EXECUTOR);
    if let Some((ref executor, ref mut refs)) = *slot {
        *refs += 1;
        return Ok(Arc::clone(executor));
    }
    let executor = Executor::new(1)?;
    *slot = Some((Arc::clone(&executor), 1));
    Ok(executor)
}

/// Drop a reference taken by [`acquire_shared`]. The last one shuts the
/// executor down.
pub(crate) fn release_shared() {
    let retired = {
        let mut slot = lock(&SHARED_EXECUTOR);
        let last = match slot.as_mut() {
            Some((_, refs)) if *refs > 1 => {
                *refs -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if last {
            slot.take().map(|(executor, _)| executor)
        } else {
            None
        }
    };
    if let Some(executor) = retired {
        executor.shutdown();
    }
}

/// References currently held on the shared executor.
pub(crate) fn shared_refs() -> usize {
    lock(&SHARED_EXECUTOR).as_ref().map_or(0, |(_, refs)| *refs)
}
