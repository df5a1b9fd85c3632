//! Shared worker threads for threaded handler invocations.
//!
//! Workers pull from a single FIFO queue guarded by a mutex and condvar, so a
//! task submitted by any dispatcher runs on whichever worker frees up first.
//! A pool whose threads could not be spawned rejects every task, and callers
//! fall back to a dedicated thread.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{Builder, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub fn default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

struct SharedState {
    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

pub struct WorkerPool {
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    state: Arc<SharedState>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(default_capacity())
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let state = Arc::new(SharedState {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(capacity);
        // every spawned worker reports in before new() returns
        let (ready_tx, ready_rx) = mpsc::channel::<()>();

        for id in 0..capacity {
            let state = Arc::clone(&state);
            let ready = ready_tx.clone();
            let spawned = Builder::new()
                .name(format!("mill-worker-{id}"))
                .spawn(move || {
                    let _ = ready.send(());
                    run_worker(&state);
                });
            match spawned {
                Ok(thread) => workers.push(thread),
                Err(e) => error!(id, error = %e, "failed to spawn worker thread"),
            }
        }
        drop(ready_tx);

        for _ in 0..workers.len() {
            if ready_rx.recv().is_err() {
                break;
            }
        }
        debug!(workers = workers.len(), "worker pool started");

        Self {
            capacity: workers.len(),
            workers: Mutex::new(workers),
            state,
        }
    }

    /// Queues a task. Fails with [`Error::PoolShutdown`] once the pool stops
    /// accepting work or has no worker threads.
    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.capacity == 0 || self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }

        let mut queue = self.state.queue.lock();
        queue.push_back(Box::new(task));
        self.state.condvar.notify_one();
        Ok(())
    }

    pub fn workers_len(&self) -> usize {
        self.capacity
    }

    pub fn queued(&self) -> usize {
        self.state.queue.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting tasks, lets the workers finish what is queued and
    /// joins them. Calling it from a worker thread skips that worker's join.
    pub fn shutdown(&self) {
        {
            let _queue = self.state.queue.lock();
            if self.state.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            self.state.condvar.notify_all();
        }

        let current = std::thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(state: &SharedState) {
    loop {
        let task = {
            let mut queue = state.queue.lock();

            while queue.is_empty() && !state.shutdown.load(Ordering::Acquire) {
                state.condvar.wait(&mut queue);
            }

            match queue.pop_front() {
                Some(task) => task,
                None => break,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("worker task panicked");
        }
    }
}
