//! Per-connection serialization of handler callbacks.
//!
//! Every connection owns one [`SerializedTaskQueue`]. At most one runner
//! drains it at a time, either the calling thread (inline submissions that
//! find the queue idle) or a worker. A runner keeps going until the queue is
//! empty and only then clears the `running` flag, so two callbacks of the same
//! connection never overlap and run in submission order.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::worker_pool::{Task, WorkerPool};

/// Kind of event a queued callback delivers. A task that is still pending
/// absorbs a newer one of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Connect,
    Data,
    Disconnect,
    IdleTimeout,
    ConnectionTimeout,
}

struct Pending {
    kind: EventKind,
    task: Task,
}

#[derive(Default)]
struct State {
    running: bool,
    pending: VecDeque<Pending>,
}

impl State {
    fn enqueue(&mut self, kind: EventKind, task: Task) -> bool {
        if self.pending.iter().any(|p| p.kind == kind) {
            return false;
        }
        self.pending.push_back(Pending { kind, task });
        true
    }
}

pub(crate) struct SerializedTaskQueue {
    state: Mutex<State>,
    workers: Arc<WorkerPool>,
}

impl SerializedTaskQueue {
    pub(crate) fn new(workers: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            workers,
        })
    }

    /// Runs `task` on the calling thread when nothing else of this connection
    /// is running or queued. Otherwise the task waits its turn behind the
    /// active runner.
    pub(crate) fn perform_inline(self: &Arc<Self>, kind: EventKind, task: Task) {
        {
            let mut state = self.state.lock();
            if state.running || !state.pending.is_empty() {
                state.enqueue(kind, task);
                if !state.running {
                    state.running = true;
                    drop(state);
                    self.spawn_runner();
                }
                return;
            }
            state.running = true;
        }

        run_task(task);

        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.running = false;
        } else {
            // tasks queued behind us must not hold up the dispatcher
            drop(state);
            self.spawn_runner();
        }
    }

    /// Queues `task` for a worker thread.
    pub(crate) fn perform_threaded(self: &Arc<Self>, kind: EventKind, task: Task) {
        let mut state = self.state.lock();
        state.enqueue(kind, task);
        if !state.running {
            state.running = true;
            drop(state);
            self.spawn_runner();
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn spawn_runner(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        if self.workers.exec(move || queue.drain()).is_ok() {
            return;
        }

        warn!("worker pool rejected callback, running it on a dedicated thread");
        let queue = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("serialized-task-fallback".into())
            .spawn(move || queue.drain());
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn fallback thread, draining on the caller");
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            run_task(next.task);
        }
    }
}

fn run_task(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("callback task panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_inline_runs_on_caller_thread() {
        let queue = SerializedTaskQueue::new(Arc::new(WorkerPool::new(1)));
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();

        queue.perform_inline(
            EventKind::Connect,
            Box::new(move || tx.send(thread::current().id()).unwrap()),
        );

        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn test_threaded_runs_on_worker() {
        let queue = SerializedTaskQueue::new(Arc::new(WorkerPool::new(1)));
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();

        queue.perform_threaded(
            EventKind::Data,
            Box::new(move || tx.send(thread::current().id()).unwrap()),
        );

        let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_pending_task_of_same_kind_collapses() {
        let queue = SerializedTaskQueue::new(Arc::new(WorkerPool::new(2)));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let data_runs = Arc::new(AtomicUsize::new(0));

        queue.perform_threaded(
            EventKind::Connect,
            Box::new(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }),
        );
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        for _ in 0..2 {
            let runs = data_runs.clone();
            queue.perform_threaded(
                EventKind::Data,
                Box::new(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(queue.pending_len(), 1);

        release_tx.send(()).unwrap();
        wait_until(|| queue.pending_len() == 0 && !queue.state.lock().running);
        assert_eq!(data_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inline_waits_behind_running_task() {
        let queue = SerializedTaskQueue::new(Arc::new(WorkerPool::new(2)));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        let first = order.clone();
        queue.perform_threaded(
            EventKind::Connect,
            Box::new(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                first.lock().push("connect");
            }),
        );
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let second = order.clone();
        queue.perform_inline(EventKind::Data, Box::new(move || second.lock().push("data")));
        assert!(order.lock().is_empty(), "inline task must not overtake the runner");

        release_tx.send(()).unwrap();
        wait_until(|| order.lock().len() == 2);
        assert_eq!(*order.lock(), vec!["connect", "data"]);
    }

    #[test]
    fn test_at_most_one_task_in_flight() {
        let queue = SerializedTaskQueue::new(Arc::new(WorkerPool::new(4)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let kinds = [
            EventKind::Connect,
            EventKind::Data,
            EventKind::IdleTimeout,
            EventKind::ConnectionTimeout,
            EventKind::Disconnect,
        ];

        let submitters: Vec<_> = (0..4)
            .map(|i| {
                let queue = queue.clone();
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let in_flight = in_flight.clone();
                        let max_seen = max_seen.clone();
                        let task: Task = Box::new(move || {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(200));
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                        let kind = kinds[(i + round) % kinds.len()];
                        if round % 2 == 0 {
                            queue.perform_inline(kind, task);
                        } else {
                            queue.perform_threaded(kind, task);
                        }
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        wait_until(|| !queue.state.lock().running);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_releases_queue() {
        let queue = SerializedTaskQueue::new(Arc::new(WorkerPool::new(1)));
        queue.perform_inline(EventKind::Data, Box::new(|| panic!("handler bug")));

        let (tx, rx) = mpsc::channel();
        queue.perform_inline(EventKind::Data, Box::new(move || tx.send(()).unwrap()));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_shut_down_pool_falls_back_to_thread() {
        let workers = Arc::new(WorkerPool::new(1));
        workers.shutdown();
        let queue = SerializedTaskQueue::new(workers);
        let (tx, rx) = mpsc::channel();

        queue.perform_threaded(EventKind::Disconnect, Box::new(move || tx.send(()).unwrap()));

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
