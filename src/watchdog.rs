//! Periodic idle/connection timeout scan, one thread per dispatcher.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    connection::TimeoutKind,
    dispatcher::{DispatcherShared, Registered},
    error::Result,
};

struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

pub(crate) struct Watchdog {
    signal: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    pub(crate) fn spawn(dispatcher: Arc<DispatcherShared>, period: Duration) -> Result<Self> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let name = dispatcher.name().replace("dispatcher", "watchdog");

        let thread = Builder::new()
            .name(name)
            .spawn(move || run(&dispatcher, &thread_signal, period))?;

        Ok(Self { signal, thread })
    }

    pub(crate) fn stop(self) {
        *self.signal.stopped.lock() = true;
        self.signal.condvar.notify_all();
        if self.thread.thread().id() != std::thread::current().id() {
            let _ = self.thread.join();
        }
    }
}

fn run(dispatcher: &DispatcherShared, signal: &StopSignal, period: Duration) {
    debug!(dispatcher = %dispatcher.name(), ?period, "watchdog started");
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                let _ = signal.condvar.wait_for(&mut stopped, period);
            }
            if *stopped || !dispatcher.is_running() {
                break;
            }
        }
        check_timeouts(dispatcher, Instant::now());
    }
    debug!(dispatcher = %dispatcher.name(), "watchdog stopped");
}

/// Scans every registered connection once. Failures of one connection never
/// stop the scan.
pub(crate) fn check_timeouts(dispatcher: &DispatcherShared, now: Instant) {
    let mut expired = Vec::new();
    for guard in dispatcher.connections.iter() {
        let entry = guard.val();
        if let Some(kind) = entry.conn.check_timeouts(now) {
            expired.push((entry.clone(), kind));
        }
    }

    for (Registered { conn, proxy }, kind) in expired {
        trace!(conn = %conn.id(), ?kind, "timeout expired");
        let counters = &dispatcher.counters;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            TimeoutKind::Idle => {
                counters.idle_timeouts.fetch_add(1, Ordering::Relaxed);
                proxy.on_idle_timeout(&conn);
            }
            TimeoutKind::Connection => {
                counters.connection_timeouts.fetch_add(1, Ordering::Relaxed);
                proxy.on_connection_timeout(&conn);
            }
        }));
        if outcome.is_err() {
            warn!(conn = %conn.id(), ?kind, "timeout handling panicked");
        }
    }
}
