//! The reactor: one thread, one poller, a bounded set of connections.
//!
//! Other threads never touch the poller. They talk to the loop through two
//! lists guarded by mutexes and a waker:
//!
//! - `staged`: sockets handed over by [`Dispatcher::admit`], registered and
//!   announced to their handlers on the next iteration
//! - `updates`: write, close and interest requests raised by [`Connection`]s
//!
//! A connection stops being read once its read queue reaches the configured
//! threshold or its receiving is suspended. Its read interest is dropped until
//! a read brings the queue back under the threshold or receiving resumes.
//!
//! Registered connections live in a lock-free map keyed by token, which the
//! timeout watchdog scans concurrently.

use std::{
    collections::HashMap,
    mem,
    net::TcpStream as StdTcpStream,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use lockfree::map::Map as LockfreeMap;
use mio::{Events, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    buffer_pool::BufferPool,
    config::{ConnectionConfig, EngineConfig},
    connection::{CloseReason, Connection, DrainOutcome, Origin, Scheduler},
    error::{Error, Result},
    event::Readiness,
    handler::{proxy::HandlerProxy, HandlerSet},
    poll::{PollHandle, WAKER_TOKEN},
    watchdog::Watchdog,
    worker_pool::WorkerPool,
};

/// I/O counters shared by a dispatcher and its connections.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) accepted: AtomicU64,
    pub(crate) closed: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) idle_timeouts: AtomicU64,
    pub(crate) connection_timeouts: AtomicU64,
}

/// Point-in-time statistics of one dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub index: usize,
    pub open_connections: usize,
    pub accepted: u64,
    pub closed: u64,
    /// Socket reads that returned data.
    pub reads: u64,
    /// Drains that wrote data.
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub idle_timeouts: u64,
    pub connection_timeouts: u64,
}

#[derive(Clone)]
pub(crate) struct Registered {
    pub(crate) conn: Connection,
    pub(crate) proxy: Arc<HandlerProxy>,
}

struct Staged {
    conn: Connection,
    handlers: HandlerSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Update {
    Write(Token),
    Close(Token),
    Interest(Token),
}

impl Update {
    fn token(self) -> Token {
        match self {
            Update::Write(token) | Update::Close(token) | Update::Interest(token) => token,
        }
    }
}

pub(crate) struct DispatcherShared {
    index: usize,
    name: String,
    waker: Arc<Waker>,
    staged: Mutex<Vec<Staged>>,
    updates: Mutex<Vec<Update>>,
    pub(crate) connections: LockfreeMap<usize, Registered>,
    open: AtomicUsize,
    /// Admitted sockets not yet counted in `open`.
    reserved: AtomicUsize,
    running: AtomicBool,
    next_token: AtomicUsize,
    pub(crate) counters: Arc<Counters>,
    max_connections: Option<usize>,
    workers: Arc<WorkerPool>,
    config: ConnectionConfig,
}

impl DispatcherShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn push_update(&self, update: Update) {
        self.updates.lock().push(update);
        if let Err(e) = self.waker.wake() {
            warn!(dispatcher = %self.name, error = %e, "failed to wake dispatcher");
        }
    }
}

impl Scheduler for DispatcherShared {
    fn request_write(&self, token: Token) {
        self.push_update(Update::Write(token));
    }

    fn request_close(&self, token: Token) {
        self.push_update(Update::Close(token));
    }

    fn request_interest(&self, token: Token) {
        self.push_update(Update::Interest(token));
    }
}

pub(crate) struct Dispatcher {
    shared: Arc<DispatcherShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl Dispatcher {
    pub(crate) fn spawn(index: usize, config: &EngineConfig, workers: Arc<WorkerPool>) -> Result<Self> {
        let poll = PollHandle::new()?;
        let name = format!("mill-dispatcher-{index}");

        let shared = Arc::new(DispatcherShared {
            index,
            name: name.clone(),
            waker: poll.waker(),
            staged: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            connections: LockfreeMap::new(),
            open: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            // Token(0) belongs to the waker
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            counters: Arc::new(Counters::default()),
            max_connections: config.max_connections_per_dispatcher,
            workers,
            config: config.connection.clone(),
        });

        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            poll,
            events: Events::with_capacity(config.events_capacity),
            buffers: BufferPool::new(config.connection.preallocation_size, config.connection.min_buffer_size),
            ready: Vec::with_capacity(config.events_capacity),
            throttled: HashMap::new(),
            deferred: Vec::new(),
            poll_timeout: config.poll_timeout,
        };
        let thread = Builder::new().name(name).spawn(move || event_loop.run())?;
        let watchdog = Watchdog::spawn(Arc::clone(&shared), config.timeout_check_period)?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.shared.index
    }

    /// Hands an accepted or connected socket to this dispatcher. The
    /// connection is registered and its connect callback invoked on the
    /// dispatcher thread shortly after.
    pub(crate) fn admit(&self, stream: StdTcpStream, origin: Origin, handlers: HandlerSet) -> Result<Connection> {
        stream.set_nonblocking(true)?;
        let socket = mio::net::TcpStream::from_std(stream);

        let mut staged = self.shared.staged.lock();
        if !self.shared.is_running() {
            return Err(Error::Shutdown);
        }
        if let Some(max) = self.shared.max_connections {
            if self.admitted() >= max {
                return Err(Error::Capacity(self.shared.name.clone()));
            }
        }

        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let scheduler: Weak<dyn Scheduler> = Arc::downgrade(&self.shared) as Weak<dyn Scheduler>;
        let conn = Connection::new(
            socket,
            token,
            self.shared.index,
            origin,
            &self.shared.config,
            Arc::clone(&self.shared.counters),
            scheduler,
        )?;
        staged.push(Staged {
            conn: conn.clone(),
            handlers,
        });
        self.shared.reserved.fetch_add(1, Ordering::AcqRel);
        drop(staged);

        self.shared.waker.wake()?;
        Ok(conn)
    }

    pub(crate) fn has_capacity(&self) -> bool {
        match self.shared.max_connections {
            Some(max) => self.admitted() < max,
            None => true,
        }
    }

    /// Open connections plus those admitted but not registered yet.
    fn admitted(&self) -> usize {
        self.shared.open.load(Ordering::Acquire) + self.shared.reserved.load(Ordering::Acquire)
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> DispatcherStats {
        let counters = &self.shared.counters;
        DispatcherStats {
            index: self.shared.index,
            open_connections: self.open_connections(),
            accepted: counters.accepted.load(Ordering::Relaxed),
            closed: counters.closed.load(Ordering::Relaxed),
            reads: counters.reads.load(Ordering::Relaxed),
            writes: counters.writes.load(Ordering::Relaxed),
            bytes_read: counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: counters.bytes_written.load(Ordering::Relaxed),
            idle_timeouts: counters.idle_timeouts.load(Ordering::Relaxed),
            connection_timeouts: counters.connection_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Stops the watchdog and the event loop. Open connections are closed and
    /// their disconnect callbacks queued.
    pub(crate) fn shutdown(&self) {
        {
            let _staged = self.shared.staged.lock();
            self.shared.running.store(false, Ordering::Release);
        }

        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.stop();
        }
        if let Err(e) = self.shared.waker.wake() {
            error!(dispatcher = %self.shared.name, error = %e, "failed to wake dispatcher for shutdown");
        }

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EventLoop {
    shared: Arc<DispatcherShared>,
    poll: PollHandle,
    events: Events,
    buffers: BufferPool,
    ready: Vec<Readiness>,
    /// Connections waiting for their next throttle window.
    throttled: HashMap<usize, Instant>,
    deferred: Vec<Update>,
    poll_timeout: Duration,
}

impl EventLoop {
    fn run(mut self) {
        debug!(dispatcher = %self.shared.name, "dispatcher started");

        while self.shared.is_running() {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                error!(dispatcher = %self.shared.name, error = %e, "poll failed, stopping dispatcher");
                self.shared.running.store(false, Ordering::Release);
                break;
            }

            let mut ready = mem::take(&mut self.ready);
            ready.extend(
                self.events
                    .iter()
                    .filter(|event| event.token() != WAKER_TOKEN)
                    .map(Readiness::from),
            );
            for readiness in ready.drain(..) {
                self.service(readiness);
            }
            self.ready = ready;

            self.admit_staged();
            self.apply_updates();
            self.drain_throttled();
        }

        self.close_all();
        debug!(dispatcher = %self.shared.name, "dispatcher stopped");
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        self.throttled
            .values()
            .map(|resume| resume.saturating_duration_since(now))
            .min()
            .map_or(self.poll_timeout, |wait| wait.min(self.poll_timeout))
    }

    fn lookup(&self, token: Token) -> Option<Registered> {
        self.shared
            .connections
            .get(&token.0)
            .map(|guard| guard.val().clone())
    }

    fn service(&mut self, readiness: Readiness) {
        let token = readiness.token();
        let Some(Registered { conn, proxy }) = self.lookup(token) else {
            return;
        };
        trace!(conn = %conn.id(), ?readiness, "ready");

        if readiness.is_readable() || readiness.is_read_closed() || readiness.is_error() {
            let mut rearm = false;
            if conn.wants_input() || readiness.is_error() {
                match conn.receive(&mut self.buffers) {
                    Ok(outcome) => {
                        if outcome.bytes > 0 {
                            proxy.on_data(&conn);
                        }
                        if outcome.eof {
                            self.close_now(token, CloseReason::PeerClosed);
                            return;
                        }
                        rearm = outcome.limited;
                    }
                    Err(e) => {
                        debug!(conn = %conn.id(), error = %e, "read failed");
                        self.close_now(token, CloseReason::Failed);
                        return;
                    }
                }
            }
            if !self.refresh_interest(&conn, rearm) {
                return;
            }
        }

        if readiness.is_writable() && conn.has_write_interest() {
            self.flush(&conn);
        }
    }

    fn flush(&mut self, conn: &Connection) {
        let token = conn.token();
        let writable = match conn.drain() {
            Ok(DrainOutcome::Drained) => {
                self.throttled.remove(&token.0);
                false
            }
            Ok(DrainOutcome::WouldBlock) => true,
            Ok(DrainOutcome::Throttled(resume)) => {
                self.throttled.insert(token.0, resume);
                false
            }
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "write failed");
                self.close_now(token, CloseReason::Failed);
                return;
            }
        };

        if let Err(e) = conn.update_interest(self.poll.registry(), writable) {
            warn!(conn = %conn.id(), error = %e, "failed to update interest");
            self.close_now(token, CloseReason::Failed);
        }
    }

    /// Returns `false` when the connection had to be closed.
    fn refresh_interest(&mut self, conn: &Connection, rearm: bool) -> bool {
        match conn.sync_interest(self.poll.registry(), rearm) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "failed to update interest");
                self.close_now(conn.token(), CloseReason::Failed);
                false
            }
        }
    }

    fn admit_staged(&mut self) {
        let staged = mem::take(&mut *self.shared.staged.lock());

        for Staged { conn, handlers } in staged {
            if let Err(e) = conn.register(self.poll.registry()) {
                warn!(conn = %conn.id(), error = %e, "failed to register connection");
                conn.finish_close(self.poll.registry(), CloseReason::Failed);
                self.shared.reserved.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            let proxy = Arc::new(HandlerProxy::new(handlers, Arc::clone(&self.shared.workers)));
            self.shared.connections.insert(
                conn.token().0,
                Registered {
                    conn: conn.clone(),
                    proxy: Arc::clone(&proxy),
                },
            );
            self.shared.open.fetch_add(1, Ordering::AcqRel);
            self.shared.reserved.fetch_sub(1, Ordering::AcqRel);
            self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
            debug!(dispatcher = %self.shared.name, conn = %conn.id(), peer = %conn.peer_addr(), "connection admitted");

            proxy.on_connect(&conn);
        }
    }

    fn apply_updates(&mut self) {
        let mut updates = mem::take(&mut self.deferred);
        updates.append(&mut self.shared.updates.lock());

        for update in updates {
            let token = update.token();
            let Some(Registered { conn, .. }) = self.lookup(token) else {
                if self.is_staged(token) {
                    self.deferred.push(update);
                }
                continue;
            };
            match update {
                Update::Write(_) => {
                    if !self.throttled.contains_key(&token.0) {
                        self.flush(&conn);
                    }
                }
                Update::Close(_) => self.close_now(token, CloseReason::Local),
                Update::Interest(_) => {
                    self.refresh_interest(&conn, false);
                }
            }
        }
    }

    fn is_staged(&self, token: Token) -> bool {
        self.shared.staged.lock().iter().any(|s| s.conn.token() == token)
    }

    fn drain_throttled(&mut self) {
        if self.throttled.is_empty() {
            return;
        }
        let now = Instant::now();
        let due: Vec<usize> = self
            .throttled
            .iter()
            .filter(|(_, resume)| **resume <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in due {
            self.throttled.remove(&token);
            if let Some(Registered { conn, .. }) = self.lookup(Token(token)) {
                self.flush(&conn);
            }
        }
    }

    fn close_now(&mut self, token: Token, reason: CloseReason) {
        let Some(removed) = self.shared.connections.remove(&token.0) else {
            return;
        };
        let Registered { conn, proxy } = removed.val().clone();
        drop(removed);

        self.throttled.remove(&token.0);
        conn.finish_close(self.poll.registry(), reason);
        self.shared.open.fetch_sub(1, Ordering::AcqRel);
        self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);

        proxy.on_disconnect(&conn);
    }

    fn close_all(&mut self) {
        let tokens: Vec<usize> = self.shared.connections.iter().map(|guard| *guard.key()).collect();
        for token in tokens {
            self.close_now(Token(token), CloseReason::Shutdown);
        }

        let staged = mem::take(&mut *self.shared.staged.lock());
        for Staged { conn, .. } in staged {
            conn.finish_close(self.poll.registry(), CloseReason::Shutdown);
            self.shared.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
