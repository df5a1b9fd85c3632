//! A TCP connection owned by one dispatcher.
//!
//! A [`Connection`] is a cheap handle (`Arc` inside) shared by the dispatcher,
//! the watchdog and the application. Received bytes land in the read queue,
//! where the framed `read_*` methods pick them up. Written bytes go to the
//! write queue and reach the socket either right away on the writing thread
//! (synchronous flush) or on the dispatcher's next writable event
//! (asynchronous flush), optionally rate limited.
//!
//! ```text
//!            receive()                      read_*()
//!  socket ─────────────▶ read queue ─────────────────▶ handler
//!  socket ◀───────────── write queue ◀──────────────── write*()
//!            drain()   [throttle]
//! ```
//!
//! Lock order is `outbound` before `socket`. The read path takes `socket`
//! and then `read_queue`; nothing takes `outbound` while holding either.

mod blocking;
mod throttle;

use std::{
    collections::hash_map::RandomState,
    fmt,
    hash::BuildHasher,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    process,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, OnceLock, Weak,
    },
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use mio::{net::TcpStream, Registry, Token};
use parking_lot::Mutex;
use tracing::{debug, trace};

pub use blocking::BlockingConnection;
pub use throttle::THROTTLE_INTERVAL;

use self::throttle::WriteThrottle;
use crate::{
    buffer_pool::BufferPool,
    byte_queue::{ByteQueue, LengthPrefix, Scalar},
    config::{ConnectionConfig, Encoding, FlushMode},
    dispatcher::Counters,
    error::{Error, Result},
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

const READ_INTEREST: u8 = 0b01;
const WRITE_INTEREST: u8 = 0b10;

/// Which side initiated the connection. Shows up in the id as `S` or `C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted from a listener.
    Server,
    /// Opened through [`Engine::connect`](crate::Engine::connect).
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    Idle,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Requested through [`Connection::close`].
    Local,
    /// The peer shut down its side. Buffered input stays readable.
    PeerClosed,
    /// A socket operation failed.
    Failed,
    /// The dispatcher is stopping.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    Drained,
    WouldBlock,
    /// The throttle budget is spent until the given instant.
    Throttled(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReceiveOutcome {
    pub(crate) bytes: usize,
    pub(crate) eof: bool,
    /// Reading stopped at the read buffer threshold, the socket may hold more.
    pub(crate) limited: bool,
}

/// Requests a connection sends to its dispatcher.
pub(crate) trait Scheduler: Send + Sync {
    fn request_write(&self, token: Token);
    fn request_close(&self, token: Token);
    fn request_interest(&self, token: Token);
}

struct WriteState {
    queue: ByteQueue,
    throttle: Option<WriteThrottle>,
}

struct TimeoutState {
    idle: Option<Duration>,
    connection: Option<Duration>,
    last_activity: Instant,
    idle_fired: bool,
    connection_fired: bool,
}

struct Inner {
    id: String,
    token: Token,
    dispatcher_index: usize,
    origin: Origin,
    peer_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    socket: Mutex<TcpStream>,
    read_queue: Mutex<ByteQueue>,
    outbound: Mutex<WriteState>,
    state: AtomicU8,
    async_flush: AtomicBool,
    write_interest: AtomicBool,
    receiving: AtomicBool,
    /// Interest currently registered with the poller.
    registered: AtomicU8,
    timeouts: Mutex<TimeoutState>,
    created: Instant,
    encoding: Encoding,
    max_read_size: Option<usize>,
    read_threshold: Option<usize>,
    counters: Arc<Counters>,
    scheduler: Weak<dyn Scheduler>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("dispatcher", &self.inner.dispatcher_index)
            .field("open", &self.is_open())
            .finish()
    }
}

fn next_connection_id(origin: Origin) -> String {
    static PREFIX: OnceLock<String> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let prefix = PREFIX.get_or_init(|| {
        let salt = RandomState::new().hash_one((process::id(), SystemTime::now()));
        format!("{:x}{:08x}", process::id(), salt as u32)
    });
    let marker = match origin {
        Origin::Server => 'S',
        Origin::Client => 'C',
    };
    let sequence = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{prefix}{marker}{sequence:x}")
}

impl Connection {
    pub(crate) fn new(
        socket: TcpStream,
        token: Token,
        dispatcher_index: usize,
        origin: Origin,
        config: &ConnectionConfig,
        counters: Arc<Counters>,
        scheduler: Weak<dyn Scheduler>,
    ) -> Result<Self> {
        let peer_addr = socket.peer_addr()?;
        let local_addr = socket.local_addr().ok();
        let now = Instant::now();

        Ok(Self {
            inner: Arc::new(Inner {
                id: next_connection_id(origin),
                token,
                dispatcher_index,
                origin,
                peer_addr,
                local_addr,
                socket: Mutex::new(socket),
                read_queue: Mutex::new(ByteQueue::new()),
                outbound: Mutex::new(WriteState {
                    queue: ByteQueue::new(),
                    throttle: config.write_rate.filter(|rate| *rate > 0).map(WriteThrottle::new),
                }),
                state: AtomicU8::new(OPEN),
                async_flush: AtomicBool::new(config.flush_mode == FlushMode::Async),
                write_interest: AtomicBool::new(false),
                receiving: AtomicBool::new(true),
                registered: AtomicU8::new(0),
                timeouts: Mutex::new(TimeoutState {
                    idle: config.idle_timeout,
                    connection: config.connection_timeout,
                    last_activity: now,
                    idle_fired: false,
                    connection_fired: false,
                }),
                created: now,
                encoding: config.encoding,
                max_read_size: config.max_read_size,
                read_threshold: config.max_read_buffer_threshold,
                counters,
                scheduler,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Index of the dispatcher that owns this connection.
    pub fn dispatcher_index(&self) -> usize {
        self.inner.dispatcher_index
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == OPEN
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    pub fn created(&self) -> Instant {
        self.inner.created
    }

    pub(crate) fn token(&self) -> Token {
        self.inner.token
    }

    // ---- writing ----

    /// Queues `data` and returns the number of bytes queued. Never blocks.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.enqueue(Bytes::copy_from_slice(data))
    }

    pub fn write_bytes(&self, data: Bytes) -> Result<usize> {
        self.enqueue(data)
    }

    pub fn write_scalar<T: Scalar>(&self, value: T) -> Result<usize> {
        let mut out = Vec::with_capacity(T::WIDTH);
        value.extend_be(&mut out);
        self.enqueue(out.into())
    }

    /// Writes `text` in the connection's encoding.
    pub fn write_str(&self, text: &str) -> Result<usize> {
        let encoded = self.inner.encoding.encode(text)?;
        self.enqueue(encoded.into())
    }

    /// Writes `payload` preceded by its big-endian length.
    pub fn write_length_prefixed(&self, prefix: LengthPrefix, payload: &[u8]) -> Result<usize> {
        let mut out = Vec::with_capacity(prefix.width() + payload.len());
        prefix.encode(payload.len(), &mut out)?;
        out.extend_from_slice(payload);
        self.enqueue(out.into())
    }

    /// Pushes queued bytes towards the socket as far as the socket and the
    /// throttle allow. Whatever remains is left to the dispatcher.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        match self.drain()? {
            DrainOutcome::Drained => Ok(()),
            DrainOutcome::WouldBlock | DrainOutcome::Throttled(_) => {
                self.request_write();
                Ok(())
            }
        }
    }

    /// Bytes queued but not yet handed to the socket.
    pub fn pending_write_size(&self) -> usize {
        self.inner.outbound.lock().queue.len()
    }

    pub fn flush_mode(&self) -> FlushMode {
        if self.inner.async_flush.load(Ordering::Acquire) {
            FlushMode::Async
        } else {
            FlushMode::Sync
        }
    }

    pub fn set_flush_mode(&self, mode: FlushMode) {
        self.inner.async_flush.store(mode == FlushMode::Async, Ordering::Release);
    }

    /// Limits outgoing traffic to `bytes_per_sec`. `None` removes the limit.
    pub fn set_write_rate(&self, bytes_per_sec: Option<u32>) -> Result<()> {
        if bytes_per_sec == Some(0) {
            return Err(Error::InvalidArgument("write rate must be positive"));
        }
        let pending = {
            let mut outbound = self.inner.outbound.lock();
            outbound.throttle = bytes_per_sec.map(WriteThrottle::new);
            !outbound.queue.is_empty()
        };
        if pending {
            self.request_write();
        }
        Ok(())
    }

    pub fn write_rate(&self) -> Option<u32> {
        self.inner.outbound.lock().throttle.as_ref().map(WriteThrottle::bytes_per_sec)
    }

    fn enqueue(&self, data: Bytes) -> Result<usize> {
        self.ensure_open()?;
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        self.inner.outbound.lock().queue.append(data);

        match self.flush_mode() {
            FlushMode::Sync => self.flush()?,
            FlushMode::Async => self.request_write(),
        }
        Ok(len)
    }

    // ---- reading ----

    /// Number of received bytes not consumed yet.
    pub fn available(&self) -> usize {
        self.inner.read_queue.lock().len()
    }

    pub fn index_of(&self, delimiter: &[u8]) -> Option<usize> {
        self.inner.read_queue.lock().index_of(delimiter)
    }

    pub fn read_bytes_by_length(&self, n: usize) -> Result<Bytes> {
        self.read_with(|queue| queue.read_bytes_by_length(n))
    }

    /// Like [`read_bytes_by_length`](Self::read_bytes_by_length) but keeps the
    /// received fragments apart instead of joining them.
    pub fn read_fragments_by_length(&self, n: usize) -> Result<Vec<Bytes>> {
        self.read_with(|queue| queue.read_by_length(n))
    }

    /// Reads up to `delimiter`, bounded by the configured max read size.
    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes> {
        let max = self.inner.max_read_size;
        self.read_with(|queue| queue.read_bytes_by_delimiter(delimiter, max))
    }

    pub fn read_bytes_by_delimiter_max(&self, delimiter: &[u8], max_len: usize) -> Result<Bytes> {
        self.read_with(|queue| queue.read_bytes_by_delimiter(delimiter, Some(max_len)))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str) -> Result<String> {
        let encoding = self.inner.encoding;
        let delimiter = encoding.encode(delimiter)?;
        let raw = self.read_bytes_by_delimiter(&delimiter)?;
        encoding.decode(&raw)
    }

    pub fn read_string_by_length(&self, n: usize) -> Result<String> {
        let raw = self.read_bytes_by_length(n)?;
        self.inner.encoding.decode(&raw)
    }

    pub fn read_scalar<T: Scalar>(&self) -> Result<T> {
        self.read_with(|queue| queue.read_scalar::<T>())
    }

    pub fn read_length_prefixed(&self, prefix: LengthPrefix) -> Result<Bytes> {
        let max = self.inner.max_read_size;
        self.read_with(|queue| queue.read_length_prefixed(prefix, max))
    }

    pub fn mark_read_position(&self) {
        self.inner.read_queue.lock().mark();
    }

    /// Puts back everything read since the mark. Returns `false` without a mark.
    pub fn reset_to_read_mark(&self) -> bool {
        self.inner.read_queue.lock().reset()
    }

    pub fn remove_read_mark(&self) {
        self.inner.read_queue.lock().remove_mark();
    }

    /// Total bytes consumed from the read queue.
    pub(crate) fn read_progress(&self) -> u64 {
        self.inner.read_queue.lock().consumed()
    }

    /// Insufficient data on a connection that will never receive more turns
    /// into [`Error::Closed`].
    fn read_with<T>(&self, read: impl FnOnce(&mut ByteQueue) -> Result<T>) -> Result<T> {
        let result = read(&mut self.inner.read_queue.lock());
        match result {
            Err(Error::InsufficientData) if !self.is_open() => Err(self.closed_error()),
            Ok(value) => {
                self.rearm_input();
                Ok(value)
            }
            other => other,
        }
    }

    // ---- receive control ----

    /// Stops reading from the socket. Bytes already received stay readable.
    pub fn suspend_receiving(&self) {
        if self.inner.receiving.swap(false, Ordering::AcqRel) {
            trace!(conn = %self.inner.id, "receiving suspended");
            self.request_interest();
        }
    }

    pub fn resume_receiving(&self) {
        if !self.inner.receiving.swap(true, Ordering::AcqRel) {
            trace!(conn = %self.inner.id, "receiving resumed");
            self.request_interest();
        }
    }

    pub fn is_receiving_suspended(&self) -> bool {
        !self.inner.receiving.load(Ordering::Acquire)
    }

    pub fn max_read_buffer_threshold(&self) -> Option<usize> {
        self.inner.read_threshold
    }

    /// Whether the dispatcher should read from the socket: receiving is not
    /// suspended and the read queue is below its threshold.
    pub(crate) fn wants_input(&self) -> bool {
        self.inner.receiving.load(Ordering::Acquire)
            && self.inner.read_threshold.map_or(true, |max| self.available() < max)
    }

    /// Asks the dispatcher to restore read interest dropped at the threshold.
    fn rearm_input(&self) {
        if self.inner.read_threshold.is_some()
            && self.inner.registered.load(Ordering::SeqCst) & READ_INTEREST == 0
            && self.is_open()
            && self.wants_input()
        {
            self.request_interest();
        }
    }

    // ---- timeouts ----

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.timeouts.lock().idle
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        let mut timeouts = self.inner.timeouts.lock();
        timeouts.idle = timeout;
        timeouts.idle_fired = false;
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.inner.timeouts.lock().connection
    }

    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        let mut timeouts = self.inner.timeouts.lock();
        timeouts.connection = timeout;
        timeouts.connection_fired = false;
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.timeouts.lock().last_activity
    }

    pub(crate) fn touch(&self, now: Instant) {
        let mut timeouts = self.inner.timeouts.lock();
        timeouts.last_activity = now;
        timeouts.idle_fired = false;
    }

    /// Reports an expired timeout once per expiry. The connection timeout is
    /// checked first.
    pub(crate) fn check_timeouts(&self, now: Instant) -> Option<TimeoutKind> {
        if !self.is_open() {
            return None;
        }
        let mut timeouts = self.inner.timeouts.lock();

        if let Some(limit) = timeouts.connection {
            if !timeouts.connection_fired && now.saturating_duration_since(self.inner.created) >= limit {
                timeouts.connection_fired = true;
                return Some(TimeoutKind::Connection);
            }
        }
        if let Some(limit) = timeouts.idle {
            if !timeouts.idle_fired && now.saturating_duration_since(timeouts.last_activity) >= limit {
                timeouts.idle_fired = true;
                return Some(TimeoutKind::Idle);
            }
        }
        None
    }

    // ---- lifecycle ----

    /// Closes the connection after a last attempt to flush queued bytes.
    /// The disconnect callback follows once the dispatcher released the socket.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(conn = %self.inner.id, "closing connection");
        if let Err(e) = self.drain() {
            trace!(conn = %self.inner.id, error = %e, "final flush failed");
        }
        self.request_close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn closed_error(&self) -> Error {
        Error::Closed(self.inner.id.clone())
    }

    fn request_write(&self) {
        if let Some(scheduler) = self.inner.scheduler.upgrade() {
            scheduler.request_write(self.inner.token);
        }
    }

    fn request_close(&self) {
        if let Some(scheduler) = self.inner.scheduler.upgrade() {
            scheduler.request_close(self.inner.token);
        }
    }

    fn request_interest(&self) {
        if let Some(scheduler) = self.inner.scheduler.upgrade() {
            scheduler.request_interest(self.inner.token);
        }
    }

    /// Marks the connection failed and asks the dispatcher to tear it down.
    fn fail(&self, error: io::Error) -> Error {
        let was_open = self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if was_open {
            debug!(conn = %self.inner.id, error = %error, "socket failed");
            self.request_close();
        }
        Error::Io(error)
    }

    // ---- dispatcher side ----

    /// Moves everything the socket has to offer into the read queue.
    pub(crate) fn receive(&self, pool: &mut BufferPool) -> Result<ReceiveOutcome> {
        let mut socket = self.inner.socket.lock();
        let mut outcome = ReceiveOutcome {
            bytes: 0,
            eof: false,
            limited: false,
        };
        let threshold = self.inner.read_threshold.unwrap_or(usize::MAX);

        loop {
            let mut buffer = pool.acquire(pool.min_buffer_size());
            match socket.read(&mut buffer[..]) {
                Ok(0) => {
                    pool.recycle(buffer);
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    let data = pool.extract_used_and_recycle_remainder(buffer, n);
                    let buffered = {
                        let mut queue = self.inner.read_queue.lock();
                        queue.append(data);
                        queue.len()
                    };
                    outcome.bytes += n;
                    if buffered >= threshold {
                        outcome.limited = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    pool.recycle(buffer);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    pool.recycle(buffer);
                }
                Err(e) => {
                    pool.recycle(buffer);
                    drop(socket);
                    return Err(self.fail(e));
                }
            }
        }
        drop(socket);

        if outcome.bytes > 0 {
            self.touch(Instant::now());
            let counters = &self.inner.counters;
            counters.reads.fetch_add(1, Ordering::Relaxed);
            counters.bytes_read.fetch_add(outcome.bytes as u64, Ordering::Relaxed);
            trace!(conn = %self.inner.id, bytes = outcome.bytes, "received");
        }
        Ok(outcome)
    }

    /// Writes queued bytes until the queue is empty, the socket would block
    /// or the throttle budget is spent.
    pub(crate) fn drain(&self) -> Result<DrainOutcome> {
        let mut outbound = self.inner.outbound.lock();
        if outbound.queue.is_empty() {
            return Ok(DrainOutcome::Drained);
        }

        let WriteState { queue, throttle } = &mut *outbound;
        let now = Instant::now();
        let mut budget = throttle.as_mut().map_or(usize::MAX, |t| t.budget(now));
        let mut written = 0;

        let mut socket = self.inner.socket.lock();
        let outcome = loop {
            let Some(front) = queue.front() else {
                break DrainOutcome::Drained;
            };
            if budget == 0 {
                let resume = throttle
                    .as_ref()
                    .and_then(WriteThrottle::next_window)
                    .unwrap_or(now + THROTTLE_INTERVAL);
                break DrainOutcome::Throttled(resume);
            }

            let chunk = front.len().min(budget);
            match socket.write(&front[..chunk]) {
                Ok(0) => {
                    queue.clear();
                    drop(socket);
                    return Err(self.fail(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    queue.advance(n);
                    budget = budget.saturating_sub(n);
                    if let Some(throttle) = throttle.as_mut() {
                        throttle.consume(n);
                    }
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break DrainOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    queue.clear();
                    drop(socket);
                    return Err(self.fail(e));
                }
            }
        };
        drop(socket);

        if written > 0 {
            let counters = &self.inner.counters;
            counters.writes.fetch_add(1, Ordering::Relaxed);
            counters.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
            trace!(conn = %self.inner.id, bytes = written, pending = queue.len(), "sent");
        }
        Ok(outcome)
    }

    pub(crate) fn has_write_interest(&self) -> bool {
        self.inner.write_interest.load(Ordering::Acquire)
    }

    pub(crate) fn update_interest(&self, registry: &Registry, writable: bool) -> Result<()> {
        self.inner.write_interest.store(writable, Ordering::Release);
        self.sync_interest(registry, false)
    }

    pub(crate) fn register(&self, registry: &Registry) -> Result<()> {
        self.sync_interest(registry, false)
    }

    /// Brings the poller registration in line with the wanted read and write
    /// interest; a connection that wants neither is deregistered. `rearm`
    /// re-registers even when nothing changed, so that readiness the socket
    /// still holds is reported again.
    ///
    /// Only the dispatcher thread calls this. Readers that drain the queue
    /// concurrently see either the old registration, which the recheck after
    /// the store covers, or the new one and request an update themselves.
    pub(crate) fn sync_interest(&self, registry: &Registry, mut rearm: bool) -> Result<()> {
        loop {
            let mut wanted = 0;
            if self.wants_input() {
                wanted |= READ_INTEREST;
            }
            if self.inner.write_interest.load(Ordering::Acquire) {
                wanted |= WRITE_INTEREST;
            }

            let current = self.inner.registered.load(Ordering::SeqCst);
            if wanted == current && !rearm {
                return Ok(());
            }
            rearm = false;

            let interest = match (wanted & READ_INTEREST != 0, wanted & WRITE_INTEREST != 0) {
                (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
                (true, false) => Some(mio::Interest::READABLE),
                (false, true) => Some(mio::Interest::WRITABLE),
                (false, false) => None,
            };
            {
                let mut socket = self.inner.socket.lock();
                match interest {
                    None if current == 0 => {}
                    None => registry.deregister(&mut *socket)?,
                    Some(interest) if current == 0 => registry.register(&mut *socket, self.inner.token, interest)?,
                    Some(interest) => registry.reregister(&mut *socket, self.inner.token, interest)?,
                }
            }
            self.inner.registered.store(wanted, Ordering::SeqCst);
            trace!(conn = %self.inner.id, interest = ?interest, "interest updated");
        }
    }

    /// Releases the socket. Input that arrived before a peer shutdown stays
    /// readable; every other reason discards both queues.
    pub(crate) fn finish_close(&self, registry: &Registry, reason: CloseReason) {
        self.inner.state.store(CLOSED, Ordering::Release);
        {
            let mut socket = self.inner.socket.lock();
            if self.inner.registered.swap(0, Ordering::SeqCst) != 0 {
                let _ = registry.deregister(&mut *socket);
            }
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.inner.outbound.lock().queue.clear();
        if reason != CloseReason::PeerClosed {
            self.inner.read_queue.lock().clear();
        }
        debug!(conn = %self.inner.id, ?reason, "connection closed");
    }
}
