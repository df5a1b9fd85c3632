//! # mill-conn
//! A reactor-based TCP connection engine built on top of [`mio`], without an
//! async runtime.
//!
//! Sockets are spread over a fixed set of dispatcher threads. Each dispatcher
//! runs its own readiness loop, pulls received bytes into per-connection read
//! queues through a pooled read buffer, and hands them to application
//! handlers. Handlers consume the stream through framed reads (by delimiter,
//! by length, by length prefix, fixed-width scalars) that either return a
//! complete unit or report [`Error::InsufficientData`] and leave the stream
//! untouched.
//! ## Guarantees
//! - **One callback at a time** per connection, in event order, whether
//!   callbacks run inline on the dispatcher or on the worker pool
//! - **Atomic framing**: a read never consumes a partial unit
//! - **Soft timeouts**: idle and connection timeouts may be vetoed by their
//!   handler
//! - **No head-of-line blocking** across connections: every connection owns
//!   its queues and is served by exactly one dispatcher
//! ## Architecture Overview
//! ```text
//!                 ┌──────────┐  admit (round robin)
//!  TcpStream ────▶│  Engine  │───────────────┬──────────────────┐
//!                 └──────────┘               ▼                  ▼
//!                                   ┌──────────────┐    ┌──────────────┐
//!                                   │ Dispatcher 0 │    │ Dispatcher 1 │
//!                                   │  PollHandle  │    │  PollHandle  │
//!                                   │  BufferPool  │    │  BufferPool  │
//!                                   │  Watchdog    │    │  Watchdog    │
//!                                   └──────┬───────┘    └──────┬───────┘
//!                                          │ inline            │
//!                                          ▼                   ▼
//!                             ┌─────────────────────────────────────────┐
//!                             │ HandlerProxy ─▶ SerializedTaskQueue ─┐  │
//!                             └──────────────────────────────────────┼──┘
//!                                                     threaded       ▼
//!                                                          ┌────────────────┐
//!                                                          │   WorkerPool   │
//!                                                          └────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::TcpListener;
//! use mill_conn::{handler, Connection, Engine, EngineConfig, HandlerSet};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let echo = handler::from_fn(|conn: &Connection| {
//!         let line = conn.read_bytes_by_delimiter(b"\r\n")?;
//!         conn.write(&line)?;
//!         conn.write(b"\r\n")?;
//!         Ok(true)
//!     });
//!     let engine = Engine::new(EngineConfig::default(), HandlerSet::builder().on_data(echo).build())?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:7000")?;
//!     for stream in listener.incoming() {
//!         engine.admit(stream?)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! - [`Engine`]: owns the dispatchers and the worker pool, admits sockets
//! - [`Connection`]: framed reads, queued writes, timeouts, close
//! - [`handler`]: handler traits, [`HandlerSet`], [`HandlerChain`]
//! - [`byte_queue`]: the fragment queue behind every read and write queue
//! - [`buffer_pool`]: read-buffer pooling used by the dispatchers
//! - [`config`]: engine and connection configuration, TOML loading
//! - [`error`]: error type and result alias

pub mod buffer_pool;
pub mod byte_queue;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod poll;
mod task_queue;
mod watchdog;
pub mod worker_pool;

use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, info};

pub use byte_queue::{ByteQueue, LengthPrefix, Scalar};
pub use config::{ConnectionConfig, EngineConfig, Encoding, FlushMode};
pub use connection::{BlockingConnection, Connection, Origin};
pub use dispatcher::DispatcherStats;
pub use error::{Error, Result};
pub use handler::{
    Capabilities, ConnectHandler, ConnectionTimeoutHandler, DataHandler, DisconnectHandler, ExecutionMode,
    HandlerChain, HandlerPrototype, HandlerSet, IdleTimeoutHandler,
};

use crate::{dispatcher::Dispatcher, worker_pool::WorkerPool};

/// Commonly used types and traits.
///
/// ```rust
/// use mill_conn::prelude::*;
/// ```
pub mod prelude {
    pub use crate::byte_queue::LengthPrefix;
    pub use crate::config::{ConnectionConfig, EngineConfig, FlushMode};
    pub use crate::connection::{BlockingConnection, Connection};
    pub use crate::error::{Error, Result};
    pub use crate::handler::{
        self, ConnectHandler, ConnectionTimeoutHandler, DataHandler, DisconnectHandler, ExecutionMode,
        HandlerChain, HandlerPrototype, HandlerSet, IdleTimeoutHandler,
    };
    pub use crate::Engine;
}

/// Entry point: a set of dispatchers sharing one worker pool.
///
/// Admitted sockets are assigned to dispatchers round robin and keep their
/// dispatcher for life. Handlers come from the engine's
/// [`HandlerPrototype`] unless a connection is admitted with its own.
///
/// ## Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use mill_conn::{
///     handler, ConnectionConfig, Engine, EngineConfig, ExecutionMode, HandlerSet,
/// };
///
/// let config = EngineConfig::builder()
///     .dispatchers(4)
///     .workers(8)
///     .connection(
///         ConnectionConfig::builder()
///             .idle_timeout(Duration::from_secs(30))
///             .build(),
///     )
///     .build();
///
/// let handlers = HandlerSet::builder()
///     .mode(ExecutionMode::Threaded)
///     .on_idle_timeout(handler::from_fn(|conn| {
///         conn.write(b"bye\r\n")?;
///         Ok(false)
///     }))
///     .build();
///
/// let engine = Engine::new(config, handlers)?;
/// let conn = engine.connect("127.0.0.1:7000", HandlerSet::default())?;
/// conn.write(b"hello\r\n")?;
/// # Ok::<(), mill_conn::Error>(())
/// ```
pub struct Engine {
    dispatchers: Vec<Dispatcher>,
    workers: Arc<WorkerPool>,
    next: AtomicUsize,
    prototype: HandlerPrototype,
    config: EngineConfig,
}

impl Engine {
    /// Starts the worker pool and every dispatcher with its watchdog.
    ///
    /// ## Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Io`] when a poller or thread cannot be created.
    pub fn new(config: EngineConfig, prototype: impl Into<HandlerPrototype>) -> Result<Self> {
        config.validate()?;

        let workers = Arc::new(WorkerPool::new(config.workers));
        let dispatchers = (0..config.dispatchers)
            .map(|index| Dispatcher::spawn(index, &config, Arc::clone(&workers)))
            .collect::<Result<Vec<_>>>()?;

        info!(
            dispatchers = dispatchers.len(),
            workers = workers.workers_len(),
            "engine started"
        );

        Ok(Self {
            dispatchers,
            workers,
            next: AtomicUsize::new(0),
            prototype: prototype.into(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hands an accepted socket to the next dispatcher, using the engine's
    /// handlers.
    pub fn admit(&self, stream: TcpStream) -> Result<Connection> {
        self.assign(stream, Origin::Server, &self.prototype)
    }

    /// Like [`admit`](Self::admit) with handlers of its own.
    pub fn admit_with(&self, stream: TcpStream, prototype: &HandlerPrototype) -> Result<Connection> {
        self.assign(stream, Origin::Server, prototype)
    }

    /// Opens an outbound connection served by this engine.
    pub fn connect(&self, addr: impl ToSocketAddrs, prototype: impl Into<HandlerPrototype>) -> Result<Connection> {
        let stream = TcpStream::connect(addr)?;
        self.assign(stream, Origin::Client, &prototype.into())
    }

    pub fn connect_timeout(
        &self,
        addr: &SocketAddr,
        timeout: Duration,
        prototype: impl Into<HandlerPrototype>,
    ) -> Result<Connection> {
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        self.assign(stream, Origin::Client, &prototype.into())
    }

    /// Opens an outbound connection without a data handler, for request and
    /// response exchanges.
    pub fn connect_blocking(&self, addr: impl ToSocketAddrs, receive_timeout: Duration) -> Result<BlockingConnection> {
        let conn = self.connect(addr, HandlerSet::default())?;
        Ok(BlockingConnection::with_receive_timeout(conn, receive_timeout))
    }

    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.workers_len()
    }

    pub fn open_connections(&self) -> usize {
        self.dispatchers.iter().map(Dispatcher::open_connections).sum()
    }

    pub fn stats(&self) -> Vec<DispatcherStats> {
        self.dispatchers.iter().map(Dispatcher::stats).collect()
    }

    /// Closes every connection, stops the dispatchers and lets the worker
    /// pool finish the queued callbacks. Further admissions fail with
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) {
        for dispatcher in &self.dispatchers {
            dispatcher.shutdown();
        }
        self.workers.shutdown();
        debug!("engine stopped");
    }

    /// Starts at the round-robin position and skips dispatchers that are
    /// at their connection limit.
    fn assign(&self, stream: TcpStream, origin: Origin, prototype: &HandlerPrototype) -> Result<Connection> {
        let count = self.dispatchers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;
        let dispatcher = (0..count)
            .map(|offset| &self.dispatchers[(start + offset) % count])
            .find(|dispatcher| dispatcher.has_capacity())
            .unwrap_or(&self.dispatchers[start]);

        let conn = dispatcher.admit(stream, origin, prototype.instantiate())?;
        debug!(conn = %conn.id(), dispatcher = dispatcher.index(), "connection assigned");
        Ok(conn)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
