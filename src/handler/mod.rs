//! Application callbacks and how they are bound to connections.
//!
//! An application implements any subset of the five handler traits. Which
//! events it handles, and whether each callback runs on the dispatcher thread
//! or on the worker pool, is declared once when the [`HandlerSet`] is built:
//!
//! ```no_run
//! use std::sync::Arc;
//! use mill_conn::{handler, Connection, ExecutionMode, HandlerSet, Result};
//!
//! let echo = handler::from_fn(|conn: &Connection| {
//!     let line = conn.read_bytes_by_delimiter(b"\r\n")?;
//!     conn.write(&line)?;
//!     conn.write(b"\r\n")?;
//!     Ok(true)
//! });
//!
//! let handlers = HandlerSet::builder()
//!     .mode(ExecutionMode::Inline)
//!     .on_data(echo)
//!     .build();
//! ```

mod chain;
pub(crate) mod proxy;

use std::{fmt, sync::Arc};

pub use chain::HandlerChain;

use crate::{connection::Connection, error::Result};

/// Called once when a connection has been admitted by its dispatcher.
pub trait ConnectHandler: Send + Sync {
    fn on_connect(&self, conn: &Connection) -> Result<bool>;
}

/// Called when the read queue holds unconsumed bytes.
///
/// Returning [`Error::InsufficientData`](crate::Error::InsufficientData)
/// (usually by propagating it from a framed read with `?`) means "call me
/// again once more bytes arrived". Any other error closes the connection.
pub trait DataHandler: Send + Sync {
    fn on_data(&self, conn: &Connection) -> Result<bool>;
}

/// Called once after a connection has been closed for any reason.
pub trait DisconnectHandler: Send + Sync {
    fn on_disconnect(&self, conn: &Connection) -> Result<bool>;
}

/// Called when no data was received for the idle timeout. Returning `true`
/// keeps the connection open.
pub trait IdleTimeoutHandler: Send + Sync {
    fn on_idle_timeout(&self, conn: &Connection) -> Result<bool>;
}

/// Called when the connection outlived its connection timeout. Returning
/// `true` keeps the connection open.
pub trait ConnectionTimeoutHandler: Send + Sync {
    fn on_connection_timeout(&self, conn: &Connection) -> Result<bool>;
}

/// Where a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// On the dispatcher thread. The callback must not block.
    Inline,
    /// On the shared worker pool.
    #[default]
    Threaded,
}

/// Adapter turning a closure into a handler for every event.
pub struct FnHandler<F>(F);

/// Wraps `f` so it can be registered for any event.
pub fn from_fn<F>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(&Connection) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

macro_rules! impl_fn_handler {
    ($($handler:ident :: $method:ident),* $(,)?) => {
        $(
            impl<F> $handler for FnHandler<F>
            where
                F: Fn(&Connection) -> Result<bool> + Send + Sync,
            {
                fn $method(&self, conn: &Connection) -> Result<bool> {
                    (self.0)(conn)
                }
            }
        )*
    };
}

impl_fn_handler!(
    ConnectHandler::on_connect,
    DataHandler::on_data,
    DisconnectHandler::on_disconnect,
    IdleTimeoutHandler::on_idle_timeout,
    ConnectionTimeoutHandler::on_connection_timeout,
);

pub(crate) struct Slot<H: ?Sized> {
    pub(crate) handler: Arc<H>,
    pub(crate) mode: ExecutionMode,
}

impl<H: ?Sized> Clone for Slot<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            mode: self.mode,
        }
    }
}

/// Which events a [`HandlerSet`] handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub connect: bool,
    pub data: bool,
    pub disconnect: bool,
    pub idle_timeout: bool,
    pub connection_timeout: bool,
}

/// The resolved callbacks of one handler, one optional slot per event.
#[derive(Clone, Default)]
pub struct HandlerSet {
    pub(crate) connect: Option<Slot<dyn ConnectHandler>>,
    pub(crate) data: Option<Slot<dyn DataHandler>>,
    pub(crate) disconnect: Option<Slot<dyn DisconnectHandler>>,
    pub(crate) idle_timeout: Option<Slot<dyn IdleTimeoutHandler>>,
    pub(crate) connection_timeout: Option<Slot<dyn ConnectionTimeoutHandler>>,
}

impl HandlerSet {
    pub fn builder() -> HandlerSetBuilder {
        HandlerSetBuilder::default()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            connect: self.connect.is_some(),
            data: self.data.is_some(),
            disconnect: self.disconnect.is_some(),
            idle_timeout: self.idle_timeout.is_some(),
            connection_timeout: self.connection_timeout.is_some(),
        }
    }

    /// Execution mode of each present slot, in event order.
    pub fn modes(&self) -> [Option<ExecutionMode>; 5] {
        [
            self.connect.as_ref().map(|s| s.mode),
            self.data.as_ref().map(|s| s.mode),
            self.disconnect.as_ref().map(|s| s.mode),
            self.idle_timeout.as_ref().map(|s| s.mode),
            self.connection_timeout.as_ref().map(|s| s.mode),
        ]
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [connect, data, disconnect, idle_timeout, connection_timeout] = self.modes();
        f.debug_struct("HandlerSet")
            .field("connect", &connect)
            .field("data", &data)
            .field("disconnect", &disconnect)
            .field("idle_timeout", &idle_timeout)
            .field("connection_timeout", &connection_timeout)
            .finish()
    }
}

struct Pending<H: ?Sized> {
    handler: Arc<H>,
    mode: Option<ExecutionMode>,
}

impl<H: ?Sized> Pending<H> {
    fn resolve(self, default: ExecutionMode) -> Slot<H> {
        Slot {
            handler: self.handler,
            mode: self.mode.unwrap_or(default),
        }
    }
}

/// Collects handlers for a [`HandlerSet`]. Slots registered without an
/// explicit mode take the builder's default mode, whenever it is set.
#[derive(Default)]
pub struct HandlerSetBuilder {
    mode: ExecutionMode,
    connect: Option<Pending<dyn ConnectHandler>>,
    data: Option<Pending<dyn DataHandler>>,
    disconnect: Option<Pending<dyn DisconnectHandler>>,
    idle_timeout: Option<Pending<dyn IdleTimeoutHandler>>,
    connection_timeout: Option<Pending<dyn ConnectionTimeoutHandler>>,
}

impl HandlerSetBuilder {
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn on_connect<H: ConnectHandler + 'static>(mut self, handler: Arc<H>) -> Self {
        let handler: Arc<dyn ConnectHandler> = handler;
        self.connect = Some(Pending { handler, mode: None });
        self
    }

    pub fn on_connect_with<H: ConnectHandler + 'static>(mut self, handler: Arc<H>, mode: ExecutionMode) -> Self {
        let handler: Arc<dyn ConnectHandler> = handler;
        self.connect = Some(Pending { handler, mode: Some(mode) });
        self
    }

    pub fn on_data<H: DataHandler + 'static>(mut self, handler: Arc<H>) -> Self {
        let handler: Arc<dyn DataHandler> = handler;
        self.data = Some(Pending { handler, mode: None });
        self
    }

    pub fn on_data_with<H: DataHandler + 'static>(mut self, handler: Arc<H>, mode: ExecutionMode) -> Self {
        let handler: Arc<dyn DataHandler> = handler;
        self.data = Some(Pending { handler, mode: Some(mode) });
        self
    }

    pub fn on_disconnect<H: DisconnectHandler + 'static>(mut self, handler: Arc<H>) -> Self {
        let handler: Arc<dyn DisconnectHandler> = handler;
        self.disconnect = Some(Pending { handler, mode: None });
        self
    }

    pub fn on_disconnect_with<H: DisconnectHandler + 'static>(mut self, handler: Arc<H>, mode: ExecutionMode) -> Self {
        let handler: Arc<dyn DisconnectHandler> = handler;
        self.disconnect = Some(Pending { handler, mode: Some(mode) });
        self
    }

    pub fn on_idle_timeout<H: IdleTimeoutHandler + 'static>(mut self, handler: Arc<H>) -> Self {
        let handler: Arc<dyn IdleTimeoutHandler> = handler;
        self.idle_timeout = Some(Pending { handler, mode: None });
        self
    }

    pub fn on_idle_timeout_with<H: IdleTimeoutHandler + 'static>(
        mut self,
        handler: Arc<H>,
        mode: ExecutionMode,
    ) -> Self {
        let handler: Arc<dyn IdleTimeoutHandler> = handler;
        self.idle_timeout = Some(Pending { handler, mode: Some(mode) });
        self
    }

    pub fn on_connection_timeout<H: ConnectionTimeoutHandler + 'static>(mut self, handler: Arc<H>) -> Self {
        let handler: Arc<dyn ConnectionTimeoutHandler> = handler;
        self.connection_timeout = Some(Pending { handler, mode: None });
        self
    }

    pub fn on_connection_timeout_with<H: ConnectionTimeoutHandler + 'static>(
        mut self,
        handler: Arc<H>,
        mode: ExecutionMode,
    ) -> Self {
        let handler: Arc<dyn ConnectionTimeoutHandler> = handler;
        self.connection_timeout = Some(Pending { handler, mode: Some(mode) });
        self
    }

    pub fn build(self) -> HandlerSet {
        let mode = self.mode;
        HandlerSet {
            connect: self.connect.map(|p| p.resolve(mode)),
            data: self.data.map(|p| p.resolve(mode)),
            disconnect: self.disconnect.map(|p| p.resolve(mode)),
            idle_timeout: self.idle_timeout.map(|p| p.resolve(mode)),
            connection_timeout: self.connection_timeout.map(|p| p.resolve(mode)),
        }
    }
}

/// How a connection obtains its handlers at admission time.
#[derive(Clone)]
pub enum HandlerPrototype {
    /// One set serves every connection.
    Shared(HandlerSet),
    /// A fresh set is built for every connection, for handlers that keep
    /// per-connection state.
    PerConnection(Arc<dyn Fn() -> HandlerSet + Send + Sync>),
}

impl HandlerPrototype {
    pub fn shared(handlers: HandlerSet) -> Self {
        HandlerPrototype::Shared(handlers)
    }

    pub fn per_connection<F>(factory: F) -> Self
    where
        F: Fn() -> HandlerSet + Send + Sync + 'static,
    {
        HandlerPrototype::PerConnection(Arc::new(factory))
    }

    pub fn instantiate(&self) -> HandlerSet {
        match self {
            HandlerPrototype::Shared(handlers) => handlers.clone(),
            HandlerPrototype::PerConnection(factory) => factory(),
        }
    }
}

impl From<HandlerSet> for HandlerPrototype {
    fn from(handlers: HandlerSet) -> Self {
        HandlerPrototype::Shared(handlers)
    }
}

impl fmt::Debug for HandlerPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerPrototype::Shared(handlers) => f.debug_tuple("Shared").field(handlers).finish(),
            HandlerPrototype::PerConnection(_) => f.write_str("PerConnection(..)"),
        }
    }
}
