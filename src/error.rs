//! Error types shared by every layer of the engine.
//!
//! Framing code reports [`Error::InsufficientData`] whenever a read cannot be
//! satisfied yet. That condition is recoverable: the handler proxy treats it as
//! "wait for more bytes" and [`BlockingConnection`](crate::BlockingConnection)
//! turns it into [`Error::Timeout`] once its receive budget is spent. Every
//! other variant that reaches the proxy closes the connection.

use std::{fmt, io, result::Result as StdResult, time::Duration};

use thiserror::Error;

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// More bytes must arrive before the requested unit can be produced.
    #[error("insufficient data")]
    InsufficientData,

    /// A caller-configured frame bound was exceeded.
    #[error("frame exceeds the maximum size of {max} bytes")]
    FrameTooLarge { max: usize },

    /// The connection is no longer open.
    #[error("connection {0} is closed")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    /// Raised by application handlers.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("{0} has reached its connection limit")]
    Capacity(String),

    #[error("engine is shut down")]
    Shutdown,
}

impl Error {
    /// Wraps an application failure so it can be returned from a handler.
    pub fn handler(reason: impl fmt::Display) -> Self {
        Error::Handler(reason.to_string())
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Error::InsufficientData)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }
}
