//! Engine and connection configuration.
//!
//! Both configs are plain structs with builders in the same style. An
//! [`EngineConfig`] can also be read from TOML, where durations are given in
//! milliseconds and `0` disables a timeout:
//!
//! ```toml
//! dispatchers = 2
//! workers = 8
//! timeout_check_period_ms = 500
//!
//! [connection]
//! idle_timeout_ms = 30000
//! flush_mode = "async"
//! encoding = "utf-8"
//! max_read_size = 65536
//! max_read_buffer_threshold = 1048576
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::{
    buffer_pool::{DEFAULT_MIN_BUFFER_SIZE, DEFAULT_PREALLOCATION_SIZE},
    error::{Error, Result},
    worker_pool,
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT_CHECK_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_DISPATCHERS: usize = 2;

/// When bytes handed to [`Connection::write`](crate::Connection::write) reach
/// the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// The writing thread drains the write queue right away.
    #[default]
    Sync,
    /// The dispatcher drains the write queue on the next writable event.
    Async,
}

/// Text encoding used by the string read/write helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "iso-8859-1", alias = "latin1")]
    Latin1,
}

impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Encoding(e.to_string())),
            Encoding::Latin1 => Ok(bytes.iter().map(|b| char::from(*b)).collect()),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| Error::Encoding(format!("{c:?} is not representable in ISO-8859-1")))
                })
                .collect(),
        }
    }
}

/// Per-connection defaults applied when a connection is admitted.
///
/// ## Timeouts
///
/// - idle_timeout: maximum time without received data (`None` never expires)
/// - connection_timeout: maximum lifetime of the connection
///
/// ## Buffers
///
/// - preallocation_size: size of the read regions handed out by the buffer pool
/// - min_buffer_size: smallest window a socket read is attempted with
/// - max_read_size: default guard for delimiter reads
/// - max_read_buffer_threshold: unread bytes at which the dispatcher stops
///   reading the socket until the handler catches up (`None` is unbounded)
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub idle_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub preallocation_size: usize,
    pub min_buffer_size: usize,
    pub flush_mode: FlushMode,
    /// Write throttle in bytes per second.
    pub write_rate: Option<u32>,
    pub encoding: Encoding,
    pub max_read_size: Option<usize>,
    pub max_read_buffer_threshold: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            connection_timeout: None,
            preallocation_size: DEFAULT_PREALLOCATION_SIZE,
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            flush_mode: FlushMode::default(),
            write_rate: None,
            encoding: Encoding::default(),
            max_read_size: None,
            max_read_buffer_threshold: None,
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }
}

#[derive(Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = Some(timeout);
        self
    }

    pub fn preallocation_size(mut self, size: usize) -> Self {
        self.config.preallocation_size = size;
        self
    }

    pub fn min_buffer_size(mut self, size: usize) -> Self {
        self.config.min_buffer_size = size;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    pub fn write_rate(mut self, bytes_per_sec: u32) -> Self {
        self.config.write_rate = Some(bytes_per_sec);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    pub fn max_read_size(mut self, max: usize) -> Self {
        self.config.max_read_size = Some(max);
        self
    }

    pub fn max_read_buffer_threshold(mut self, threshold: usize) -> Self {
        self.config.max_read_buffer_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// Configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of dispatcher threads.
    pub dispatchers: usize,
    /// Number of worker threads for threaded handlers.
    pub workers: usize,
    /// Period of each dispatcher's timeout watchdog.
    pub timeout_check_period: Duration,
    /// Maximum readiness events handled per poll.
    pub events_capacity: usize,
    /// Upper bound of a single poll wait.
    pub poll_timeout: Duration,
    /// Connection limit per dispatcher (`None` for unlimited).
    pub max_connections_per_dispatcher: Option<usize>,
    pub connection: ConnectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatchers: DEFAULT_DISPATCHERS,
            workers: worker_pool::default_capacity(),
            timeout_check_period: DEFAULT_TIMEOUT_CHECK_PERIOD,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_connections_per_dispatcher: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawEngineConfig = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatchers == 0 {
            return Err(Error::Config("at least one dispatcher is required".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("at least one worker is required".into()));
        }
        if self.events_capacity == 0 {
            return Err(Error::Config("events capacity must be positive".into()));
        }
        if self.timeout_check_period.is_zero() {
            return Err(Error::Config("timeout check period must be positive".into()));
        }
        if self.connection.max_read_buffer_threshold == Some(0) {
            return Err(Error::Config("read buffer threshold must be positive".into()));
        }
        if self.connection.write_rate == Some(0) {
            return Err(Error::Config("write rate must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatchers(mut self, count: usize) -> Self {
        self.config.dispatchers = count;
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.workers = count;
        self
    }

    pub fn timeout_check_period(mut self, period: Duration) -> Self {
        self.config.timeout_check_period = period;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn max_connections_per_dispatcher(mut self, max: usize) -> Self {
        self.config.max_connections_per_dispatcher = Some(max);
        self
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawEngineConfig {
    dispatchers: Option<usize>,
    workers: Option<usize>,
    timeout_check_period_ms: Option<u64>,
    events_capacity: Option<usize>,
    poll_timeout_ms: Option<u64>,
    max_connections_per_dispatcher: Option<usize>,
    connection: RawConnectionConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConnectionConfig {
    idle_timeout_ms: Option<u64>,
    connection_timeout_ms: Option<u64>,
    preallocation_size: Option<usize>,
    min_buffer_size: Option<usize>,
    flush_mode: Option<FlushMode>,
    write_rate: Option<u32>,
    encoding: Option<Encoding>,
    max_read_size: Option<usize>,
    max_read_buffer_threshold: Option<usize>,
}

fn timeout_from_millis(millis: Option<u64>) -> Option<Duration> {
    millis.filter(|ms| *ms > 0).map(Duration::from_millis)
}

impl RawEngineConfig {
    fn into_config(self) -> EngineConfig {
        let default = EngineConfig::default();
        let raw = self.connection;
        let connection_default = default.connection;

        EngineConfig {
            dispatchers: self.dispatchers.unwrap_or(default.dispatchers),
            workers: self.workers.unwrap_or(default.workers),
            timeout_check_period: self
                .timeout_check_period_ms
                .map(Duration::from_millis)
                .unwrap_or(default.timeout_check_period),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self
                .poll_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default.poll_timeout),
            max_connections_per_dispatcher: self
                .max_connections_per_dispatcher
                .or(default.max_connections_per_dispatcher),
            connection: ConnectionConfig {
                idle_timeout: timeout_from_millis(raw.idle_timeout_ms),
                connection_timeout: timeout_from_millis(raw.connection_timeout_ms),
                preallocation_size: raw
                    .preallocation_size
                    .unwrap_or(connection_default.preallocation_size),
                min_buffer_size: raw.min_buffer_size.unwrap_or(connection_default.min_buffer_size),
                flush_mode: raw.flush_mode.unwrap_or(connection_default.flush_mode),
                write_rate: raw.write_rate,
                encoding: raw.encoding.unwrap_or(connection_default.encoding),
                max_read_size: raw.max_read_size,
                max_read_buffer_threshold: raw.max_read_buffer_threshold,
            },
        }
    }
}
