//! Line echo server.
//!
//! ```text
//! cargo run --example line_echo -- 127.0.0.1:7000
//! printf 'hello\r\nworld\r\n' | nc 127.0.0.1 7000
//! ```
//!
//! Lines are echoed upper-cased by the worker pool. Idle clients get a
//! farewell after 30 seconds and are disconnected.

use std::{net::TcpListener, time::Duration};

use anyhow::Context;
use mill_conn::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7000".to_string());

    let config = EngineConfig::builder()
        .connection(
            ConnectionConfig::builder()
                .idle_timeout(Duration::from_secs(30))
                .build(),
        )
        .build();

    let handlers = HandlerSet::builder()
        .on_connect_with(
            handler::from_fn(|conn: &Connection| {
                info!(conn = %conn.id(), peer = %conn.peer_addr(), "client connected");
                conn.write_str("ready\r\n")?;
                Ok(true)
            }),
            ExecutionMode::Inline,
        )
        .on_data(handler::from_fn(|conn: &Connection| {
            let line = conn.read_string_by_delimiter("\r\n")?;
            conn.write_str(&line.to_uppercase())?;
            conn.write_str("\r\n")?;
            Ok(true)
        }))
        .on_idle_timeout(handler::from_fn(|conn: &Connection| {
            conn.write_str("idle, bye\r\n")?;
            Ok(false)
        }))
        .on_disconnect(handler::from_fn(|conn: &Connection| {
            info!(conn = %conn.id(), "client disconnected");
            Ok(true)
        }))
        .build();

    let engine = Engine::new(config, handlers).context("failed to start engine")?;
    let listener = TcpListener::bind(&addr).with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, dispatchers = engine.dispatcher_count(), "listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = engine.admit(stream) {
            warn!(error = %e, "connection rejected");
        }
    }
    Ok(())
}
