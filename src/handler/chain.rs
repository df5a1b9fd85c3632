use std::sync::Arc;

use super::{
    ConnectHandler, ConnectionTimeoutHandler, DataHandler, DisconnectHandler, ExecutionMode, HandlerSet,
    IdleTimeoutHandler, Slot,
};
use crate::{connection::Connection, error::Result};

/// Combines several handler sets into one.
///
/// For every event the links that handle it are called in insertion order
/// until one returns `true`. A chained slot runs threaded when any of its
/// links is threaded.
#[derive(Default)]
pub struct HandlerChain {
    links: Vec<HandlerSet>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, link: HandlerSet) -> Self {
        self.links.push(link);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn build(self) -> HandlerSet {
        let links = &self.links;
        HandlerSet {
            connect: chain_slot(
                links.iter().filter_map(|l| l.connect.clone()),
                |handlers| -> Arc<dyn ConnectHandler> { Arc::new(Chained(handlers)) },
            ),
            data: chain_slot(
                links.iter().filter_map(|l| l.data.clone()),
                |handlers| -> Arc<dyn DataHandler> { Arc::new(Chained(handlers)) },
            ),
            disconnect: chain_slot(
                links.iter().filter_map(|l| l.disconnect.clone()),
                |handlers| -> Arc<dyn DisconnectHandler> { Arc::new(Chained(handlers)) },
            ),
            idle_timeout: chain_slot(
                links.iter().filter_map(|l| l.idle_timeout.clone()),
                |handlers| -> Arc<dyn IdleTimeoutHandler> { Arc::new(Chained(handlers)) },
            ),
            connection_timeout: chain_slot(
                links.iter().filter_map(|l| l.connection_timeout.clone()),
                |handlers| -> Arc<dyn ConnectionTimeoutHandler> { Arc::new(Chained(handlers)) },
            ),
        }
    }
}

fn chain_slot<H: ?Sized>(
    slots: impl Iterator<Item = Slot<H>>,
    combine: impl FnOnce(Vec<Arc<H>>) -> Arc<H>,
) -> Option<Slot<H>> {
    let mut slots: Vec<_> = slots.collect();
    match slots.len() {
        0 => None,
        1 => slots.pop(),
        _ => {
            let mode = if slots.iter().any(|s| s.mode == ExecutionMode::Threaded) {
                ExecutionMode::Threaded
            } else {
                ExecutionMode::Inline
            };
            let handler = combine(slots.into_iter().map(|s| s.handler).collect());
            Some(Slot { handler, mode })
        }
    }
}

struct Chained<H: ?Sized>(Vec<Arc<H>>);

macro_rules! impl_chained {
    ($($handler:ident :: $method:ident),* $(,)?) => {
        $(
            impl $handler for Chained<dyn $handler> {
                fn $method(&self, conn: &Connection) -> Result<bool> {
                    for link in &self.0 {
                        if link.$method(conn)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        )*
    };
}

impl_chained!(
    ConnectHandler::on_connect,
    DataHandler::on_data,
    DisconnectHandler::on_disconnect,
    IdleTimeoutHandler::on_idle_timeout,
    ConnectionTimeoutHandler::on_connection_timeout,
);
