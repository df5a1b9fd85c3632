//! Binds one connection's [`HandlerSet`] to its serialized task queue and
//! applies the close policy to callback results.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{debug, trace, warn};

use super::{DataHandler, ExecutionMode, HandlerSet};
use crate::{
    connection::Connection,
    error::{Error, Result},
    task_queue::{EventKind, SerializedTaskQueue},
    worker_pool::{Task, WorkerPool},
};

pub(crate) struct HandlerProxy {
    handlers: HandlerSet,
    tasks: Arc<SerializedTaskQueue>,
}

impl HandlerProxy {
    pub(crate) fn new(handlers: HandlerSet, workers: Arc<WorkerPool>) -> Self {
        Self {
            handlers,
            tasks: SerializedTaskQueue::new(workers),
        }
    }

    pub(crate) fn on_connect(&self, conn: &Connection) {
        let Some(slot) = &self.handlers.connect else {
            return;
        };
        let handler = Arc::clone(&slot.handler);
        let conn = conn.clone();
        self.submit(
            slot.mode,
            EventKind::Connect,
            Box::new(move || {
                if invoke(&conn, "connect", || handler.on_connect(&conn)).is_none() {
                    conn.close();
                }
            }),
        );
    }

    pub(crate) fn on_data(&self, conn: &Connection) {
        let Some(slot) = &self.handlers.data else {
            return;
        };
        let handler = Arc::clone(&slot.handler);
        let conn = conn.clone();
        self.submit(
            slot.mode,
            EventKind::Data,
            Box::new(move || perform_on_data(&*handler, &conn)),
        );
    }

    pub(crate) fn on_disconnect(&self, conn: &Connection) {
        let Some(slot) = &self.handlers.disconnect else {
            return;
        };
        let handler = Arc::clone(&slot.handler);
        let conn = conn.clone();
        self.submit(
            slot.mode,
            EventKind::Disconnect,
            Box::new(move || {
                invoke(&conn, "disconnect", || handler.on_disconnect(&conn));
            }),
        );
    }

    pub(crate) fn on_idle_timeout(&self, conn: &Connection) {
        let Some(slot) = &self.handlers.idle_timeout else {
            debug!(conn = %conn.id(), "idle timeout reached, closing");
            conn.close();
            return;
        };
        let handler = Arc::clone(&slot.handler);
        let conn = conn.clone();
        self.submit(
            slot.mode,
            EventKind::IdleTimeout,
            Box::new(move || {
                let keep = invoke(&conn, "idle timeout", || handler.on_idle_timeout(&conn));
                apply_timeout_verdict(&conn, "idle", keep);
            }),
        );
    }

    pub(crate) fn on_connection_timeout(&self, conn: &Connection) {
        let Some(slot) = &self.handlers.connection_timeout else {
            debug!(conn = %conn.id(), "connection timeout reached, closing");
            conn.close();
            return;
        };
        let handler = Arc::clone(&slot.handler);
        let conn = conn.clone();
        self.submit(
            slot.mode,
            EventKind::ConnectionTimeout,
            Box::new(move || {
                let keep = invoke(&conn, "connection timeout", || handler.on_connection_timeout(&conn));
                apply_timeout_verdict(&conn, "connection", keep);
            }),
        );
    }

    fn submit(&self, mode: ExecutionMode, kind: EventKind, task: Task) {
        match mode {
            ExecutionMode::Inline => self.tasks.perform_inline(kind, task),
            ExecutionMode::Threaded => self.tasks.perform_threaded(kind, task),
        }
    }
}

fn apply_timeout_verdict(conn: &Connection, timeout: &str, keep: Option<bool>) {
    if keep == Some(true) {
        debug!(conn = %conn.id(), timeout, "timeout handler kept the connection open");
    } else {
        debug!(conn = %conn.id(), timeout, "timeout reached, closing");
        conn.close();
    }
}

/// Calls the data handler until the read queue is empty or a call makes no
/// progress on it.
fn perform_on_data(handler: &dyn DataHandler, conn: &Connection) {
    while conn.available() > 0 {
        let before = conn.read_progress();
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_data(conn))) {
            Ok(Ok(_)) => {
                if conn.read_progress() == before {
                    break;
                }
            }
            Ok(Err(Error::InsufficientData)) => {
                trace!(conn = %conn.id(), available = conn.available(), "waiting for more data");
                break;
            }
            Ok(Err(e)) => {
                report_failure(conn, "data", &e);
                conn.close();
                break;
            }
            Err(_) => {
                warn!(conn = %conn.id(), "data handler panicked, closing connection");
                conn.close();
                break;
            }
        }
    }
}

/// Runs one callback. `None` means it failed or panicked.
fn invoke(conn: &Connection, event: &str, call: impl FnOnce() -> Result<bool>) -> Option<bool> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(verdict)) => Some(verdict),
        Ok(Err(e)) => {
            report_failure(conn, event, &e);
            None
        }
        Err(_) => {
            warn!(conn = %conn.id(), event, "handler panicked");
            None
        }
    }
}

fn report_failure(conn: &Connection, event: &str, error: &Error) {
    if conn.is_open() {
        warn!(conn = %conn.id(), event, error = %error, "handler failed, closing connection");
    } else {
        debug!(conn = %conn.id(), event, error = %error, "handler failed on closed connection");
    }
}
