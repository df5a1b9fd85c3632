use std::{sync::Arc, time::Duration};

use mio::{Events, Poll, Registry, Token, Waker};

use crate::error::Result;

/// Token reserved for the waker. Connection tokens start above it.
pub const WAKER_TOKEN: Token = Token(0);

pub struct PollHandle {
    poller: Poll,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(PollHandle {
            poller,
            waker: Arc::new(waker),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    /// Handle that other threads use to interrupt [`PollHandle::poll`].
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Waits for readiness. An interrupted wait counts as zero events.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        match self.poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn wake(&self) -> Result<()> {
        Ok(self.waker.wake()?)
    }
}
