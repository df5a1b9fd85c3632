use mio::{event::Event, Token};
use std::fmt;

/// Readiness of one registered socket, detached from the borrowed mio event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    is_readable: bool,
    is_writable: bool,
    is_read_closed: bool,
    is_error: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .field("is_read_closed", &self.is_read_closed)
            .field("is_error", &self.is_error)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    /// The peer shut down its write half. Buffered bytes may still be read.
    pub fn is_read_closed(&self) -> bool {
        self.is_read_closed
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_read_closed: event.is_read_closed(),
            is_error: event.is_error(),
        }
    }
}
