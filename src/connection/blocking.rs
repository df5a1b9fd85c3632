use std::{
    cmp, thread,
    time::{Duration, Instant},
};

use bytes::Bytes;

use super::Connection;
use crate::{
    byte_queue::{LengthPrefix, Scalar},
    error::{Error, Result},
};

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest single sleep between two read attempts.
const RETRY_STEP: Duration = Duration::from_millis(10);

/// Request/response style access to a [`Connection`].
///
/// Reads wait until the requested unit is available instead of reporting
/// [`Error::InsufficientData`]. Once the receive timeout is spent they fail
/// with [`Error::Timeout`]; a connection closed before enough data arrived
/// fails with [`Error::Closed`]. Only the calling thread sleeps.
///
/// The wrapped connection should have no data handler, otherwise the handler
/// and the blocking reader compete for the same bytes.
#[derive(Debug, Clone)]
pub struct BlockingConnection {
    conn: Connection,
    receive_timeout: Duration,
}

impl BlockingConnection {
    pub fn new(conn: Connection) -> Self {
        Self::with_receive_timeout(conn, DEFAULT_RECEIVE_TIMEOUT)
    }

    pub fn with_receive_timeout(conn: Connection, receive_timeout: Duration) -> Self {
        Self { conn, receive_timeout }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let written = self.conn.write(data)?;
        self.conn.flush()?;
        Ok(written)
    }

    pub fn write_str(&self, text: &str) -> Result<usize> {
        let written = self.conn.write_str(text)?;
        self.conn.flush()?;
        Ok(written)
    }

    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes> {
        self.retry(|conn| conn.read_bytes_by_delimiter(delimiter))
    }

    pub fn read_bytes_by_length(&self, n: usize) -> Result<Bytes> {
        self.retry(|conn| conn.read_bytes_by_length(n))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str) -> Result<String> {
        self.retry(|conn| conn.read_string_by_delimiter(delimiter))
    }

    pub fn read_string_by_length(&self, n: usize) -> Result<String> {
        self.retry(|conn| conn.read_string_by_length(n))
    }

    pub fn read_scalar<T: Scalar>(&self) -> Result<T> {
        self.retry(|conn| conn.read_scalar::<T>())
    }

    pub fn read_length_prefixed(&self, prefix: LengthPrefix) -> Result<Bytes> {
        self.retry(|conn| conn.read_length_prefixed(prefix))
    }

    pub fn close(&self) {
        self.conn.close();
    }

    fn retry<T>(&self, mut read: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.receive_timeout;
        loop {
            match read(&self.conn) {
                Err(Error::InsufficientData) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(self.receive_timeout));
                    }
                    thread::sleep(cmp::min(RETRY_STEP, deadline - now));
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::{buffer_pool::BufferPool, connection::tests::pair};

    #[test]
    fn test_read_times_out_without_data() {
        let (conn, _peer, _) = pair();
        let blocking = BlockingConnection::with_receive_timeout(conn, Duration::from_millis(50));

        let started = Instant::now();
        let err = blocking.read_bytes_by_delimiter(b"\n").unwrap_err();

        assert!(matches!(err, Error::Timeout(t) if t == Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_read_waits_for_late_data() {
        let (conn, mut peer, _) = pair();
        let blocking = BlockingConnection::with_receive_timeout(conn.clone(), Duration::from_secs(2));

        let receiver = thread::spawn(move || {
            let mut pool = BufferPool::default();
            peer.write_all(b"pong").unwrap();
            thread::sleep(Duration::from_millis(30));
            peer.write_all(b"\r\n").unwrap();
            for _ in 0..100 {
                conn.receive(&mut pool).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            peer
        });

        assert_eq!(blocking.read_string_by_delimiter("\r\n").unwrap(), "pong");
        receiver.join().unwrap();
    }
}
