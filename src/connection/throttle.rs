use std::time::{Duration, Instant};

/// Length of one throttle window. A rate-limited connection may release one
/// quantum of `ceil(rate / 4)` bytes per window.
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(250);

const WINDOWS_PER_SEC: u64 = 1000 / THROTTLE_INTERVAL.as_millis() as u64;

/// Token-bucket style limiter sitting between the write queue and the socket.
#[derive(Debug, Clone)]
pub(crate) struct WriteThrottle {
    bytes_per_sec: u32,
    quantum: usize,
    window_start: Option<Instant>,
    remaining: usize,
}

impl WriteThrottle {
    pub(crate) fn new(bytes_per_sec: u32) -> Self {
        let quantum = (u64::from(bytes_per_sec).div_ceil(WINDOWS_PER_SEC)).max(1) as usize;
        Self {
            bytes_per_sec,
            quantum,
            window_start: None,
            remaining: 0,
        }
    }

    pub(crate) fn bytes_per_sec(&self) -> u32 {
        self.bytes_per_sec
    }

    /// Bytes that may still be written in the window containing `now`.
    pub(crate) fn budget(&mut self, now: Instant) -> usize {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < THROTTLE_INTERVAL => self.remaining,
            _ => {
                self.window_start = Some(now);
                self.remaining = self.quantum;
                self.remaining
            }
        }
    }

    pub(crate) fn consume(&mut self, written: usize) {
        self.remaining = self.remaining.saturating_sub(written);
    }

    /// Start of the next window, once the current one is used up.
    pub(crate) fn next_window(&self) -> Option<Instant> {
        match self.window_start {
            Some(start) if self.remaining == 0 => Some(start + THROTTLE_INTERVAL),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantum_is_quarter_of_rate() {
        let now = Instant::now();
        assert_eq!(WriteThrottle::new(1000).budget(now), 250);
        assert_eq!(WriteThrottle::new(1001).budget(now), 251);
        assert_eq!(WriteThrottle::new(1).budget(now), 1);
    }

    #[test]
    fn test_budget_refills_per_window() {
        let mut throttle = WriteThrottle::new(400);
        let start = Instant::now();

        assert_eq!(throttle.budget(start), 100);
        throttle.consume(60);
        assert_eq!(throttle.budget(start + Duration::from_millis(100)), 40);
        throttle.consume(40);
        assert_eq!(throttle.budget(start + Duration::from_millis(200)), 0);
        assert_eq!(throttle.next_window(), Some(start + THROTTLE_INTERVAL));

        assert_eq!(throttle.budget(start + THROTTLE_INTERVAL), 100);
        assert_eq!(throttle.next_window(), None);
    }
}
