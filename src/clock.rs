//! Millisecond time source and delays.

use std::time::{Duration, Instant};

/// Monotonic milliseconds and sleeping.
///
/// The state machine reads [`now_ms`](Self::now_ms) for retry timeouts and the
/// drivers call [`sleep`](Self::sleep) between passes, so a test clock that
/// advances on `sleep` makes every timeout deterministic.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;

    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now_ms() >= a + 1);
    }

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = mock::ManualClock::default();
        assert_eq!(clock.now_ms(), 0);
        clock.sleep(Duration::from_millis(250));
        clock.advance(5);
        assert_eq!(clock.now_ms(), 255);
    }
}
