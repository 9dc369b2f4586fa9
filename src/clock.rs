//! Time source abstraction so that TTL and backoff logic is testable.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source. Production code uses [`SystemClock`]; tests use
/// [`FakeClock`] to step through TTL refresh and expiration schedules.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<parking_lot::Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> FakeClock {
        FakeClock {
            inner: Arc::new(parking_lot::Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.inner.lock();
        *now += delta;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        FakeClock::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }
}
