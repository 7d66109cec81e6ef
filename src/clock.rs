//! Monotonic reference clock
//!
//! Every report line carries seconds elapsed since the supervisor started.
//! The reference is captured once in `main` and handed to the sampler and the
//! event loop, so all timestamps share the same origin.

use std::time::{Duration, Instant};

/// Handle on a monotonic clock with a fixed origin
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock whose origin is now (t = 0)
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the origin
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Seconds elapsed since the origin
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_near_zero() {
        let clock = MonotonicClock::start();
        assert!(clock.elapsed_secs() < 1.0);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::start();
        let a = clock.elapsed_secs();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.elapsed_secs();
        assert!(b > a);
    }

    #[test]
    fn test_copies_share_origin() {
        let clock = MonotonicClock::start();
        let copy = clock;
        std::thread::sleep(Duration::from_millis(2));
        let diff = (clock.elapsed_secs() - copy.elapsed_secs()).abs();
        assert!(diff < 0.5);
    }
}
