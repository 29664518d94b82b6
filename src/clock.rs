//! Real-time sources used for arrival stamps and idle catch-up of virtual time.
//!
//! Virtual time is measured in seconds. The production clock counts seconds since the scheduler
//! was created on a monotonic base, so virtual time starts near zero and wall-clock adjustments
//! cannot move it backwards.

use parking_lot::Mutex;
use std::time::Instant;

/// Source of "now" in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic clock anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, delta: f64) {
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(first >= 0.0);
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_moves_on_request() {
        let clock = ManualClock::new(1.5);
        clock.advance(0.5);
        assert_eq!(clock.now(), 2.0);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }
}
