//! Exponential backoff with jitter
//!
//! The upstream relay policy is unspecified, so the parameters here are
//! our own: callers pass a base and a cap, the delay doubles per
//! failure, and each delay is jittered by ±25% to avoid reconnect
//! stampedes against the same node.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff state for one retry loop
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Next delay to sleep; advances the internal state
    pub fn next(&mut self) -> Duration {
        let delay = self.jitter(self.current);
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    fn jitter(&self, d: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        d.mul_f64(factor)
    }
}
