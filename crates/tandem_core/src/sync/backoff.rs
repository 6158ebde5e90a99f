//! # Sleep Backoff
//!
//! Geometric sleep schedule for polling loops. Each `sleep` waits the
//! current delay, then grows it by `ratio` up to `max`. `reset` returns to
//! `min` after the loop finds work.

use std::thread;
use std::time::Duration;

/// Geometric sleep backoff between `min` and `max` milliseconds.
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    ratio: f64,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `min_ms`, growing by `ratio` up to `max_ms`.
    ///
    /// Out-of-range arguments are clamped: `min_ms` to at least 0.1ms,
    /// `max_ms` to at least `min_ms`, `ratio` to at least 1.0.
    #[must_use]
    pub fn new(min_ms: f64, max_ms: f64, ratio: f64) -> Self {
        let min_ms = if min_ms.is_finite() { min_ms.max(0.1) } else { 0.1 };
        let max_ms = if max_ms.is_finite() { max_ms.max(min_ms) } else { min_ms };
        let ratio = if ratio.is_finite() { ratio.max(1.0) } else { 1.0 };
        let min = Duration::from_secs_f64(min_ms / 1000.0);
        Self {
            min,
            max: Duration::from_secs_f64(max_ms / 1000.0),
            ratio,
            current: min,
        }
    }

    /// Sleeps for the current delay, then grows it.
    pub fn sleep(&mut self) {
        thread::sleep(self.current);
        self.advance();
    }

    /// Grows the delay without sleeping.
    #[inline]
    pub fn advance(&mut self) {
        self.current = self.current.mul_f64(self.ratio).min(self.max);
    }

    /// Returns to the minimum delay.
    #[inline]
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// The delay the next `sleep` will use.
    #[inline]
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// The delay ceiling.
    #[inline]
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}
