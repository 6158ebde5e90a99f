//! # Single-Slot Signal
//!
//! A binary wake-up object. `send` leaves at most one pending wake-up and
//! `wait` consumes it. Sending twice before anyone waits is the same as
//! sending once.
//!
//! Backed by a capacity-1 crossbeam channel: the slot is the channel buffer.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// Single-slot wake-up signal.
///
/// # Example
///
/// ```rust,ignore
/// let signal = Signal::new();
/// signal.send();
/// signal.send(); // absorbed
/// signal.wait(); // returns at once
/// assert!(!signal.is_pending());
/// ```
#[derive(Debug)]
pub struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Signal {
    /// Creates a signal with no pending wake-up.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Raises the signal. A no-op if a wake-up is already pending.
    #[inline]
    pub fn send(&self) {
        // Full means a wake-up is already pending. Both ends live in self,
        // so the channel cannot be disconnected.
        let _ = self.tx.try_send(());
    }

    /// Blocks until the signal is raised, then clears it.
    pub fn wait(&self) {
        // We hold the sender, so recv only returns once a value arrives.
        let _ = self.rx.recv();
    }

    /// Like [`Signal::wait`] but gives up after `timeout`.
    ///
    /// Returns true if a wake-up was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Clears any pending wake-up without blocking.
    #[inline]
    pub fn reset(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Returns true if a wake-up is pending.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_send_then_wait() {
        let signal = Signal::new();
        signal.send();
        assert!(signal.is_pending());
        signal.wait();
        assert!(!signal.is_pending());
    }

    #[test]
    fn test_double_send_is_absorbed() {
        let signal = Signal::new();
        signal.send();
        signal.send();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_reset_clears_pending() {
        let signal = Signal::new();
        signal.send();
        signal.reset();
        assert!(!signal.is_pending());
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(10));
        signal.send();
        waiter.join().unwrap();
    }
}
