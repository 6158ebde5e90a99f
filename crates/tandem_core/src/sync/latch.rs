//! # Latches and Worker Flags
//!
//! `Latch` is a one-way flag: once tripped it never resets. Components use
//! it as their exit flag and re-check it between blocking steps.
//!
//! `WorkerFlag` is a loop's reported liveness. The spawner raises it before
//! the thread exists and the loop adopts it, so shutdown right after start
//! still waits for the loop. Shutdown code polls it instead of joining, so a
//! loop may clear it while parked in a call that the shutdown path cannot
//! interrupt directly.

use std::sync::atomic::{AtomicBool, Ordering};

/// One-way flag. Once tripped, stays tripped.
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    /// Creates an untripped latch.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Trips the latch. Returns true if this call did the tripping.
    #[inline]
    pub fn trip(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Returns true once the latch has been tripped.
    #[inline]
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Liveness flag reported by a worker loop.
#[derive(Debug, Default)]
pub struct WorkerFlag(AtomicBool);

impl WorkerFlag {
    /// Creates a flag reporting "not running".
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Sets the reported state.
    #[inline]
    pub fn set_running(&self, running: bool) {
        self.0.store(running, Ordering::Release);
    }

    /// Returns the reported state.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Takes over a flag the spawner already set running. It clears when
    /// the returned guard drops.
    ///
    /// A loop that panics or returns early still reports stopped.
    #[must_use = "the flag clears when the guard is dropped"]
    pub fn adopt(&self) -> RunningGuard<'_> {
        RunningGuard { flag: self }
    }
}

/// Clears a [`WorkerFlag`] on drop.
#[derive(Debug)]
pub struct RunningGuard<'a> {
    flag: &'a WorkerFlag,
}

impl RunningGuard<'_> {
    /// Temporarily reports "not running", e.g. across a blocking lookup
    /// that shutdown should not wait for.
    #[inline]
    pub fn park(&self) {
        self.flag.set_running(false);
    }

    /// Reports "running" again after [`RunningGuard::park`].
    #[inline]
    pub fn resume(&self) {
        self.flag.set_running(true);
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.set_running(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_trips_once() {
        let latch = Latch::new();
        assert!(!latch.is_tripped());
        assert!(latch.trip());
        assert!(!latch.trip());
        assert!(latch.is_tripped());
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let flag = WorkerFlag::new();
        flag.set_running(true);
        {
            let guard = flag.adopt();
            assert!(flag.is_running());
            guard.park();
            assert!(!flag.is_running());
            guard.resume();
            assert!(flag.is_running());
        }
        assert!(!flag.is_running());
    }

    #[test]
    fn test_guard_clears_on_panic() {
        let flag = std::sync::Arc::new(WorkerFlag::new());
        flag.set_running(true);
        let worker = {
            let flag = std::sync::Arc::clone(&flag);
            std::thread::spawn(move || {
                let _guard = flag.adopt();
                panic!("worker failed");
            })
        };
        assert!(worker.join().is_err());
        assert!(!flag.is_running());
    }
}
