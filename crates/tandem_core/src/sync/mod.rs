//! # Synchronization Primitives for Frame-Locked Threads
//!
//! ## The Problem
//!
//! ```text
//! Reader thread:   blocked on a socket, a swap gate or a release signal
//! App thread:      calls stop()
//!
//! Without an escape: the reader never wakes, stop() never returns
//! ```
//!
//! ## The Solution
//!
//! ```text
//! Latch       one-way "exit" flag checked between every blocking step
//! Signal      single-slot wake-up, sent by stop() to unblock waiters
//! WorkerFlag  each loop reports liveness; stop() polls with a Backoff
//! ```

mod backoff;
mod latch;
mod signal;

pub use backoff::Backoff;
pub use latch::{Latch, RunningGuard, WorkerFlag};
pub use signal::Signal;
