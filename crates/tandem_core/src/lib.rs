//! # TANDEM Core
//!
//! Threading primitives shared by every node of a frame-locked cluster:
//! - Single-slot wake-up signals (no lost or duplicated wake-ups)
//! - One-way shutdown latches and worker liveness flags
//! - Geometric sleep backoff for polling loops
//! - Recycling buffer stacks for double-buffered delivery
//!
//! ## Architecture Rules
//!
//! 1. **Every blocking wait has an escape** - a latch, a signal or a timeout
//! 2. **Buffers are recycled, never dropped** - storage is accounted for
//! 3. **No global state** - every primitive is owned and shared by `Arc`
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem_core::{Backoff, Latch, WorkerFlag};
//!
//! let exit = Latch::new();
//! let running = WorkerFlag::new();
//! let mut backoff = Backoff::new(8.0, 20.0, 1.08);
//! exit.trip();
//! while running.is_running() {
//!     backoff.sleep();
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod memory;
pub mod sync;

pub use memory::{BufferStacks, BufferStats, Drain};
pub use sync::{Backoff, Latch, RunningGuard, Signal, WorkerFlag};
