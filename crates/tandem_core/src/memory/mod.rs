//! # Frame Buffer Memory
//!
//! Receive buffers are allocated lazily and then recycled forever. A buffer
//! is always on exactly one of three stacks:
//!
//! ```text
//!   storage ──take──> (reading) ──push──> receive ──consume──> consuming
//!      ^                  │                                       │
//!      └────recycle───────┴───────────────finish──────────────────┘
//! ```

mod buffer_stacks;

pub use buffer_stacks::{BufferStacks, BufferStats, Drain};
