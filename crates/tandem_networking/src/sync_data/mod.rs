//! # Synchronized Data
//!
//! One producer, many render nodes, one frame at a time.
//!
//! ```text
//! master:  receive_message ──> back buffer ──swap──> front buffer ──> data sockets
//! render:  data socket ──> receive stack ──> consume ──> barrier sync
//! ```
//!
//! Each side owns its half of a frame barrier: the server owns a
//! [`BarrierServer`](crate::barrier::BarrierServer) and joins it as the
//! local participant; every client owns a
//! [`BarrierClient`](crate::barrier::BarrierClient) bonded to its data
//! socket, so both sockets are activated together.

mod callbacks;
mod client;
mod perf;
mod server;
mod shared;

pub use callbacks::{PassThrough, SyncConsumer, SyncProducer};
pub use client::SyncDataClient;
pub use perf::{filter_for, FrameCounters, FrameSample, SmoothedValue};
pub use server::SyncDataServer;
