//! # TANDEM
//!
//! Frame-locked cluster nodes, built from the units.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         TANDEM CLUSTER                            │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌─────────────────┐      frames        ┌─────────────────┐       │
//! │  │  tandem_master  │ ─────────────────> │  tandem_render  │ (xN)  │
//! │  │                 │                    │                 │       │
//! │  │ SyncDataServer  │ <── barrier ─────> │ SyncDataClient  │       │
//! │  │ BarrierServer   │                    │ BarrierClient   │       │
//! │  └─────────────────┘                    └─────────────────┘       │
//! │           │                                      │                │
//! │           └──────────── ServiceDirectory ────────┘                │
//! │                                                                   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `frames`: the demo frame stream and a tallying consumer
//! - `node`: builds directories, servers and clients from a `ClusterConfig`

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod frames;
pub mod node;

// Re-export the units
pub use tandem_core as core;
pub use tandem_networking as networking;
pub use tandem_shared as shared;

// Re-export commonly used types
pub use frames::{frame_dictionary, FrameLog, FrameSource, FrameTally, TallySnapshot};
pub use node::{directory, master, render};
