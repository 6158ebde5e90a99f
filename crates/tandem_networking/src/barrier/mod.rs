//! # Frame Barrier
//!
//! A release group of render nodes. Every active client reports arrival
//! with a tuning record; when all have arrived the server broadcasts one
//! release.
//!
//! ## Activation Handshake
//!
//! ```text
//! client                              server
//!   │ ── handshake(bonded id) ──────────> │  queued (passive)
//!   │ <───────────────────── handshake ── │  probe, sent by activate_passive_sockets
//!   │ ── response ──────────────────────> │  promoted (active), bonded socket too
//! ```
//!
//! ## One Round
//!
//! ```text
//! client A ── client tuning ──┐
//! client B ── client tuning ──┼──> waiting >= active ──> server tuning ──> A, B
//! local    ── local_sync ─────┘
//! ```

mod client;
mod language;
mod server;

pub use client::BarrierClient;
pub use language::{BarrierLanguage, BarrierRecord};
pub use server::{ActivationQueueGuard, BarrierServer};
