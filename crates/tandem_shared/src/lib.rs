//! # TANDEM Shared
//!
//! Common types used by both ends of a frame-locked cluster.
//!
//! ## CRITICAL RULE
//!
//! The template and field names in [`protocol`] are part of the wire
//! contract. A client resolves them by name from the dictionary the server
//! sends at connect time, so renaming one breaks every deployed node.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod constants;
pub mod protocol;

pub use constants::{
    BackoffSpec, ANY_NETWORK, BARRIER_BUFFER_SIZE, BARRIER_SERVICE_SUFFIX,
    DEFAULT_DATA_BUFFER_SIZE, DEFAULT_SEND_LIMIT, DIAL_TIMEOUT, LISTEN_RETRIES, MIN_PORT,
};
pub use protocol::{ClientMode, ClientTuning, ServerMode, ServerTuning};
