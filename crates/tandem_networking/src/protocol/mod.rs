//! # Record Protocol
//!
//! Self-describing binary records.
//!
//! ## Overview
//!
//! ```text
//! connect:   server ──preamble (socket id + dictionary)──> client
//! traffic:   [size][template id][kind count payload]...   (either way)
//! frames:    [size][record count][record]...              (server to clients)
//! ```
//!
//! All integers are little-endian. A peer announcing another byte order
//! is rejected during the preamble.

pub mod codec;
mod dictionary;
mod queued;
mod record;

pub use codec::{FrameReader, FrameWriter, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use dictionary::{Dictionary, FieldDef, FieldKind, RecordTemplate};
pub use queued::{QueuedData, QueuedRecords};
pub use record::{FieldValue, Record};
