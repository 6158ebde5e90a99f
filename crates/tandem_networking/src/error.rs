//! # Networking Error Types
//!
//! Everything that can go wrong between two nodes, from a short read to a
//! dictionary that lacks a template the barrier needs.

use crate::protocol::FieldKind;
use crate::transport::SocketId;
use thiserror::Error;

/// Errors raised by the record protocol, transports and directories.
#[derive(Error, Debug)]
pub enum NetError {
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Disconnected,

    /// Connection preamble did not start with the protocol magic.
    #[error("bad preamble magic {0:?}")]
    BadMagic([u8; 4]),

    /// Peer speaks a protocol version we do not.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Peer announced a byte order we do not decode.
    #[error("unsupported byte order tag {0}")]
    UnsupportedByteOrder(u8),

    /// Frame header declared an impossible size.
    #[error("frame size {size} outside [{min}, {max}]")]
    BadFrameSize {
        /// Declared size.
        size: usize,
        /// Smallest legal frame.
        min: usize,
        /// Largest legal frame.
        max: usize,
    },

    /// Ran out of bytes while decoding.
    #[error("truncated frame: needed {needed} bytes, {available} left")]
    Truncated {
        /// Bytes the decoder wanted.
        needed: usize,
        /// Bytes remaining.
        available: usize,
    },

    /// Record frame names a template id the dictionary does not have.
    #[error("unknown template id {0}")]
    UnknownTemplate(u32),

    /// Lookup of a template by name failed.
    #[error("dictionary has no template {0:?}")]
    MissingTemplate(String),

    /// Lookup of a field by name failed.
    #[error("template {template:?} has no field {field:?}")]
    MissingField {
        /// Template searched.
        template: String,
        /// Field requested.
        field: String,
    },

    /// Field index out of range for the record's template.
    #[error("field index {index} out of range ({count} fields)")]
    FieldOutOfRange {
        /// Requested index.
        index: usize,
        /// Fields in the template.
        count: usize,
    },

    /// Field accessed or decoded with the wrong element kind.
    #[error("field {index} holds {actual:?}, not {expected:?}")]
    FieldKindMismatch {
        /// Field index.
        index: usize,
        /// Kind the caller asked for.
        expected: FieldKind,
        /// Kind the template declares.
        actual: FieldKind,
    },

    /// Field kind tag not in the protocol.
    #[error("unknown field kind tag {0}")]
    BadFieldKind(u8),

    /// Dictionary frame could not be parsed.
    #[error("malformed dictionary: {0}")]
    MalformedDictionary(String),

    /// Address or port rejected before dialing.
    #[error("invalid address {address:?} port {port}")]
    InvalidAddress {
        /// Host part.
        address: String,
        /// Port part.
        port: u16,
    },

    /// No socket with this id is connected.
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),

    /// A component was used before it was given what it needs.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    /// `start` called twice.
    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    /// Operation not available in the current mode.
    #[error("{operation} is not available: {reason}")]
    InvalidMode {
        /// What was attempted.
        operation: &'static str,
        /// Why it was refused.
        reason: &'static str,
    },

    /// The directory could not place the service.
    #[error("port registration failed for {0:?}")]
    PortRegistration(String),

    /// Cluster configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NetError {
    /// True for errors that mean "the connection is gone" rather than
    /// "the data was bad".
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Io(_))
    }
}

/// Result type for networking operations.
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_problem() {
        let err = NetError::MissingField {
            template: "handshake".into(),
            field: "bonded ID".into(),
        };
        assert_eq!(err.to_string(), "template \"handshake\" has no field \"bonded ID\"");

        let err = NetError::UnknownSocket(SocketId(7));
        assert_eq!(err.to_string(), "unknown socket #7");
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(NetError::Disconnected.is_disconnect());
        assert!(NetError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(!NetError::UnknownTemplate(3).is_disconnect());
    }
}
