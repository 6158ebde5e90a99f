//! # Transport Layer
//!
//! Record streams over TCP.
//!
//! ## Design
//!
//! - One blocking stream per peer; each direction has its own lock
//! - Servers accept without blocking so a stop flag can interrupt them
//! - Clients dial through a [`Connector`] so tests can swap the wire out

mod server;
mod stream;

pub use server::{ConsumerFn, DisconnectFn, RecordServer};
pub use stream::RecordStream;

use crate::directory::ServiceAddress;
use crate::error::{NetError, NetResult};
use crate::protocol::{Dictionary, Record};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Server-assigned identifier of a connected socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl SocketId {
    /// Invalid/null socket ID.
    pub const NULL: Self = Self(u32::MAX);

    /// Returns true if this is a null/invalid ID.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("#null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// A connected, dictionary-aware record channel.
///
/// Implementations must allow `send` and `receive` from different threads
/// at once, and `close` must unblock a pending `receive`.
pub trait RecordLink: Send + Sync {
    /// Dictionary the server sent at connect time.
    fn dictionary(&self) -> &Dictionary;

    /// Id the server assigned to this connection.
    fn remote_socket_id(&self) -> SocketId;

    /// Sends one record.
    fn send(&self, record: &Record) -> NetResult<()>;

    /// Blocks for the next frame and stores it in `buffer`.
    fn receive(&self, buffer: &mut Vec<u8>) -> NetResult<()>;

    /// Shuts the connection down. Idempotent.
    fn close(&self);
}

/// Dials a service address.
pub trait Connector: Send + Sync {
    /// Connects and completes the preamble.
    fn connect(&self, address: &ServiceAddress) -> NetResult<Arc<dyn RecordLink>>;
}

/// [`Connector`] producing [`RecordStream`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector {
    small_packet_optimize: bool,
}

impl TcpConnector {
    /// Creates a connector. `small_packet_optimize` disables Nagle.
    #[must_use]
    pub const fn new(small_packet_optimize: bool) -> Self {
        Self { small_packet_optimize }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, address: &ServiceAddress) -> NetResult<Arc<dyn RecordLink>> {
        let port = address.primary_port().ok_or_else(|| NetError::InvalidAddress {
            address: address.address.clone(),
            port: 0,
        })?;
        let stream = RecordStream::dial(&address.address, port, self.small_packet_optimize)?;
        Ok(Arc::new(stream))
    }
}

/// Transport statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames sent.
    pub frames_sent: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Send errors.
    pub send_errors: u64,
}

/// Lock-free counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, result: &NetResult<()>, bytes: usize) {
        match result {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_receive(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}
