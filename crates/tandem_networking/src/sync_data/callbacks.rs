//! Application hooks for both ends of a sync data connection.

use crate::protocol::{Dictionary, QueuedData, Record};
use crate::transport::{RecordServer, SocketId};

/// Receives frames on a render node.
///
/// `on_connect` runs on the client's connection thread. Every other hook
/// runs on the thread calling [`SyncDataClient::consume`], so the consumer
/// may mutate its scene without further locking.
///
/// Per `consume` call exactly one of these happens: the buffers go through
/// `on_consume` followed by `on_action` and `on_post_sync`, or `on_null`
/// runs alone.
///
/// [`SyncDataClient::consume`]: super::SyncDataClient::consume
pub trait SyncConsumer: Send {
    /// A data connection came up speaking `dictionary`.
    fn on_connect(&mut self, _dictionary: &Dictionary) -> bool {
        true
    }

    /// The connection went away. Runs once per disconnect, after the
    /// first `on_null` that follows it.
    fn on_disconnect(&mut self) -> bool {
        true
    }

    /// One queue buffer from the producer.
    fn on_consume(&mut self, buffer: &[u8]) -> bool;

    /// After the frame's buffers were consumed, before the barrier.
    fn on_action(&mut self) -> bool {
        true
    }

    /// After the barrier released.
    fn on_post_sync(&mut self) -> bool {
        true
    }

    /// A frame with nothing to consume.
    fn on_null(&mut self) -> bool {
        true
    }
}

/// Feeds frames on the master node.
pub trait SyncProducer: Send {
    /// Sees every record before it is queued. May rewrite it.
    fn on_message(&mut self, _record: &mut Record) -> bool {
        true
    }

    /// New data sockets joined. Must send each of them exactly one queue
    /// buffer: the current front buffer, or a full state dump in the same
    /// format.
    fn on_connect(&mut self, queue: &QueuedData, server: &RecordServer, sockets: &[SocketId]) -> bool {
        sockets.is_empty() || server.send_raw_to_many(queue.front_buffer(), sockets)
    }
}

/// Producer that forwards records unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl SyncProducer for PassThrough {}
