//! Barrier wire names, tuning payloads and operating modes.
//!
//! Tuning payloads travel as int arrays inside records. The structs here
//! are `Pod` so they convert to and from those arrays without copying
//! field by field.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

// =============================================================================
// BARRIER DICTIONARY NAMES
// =============================================================================

/// Activation handshake record (rounds 1 and 2).
pub const HANDSHAKE: &str = "handshake";
/// Field of [`HANDSHAKE`] carrying the client's bonded data socket id.
pub const BONDED_ID_FIELD: &str = "bonded ID";

/// Activation response record (round 3).
pub const RESPONSE: &str = "response";

/// Per-frame record a client sends when it reaches the barrier.
pub const CLIENT_TUNING: &str = "client tuning";
/// Field of [`CLIENT_TUNING`] holding the four tuning ints.
pub const CLIENT_TUNING_FIELD: &str = "client tuning data";

/// Release broadcast from server to clients.
pub const SERVER_TUNING: &str = "server tuning";
/// Field of [`SERVER_TUNING`] holding the send-size int.
pub const SERVER_TUNING_FIELD: &str = "server tuning data";

// =============================================================================
// TUNING PAYLOADS
// =============================================================================

/// Per-frame timing a client reports with every barrier arrival.
///
/// Times are microseconds.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct ClientTuning {
    /// Smoothed time spent in the action callback.
    pub draw_time: i32,
    /// Smoothed time spent reading a frame off the socket.
    pub recv_time: i32,
    /// Smoothed time spent consuming frame buffers.
    pub proc_time: i32,
    /// Frame counter, reserved.
    pub frame_number: i32,
}

impl ClientTuning {
    /// Number of ints on the wire.
    pub const LEN: usize = 4;

    /// Wire representation.
    #[inline]
    #[must_use]
    pub fn to_array(self) -> [i32; Self::LEN] {
        bytemuck::cast(self)
    }

    /// Parses the wire representation. Short slices yield `None`.
    #[must_use]
    pub fn from_slice(values: &[i32]) -> Option<Self> {
        let array: [i32; Self::LEN] = values.get(..Self::LEN)?.try_into().ok()?;
        Some(bytemuck::cast(array))
    }
}

/// Release payload broadcast by the barrier server.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct ServerTuning {
    /// Bytes the data server sent last frame, summed over clients.
    pub send_size: i32,
}

impl ServerTuning {
    /// Creates a payload, clamping negative sizes to zero.
    #[inline]
    #[must_use]
    pub const fn new(send_size: i32) -> Self {
        Self {
            send_size: if send_size < 0 { 0 } else { send_size },
        }
    }
}

// =============================================================================
// OPERATING MODES
// =============================================================================

/// How a sync data client paces consumption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// One buffer per frame, released by the barrier.
    #[default]
    Sync,
    /// Drain whatever has arrived, no barrier participation.
    NoSync,
}

/// How a sync data server paces sending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Barrier release drives the send loop.
    #[default]
    SyncAuto,
    /// The application swaps and waits for release.
    SyncManual,
    /// The application swaps and never waits.
    NoSyncManual,
}

impl ServerMode {
    /// True if the send loop joins the barrier as a local participant.
    #[inline]
    #[must_use]
    pub const fn joins_barrier(self) -> bool {
        !matches!(self, Self::NoSyncManual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tuning_wire_order() {
        let tuning = ClientTuning {
            draw_time: 1,
            recv_time: 2,
            proc_time: 3,
            frame_number: 4,
        };
        assert_eq!(tuning.to_array(), [1, 2, 3, 4]);
        assert_eq!(ClientTuning::from_slice(&[1, 2, 3, 4, 99]), Some(tuning));
        assert_eq!(ClientTuning::from_slice(&[1, 2]), None);
    }

    #[test]
    fn test_server_tuning_clamps_negative() {
        assert_eq!(ServerTuning::new(-5).send_size, 0);
        assert_eq!(ServerTuning::new(42).send_size, 42);
    }

    #[test]
    fn test_modes_from_config_names() {
        #[derive(Deserialize)]
        struct Modes {
            client: ClientMode,
            server: ServerMode,
        }
        let modes: Modes = toml::from_str("client = \"no_sync\"\nserver = \"sync_manual\"").unwrap();
        assert_eq!(modes.client, ClientMode::NoSync);
        assert_eq!(modes.server, ServerMode::SyncManual);
        assert!(modes.server.joins_barrier());
        assert!(!ServerMode::NoSyncManual.joins_barrier());
    }
}
