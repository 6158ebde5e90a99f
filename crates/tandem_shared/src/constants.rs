//! # Cluster Constants
//!
//! Buffer sizes, limits and polling schedules shared by every node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// SERVICE NAMING
// =============================================================================

/// Appended to a data service name to form its barrier service name.
pub const BARRIER_SERVICE_SUFFIX: &str = "_BARRIER";

/// Network list meaning "any network".
pub const ANY_NETWORK: &str = "NULL";

/// Lowest port a client will dial.
pub const MIN_PORT: u16 = 1000;

/// How many brokered ports a server tries before giving up.
pub const LISTEN_RETRIES: usize = 10;

// =============================================================================
// BUFFERS AND LIMITS
// =============================================================================

/// Initial receive buffer for barrier records (they are tiny).
pub const BARRIER_BUFFER_SIZE: usize = 200;

/// Initial receive buffer for a frame of sync data.
pub const DEFAULT_DATA_BUFFER_SIZE: usize = 10_000;

/// Bytes queued in the back buffer before producers are throttled.
pub const DEFAULT_SEND_LIMIT: usize = 300_000;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Bound on the TCP connect and on waiting for the server's preamble.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// POLLING SCHEDULES
// =============================================================================

/// Geometric sleep schedule, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffSpec {
    /// First delay.
    pub min_ms: f64,
    /// Delay ceiling.
    pub max_ms: f64,
    /// Growth factor per sleep.
    pub ratio: f64,
}

impl BackoffSpec {
    /// Creates a schedule.
    #[must_use]
    pub const fn new(min_ms: f64, max_ms: f64, ratio: f64) -> Self {
        Self { min_ms, max_ms, ratio }
    }

    /// Barrier client: retry discovery and dialing.
    pub const BARRIER_CONNECT: Self = Self::new(7.0, 50.0, 1.2);
    /// Barrier client: idle data loop while disconnected.
    pub const BARRIER_IDLE: Self = Self::new(1.0, 10.0, 1.2);
    /// Barrier client: wait for worker loops during stop.
    pub const BARRIER_STOP: Self = Self::new(8.0, 20.0, 1.08);
    /// Sync data server: wait for worker loops during stop.
    pub const DATA_SERVER_STOP: Self = Self::new(8.0, 20.0, 1.15);
    /// Sync data client: wait for worker loops during stop.
    pub const DATA_CLIENT_STOP: Self = Self::new(30.0, 30.0, 1.0);
    /// Servers: idle accept loop.
    pub const ACCEPT_IDLE: Self = Self::new(1.0, 20.0, 1.5);
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self::BARRIER_CONNECT
    }
}
