//! # TANDEM Networking - The Frame Lock
//!
//! Frame-locked data distribution for a cluster of render nodes.
//!
//! ## Architecture
//!
//! - **Protocol**: self-describing records; the server sends its dictionary
//!   at connect time
//! - **Transport**: blocking TCP record streams, one reader thread per peer
//! - **Directory**: where servers publish services and clients find them
//! - **Barrier**: release groups with a 3-way activation handshake
//! - **Sync data**: double-buffered frames paced by the barrier
//!
//! ## Guarantees
//!
//! - No active client is released before every active client has arrived
//! - A render node never sees its next buffer overwrite the one it is
//!   consuming
//! - `stop()` returns, whatever state the peers are in
//!
//! ## Topology
//!
//! ```text
//! MASTER                                   RENDER NODE
//! SyncDataServer ── data (frames) ───────> SyncDataClient
//!   BarrierServer <── barrier (tuning) ──>   BarrierClient
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem_networking::{LocalDirectory, PassThrough, SyncDataServer};
//!
//! let directory = Arc::new(LocalDirectory::loopback("master"));
//! let server = SyncDataServer::new("master", dictionary, ServerMode::SyncAuto, Box::new(PassThrough));
//! server.set_service_name("FRAMES");
//! server.set_channel("lan");
//! server.init(directory)?;
//! server.start()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod barrier;
pub mod config;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod sync_data;
pub mod transport;

mod worker;

// Re-exports for convenience
pub use barrier::{ActivationQueueGuard, BarrierClient, BarrierLanguage, BarrierRecord, BarrierServer};
pub use config::ClusterConfig;
pub use directory::{LocalDirectory, NetworkList, ServiceAddress, ServiceDirectory, StaticDirectory, StaticService};
pub use error::{NetError, NetResult};
pub use protocol::{Dictionary, FieldKind, QueuedData, QueuedRecords, Record, RecordTemplate};
pub use sync_data::{PassThrough, SyncConsumer, SyncDataClient, SyncDataServer, SyncProducer};
pub use transport::{Connector, RecordLink, RecordServer, RecordStream, SocketId, TcpConnector, TransportStats};
