//! # Service Directory
//!
//! Where servers register services and clients find them.
//!
//! ## Contract
//!
//! ```text
//! server: register_service ──> listen on port ──> confirm_ports
//!                     (bind failed? request_new_ports, retry)
//! client: discover_service(name, networks) ──> address + ports
//! ```
//!
//! Discovery may block until the service appears; it gives up when the
//! caller's cancel latch trips.

mod local;
mod static_table;

pub use local::LocalDirectory;
pub use static_table::{StaticDirectory, StaticService};

use crate::error::NetResult;
use std::fmt;
use std::str::FromStr;
use tandem_core::Latch;
use tandem_shared::ANY_NETWORK;

/// Where a discovered service lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAddress {
    /// Host name or IP.
    pub address: String,
    /// Ports the service listens on.
    pub ports: Vec<u16>,
    /// Network the service was found on.
    pub network: String,
}

impl ServiceAddress {
    /// The first port.
    #[must_use]
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }
}

/// Ordered network preference, written `"a/b/c"`. `"NULL"` or empty means
/// any network.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkList(Vec<String>);

impl NetworkList {
    /// Any network.
    #[must_use]
    pub const fn any() -> Self {
        Self(Vec::new())
    }

    /// Parses `"a/b/c"`.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        if spec.is_empty() || spec == ANY_NETWORK {
            return Self::any();
        }
        Self(
            spec.split('/')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// True if any network is acceptable.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `network` is acceptable.
    #[must_use]
    pub fn accepts(&self, network: &str) -> bool {
        self.is_any() || self.0.iter().any(|name| name == network)
    }

    /// Preference rank of `network`, lower is better. `None` if rejected.
    #[must_use]
    pub fn rank(&self, network: &str) -> Option<usize> {
        if self.is_any() {
            return Some(0);
        }
        self.0.iter().position(|name| name == network)
    }

    /// Networks in preference order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromStr for NetworkList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for NetworkList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str(ANY_NETWORK)
        } else {
            f.write_str(&self.0.join("/"))
        }
    }
}

/// Registry of cluster services.
pub trait ServiceDirectory: Send + Sync {
    /// Name of this node, for logs.
    fn label(&self) -> &str;

    /// Scopes `service` to this node's location, or to its user when the
    /// node has no location.
    fn complex_service_name(&self, service: &str) -> String;

    /// Finds `service` on one of `networks`, preferring earlier ones.
    ///
    /// Implementations may block until the service is registered. They
    /// return `None` once `cancel` trips.
    fn discover_service(&self, service: &str, networks: &NetworkList, cancel: &Latch) -> Option<ServiceAddress>;

    /// Reserves `count` ports for `service` on `channel`.
    fn register_service(&self, service: &str, channel: &str, count: usize) -> NetResult<Vec<u16>>;

    /// Replaces a reservation whose ports could not be bound.
    fn request_new_ports(&self, service: &str, channel: &str, count: usize) -> NetResult<Vec<u16>>;

    /// Publishes the service on the ports actually bound.
    fn confirm_ports(&self, service: &str, channel: &str, ports: &[u16]) -> NetResult<()>;

    /// Withdraws a service, e.g. when its server stops.
    fn release_service(&self, service: &str);
}

/// `location/service` when the node has a location, else `service/user`.
#[must_use]
pub fn complex_name(location: Option<&str>, user: &str, service: &str) -> String {
    match location {
        Some(location) if !location.is_empty() => format!("{location}/{service}"),
        _ => format!("{service}/{user}"),
    }
}
