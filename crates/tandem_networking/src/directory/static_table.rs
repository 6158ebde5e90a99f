//! Directory backed by a fixed table, usually from the cluster config.
//!
//! Nothing is ever "registered" here: servers are told the port the table
//! gives them, and discovery answers from the table immediately.

use super::{complex_name, NetworkList, ServiceAddress, ServiceDirectory};
use crate::error::{NetError, NetResult};
use serde::{Deserialize, Serialize};
use tandem_core::Latch;

/// One row of the table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticService {
    /// Full (scoped) service name.
    pub name: String,
    /// Network the entry belongs to.
    #[serde(default = "default_network")]
    pub network: String,
    /// Host to dial.
    pub address: String,
    /// Ports, first one primary.
    pub ports: Vec<u16>,
}

fn default_network() -> String {
    "default".to_owned()
}

/// Fixed-table directory.
#[derive(Clone, Debug)]
pub struct StaticDirectory {
    label: String,
    user: String,
    location: Option<String>,
    services: Vec<StaticService>,
}

impl StaticDirectory {
    /// Creates a directory over `services`.
    #[must_use]
    pub fn new(label: impl Into<String>, user: impl Into<String>, location: Option<String>, services: Vec<StaticService>) -> Self {
        Self {
            label: label.into(),
            user: user.into(),
            location,
            services,
        }
    }

    fn lookup(&self, service: &str, channel: &str) -> NetResult<&StaticService> {
        self.services
            .iter()
            .find(|entry| entry.name == service && entry.network == channel)
            .ok_or_else(|| NetError::PortRegistration(service.to_owned()))
    }
}

impl ServiceDirectory for StaticDirectory {
    fn label(&self) -> &str {
        &self.label
    }

    fn complex_service_name(&self, service: &str) -> String {
        complex_name(self.location.as_deref(), &self.user, service)
    }

    /// Never blocks. Returns `None` if no row matches, and callers retry.
    fn discover_service(&self, service: &str, networks: &NetworkList, _cancel: &Latch) -> Option<ServiceAddress> {
        self.services
            .iter()
            .filter(|entry| entry.name == service)
            .filter_map(|entry| networks.rank(&entry.network).map(|rank| (rank, entry)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, entry)| ServiceAddress {
                address: entry.address.clone(),
                ports: entry.ports.clone(),
                network: entry.network.clone(),
            })
    }

    fn register_service(&self, service: &str, channel: &str, count: usize) -> NetResult<Vec<u16>> {
        let entry = self.lookup(service, channel)?;
        if entry.ports.len() < count {
            return Err(NetError::PortRegistration(service.to_owned()));
        }
        Ok(entry.ports[..count].to_vec())
    }

    /// The table has no spare ports to offer.
    fn request_new_ports(&self, service: &str, _channel: &str, _count: usize) -> NetResult<Vec<u16>> {
        Err(NetError::PortRegistration(service.to_owned()))
    }

    fn confirm_ports(&self, service: &str, channel: &str, ports: &[u16]) -> NetResult<()> {
        let entry = self.lookup(service, channel)?;
        if entry.ports.starts_with(ports) {
            Ok(())
        } else {
            Err(NetError::PortRegistration(service.to_owned()))
        }
    }

    fn release_service(&self, _service: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        let row = |network: &str, address: &str, port| StaticService {
            name: "FRAMES/ann".into(),
            network: network.into(),
            address: address.into(),
            ports: vec![port],
        };
        StaticDirectory::new(
            "render1",
            "ann",
            None,
            vec![row("slow", "10.0.0.1", 5000), row("fast", "10.1.0.1", 5001)],
        )
    }

    #[test]
    fn test_discovery_prefers_earlier_networks() {
        let directory = directory();
        let cancel = Latch::new();
        let found = directory
            .discover_service("FRAMES/ann", &NetworkList::parse("fast/slow"), &cancel)
            .unwrap();
        assert_eq!(found.address, "10.1.0.1");

        let found = directory
            .discover_service("FRAMES/ann", &NetworkList::parse("slow/fast"), &cancel)
            .unwrap();
        assert_eq!(found.address, "10.0.0.1");

        assert!(directory
            .discover_service("FRAMES/ann", &NetworkList::parse("wan"), &cancel)
            .is_none());
    }

    #[test]
    fn test_registration_uses_table_ports() {
        let directory = directory();
        assert_eq!(directory.register_service("FRAMES/ann", "fast", 1).unwrap(), vec![5001]);
        assert!(directory.confirm_ports("FRAMES/ann", "fast", &[5001]).is_ok());
        assert!(directory.confirm_ports("FRAMES/ann", "fast", &[6000]).is_err());
        assert!(directory.register_service("FRAMES/ann", "fast", 2).is_err());
        assert!(directory.request_new_ports("FRAMES/ann", "fast", 1).is_err());
    }
}
