//! In-process service directory.
//!
//! Every node of a single-host cluster (and every test) shares one of
//! these through an `Arc`. Discovery blocks on a condition variable until
//! the service is confirmed or the caller cancels.

use super::{complex_name, NetworkList, ServiceAddress, ServiceDirectory};
use crate::error::{NetError, NetResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Duration;
use tandem_core::Latch;

/// How often a blocked discovery re-checks its cancel latch.
const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct Registration {
    channel: String,
    ports: Vec<u16>,
    confirmed: bool,
}

#[derive(Debug)]
struct DirectoryState {
    services: HashMap<String, Registration>,
    next_port: u16,
}

/// Directory living in this process.
#[derive(Debug)]
pub struct LocalDirectory {
    label: String,
    host: String,
    user: String,
    location: Option<String>,
    base_port: u16,
    state: Mutex<DirectoryState>,
    changed: Condvar,
}

impl LocalDirectory {
    /// Creates a directory handing out ports from `base_port` upward on
    /// `host`. A base port of 0 hands out ephemeral ports; the bound port
    /// is learned at confirmation.
    #[must_use]
    pub fn new(label: impl Into<String>, host: impl Into<String>, base_port: u16) -> Self {
        Self {
            label: label.into(),
            host: host.into(),
            user: "tandem".to_owned(),
            location: None,
            base_port,
            state: Mutex::new(DirectoryState {
                services: HashMap::new(),
                next_port: base_port,
            }),
            changed: Condvar::new(),
        }
    }

    /// Loopback directory with ephemeral ports.
    #[must_use]
    pub fn loopback(label: impl Into<String>) -> Self {
        Self::new(label, "127.0.0.1", 0)
    }

    /// Sets the user used when scoping service names.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the location used when scoping service names.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// True if `service` has been confirmed.
    #[must_use]
    pub fn is_published(&self, service: &str) -> bool {
        self.state
            .lock()
            .services
            .get(service)
            .is_some_and(|registration| registration.confirmed)
    }

    fn allocate(&self, state: &mut DirectoryState, count: usize) -> NetResult<Vec<u16>> {
        if self.base_port == 0 {
            return Ok(vec![0; count]);
        }
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            let port = state.next_port;
            state.next_port = port
                .checked_add(1)
                .ok_or_else(|| NetError::PortRegistration("port range exhausted".into()))?;
            ports.push(port);
        }
        Ok(ports)
    }
}

impl ServiceDirectory for LocalDirectory {
    fn label(&self) -> &str {
        &self.label
    }

    fn complex_service_name(&self, service: &str) -> String {
        complex_name(self.location.as_deref(), &self.user, service)
    }

    fn discover_service(&self, service: &str, networks: &NetworkList, cancel: &Latch) -> Option<ServiceAddress> {
        let mut state = self.state.lock();
        loop {
            if let Some(registration) = state.services.get(service) {
                if registration.confirmed && networks.accepts(&registration.channel) {
                    return Some(ServiceAddress {
                        address: self.host.clone(),
                        ports: registration.ports.clone(),
                        network: registration.channel.clone(),
                    });
                }
            }
            if cancel.is_tripped() {
                return None;
            }
            self.changed.wait_for(&mut state, CANCEL_POLL);
        }
    }

    fn register_service(&self, service: &str, channel: &str, count: usize) -> NetResult<Vec<u16>> {
        let mut state = self.state.lock();
        if state.services.get(service).is_some_and(|registration| registration.confirmed) {
            return Err(NetError::PortRegistration(service.to_owned()));
        }
        let ports = self.allocate(&mut state, count)?;
        state.services.insert(
            service.to_owned(),
            Registration {
                channel: channel.to_owned(),
                ports: ports.clone(),
                confirmed: false,
            },
        );
        tracing::debug!("{}: reserved {:?} for {}", self.label, ports, service);
        Ok(ports)
    }

    fn request_new_ports(&self, service: &str, channel: &str, count: usize) -> NetResult<Vec<u16>> {
        let mut state = self.state.lock();
        let ports = self.allocate(&mut state, count)?;
        match state.services.get_mut(service) {
            Some(registration) if !registration.confirmed && registration.channel == channel => {
                registration.ports = ports.clone();
                Ok(ports)
            }
            _ => Err(NetError::PortRegistration(service.to_owned())),
        }
    }

    fn confirm_ports(&self, service: &str, channel: &str, ports: &[u16]) -> NetResult<()> {
        let mut state = self.state.lock();
        match state.services.get_mut(service) {
            Some(registration) if registration.channel == channel => {
                registration.ports = ports.to_vec();
                registration.confirmed = true;
            }
            _ => return Err(NetError::PortRegistration(service.to_owned())),
        }
        drop(state);
        tracing::info!("{}: published {} on {:?}", self.label, service, ports);
        self.changed.notify_all();
        Ok(())
    }

    fn release_service(&self, service: &str) {
        if self.state.lock().services.remove(service).is_some() {
            tracing::info!("{}: withdrew {}", self.label, service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_discovery_waits_for_confirmation() {
        let directory = Arc::new(LocalDirectory::new("test", "127.0.0.1", 5100));
        let ports = directory.register_service("FRAMES", "lan", 1).unwrap();
        assert_eq!(ports, vec![5100]);

        let finder = {
            let directory = Arc::clone(&directory);
            thread::spawn(move || directory.discover_service("FRAMES", &NetworkList::any(), &Latch::new()))
        };
        thread::sleep(Duration::from_millis(30));
        directory.confirm_ports("FRAMES", "lan", &[5101]).unwrap();

        let found = finder.join().unwrap().unwrap();
        assert_eq!(found.ports, vec![5101]);
        assert_eq!(found.network, "lan");
    }

    #[test]
    fn test_discovery_respects_networks_and_cancel() {
        let directory = LocalDirectory::loopback("test");
        directory.register_service("FRAMES", "lan", 1).unwrap();
        directory.confirm_ports("FRAMES", "lan", &[6000]).unwrap();

        let cancel = Latch::new();
        cancel.trip();
        assert!(directory
            .discover_service("FRAMES", &NetworkList::parse("wan"), &cancel)
            .is_none());
        assert!(directory
            .discover_service("FRAMES", &NetworkList::parse("wan/lan"), &cancel)
            .is_some());
    }

    #[test]
    fn test_confirmed_service_cannot_be_registered_twice() {
        let directory = LocalDirectory::loopback("test");
        directory.register_service("FRAMES", "lan", 1).unwrap();
        directory.confirm_ports("FRAMES", "lan", &[6000]).unwrap();
        assert!(directory.register_service("FRAMES", "lan", 1).is_err());

        directory.release_service("FRAMES");
        assert!(!directory.is_published("FRAMES"));
        assert!(directory.register_service("FRAMES", "lan", 1).is_ok());
    }

    #[test]
    fn test_new_ports_replace_reservation() {
        let directory = LocalDirectory::new("test", "127.0.0.1", 7000);
        directory.register_service("FRAMES", "lan", 1).unwrap();
        assert_eq!(directory.request_new_ports("FRAMES", "lan", 1).unwrap(), vec![7001]);
        assert!(directory.request_new_ports("OTHER", "lan", 1).is_err());
    }

    #[test]
    fn test_scoped_names() {
        let directory = LocalDirectory::loopback("test").with_user("ann");
        assert_eq!(directory.complex_service_name("FRAMES"), "FRAMES/ann");
        let directory = directory.with_location("cave");
        assert_eq!(directory.complex_service_name("FRAMES"), "cave/FRAMES");
    }
}
