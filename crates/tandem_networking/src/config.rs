//! # Cluster Configuration
//!
//! One TOML file describes a node: who it is, which service it serves or
//! consumes, how it paces frames, and (optionally) a static service table.
//!
//! ```toml
//! [node]
//! label = "render-left"
//! user = "ann"
//!
//! [service]
//! name = "FRAMES"
//! networks = "fast/slow"
//! channel = "fast"
//!
//! [sync]
//! client_mode = "sync"
//! server_mode = "sync_auto"
//!
//! [[directory.services]]
//! name = "FRAMES/ann"
//! network = "fast"
//! address = "10.1.0.1"
//! ports = [5000]
//! ```

use crate::directory::{complex_name, NetworkList, StaticService};
use crate::error::{NetError, NetResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tandem_shared::{
    BackoffSpec, ClientMode, ServerMode, BARRIER_SERVICE_SUFFIX, DEFAULT_DATA_BUFFER_SIZE, DEFAULT_SEND_LIMIT,
};

/// Whole-node configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node identity.
    pub node: NodeConfig,
    /// Service this node serves or consumes.
    pub service: ServiceConfig,
    /// Frame pacing.
    pub sync: SyncConfig,
    /// Polling schedules.
    pub backoff: BackoffConfig,
    /// Service directory.
    pub directory: DirectoryConfig,
}

/// Node identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Label used in logs and thread names.
    pub label: String,
    /// User that scopes service names when there is no location.
    pub user: String,
    /// Location that scopes service names, if any.
    pub location: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            label: "tandem".to_owned(),
            user: "tandem".to_owned(),
            location: None,
        }
    }
}

/// Service naming and networks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base service name, before scoping.
    pub name: String,
    /// Client side: acceptable networks in preference order.
    pub networks: String,
    /// Server side: network to register on.
    pub channel: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "FRAMES".to_owned(),
            networks: tandem_shared::ANY_NETWORK.to_owned(),
            channel: "default".to_owned(),
        }
    }
}

/// Frame pacing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Consumer pacing.
    pub client_mode: ClientMode,
    /// Producer pacing.
    pub server_mode: ServerMode,
    /// First size of receive buffers.
    pub initial_buffer_size: usize,
    /// Back-buffer bytes before producers are throttled.
    pub send_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_mode: ClientMode::Sync,
            server_mode: ServerMode::SyncAuto,
            initial_buffer_size: DEFAULT_DATA_BUFFER_SIZE,
            send_limit: DEFAULT_SEND_LIMIT,
        }
    }
}

/// Polling schedules.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Barrier client reconnect schedule.
    pub barrier_connect: BackoffSpec,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            barrier_connect: BackoffSpec::BARRIER_CONNECT,
        }
    }
}

/// Service directory settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Static table. Empty means "use an in-process directory".
    pub services: Vec<StaticService>,
}

impl ClusterConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(text: &str) -> NetResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NetError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects settings no node could run with.
    pub fn validate(&self) -> NetResult<()> {
        if self.service.name.is_empty() {
            return Err(NetError::Config("service.name is empty".into()));
        }
        if self.service.channel.is_empty() {
            return Err(NetError::Config("service.channel is empty".into()));
        }
        if self.sync.initial_buffer_size == 0 {
            return Err(NetError::Config("sync.initial_buffer_size must be positive".into()));
        }
        let spec = self.backoff.barrier_connect;
        if !(spec.min_ms > 0.0 && spec.max_ms >= spec.min_ms && spec.ratio >= 1.0) {
            return Err(NetError::Config(format!("backoff.barrier_connect is unusable: {spec:?}")));
        }
        if let Some(entry) = self.directory.services.iter().find(|entry| entry.ports.is_empty()) {
            return Err(NetError::Config(format!("directory entry {:?} has no ports", entry.name)));
        }
        Ok(())
    }

    /// Data service name scoped to this node.
    #[must_use]
    pub fn data_service_name(&self) -> String {
        complex_name(self.node.location.as_deref(), &self.node.user, &self.service.name)
    }

    /// Barrier service name scoped to this node.
    #[must_use]
    pub fn barrier_service_name(&self) -> String {
        complex_name(
            self.node.location.as_deref(),
            &self.node.user,
            &format!("{}{}", self.service.name, BARRIER_SERVICE_SUFFIX),
        )
    }

    /// Parsed network preference.
    #[must_use]
    pub fn networks(&self) -> NetworkList {
        NetworkList::parse(&self.service.networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ClusterConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClusterConfig::default());
        assert!(config.networks().is_any());
        assert_eq!(config.sync.send_limit, 300_000);
    }

    #[test]
    fn test_full_document() {
        let config = ClusterConfig::from_toml_str(
            r#"
            [node]
            label = "render-left"
            user = "ann"

            [service]
            name = "SCENE"
            networks = "fast/slow"
            channel = "fast"

            [sync]
            client_mode = "no_sync"
            server_mode = "no_sync_manual"

            [backoff.barrier_connect]
            min_ms = 5.0
            max_ms = 80.0
            ratio = 1.5

            [[directory.services]]
            name = "SCENE/ann"
            network = "fast"
            address = "10.1.0.1"
            ports = [5000]
            "#,
        )
        .unwrap();

        assert_eq!(config.node.label, "render-left");
        assert_eq!(config.sync.client_mode, ClientMode::NoSync);
        assert_eq!(config.sync.server_mode, ServerMode::NoSyncManual);
        assert_eq!(config.sync.initial_buffer_size, DEFAULT_DATA_BUFFER_SIZE);
        assert_eq!(config.backoff.barrier_connect, BackoffSpec::new(5.0, 80.0, 1.5));
        assert_eq!(config.data_service_name(), "SCENE/ann");
        assert_eq!(config.barrier_service_name(), "SCENE_BARRIER/ann");
        assert_eq!(config.directory.services[0].ports, vec![5000]);
    }

    #[test]
    fn test_location_scopes_names() {
        let mut config = ClusterConfig::default();
        config.node.location = Some("cave".into());
        assert_eq!(config.barrier_service_name(), "cave/FRAMES_BARRIER");
    }

    #[test]
    fn test_rejects_unusable_settings() {
        assert!(matches!(
            ClusterConfig::from_toml_str("[service]\nname = \"\""),
            Err(NetError::Config(_))
        ));
        assert!(matches!(
            ClusterConfig::from_toml_str("[backoff.barrier_connect]\nmin_ms = 0.0\nmax_ms = 1.0\nratio = 1.0"),
            Err(NetError::Config(_))
        ));
        assert!(matches!(
            ClusterConfig::from_toml_str("[sync]\nclient_mode = \"sometimes\""),
            Err(NetError::Config(_))
        ));
    }
}
