//! # Node Assembly
//!
//! Turns a [`ClusterConfig`] into running components. Both binaries go
//! through here so a master and its render nodes agree on names, modes and
//! networks as long as they read the same file.

use std::sync::Arc;
use tandem_networking::{
    ClusterConfig, Dictionary, LocalDirectory, NetResult, PassThrough, ServiceDirectory, StaticDirectory,
    SyncConsumer, SyncDataClient, SyncDataServer, TcpConnector,
};

/// The directory a node registers with and discovers through.
///
/// An empty `[[directory.services]]` table means a single-process cluster
/// sharing one in-process directory; otherwise the static table is used.
#[must_use]
pub fn directory(config: &ClusterConfig) -> Arc<dyn ServiceDirectory> {
    let node = &config.node;
    if config.directory.services.is_empty() {
        let mut local = LocalDirectory::loopback(node.label.clone()).with_user(node.user.clone());
        if let Some(location) = &node.location {
            local = local.with_location(location.clone());
        }
        Arc::new(local)
    } else {
        Arc::new(StaticDirectory::new(
            node.label.clone(),
            node.user.clone(),
            node.location.clone(),
            config.directory.services.clone(),
        ))
    }
}

/// Starts a sync data server serving `dictionary` records.
pub fn master(config: &ClusterConfig, dictionary: Dictionary, directory: Arc<dyn ServiceDirectory>) -> NetResult<SyncDataServer> {
    let server = SyncDataServer::new(config.node.label.clone(), dictionary, config.sync.server_mode, Box::new(PassThrough));
    server.set_service_name(config.service.name.clone());
    server.set_channel(config.service.channel.clone());
    server.set_send_limit(config.sync.send_limit);
    let port = server.init(directory)?;
    server.start()?;
    tracing::info!(
        label = %config.node.label,
        service = %config.data_service_name(),
        port,
        mode = ?config.sync.server_mode,
        "master serving frames"
    );
    Ok(server)
}

/// Starts a sync data client handing buffers to `consumer`.
pub fn render(
    config: &ClusterConfig,
    consumer: Box<dyn SyncConsumer>,
    directory: Arc<dyn ServiceDirectory>,
) -> NetResult<SyncDataClient> {
    let client = SyncDataClient::with_buffer_size(
        config.node.label.clone(),
        config.sync.client_mode,
        Arc::new(TcpConnector::new(true)),
        consumer,
        config.sync.initial_buffer_size,
    );
    client.set_service_name(config.service.name.clone());
    client.set_networks(config.networks());
    client.set_connect_backoff(config.backoff.barrier_connect);
    client.init(directory)?;
    client.start()?;
    tracing::info!(
        label = %config.node.label,
        service = %config.data_service_name(),
        networks = %config.networks(),
        mode = ?config.sync.client_mode,
        "render node started"
    );
    Ok(client)
}
