//! # Record Server
//!
//! Accepts record connections and runs one reader thread per peer.
//!
//! ## Socket Lifecycle
//!
//! ```text
//! accept ──> passive ──activate──> active ──(peer closes / stop)──> gone
//!              │                     │
//!              └── send_to ──────────┴── send_active broadcasts here
//! ```
//!
//! New sockets start passive when the owner asks for it. Passive sockets
//! only receive directed sends; broadcasts go to active sockets.

use crate::directory::ServiceDirectory;
use crate::error::{NetError, NetResult};
use crate::protocol::codec::{read_frame, write_preamble};
use crate::protocol::{Dictionary, Record};
use crate::transport::{SocketId, StatsCounters, TransportStats};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use tandem_shared::LISTEN_RETRIES;

/// Called on a reader thread for every decoded record.
pub type ConsumerFn = Arc<dyn Fn(&Record, SocketId) + Send + Sync>;

/// Called on a reader thread after a peer has been removed.
pub type DisconnectFn = Arc<dyn Fn(SocketId) + Send + Sync>;

struct Peer {
    writer: Mutex<TcpStream>,
    control: TcpStream,
    addr: SocketAddr,
    active: AtomicBool,
}

impl Peer {
    fn send(&self, frame: &[u8]) -> NetResult<()> {
        let mut writer = self.writer.lock();
        writer.write_all(frame)?;
        Ok(())
    }

    fn shutdown(&self) {
        // Already-closed sockets report NotConnected; nothing to do.
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

type PeerMap = Arc<Mutex<BTreeMap<SocketId, Arc<Peer>>>>;

/// Multi-peer record server.
///
/// # Example
///
/// ```rust,ignore
/// let server = RecordServer::new("barrier", dictionary, 200)
///     .with_consumer(Arc::new(|record, socket| println!("{socket}: {}", record.id())))
///     .with_atomic_receive(false);
/// let port = server.begin_listening(0)?;
/// while running {
///     server.accept_connection(false)?;
/// }
/// ```
pub struct RecordServer {
    label: String,
    dictionary: Dictionary,
    interface: String,
    buffer_size: usize,
    small_packet_optimize: bool,
    atomic_receive: bool,
    consumer: Option<ConsumerFn>,
    disconnect: Option<DisconnectFn>,
    listener: Mutex<Option<TcpListener>>,
    peers: PeerMap,
    next_id: AtomicU32,
    receive_lock: Arc<Mutex<()>>,
    stopped: AtomicBool,
    stats: Arc<StatsCounters>,
}

impl RecordServer {
    /// Creates a server speaking `dictionary`. Reader buffers start at
    /// `buffer_size` bytes and grow as needed.
    #[must_use]
    pub fn new(label: impl Into<String>, dictionary: Dictionary, buffer_size: usize) -> Self {
        Self {
            label: label.into(),
            dictionary,
            interface: "0.0.0.0".to_owned(),
            buffer_size,
            small_packet_optimize: true,
            atomic_receive: true,
            consumer: None,
            disconnect: None,
            listener: Mutex::new(None),
            peers: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU32::new(0),
            receive_lock: Arc::new(Mutex::new(())),
            stopped: AtomicBool::new(false),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Sets the record callback.
    #[must_use]
    pub fn with_consumer(mut self, consumer: ConsumerFn) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Sets the disconnect callback.
    #[must_use]
    pub fn with_disconnect(mut self, disconnect: DisconnectFn) -> Self {
        self.disconnect = Some(disconnect);
        self
    }

    /// When true (the default), consumer calls from different peers are
    /// serialized.
    #[must_use]
    pub fn with_atomic_receive(mut self, atomic: bool) -> Self {
        self.atomic_receive = atomic;
        self
    }

    /// Disables Nagle on accepted sockets when true (the default).
    #[must_use]
    pub fn with_small_packet_optimize(mut self, enabled: bool) -> Self {
        self.small_packet_optimize = enabled;
        self
    }

    /// Interface to bind. Defaults to all interfaces.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Dictionary sent to every peer.
    #[must_use]
    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Binds a non-blocking listener. Port 0 picks an ephemeral port.
    ///
    /// Returns the bound port.
    pub fn begin_listening(&self, port: u16) -> NetResult<u16> {
        let listener = TcpListener::bind((self.interface.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?.port();
        *self.listener.lock() = Some(listener);
        self.stopped.store(false, Ordering::Release);
        tracing::info!("{}: listening on {}:{}", self.label, self.interface, bound);
        Ok(bound)
    }

    /// Registers `service` with the directory and listens on the port it
    /// hands out, asking for new ports up to ten times if binding fails.
    ///
    /// Returns the confirmed port.
    pub fn listen_brokered(&self, directory: &dyn ServiceDirectory, service: &str, channel: &str) -> NetResult<u16> {
        let mut ports = directory.register_service(service, channel, 1)?;
        for attempt in 1..=LISTEN_RETRIES {
            let port = *ports
                .first()
                .ok_or_else(|| NetError::PortRegistration(service.to_owned()))?;
            match self.begin_listening(port) {
                Ok(bound) => {
                    directory.confirm_ports(service, channel, &[bound])?;
                    return Ok(bound);
                }
                Err(e) => {
                    tracing::warn!("{}: cannot listen on port {} (attempt {}): {}", self.label, port, attempt, e);
                    ports = directory.request_new_ports(service, channel, 1)?;
                }
            }
        }
        Err(NetError::PortRegistration(service.to_owned()))
    }

    /// Accepts at most one pending connection without blocking.
    ///
    /// Returns `Ok(None)` when nobody is waiting or the new peer failed the
    /// preamble. Errors are fatal to the listener.
    pub fn accept_connection(&self, active: bool) -> NetResult<Option<SocketId>> {
        let accepted = {
            let listener = self.listener.lock();
            let Some(listener) = listener.as_ref() else {
                return Err(NetError::NotInitialized("listener"));
            };
            match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let (stream, addr) = accepted;
        match self.adopt(stream, addr, active) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                tracing::warn!("{}: dropped connection from {}: {}", self.label, addr, e);
                Ok(None)
            }
        }
    }

    fn adopt(&self, stream: TcpStream, addr: SocketAddr, active: bool) -> NetResult<SocketId> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(self.small_packet_optimize)?;
        let id = SocketId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut reader = stream.try_clone()?;
        let peer = Arc::new(Peer {
            control: stream.try_clone()?,
            writer: Mutex::new(stream),
            addr,
            active: AtomicBool::new(active),
        });

        // The peer must be visible before it learns its id, so that a
        // handshake naming it cannot race ahead of the map insert.
        self.peers.lock().insert(id, Arc::clone(&peer));
        let preamble = {
            let mut writer = peer.writer.lock();
            write_preamble(&mut *writer, id, &self.dictionary)
        };
        if let Err(e) = preamble {
            self.peers.lock().remove(&id);
            peer.shutdown();
            return Err(e);
        }

        let task = ReaderTask {
            label: self.label.clone(),
            id,
            dictionary: self.dictionary.clone(),
            buffer_size: self.buffer_size,
            consumer: self.consumer.clone(),
            disconnect: self.disconnect.clone(),
            receive_lock: self.atomic_receive.then(|| Arc::clone(&self.receive_lock)),
            peers: Arc::clone(&self.peers),
            stats: Arc::clone(&self.stats),
        };
        let spawned = thread::Builder::new()
            .name(format!("{}-rx-{}", self.label, id.0))
            .spawn(move || task.run(&mut reader));
        if let Err(e) = spawned {
            self.peers.lock().remove(&id);
            peer.shutdown();
            return Err(e.into());
        }
        tracing::info!("{}: accepted {} from {} ({})", self.label, id, addr, if active { "active" } else { "passive" });
        Ok(id)
    }

    fn peer(&self, id: SocketId) -> NetResult<Arc<Peer>> {
        self.peers.lock().get(&id).cloned().ok_or(NetError::UnknownSocket(id))
    }

    fn snapshot(&self, active_only: bool) -> Vec<(SocketId, Arc<Peer>)> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, peer)| !active_only || peer.active.load(Ordering::Acquire))
            .map(|(id, peer)| (*id, Arc::clone(peer)))
            .collect()
    }

    /// Sends a record to one socket.
    pub fn send_to(&self, record: &Record, id: SocketId) -> NetResult<()> {
        let mut frame = Vec::with_capacity(record.encoded_len());
        record.encode(&mut frame);
        self.send_raw_to(&frame, id)
    }

    /// Sends an encoded frame to one socket.
    pub fn send_raw_to(&self, frame: &[u8], id: SocketId) -> NetResult<()> {
        let peer = self.peer(id)?;
        let result = peer.send(frame);
        self.stats.record_send(&result, frame.len());
        if result.is_err() {
            peer.shutdown();
        }
        result
    }

    /// Sends an encoded frame to each listed socket.
    ///
    /// Returns false if any send failed. Failed peers are shut down so
    /// their reader threads report the disconnect.
    pub fn send_raw_to_many(&self, frame: &[u8], ids: &[SocketId]) -> bool {
        let mut ok = true;
        for id in ids {
            if let Err(e) = self.send_raw_to(frame, *id) {
                tracing::debug!("{}: send to {} failed: {}", self.label, id, e);
                ok = false;
            }
        }
        ok
    }

    /// Broadcasts a record to every active socket.
    pub fn send_active(&self, record: &Record) -> bool {
        let mut frame = Vec::with_capacity(record.encoded_len());
        record.encode(&mut frame);
        self.send_raw_active(&frame)
    }

    /// Broadcasts an encoded frame to every active socket.
    pub fn send_raw_active(&self, frame: &[u8]) -> bool {
        let mut ok = true;
        for (id, peer) in self.snapshot(true) {
            let result = peer.send(frame);
            self.stats.record_send(&result, frame.len());
            if let Err(e) = result {
                tracing::debug!("{}: broadcast to {} failed: {}", self.label, id, e);
                peer.shutdown();
                ok = false;
            }
        }
        ok
    }

    /// Promotes a passive socket. Returns false if it is unknown.
    pub fn activate_passive_socket(&self, id: SocketId) -> bool {
        match self.peers.lock().get(&id) {
            Some(peer) => {
                peer.active.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Ids of active sockets.
    #[must_use]
    pub fn active_sockets(&self) -> Vec<SocketId> {
        self.snapshot(true).into_iter().map(|(id, _)| id).collect()
    }

    /// True while `id` is connected.
    #[must_use]
    pub fn has_socket(&self, id: SocketId) -> bool {
        self.peers.lock().contains_key(&id)
    }

    /// Remote address of a socket.
    #[must_use]
    pub fn peer_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.peers.lock().get(&id).map(|peer| peer.addr)
    }

    /// Connected sockets, passive and active.
    #[must_use]
    pub fn number_connected(&self) -> usize {
        self.peers.lock().len()
    }

    /// Connected active sockets.
    #[must_use]
    pub fn number_connected_active(&self) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|peer| peer.active.load(Ordering::Acquire))
            .count()
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    /// Closes the listener and shuts every peer down. Reader threads then
    /// exit and fire the disconnect callback.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.lock().take();
        for (_, peer) in self.snapshot(false) {
            peer.shutdown();
        }
        tracing::info!("{}: stopped", self.label);
    }
}

impl Drop for RecordServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything a reader thread needs, detached from the server.
struct ReaderTask {
    label: String,
    id: SocketId,
    dictionary: Dictionary,
    buffer_size: usize,
    consumer: Option<ConsumerFn>,
    disconnect: Option<DisconnectFn>,
    receive_lock: Option<Arc<Mutex<()>>>,
    peers: PeerMap,
    stats: Arc<StatsCounters>,
}

impl ReaderTask {
    fn run(self, stream: &mut TcpStream) {
        let mut buffer = Vec::with_capacity(self.buffer_size);
        loop {
            if let Err(e) = read_frame(stream, &mut buffer) {
                if !e.is_disconnect() {
                    tracing::warn!("{}: bad frame from {}: {}", self.label, self.id, e);
                }
                break;
            }
            self.stats.record_receive();
            let record = match Record::decode(&buffer, &self.dictionary) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("{}: undecodable record from {}: {}", self.label, self.id, e);
                    continue;
                }
            };
            if let Some(consumer) = &self.consumer {
                let _serial = self.receive_lock.as_ref().map(|lock| lock.lock());
                consumer(&record, self.id);
            }
        }

        let removed = self.peers.lock().remove(&self.id);
        if let Some(peer) = removed {
            peer.shutdown();
        }
        tracing::info!("{}: {} disconnected", self.label, self.id);
        if let Some(disconnect) = &self.disconnect {
            disconnect(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldKind, RecordTemplate};
    use crate::transport::{RecordLink, RecordStream};
    use crossbeam_channel::{unbounded, RecvTimeoutError};
    use std::time::{Duration, Instant};

    fn dictionary() -> Dictionary {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("ping").with_field("n", FieldKind::Int));
        dictionary
    }

    fn accept_one(server: &RecordServer, active: bool) -> SocketId {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(id) = server.accept_connection(active).unwrap() {
                return id;
            }
            assert!(Instant::now() < deadline, "no connection arrived");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Dials from a helper thread, since the dial blocks on the preamble
    /// that accept sends.
    fn connect(server: &RecordServer, port: u16, active: bool) -> (RecordStream, SocketId) {
        let dialer = thread::spawn(move || RecordStream::dial("127.0.0.1", port, true).unwrap());
        let id = accept_one(server, active);
        (dialer.join().unwrap(), id)
    }

    #[test]
    fn test_records_reach_consumer_and_disconnect_fires() {
        let (record_tx, record_rx) = unbounded();
        let (gone_tx, gone_rx) = unbounded();
        let server = RecordServer::new("test", dictionary(), 64)
            .with_interface("127.0.0.1")
            .with_consumer(Arc::new(move |record: &Record, id| {
                record_tx.send((id, record.data_int(0))).unwrap();
            }))
            .with_disconnect(Arc::new(move |id| gone_tx.send(id).unwrap()));
        let port = server.begin_listening(0).unwrap();

        let (client, id) = connect(&server, port, false);
        assert_eq!(client.remote_socket_id(), id);
        assert_eq!(server.number_connected(), 1);
        assert_eq!(server.number_connected_active(), 0);

        let mut ping = Record::from_dictionary(client.dictionary(), "ping").unwrap();
        ping.set_ints(0, &[5]).unwrap();
        client.send(&ping).unwrap();
        assert_eq!(record_rx.recv_timeout(Duration::from_secs(5)).unwrap(), (id, Some(5)));

        client.close();
        assert_eq!(gone_rx.recv_timeout(Duration::from_secs(5)).unwrap(), id);
        assert_eq!(server.number_connected(), 0);
    }

    #[test]
    fn test_broadcast_reaches_only_active_sockets() {
        let server = RecordServer::new("test", dictionary(), 64).with_interface("127.0.0.1");
        let port = server.begin_listening(0).unwrap();

        let (passive, passive_id) = connect(&server, port, false);
        let (active, _) = connect(&server, port, true);

        let mut ping = Record::from_dictionary(server.dictionary(), "ping").unwrap();
        ping.set_ints(0, &[1]).unwrap();
        assert!(server.send_active(&ping));

        let mut buffer = Vec::new();
        active.receive(&mut buffer).unwrap();
        assert_eq!(Record::decode(&buffer, active.dictionary()).unwrap().data_int(0), Some(1));

        assert!(server.activate_passive_socket(passive_id));
        ping.set_ints(0, &[2]).unwrap();
        assert!(server.send_active(&ping));
        passive.receive(&mut buffer).unwrap();
        assert_eq!(Record::decode(&buffer, passive.dictionary()).unwrap().data_int(0), Some(2));
        assert_eq!(server.active_sockets().len(), 2);
    }

    #[test]
    fn test_stop_unblocks_readers() {
        let (gone_tx, gone_rx) = unbounded();
        let server = RecordServer::new("test", dictionary(), 64)
            .with_interface("127.0.0.1")
            .with_disconnect(Arc::new(move |id| gone_tx.send(id).unwrap()));
        let port = server.begin_listening(0).unwrap();
        let (client, id) = connect(&server, port, true);

        server.stop();
        assert_eq!(gone_rx.recv_timeout(Duration::from_secs(5)).unwrap(), id);
        let mut buffer = Vec::new();
        assert!(client.receive(&mut buffer).is_err());
        assert!(matches!(server.accept_connection(true), Err(NetError::NotInitialized(_))));
        assert_eq!(gone_rx.recv_timeout(Duration::from_millis(50)), Err(RecvTimeoutError::Timeout));
    }

    #[test]
    fn test_send_to_unknown_socket() {
        let server = RecordServer::new("test", dictionary(), 64);
        assert!(matches!(server.send_raw_to(&[0; 8], SocketId(9)), Err(NetError::UnknownSocket(_))));
        assert!(!server.activate_passive_socket(SocketId(9)));
    }
}
