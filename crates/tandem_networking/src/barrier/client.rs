//! # Barrier Client
//!
//! Joins one barrier server's release group and blocks the caller in
//! [`BarrierClient::sync`] until the group is released.
//!
//! ## Threads
//!
//! ```text
//! connection loop: discover ──> dial ──> build language ──> idle while connected
//! data loop:       receive ──> handshake?     wake request_activation
//!                          ──> server tuning? store send size, raise release
//!                          ──> error?         disconnected, raise release
//! caller:          request_activation / sync / stop
//! ```
//!
//! ## Shutdown
//!
//! `stop` trips the exit latch while holding the activation lock and the
//! send lock, so exactly one tuning record goes out after exit, whether
//! `sync` or `stop` sends it.

use super::language::{BarrierLanguage, BarrierRecord};
use crate::directory::{NetworkList, ServiceDirectory};
use crate::error::{NetError, NetResult};
use crate::protocol::codec::peek_id;
use crate::protocol::Record;
use crate::transport::{Connector, RecordLink, SocketId};
use crate::worker;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tandem_core::{Latch, Signal, WorkerFlag};
use tandem_shared::{BackoffSpec, ClientTuning, BARRIER_BUFFER_SIZE};

struct Settings {
    directory: Option<Arc<dyn ServiceDirectory>>,
    service_name: String,
    networks: NetworkList,
    connect_backoff: BackoffSpec,
}

struct SendState {
    final_sync_sent: bool,
}

struct Inner {
    label: String,
    connector: Arc<dyn Connector>,
    settings: RwLock<Settings>,
    link: RwLock<Option<Arc<dyn RecordLink>>>,
    language: RwLock<Option<BarrierLanguage>>,
    connected: AtomicBool,
    activated: AtomicBool,
    /// Round 2 of the handshake has arrived.
    activation: Mutex<bool>,
    activation_cv: Condvar,
    send: Mutex<SendState>,
    tuning: Mutex<ClientTuning>,
    bonded: AtomicU32,
    server_send_size: AtomicI32,
    release: Signal,
    exit: Arc<Latch>,
    started: AtomicBool,
    connection_flag: WorkerFlag,
    data_flag: WorkerFlag,
}

/// Client end of a frame barrier.
///
/// # Example
///
/// ```rust,ignore
/// let barrier = BarrierClient::new("render1", Arc::new(TcpConnector::new(true)));
/// barrier.init(directory);
/// barrier.set_service_name("FRAMES_BARRIER/ann");
/// barrier.start()?;
/// loop {
///     if !barrier.check_activation() {
///         barrier.request_activation();
///     }
///     draw();
///     barrier.sync();
/// }
/// ```
pub struct BarrierClient {
    inner: Arc<Inner>,
}

impl BarrierClient {
    /// Creates a stopped client that dials through `connector`.
    #[must_use]
    pub fn new(label: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                connector,
                settings: RwLock::new(Settings {
                    directory: None,
                    service_name: String::new(),
                    networks: NetworkList::any(),
                    connect_backoff: BackoffSpec::BARRIER_CONNECT,
                }),
                link: RwLock::new(None),
                language: RwLock::new(None),
                connected: AtomicBool::new(false),
                activated: AtomicBool::new(false),
                activation: Mutex::new(false),
                activation_cv: Condvar::new(),
                send: Mutex::new(SendState { final_sync_sent: false }),
                tuning: Mutex::new(ClientTuning::default()),
                bonded: AtomicU32::new(SocketId::NULL.0),
                server_send_size: AtomicI32::new(0),
                release: Signal::new(),
                exit: Arc::new(Latch::new()),
                started: AtomicBool::new(false),
                connection_flag: WorkerFlag::new(),
                data_flag: WorkerFlag::new(),
            }),
        }
    }

    /// Supplies the directory used to find the barrier server.
    pub fn init(&self, directory: Arc<dyn ServiceDirectory>) {
        self.inner.settings.write().directory = Some(directory);
    }

    /// Full (scoped) name of the barrier service.
    pub fn set_service_name(&self, service: impl Into<String>) {
        self.inner.settings.write().service_name = service.into();
    }

    /// Networks to look for the service on, most preferred first.
    pub fn set_networks(&self, networks: NetworkList) {
        self.inner.settings.write().networks = networks;
    }

    /// Overrides the reconnect schedule. Takes effect at `start`.
    pub fn set_connect_backoff(&self, spec: BackoffSpec) {
        self.inner.settings.write().connect_backoff = spec;
    }

    /// Launches the connection and data loops.
    pub fn start(&self) -> NetResult<()> {
        let inner = &self.inner;
        if inner.settings.read().directory.is_none() {
            tracing::error!(label = %inner.label, "barrier client started before init");
            return Err(NetError::NotInitialized("barrier client directory"));
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            tracing::error!(label = %inner.label, "barrier client started twice");
            return Err(NetError::AlreadyStarted("barrier client"));
        }

        let connection = Arc::clone(inner);
        worker::spawn(format!("{}-barrier-connect", inner.label), &inner.connection_flag, move || {
            connection.connection_loop();
        })?;
        let data = Arc::clone(inner);
        worker::spawn(format!("{}-barrier-data", inner.label), &inner.data_flag, move || data.data_loop())?;
        tracing::info!(label = %inner.label, "barrier client started");
        Ok(())
    }

    /// True while a barrier server connection is up.
    #[inline]
    #[must_use]
    pub fn check_connection(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// True once this connection has joined the release group.
    #[inline]
    #[must_use]
    pub fn check_activation(&self) -> bool {
        self.inner.activated.load(Ordering::Acquire)
    }

    /// Names the companion data socket promoted alongside this one.
    pub fn set_bonded_socket_id(&self, id: SocketId) {
        self.inner.bonded.store(id.0, Ordering::Release);
    }

    /// Telemetry carried by the next barrier arrival.
    pub fn set_tuning_data(&self, tuning: ClientTuning) {
        *self.inner.tuning.lock() = tuning;
    }

    /// Send size from the most recent release.
    #[must_use]
    pub fn server_send_size(&self) -> i32 {
        self.inner.server_send_size.load(Ordering::Acquire)
    }

    /// The latch `stop` trips.
    #[must_use]
    pub fn exit_handle(&self) -> Arc<Latch> {
        Arc::clone(&self.inner.exit)
    }

    /// Runs this side of the activation handshake.
    ///
    /// Sends the bonded socket id, waits for the server's probe, then
    /// confirms. Returns false if not connected or if the connection
    /// drops part way. After a `stop` it returns true without confirming.
    pub fn request_activation(&self) -> bool {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::Acquire) {
            return false;
        }
        let (Some(link), Some(language)) = (inner.current_link(), inner.current_language()) else {
            return false;
        };

        *inner.activation.lock() = false;
        let bonded = SocketId(inner.bonded.load(Ordering::Acquire));
        let sent = {
            let _send = inner.send.lock();
            link.send(&language.handshake_record(bonded))
        };
        if let Err(e) = sent {
            tracing::error!(label = %inner.label, "activation request failed: {}", e);
            return false;
        }

        {
            let mut responded = inner.activation.lock();
            while !*responded && !inner.exit.is_tripped() && inner.connected.load(Ordering::Acquire) {
                inner.activation_cv.wait(&mut responded);
            }
        }
        if inner.exit.is_tripped() {
            // Report activated so the caller's activation poll ends.
            inner.activated.store(true, Ordering::Release);
            inner.release.reset();
            return true;
        }
        if !inner.connected.load(Ordering::Acquire) {
            tracing::warn!(label = %inner.label, "connection lost during activation");
            return false;
        }

        let confirmed = {
            let _send = inner.send.lock();
            link.send(&language.response_record())
        };
        if let Err(e) = confirmed {
            tracing::warn!(label = %inner.label, "activation confirmation failed: {}", e);
        }
        inner.activated.store(true, Ordering::Release);
        // A release raised by a disconnect while we were outside sync()
        // must not satisfy the first sync of the new connection.
        inner.release.reset();
        tracing::info!(label = %inner.label, "activated with bonded socket {}", bonded);
        true
    }

    /// Reports arrival at the barrier and blocks until released.
    ///
    /// Returns true without blocking when stopped, disconnected or not
    /// yet activated. Returns false if the arrival could not be sent.
    pub fn sync(&self) -> bool {
        let inner = &self.inner;
        if inner.exit.is_tripped() || !inner.connected.load(Ordering::Acquire) || !inner.activated.load(Ordering::Acquire) {
            return true;
        }
        let (Some(link), Some(language)) = (inner.current_link(), inner.current_language()) else {
            return true;
        };

        let sent = {
            let mut send = inner.send.lock();
            if send.final_sync_sent {
                false
            } else {
                let record = language.client_tuning_record(*inner.tuning.lock());
                let ok = link.send(&record).is_ok();
                // Exit may have tripped since the check above. Whatever
                // happened, this was the last arrival after exit.
                if inner.exit.is_tripped() {
                    send.final_sync_sent = true;
                }
                ok
            }
        };
        if !sent {
            if inner.exit.is_tripped() {
                tracing::debug!(label = %inner.label, "sync lost the final arrival to stop");
            } else {
                tracing::error!(label = %inner.label, "sync failed");
            }
            return false;
        }
        inner.release.wait();
        true
    }

    /// Stops both loops and releases any blocked caller.
    pub fn stop(&self) {
        let inner = &self.inner;
        {
            let mut responded = inner.activation.lock();
            {
                let _send = inner.send.lock();
                inner.exit.trip();
            }
            *responded = true;
            inner.activation_cv.notify_all();
        }

        {
            let mut send = inner.send.lock();
            if !send.final_sync_sent {
                if let (Some(link), Some(language)) = (inner.current_link(), inner.current_language()) {
                    // Pushes the server through a round it may be waiting on.
                    let record = language.client_tuning_record(*inner.tuning.lock());
                    if let Err(e) = link.send(&record) {
                        tracing::debug!(label = %inner.label, "final arrival not delivered: {}", e);
                    }
                }
                send.final_sync_sent = true;
            }
        }
        inner.release.send();
        inner.close_link();

        worker::wait_stopped(&[&inner.connection_flag, &inner.data_flag], BackoffSpec::BARRIER_STOP);
        tracing::info!(label = %inner.label, "barrier client stopped");
    }
}

impl Drop for BarrierClient {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.exit.trip();
        {
            let mut responded = inner.activation.lock();
            *responded = true;
            inner.activation_cv.notify_all();
        }
        inner.release.send();
        inner.close_link();
    }
}

impl Inner {
    fn current_link(&self) -> Option<Arc<dyn RecordLink>> {
        self.link.read().clone()
    }

    fn current_language(&self) -> Option<BarrierLanguage> {
        self.language.read().clone()
    }

    fn close_link(&self) {
        if let Some(link) = self.link.read().as_ref() {
            link.close();
        }
    }

    fn connection_loop(&self) {
        let running = self.connection_flag.adopt();
        let (directory, service, networks, spec) = {
            let settings = self.settings.read();
            let Some(directory) = settings.directory.clone() else {
                return;
            };
            (
                directory,
                settings.service_name.clone(),
                settings.networks.clone(),
                settings.connect_backoff,
            )
        };
        let mut backoff = worker::backoff(spec);

        while !self.exit.is_tripped() {
            backoff.sleep();
            if self.connected.load(Ordering::Acquire) {
                continue;
            }
            backoff.reset();
            if let Some(stale) = self.link.write().take() {
                stale.close();
            }

            // Discovery may block indefinitely; stop must not wait for it.
            running.park();
            let found = directory.discover_service(&service, &networks, &self.exit);
            running.resume();
            if self.exit.is_tripped() {
                break;
            }

            let Some(address) = found else {
                tracing::warn!(label = %self.label, "no service {} on networks {}", service, networks);
                continue;
            };
            // Nor for a dial stalled on a peer that never answers.
            running.park();
            let dialed = self.connector.connect(&address);
            running.resume();
            if self.exit.is_tripped() {
                if let Ok(link) = dialed {
                    link.close();
                }
                break;
            }
            let link = match dialed {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!(
                        label = %self.label,
                        "cannot connect to {} at {}:{:?}: {}",
                        service, address.address, address.ports, e
                    );
                    continue;
                }
            };
            let language = match BarrierLanguage::from_dictionary(link.dictionary()) {
                Ok(language) => language,
                Err(e) => {
                    tracing::error!(label = %self.label, "{} does not speak the barrier language: {}", service, e);
                    link.close();
                    continue;
                }
            };

            *self.language.write() = Some(language);
            *self.link.write() = Some(link);
            if self.exit.is_tripped() {
                self.close_link();
                break;
            }
            self.connected.store(true, Ordering::Release);
            tracing::info!(label = %self.label, "connected to {} at {}", service, address.address);
        }
    }

    fn data_loop(&self) {
        let _running = self.data_flag.adopt();
        let mut idle = worker::backoff(BackoffSpec::BARRIER_IDLE);
        let mut buffer = Vec::with_capacity(BARRIER_BUFFER_SIZE);

        while !self.exit.is_tripped() {
            let link = match self.current_link() {
                Some(link) if self.connected.load(Ordering::Acquire) => link,
                _ => {
                    idle.sleep();
                    continue;
                }
            };
            idle.reset();

            if let Err(e) = link.receive(&mut buffer) {
                if !self.exit.is_tripped() {
                    tracing::warn!(label = %self.label, "barrier connection lost: {}", e);
                }
                self.connected.store(false, Ordering::Release);
                self.activated.store(false, Ordering::Release);
                {
                    let _guard = self.activation.lock();
                    self.activation_cv.notify_all();
                }
                // Anyone parked in sync() must not be stranded.
                self.release.send();
                continue;
            }
            self.route(&buffer);
        }
    }

    fn route(&self, frame: &[u8]) {
        let Some(language) = self.current_language() else {
            return;
        };
        match peek_id(frame).and_then(|id| language.classify(id)) {
            Some(BarrierRecord::Handshake) => {
                let mut responded = self.activation.lock();
                *responded = true;
                self.activation_cv.notify_all();
            }
            Some(BarrierRecord::ServerTuning) => {
                match Record::decode(frame, language.dictionary()) {
                    Ok(record) => {
                        if let Some(tuning) = language.server_tuning(&record) {
                            self.server_send_size.store(tuning.send_size, Ordering::Release);
                        }
                    }
                    Err(e) => tracing::error!(label = %self.label, "bad release record: {}", e),
                }
                // Raised whether or not anyone is in sync() right now.
                self.release.send();
            }
            _ => tracing::error!(label = %self.label, "ignoring unexpected barrier record {:?}", peek_id(frame)),
        }
    }
}
