//! # Barrier Server
//!
//! Accepts barrier clients, runs their activation handshakes, and releases
//! every active client at once when all of them have arrived.
//!
//! ## Socket States
//!
//! ```text
//! PASSIVE ──handshake──> QUEUED ──probe + confirm──> ACTIVE
//!    │                      │                          │
//!    └──────────────── disconnect ─────────────────────┘
//! ```
//!
//! Only ACTIVE sockets count toward a release. The in-process producer may
//! join the group with [`BarrierServer::register_local`] and counts as one
//! more participant.
//!
//! ## Locks
//!
//! The activation queue and the release count use separate locks. A socket
//! is promoted under the release lock, but the wait for its confirmation
//! happens under neither: the confirmation arrives through the same record
//! callback that queues handshakes.

use super::language::{BarrierLanguage, BarrierRecord};
use crate::directory::ServiceDirectory;
use crate::error::{NetError, NetResult};
use crate::protocol::Record;
use crate::transport::{RecordServer, SocketId};
use crate::worker;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tandem_core::{Latch, Signal, WorkerFlag};
use tandem_shared::{BackoffSpec, ClientTuning, ServerTuning, DEFAULT_DATA_BUFFER_SIZE};

/// How often a pending activation re-checks that its socket still exists.
const ACTIVATION_POLL: Duration = Duration::from_millis(20);

/// Pause before a local arrival when no remote client is active.
const LOCAL_IDLE: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
struct Pending {
    socket: SocketId,
    bonded: SocketId,
}

#[derive(Debug)]
struct ActivationQueue {
    pending: VecDeque<Pending>,
    pump_priming: bool,
}

#[derive(Debug)]
struct ReleaseState {
    total_waiting: usize,
    run: bool,
}

#[derive(Default)]
struct Settings {
    service: String,
    channel: String,
    directory: Option<Arc<dyn ServiceDirectory>>,
}

/// Holds the activation queue lock.
///
/// Obtained from [`BarrierServer::lock_activation_queue`]; dropping it
/// unlocks the queue.
pub struct ActivationQueueGuard<'a> {
    queue: MutexGuard<'a, ActivationQueue>,
}

impl ActivationQueueGuard<'_> {
    /// Bonded (data channel) sockets of every queued activation.
    #[must_use]
    pub fn bonded_sockets(&self) -> Vec<SocketId> {
        self.queue
            .pending
            .iter()
            .map(|pending| pending.bonded)
            .filter(|bonded| !bonded.is_null())
            .collect()
    }

    /// Queued activations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.pending.len()
    }

    /// True if no activation is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.pending.is_empty()
    }
}

struct Inner {
    label: String,
    language: BarrierLanguage,
    records: RecordServer,
    settings: Mutex<Settings>,
    release: Mutex<ReleaseState>,
    release_cv: Condvar,
    activation_queue: Mutex<ActivationQueue>,
    /// Last socket that confirmed an activation.
    activation: Mutex<Option<SocketId>>,
    activation_cv: Condvar,
    signal: RwLock<Option<Arc<Signal>>>,
    release_signal: RwLock<Option<Arc<Signal>>>,
    local_signal: Signal,
    local_connection: AtomicBool,
    server_send_size: AtomicI32,
    last_tuning: Mutex<ClientTuning>,
    release_count: AtomicU64,
    exit: Latch,
    started: AtomicBool,
    stopped: AtomicBool,
    accept_flag: WorkerFlag,
    release_flag: WorkerFlag,
}

/// Server end of a frame barrier.
pub struct BarrierServer {
    inner: Arc<Inner>,
}

impl BarrierServer {
    /// Creates a stopped server.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let language = BarrierLanguage::new();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_record = weak.clone();
            let on_disconnect = weak.clone();
            let records = RecordServer::new(format!("{label}-barrier"), language.dictionary().clone(), DEFAULT_DATA_BUFFER_SIZE)
                .with_atomic_receive(false)
                .with_consumer(Arc::new(move |record: &Record, socket| {
                    if let Some(inner) = on_record.upgrade() {
                        inner.on_record(record, socket);
                    }
                }))
                .with_disconnect(Arc::new(move |socket| {
                    if let Some(inner) = on_disconnect.upgrade() {
                        inner.on_disconnect(socket);
                    }
                }));
            Inner {
                label,
                language,
                records,
                settings: Mutex::new(Settings::default()),
                release: Mutex::new(ReleaseState {
                    total_waiting: 0,
                    run: false,
                }),
                release_cv: Condvar::new(),
                activation_queue: Mutex::new(ActivationQueue {
                    pending: VecDeque::new(),
                    pump_priming: true,
                }),
                activation: Mutex::new(None),
                activation_cv: Condvar::new(),
                signal: RwLock::new(None),
                release_signal: RwLock::new(None),
                local_signal: Signal::new(),
                local_connection: AtomicBool::new(false),
                server_send_size: AtomicI32::new(0),
                last_tuning: Mutex::new(ClientTuning::default()),
                release_count: AtomicU64::new(0),
                exit: Latch::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                accept_flag: WorkerFlag::new(),
                release_flag: WorkerFlag::new(),
            }
        });
        Self { inner }
    }

    /// Records the service to publish and where.
    pub fn init(&self, service: impl Into<String>, channel: impl Into<String>, directory: Arc<dyn ServiceDirectory>) {
        let mut settings = self.inner.settings.lock();
        settings.service = service.into();
        settings.channel = channel.into();
        settings.directory = Some(directory);
    }

    /// Publishes the service and launches the accept and release loops.
    ///
    /// Returns the port the barrier listens on.
    pub fn start(&self) -> NetResult<u16> {
        let inner = &self.inner;
        let (directory, service, channel) = {
            let settings = inner.settings.lock();
            let Some(directory) = settings.directory.clone() else {
                tracing::error!(label = %inner.label, "barrier server started before init");
                return Err(NetError::NotInitialized("barrier server directory"));
            };
            if settings.channel.is_empty() {
                tracing::error!(label = %inner.label, "barrier server has no channel");
                return Err(NetError::NotInitialized("barrier server channel"));
            }
            (directory, settings.service.clone(), settings.channel.clone())
        };
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyStarted("barrier server"));
        }

        let port = inner.records.listen_brokered(directory.as_ref(), &service, &channel)?;
        inner.release.lock().run = true;

        let release = Arc::clone(inner);
        worker::spawn(format!("{}-barrier-release", inner.label), &inner.release_flag, move || release.release_loop())?;
        let accept = Arc::clone(inner);
        worker::spawn(format!("{}-barrier-accept", inner.label), &inner.accept_flag, move || accept.accept_loop())?;
        tracing::info!(label = %inner.label, "barrier {} serving on port {}", service, port);
        Ok(port)
    }

    /// Disables `local_sync`, disconnects every client and waits for the
    /// worker loops. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.exit.trip();
        inner.local_signal.send();
        {
            let mut state = inner.release.lock();
            state.run = false;
            inner.release_cv.notify_all();
        }
        {
            let _guard = inner.activation.lock();
            inner.activation_cv.notify_all();
        }
        inner.records.stop();

        if inner.started.load(Ordering::Acquire) {
            let settings = inner.settings.lock();
            if let Some(directory) = &settings.directory {
                directory.release_service(&settings.service);
            }
        }
        worker::wait_stopped(&[&inner.accept_flag, &inner.release_flag], BackoffSpec::BARRIER_STOP);
        tracing::info!(label = %inner.label, "barrier server stopped after {} releases", inner.release_count.load(Ordering::Relaxed));
    }

    /// Adds the in-process producer to the release group.
    pub fn register_local(&self) {
        self.inner.local_connection.store(true, Ordering::Release);
    }

    /// Arrives at the barrier as the local participant and waits for the
    /// release. Returns at once after `stop`.
    pub fn local_sync(&self) {
        let inner = &self.inner;
        if inner.exit.is_tripped() {
            return;
        }
        if inner.records.number_connected_active() == 0 {
            thread::sleep(LOCAL_IDLE);
        }
        {
            let mut state = inner.release.lock();
            state.total_waiting += 1;
            inner.release_cv.notify_all();
        }
        inner.local_signal.wait();
    }

    /// Signal raised on pump priming and, without a release signal, on
    /// every release.
    pub fn set_signal(&self, signal: Arc<Signal>) {
        *self.inner.signal.write() = Some(signal);
    }

    /// Signal raised on every release instead of the plain signal.
    pub fn set_release_signal(&self, signal: Arc<Signal>) {
        *self.inner.release_signal.write() = Some(signal);
    }

    /// Payload of the next release broadcast.
    pub fn set_server_send_size(&self, size: i32) {
        self.inner.server_send_size.store(size, Ordering::Release);
    }

    /// True if any socket is queued for activation.
    #[must_use]
    pub fn check_waiting_sockets(&self) -> bool {
        !self.inner.activation_queue.lock().pending.is_empty()
    }

    /// Locks the activation queue until the guard drops.
    ///
    /// Handshakes arriving meanwhile block in the record callback.
    #[must_use]
    pub fn lock_activation_queue(&self) -> ActivationQueueGuard<'_> {
        ActivationQueueGuard {
            queue: self.inner.activation_queue.lock(),
        }
    }

    /// Bonded sockets of every queued activation.
    #[must_use]
    pub fn waiting_bonded_sockets(&self) -> Vec<SocketId> {
        self.lock_activation_queue().bonded_sockets()
    }

    /// Activates every queued socket, and its bonded socket on `bonded`.
    ///
    /// Returns how many were promoted.
    pub fn activate_passive_sockets(&self, bonded: Option<&RecordServer>) -> usize {
        let guard = self.lock_activation_queue();
        self.activate_passive_sockets_locked(guard, bonded)
    }

    /// Like [`BarrierServer::activate_passive_sockets`] with a queue lock
    /// the caller already holds. The lock is released before any wait.
    pub fn activate_passive_sockets_locked(&self, mut guard: ActivationQueueGuard<'_>, bonded: Option<&RecordServer>) -> usize {
        let pending: Vec<Pending> = guard.queue.pending.drain(..).collect();
        drop(guard);
        pending
            .into_iter()
            .filter(|entry| self.inner.activate(*entry, bonded))
            .count()
    }

    /// Connected barrier sockets, passive and active.
    #[must_use]
    pub fn number_connected(&self) -> usize {
        self.inner.records.number_connected()
    }

    /// Barrier sockets in the release group.
    #[must_use]
    pub fn number_connected_active(&self) -> usize {
        self.inner.records.number_connected_active()
    }

    /// Releases broadcast so far.
    #[must_use]
    pub fn release_count(&self) -> u64 {
        self.inner.release_count.load(Ordering::Acquire)
    }

    /// Tuning from the most recent client arrival.
    #[must_use]
    pub fn last_client_tuning(&self) -> ClientTuning {
        *self.inner.last_tuning.lock()
    }

    /// Draw time reported by the most recent arrival.
    #[must_use]
    pub fn draw_time(&self) -> i32 {
        self.last_client_tuning().draw_time
    }

    /// Receive time reported by the most recent arrival.
    #[must_use]
    pub fn recv_time(&self) -> i32 {
        self.last_client_tuning().recv_time
    }

    /// Process time reported by the most recent arrival.
    #[must_use]
    pub fn proc_time(&self) -> i32 {
        self.last_client_tuning().proc_time
    }

    /// Frame number reported by the most recent arrival.
    #[must_use]
    pub fn frame_number(&self) -> i32 {
        self.last_client_tuning().frame_number
    }
}

impl Drop for BarrierServer {
    fn drop(&mut self) {
        if self.inner.started.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

impl Inner {
    fn on_record(&self, record: &Record, socket: SocketId) {
        match self.language.classify(record.id()) {
            Some(BarrierRecord::Handshake) => {
                let bonded = self.language.bonded_id(record);
                let mut queue = self.activation_queue.lock();
                queue.pending.push_back(Pending { socket, bonded });
                tracing::debug!(label = %self.label, "socket {} asks to join (bonded {})", socket, bonded);
                // Nobody active means no release will ever come to send the
                // first buffer. Kick the producer once.
                if queue.pump_priming && self.records.number_connected_active() == 0 {
                    if let Some(signal) = self.signal.read().as_ref() {
                        signal.send();
                    }
                    queue.pump_priming = false;
                }
            }
            Some(BarrierRecord::Response) => {
                let mut responded = self.activation.lock();
                *responded = Some(socket);
                self.activation_cv.notify_all();
            }
            Some(BarrierRecord::ClientTuning) => {
                if let Some(tuning) = self.language.client_tuning(record) {
                    *self.last_tuning.lock() = tuning;
                }
                let mut state = self.release.lock();
                state.total_waiting += 1;
                self.release_cv.notify_all();
            }
            Some(BarrierRecord::ServerTuning) | None => {
                tracing::error!(label = %self.label, "ignoring record {} from {}", record.id(), socket);
            }
        }
    }

    fn on_disconnect(&self, socket: SocketId) {
        {
            let _state = self.release.lock();
            self.release_cv.notify_all();
        }
        {
            let _responded = self.activation.lock();
            self.activation_cv.notify_all();
        }
        let mut queue = self.activation_queue.lock();
        queue.pending.retain(|pending| pending.socket != socket);
        if self.records.number_connected() == 0 {
            queue.pump_priming = true;
        }
    }

    fn activate(&self, entry: Pending, bonded: Option<&RecordServer>) -> bool {
        *self.activation.lock() = None;
        let probe = self.language.handshake_record(entry.bonded);
        if let Err(e) = self.records.send_to(&probe, entry.socket) {
            tracing::warn!(label = %self.label, "cannot probe {}: {}", entry.socket, e);
            return false;
        }

        {
            let mut responded = self.activation.lock();
            while *responded != Some(entry.socket) {
                if self.exit.is_tripped() || !self.records.has_socket(entry.socket) {
                    tracing::info!(label = %self.label, "socket {} left before activation", entry.socket);
                    return false;
                }
                self.activation_cv.wait_for(&mut responded, ACTIVATION_POLL);
            }
        }

        let _state = self.release.lock();
        self.records.activate_passive_socket(entry.socket);
        if let Some(server) = bonded {
            if !entry.bonded.is_null() && !server.activate_passive_socket(entry.bonded) {
                tracing::warn!(label = %self.label, "bonded socket {} is gone", entry.bonded);
            }
        }
        tracing::info!(label = %self.label, "socket {} joined the release group", entry.socket);
        true
    }

    fn release_loop(&self) {
        let _running = self.release_flag.adopt();
        loop {
            {
                let mut state = self.release.lock();
                loop {
                    if !state.run {
                        return;
                    }
                    let local = usize::from(self.local_connection.load(Ordering::Acquire));
                    let total = self.records.number_connected_active() + local;
                    if total > 0 && state.total_waiting >= total {
                        state.total_waiting = 0;
                        break;
                    }
                    self.release_cv.wait(&mut state);
                }

                self.release_count.fetch_add(1, Ordering::AcqRel);
                let tuning = ServerTuning::new(self.server_send_size.load(Ordering::Acquire));
                if !self.records.send_active(&self.language.server_tuning_record(tuning)) {
                    // Usually a client that just left.
                    tracing::debug!(label = %self.label, "release not delivered to every client");
                }
            }

            if let Some(release) = self.release_signal.read().as_ref() {
                release.send();
            } else if let Some(signal) = self.signal.read().as_ref() {
                signal.send();
            }
            self.local_signal.send();
        }
    }

    fn accept_loop(&self) {
        let _running = self.accept_flag.adopt();
        let mut idle = worker::backoff(BackoffSpec::ACCEPT_IDLE);
        while !self.exit.is_tripped() {
            match self.records.accept_connection(false) {
                Ok(Some(_)) => idle.reset(),
                Ok(None) => idle.sleep(),
                Err(e) => {
                    if !self.exit.is_tripped() {
                        tracing::error!(label = %self.label, "accept failed, barrier halted: {}", e);
                        let mut state = self.release.lock();
                        state.run = false;
                        self.release_cv.notify_all();
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::LocalDirectory;

    #[test]
    fn test_start_requires_init() {
        let server = BarrierServer::new("test");
        assert!(matches!(server.start(), Err(NetError::NotInitialized(_))));
    }

    #[test]
    fn test_start_requires_channel() {
        let server = BarrierServer::new("test");
        server.init("FRAMES_BARRIER", "", Arc::new(LocalDirectory::loopback("test")));
        assert!(matches!(server.start(), Err(NetError::NotInitialized(_))));
    }

    #[test]
    fn test_local_participant_releases_alone() {
        let directory = Arc::new(LocalDirectory::loopback("test"));
        let server = BarrierServer::new("test");
        server.init("FRAMES_BARRIER", "lan", directory.clone());
        server.register_local();
        let release = Arc::new(Signal::new());
        server.set_signal(Arc::clone(&release));
        server.start().unwrap();
        assert!(directory.is_published("FRAMES_BARRIER"));

        server.local_sync();
        server.local_sync();
        assert_eq!(server.release_count(), 2);
        assert!(release.is_pending());

        server.stop();
        assert!(!directory.is_published("FRAMES_BARRIER"));
        // Falls straight through once stopped.
        server.local_sync();
    }

    #[test]
    fn test_empty_queue_activates_nothing() {
        let server = BarrierServer::new("test");
        assert!(!server.check_waiting_sockets());
        assert!(server.lock_activation_queue().is_empty());
        assert_eq!(server.activate_passive_sockets(None), 0);
        assert!(server.waiting_bonded_sockets().is_empty());
    }
}
