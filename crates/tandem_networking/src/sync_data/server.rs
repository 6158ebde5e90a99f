//! # Sync Data Server
//!
//! Collects records from the application into a double-buffered queue and
//! ships the sealed buffer to every active render node once per frame.
//! Frames are paced by an owned [`BarrierServer`] that the send loop joins
//! as the local participant.
//!
//! ## Send Loop
//!
//! ```text
//! wait send signal ──> swap ──┬── sockets waiting? ──> activate (barrier + data)
//!                             │                        old sockets: front buffer
//!                             │                        new sockets: on_connect
//!                             └── otherwise ─────────> broadcast front buffer
//!                  ──> local_sync (unless NoSyncManual)
//! ```
//!
//! ## Modes
//!
//! | Mode | Who swaps | `swap_buffers` |
//! |------|-----------|----------------|
//! | `SyncAuto` | barrier release | ignored |
//! | `SyncManual` | application | waits for the release |
//! | `NoSyncManual` | application | returns at once |

use super::callbacks::SyncProducer;
use super::shared::{LocalLink, SharedQueue};
use crate::barrier::BarrierServer;
use crate::directory::ServiceDirectory;
use crate::error::{NetError, NetResult};
use crate::protocol::{Dictionary, Record};
use crate::transport::{RecordServer, TransportStats};
use crate::worker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tandem_core::{Latch, Signal, WorkerFlag};
use tandem_shared::{BackoffSpec, ServerMode, BARRIER_SERVICE_SUFFIX, DEFAULT_DATA_BUFFER_SIZE, DEFAULT_SEND_LIMIT};

/// Pause after a failed accept.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Settings {
    service_name: String,
    channel: String,
    data_service: String,
    directory: Option<Arc<dyn ServiceDirectory>>,
}

struct Inner {
    label: String,
    mode: ServerMode,
    records: RecordServer,
    barrier: BarrierServer,
    producer: Mutex<Box<dyn SyncProducer>>,
    queue: Arc<SharedQueue>,
    local: Arc<LocalLink>,
    local_mode: AtomicBool,
    send_limit: AtomicUsize,
    send_signal: Arc<Signal>,
    release_signal: Arc<Signal>,
    settings: Mutex<Settings>,
    exit: Latch,
    started: AtomicBool,
    stopped: AtomicBool,
    send_flag: WorkerFlag,
    accept_flag: WorkerFlag,
}

/// Master-node end of a synchronized data stream.
///
/// # Example
///
/// ```rust,ignore
/// let server = SyncDataServer::new("master", dictionary, ServerMode::SyncAuto, Box::new(PassThrough));
/// server.set_service_name("FRAMES");
/// server.set_channel("lan");
/// server.init(directory)?;
/// server.start()?;
/// loop {
///     server.receive_message(&mut record);
/// }
/// ```
pub struct SyncDataServer {
    inner: Arc<Inner>,
}

impl SyncDataServer {
    /// Creates a stopped server speaking `dictionary`.
    #[must_use]
    pub fn new(label: impl Into<String>, dictionary: Dictionary, mode: ServerMode, producer: Box<dyn SyncProducer>) -> Self {
        let label = label.into();
        Self {
            inner: Arc::new(Inner {
                records: RecordServer::new(format!("{label}-data"), dictionary, DEFAULT_DATA_BUFFER_SIZE),
                barrier: BarrierServer::new(label.clone()),
                label,
                mode,
                producer: Mutex::new(producer),
                queue: Arc::new(SharedQueue::new()),
                local: Arc::new(LocalLink::new()),
                local_mode: AtomicBool::new(false),
                send_limit: AtomicUsize::new(DEFAULT_SEND_LIMIT),
                send_signal: Arc::new(Signal::new()),
                release_signal: Arc::new(Signal::new()),
                settings: Mutex::new(Settings::default()),
                exit: Latch::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                send_flag: WorkerFlag::new(),
                accept_flag: WorkerFlag::new(),
            }),
        }
    }

    /// Base service name. The directory scopes it at `init`.
    pub fn set_service_name(&self, service: impl Into<String>) {
        self.inner.settings.lock().service_name = service.into();
    }

    /// Network both services register on.
    pub fn set_channel(&self, channel: impl Into<String>) {
        self.inner.settings.lock().channel = channel.into();
    }

    /// Back-buffer bytes before `receive_message` blocks in `SyncAuto`.
    pub fn set_send_limit(&self, bytes: usize) {
        self.inner.send_limit.store(bytes, Ordering::Release);
    }

    /// Publishes the data service and prepares the barrier service.
    ///
    /// Returns the data port.
    pub fn init(&self, directory: Arc<dyn ServiceDirectory>) -> NetResult<u16> {
        let inner = &self.inner;
        inner.refuse_local("init")?;
        let mut settings = inner.settings.lock();
        if settings.service_name.is_empty() || settings.channel.is_empty() {
            tracing::error!(label = %inner.label, "sync data server needs a service name and a channel");
            return Err(NetError::NotInitialized("sync data server service"));
        }
        let data_service = directory.complex_service_name(&settings.service_name);
        let barrier_service = directory.complex_service_name(&format!("{}{}", settings.service_name, BARRIER_SERVICE_SUFFIX));

        let port = inner.records.listen_brokered(directory.as_ref(), &data_service, &settings.channel)?;
        inner.barrier.init(barrier_service, settings.channel.clone(), Arc::clone(&directory));
        tracing::info!(label = %inner.label, "data service {} on port {}", data_service, port);
        settings.data_service = data_service;
        settings.directory = Some(directory);
        Ok(port)
    }

    /// Starts the barrier and the send and accept loops. With a local
    /// connection only the send loop runs.
    pub fn start(&self) -> NetResult<()> {
        let inner = &self.inner;
        if inner.local_mode.load(Ordering::Acquire) {
            if inner.started.swap(true, Ordering::AcqRel) {
                return Err(NetError::AlreadyStarted("sync data server"));
            }
            let send = Arc::clone(inner);
            worker::spawn(format!("{}-data-send", inner.label), &inner.send_flag, move || send.send_local())?;
            tracing::info!(label = %inner.label, "sync data server started in-process in {:?} mode", inner.mode);
            return Ok(());
        }

        if inner.settings.lock().directory.is_none() {
            tracing::error!(label = %inner.label, "sync data server started before init");
            return Err(NetError::NotInitialized("sync data server directory"));
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyStarted("sync data server"));
        }

        if inner.mode.joins_barrier() {
            inner.barrier.register_local();
        }
        if inner.mode != ServerMode::SyncAuto {
            inner.barrier.set_release_signal(Arc::clone(&inner.release_signal));
        }
        inner.barrier.set_signal(Arc::clone(&inner.send_signal));
        let barrier_port = inner.barrier.start()?;

        let accept = Arc::clone(inner);
        worker::spawn(format!("{}-data-accept", inner.label), &inner.accept_flag, move || accept.accept_loop())?;
        let send = Arc::clone(inner);
        worker::spawn(format!("{}-data-send", inner.label), &inner.send_flag, move || send.send_remote())?;
        tracing::info!(label = %inner.label, "sync data server started in {:?} mode, barrier on port {}", inner.mode, barrier_port);
        Ok(())
    }

    /// Runs the producer's message hook and queues `record` for the next
    /// frame if anyone is consuming.
    ///
    /// In `SyncAuto` with active clients this blocks while the back buffer
    /// is over the send limit, until the send loop swaps.
    pub fn receive_message(&self, record: &mut Record) -> bool {
        let inner = &self.inner;
        let mut state = inner.queue.state.lock();
        if inner.mode == ServerMode::SyncAuto
            && state.data.back_buffer_size() > inner.send_limit.load(Ordering::Acquire)
            && inner.barrier.number_connected_active() > 0
        {
            state.buffer_full = true;
            while state.buffer_full && !inner.exit.is_tripped() {
                inner.queue.not_full.wait(&mut state);
            }
        }

        let accepted = inner.producer.lock().on_message(record);
        if inner.barrier.number_connected_active() > 0 || inner.local.is_connected() {
            state.data.queue(record);
        }
        accepted
    }

    /// Triggers a send in the manual modes. `SyncManual` also waits for
    /// the barrier release. Ignored in `SyncAuto`.
    pub fn swap_buffers(&self) {
        let inner = &self.inner;
        if inner.mode == ServerMode::SyncAuto {
            tracing::debug!(label = %inner.label, "swap_buffers ignored in SyncAuto mode");
            return;
        }
        if inner.exit.is_tripped() {
            return;
        }
        inner.send_signal.send();
        if inner.mode != ServerMode::NoSyncManual {
            inner.release_signal.wait();
        }
    }

    /// Stops every loop and the barrier, releasing every blocked caller.
    /// Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.exit.trip();
        inner.send_signal.send();
        inner.release_signal.send();
        inner.local.stop();
        inner.queue.release_producers();
        inner.barrier.stop();
        inner.records.stop();
        {
            let settings = inner.settings.lock();
            if let Some(directory) = &settings.directory {
                directory.release_service(&settings.data_service);
            }
        }

        worker::wait_stopped(&[&inner.send_flag, &inner.accept_flag], BackoffSpec::DATA_SERVER_STOP);
        tracing::info!(label = %inner.label, "sync data server stopped");
    }

    /// The owned barrier server.
    #[must_use]
    pub fn barrier(&self) -> &BarrierServer {
        &self.inner.barrier
    }

    /// Connected data sockets, passive and active.
    #[must_use]
    pub fn number_connected(&self) -> usize {
        self.inner.records.number_connected()
    }

    /// Data sockets receiving frames.
    #[must_use]
    pub fn number_connected_active(&self) -> usize {
        self.inner.records.number_connected_active()
    }

    /// Data traffic, one frame per socket per send. Barrier traffic is
    /// counted by the barrier's own transport.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.inner.records.stats()
    }

    /// Switches this server to in-process delivery for one client.
    pub(crate) fn attach_local(&self) -> NetResult<(Arc<LocalLink>, Arc<SharedQueue>, Dictionary)> {
        let inner = &self.inner;
        if inner.started.load(Ordering::Acquire) {
            return Err(NetError::InvalidMode {
                operation: "register_local_connection",
                reason: "server already started",
            });
        }
        inner.local_mode.store(true, Ordering::Release);
        inner.local.connect();
        Ok((Arc::clone(&inner.local), Arc::clone(&inner.queue), inner.records.dictionary().clone()))
    }
}

impl Drop for SyncDataServer {
    fn drop(&mut self) {
        if self.inner.started.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

impl Inner {
    fn refuse_local(&self, operation: &'static str) -> NetResult<()> {
        if self.local_mode.load(Ordering::Acquire) {
            tracing::error!(label = %self.label, "{} refused on a local connection", operation);
            return Err(NetError::InvalidMode {
                operation,
                reason: "server feeds a local connection",
            });
        }
        Ok(())
    }

    fn accept_loop(&self) {
        let _running = self.accept_flag.adopt();
        let mut idle = worker::backoff(BackoffSpec::ACCEPT_IDLE);
        while !self.exit.is_tripped() {
            match self.records.accept_connection(false) {
                Ok(Some(socket)) => {
                    idle.reset();
                    tracing::info!(label = %self.label, "data socket {} connected (passive)", socket);
                }
                Ok(None) => idle.sleep(),
                Err(e) => {
                    if self.exit.is_tripped() {
                        break;
                    }
                    tracing::warn!(label = %self.label, "data accept failed: {}", e);
                    thread::sleep(ACCEPT_ERROR_PAUSE);
                }
            }
        }
    }

    fn send_remote(&self) {
        let _running = self.send_flag.adopt();
        let mut frame = Vec::new();
        while !self.exit.is_tripped() {
            self.send_signal.wait();
            if self.exit.is_tripped() {
                break;
            }

            let mut state = self.queue.state.lock();
            self.queue.swap(&mut state);
            if self.barrier.check_waiting_sockets() {
                let guard = self.barrier.lock_activation_queue();
                let joining = guard.bonded_sockets();
                let previously_active = self.records.active_sockets();
                let activated = self.barrier.activate_passive_sockets_locked(guard, Some(&self.records));
                tracing::info!(label = %self.label, "activated {} sockets", activated);

                if !previously_active.is_empty() && !self.records.send_raw_to_many(state.data.front_buffer(), &previously_active) {
                    tracing::debug!(label = %self.label, "frame not delivered to every active socket");
                }
                let joined: Vec<_> = joining.into_iter().filter(|socket| self.records.has_socket(*socket)).collect();
                if !self.producer.lock().on_connect(&state.data, &self.records, &joined) {
                    tracing::warn!(label = %self.label, "connection callback failed for {:?}", joined);
                }
                drop(state);
            } else {
                frame.clear();
                frame.extend_from_slice(state.data.front_buffer());
                drop(state);
                if !self.records.send_raw_active(&frame) {
                    tracing::debug!(label = %self.label, "frame not delivered to every active socket");
                }
                let sent = frame.len().saturating_mul(self.records.number_connected());
                self.barrier.set_server_send_size(i32::try_from(sent).unwrap_or(i32::MAX));
            }

            if self.mode.joins_barrier() {
                self.barrier.local_sync();
            }
        }
    }

    fn send_local(&self) {
        let _running = self.send_flag.adopt();
        while !self.exit.is_tripped() {
            if !self.local.wait_for_consumer() {
                break;
            }
            if self.mode != ServerMode::SyncAuto {
                self.send_signal.wait();
                if self.exit.is_tripped() {
                    break;
                }
            }
            {
                let mut state = self.queue.state.lock();
                self.queue.swap(&mut state);
            }
            if !self.local.publish() {
                break;
            }
            if self.mode != ServerMode::SyncAuto {
                self.release_signal.send();
            }
        }
        self.local.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::LocalDirectory;
    use crate::protocol::{FieldKind, RecordTemplate};
    use crate::sync_data::PassThrough;

    fn dictionary() -> Dictionary {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("frame").with_field("n", FieldKind::Int));
        dictionary
    }

    fn record(dictionary: &Dictionary) -> Record {
        let mut record = Record::from_dictionary(dictionary, "frame").unwrap();
        record.set_ints(0, &[1]).unwrap();
        record
    }

    #[test]
    fn test_records_dropped_without_consumers() {
        let dictionary = dictionary();
        let server = SyncDataServer::new("test", dictionary.clone(), ServerMode::SyncAuto, Box::new(PassThrough));
        let mut message = record(&dictionary);
        assert!(server.receive_message(&mut message));
        assert_eq!(server.inner.queue.state.lock().data.back_record_count(), 0);
    }

    #[test]
    fn test_init_requires_name_and_channel() {
        let server = SyncDataServer::new("test", dictionary(), ServerMode::SyncAuto, Box::new(PassThrough));
        let directory: Arc<dyn ServiceDirectory> = Arc::new(LocalDirectory::loopback("test"));
        assert!(matches!(server.init(Arc::clone(&directory)), Err(NetError::NotInitialized(_))));
        assert!(matches!(server.start(), Err(NetError::NotInitialized(_))));
    }

    #[test]
    fn test_start_publishes_both_services() {
        let directory = Arc::new(LocalDirectory::loopback("test"));
        let server = SyncDataServer::new("test", dictionary(), ServerMode::SyncAuto, Box::new(PassThrough));
        server.set_service_name("FRAMES");
        server.set_channel("lan");
        let port = server.init(directory.clone()).unwrap();
        assert_ne!(port, 0);
        server.start().unwrap();
        assert!(directory.is_published("FRAMES/tandem"));
        assert!(directory.is_published("FRAMES_BARRIER/tandem"));
        assert!(matches!(server.start(), Err(NetError::AlreadyStarted(_))));

        server.stop();
        assert!(!directory.is_published("FRAMES/tandem"));
        assert!(!directory.is_published("FRAMES_BARRIER/tandem"));
    }

    #[test]
    fn test_manual_swap_released_by_stop() {
        let directory = Arc::new(LocalDirectory::loopback("test"));
        let server = Arc::new(SyncDataServer::new("test", dictionary(), ServerMode::SyncManual, Box::new(PassThrough)));
        server.set_service_name("FRAMES");
        server.set_channel("lan");
        server.init(directory).unwrap();
        server.start().unwrap();

        let swapper = Arc::clone(&server);
        let handle = thread::spawn(move || swapper.swap_buffers());
        thread::sleep(Duration::from_millis(50));
        server.stop();
        handle.join().unwrap();
    }
}
