//! # Sync Data Client
//!
//! Receives queue buffers from a sync data server and hands them to a
//! [`SyncConsumer`] one frame at a time, pacing itself with an inner
//! [`BarrierClient`].
//!
//! ## Threads
//!
//! ```text
//! connection loop: wait for barrier ──> discover ──> dial ──> on_connect
//!                  ──> idle while connected ──> null handshake
//! read loop:       activate ──> receive ──> (sync) wait swap ready ──> push
//! caller:          consume ──> on_consume* ──> on_action ──> sync ──> on_post_sync
//! ```
//!
//! ## Null Handshake
//!
//! After a disconnect the connection loop requests a handshake and waits.
//! The next `consume` runs `on_null`, then `on_disconnect`, and completes
//! it. Only then does the connection loop reconnect, so the consumer always
//! sees `on_disconnect` before the next `on_connect`.

use super::callbacks::SyncConsumer;
use super::perf::{FrameCounters, FrameSample};
use super::server::SyncDataServer;
use super::shared::{LocalLink, SharedQueue};
use crate::barrier::BarrierClient;
use crate::directory::{NetworkList, ServiceDirectory};
use crate::error::{NetError, NetResult};
use crate::protocol::codec::peek_size;
use crate::transport::{Connector, RecordLink};
use crate::worker;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem_core::{BufferStacks, BufferStats, Drain, Latch, WorkerFlag};
use tandem_shared::{BackoffSpec, ClientMode, BARRIER_SERVICE_SUFFIX, DEFAULT_DATA_BUFFER_SIZE};

/// Poll interval while waiting for the barrier connection.
const BARRIER_POLL: Duration = Duration::from_millis(10);

/// Poll interval while connected, and for the read loop while not.
const CONNECTED_POLL: Duration = Duration::from_millis(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DataAvailable {
    Empty,
    Ready,
    /// Wake the consumer with nothing to consume.
    Skip,
}

#[derive(Debug)]
struct SwapState {
    available: DataAvailable,
    /// The consumer has released the previous buffer.
    swap_ready: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NullHandshake {
    Idle,
    Requested,
    Done,
}

#[derive(Clone, Copy, Debug, Default)]
struct LastRead {
    recv_us: Option<f64>,
    size: f64,
}

struct Settings {
    directory: Option<Arc<dyn ServiceDirectory>>,
    service_name: String,
    data_service: String,
    networks: NetworkList,
    connect_backoff: BackoffSpec,
}

struct LocalConnection {
    link: Arc<LocalLink>,
    queue: Arc<SharedQueue>,
}

struct Inner {
    label: String,
    mode: ClientMode,
    connector: Arc<dyn Connector>,
    barrier: BarrierClient,
    consumer: Mutex<Box<dyn SyncConsumer>>,
    settings: RwLock<Settings>,
    link: RwLock<Option<Arc<dyn RecordLink>>>,
    connected: AtomicBool,
    first_consumption: AtomicBool,
    stacks: BufferStacks,
    swap: Mutex<SwapState>,
    /// Consumer waits here for a buffer.
    data_cv: Condvar,
    /// Reader waits here for the consumer to finish a frame.
    swap_cv: Condvar,
    null_handshake: Mutex<NullHandshake>,
    null_cv: Condvar,
    counters: Mutex<FrameCounters>,
    last_read: Mutex<LastRead>,
    local: RwLock<Option<LocalConnection>>,
    local_frame: Mutex<Vec<u8>>,
    exit: Latch,
    started: AtomicBool,
    stopped: AtomicBool,
    connection_flag: WorkerFlag,
    read_flag: WorkerFlag,
}

/// Render-node end of a synchronized data stream.
///
/// # Example
///
/// ```rust,ignore
/// let client = SyncDataClient::new("render1", ClientMode::Sync, Arc::new(TcpConnector::new(true)), Box::new(scene));
/// client.set_service_name("FRAMES");
/// client.init(directory)?;
/// client.start()?;
/// loop {
///     client.consume();
/// }
/// ```
pub struct SyncDataClient {
    inner: Arc<Inner>,
}

impl SyncDataClient {
    /// Creates a stopped client. Both the data and the barrier connection
    /// dial through `connector`.
    #[must_use]
    pub fn new(label: impl Into<String>, mode: ClientMode, connector: Arc<dyn Connector>, consumer: Box<dyn SyncConsumer>) -> Self {
        Self::with_buffer_size(label, mode, connector, consumer, DEFAULT_DATA_BUFFER_SIZE)
    }

    /// Like [`SyncDataClient::new`], with receive buffers first sized to
    /// `buffer_size` bytes.
    #[must_use]
    pub fn with_buffer_size(
        label: impl Into<String>,
        mode: ClientMode,
        connector: Arc<dyn Connector>,
        consumer: Box<dyn SyncConsumer>,
        buffer_size: usize,
    ) -> Self {
        let label = label.into();
        Self {
            inner: Arc::new(Inner {
                barrier: BarrierClient::new(label.clone(), Arc::clone(&connector)),
                label,
                mode,
                connector,
                consumer: Mutex::new(consumer),
                settings: RwLock::new(Settings {
                    directory: None,
                    service_name: String::new(),
                    data_service: String::new(),
                    networks: NetworkList::any(),
                    connect_backoff: BackoffSpec::BARRIER_CONNECT,
                }),
                link: RwLock::new(None),
                connected: AtomicBool::new(false),
                first_consumption: AtomicBool::new(true),
                stacks: BufferStacks::new(buffer_size),
                swap: Mutex::new(SwapState {
                    available: DataAvailable::Empty,
                    swap_ready: true,
                }),
                data_cv: Condvar::new(),
                swap_cv: Condvar::new(),
                null_handshake: Mutex::new(NullHandshake::Idle),
                null_cv: Condvar::new(),
                counters: Mutex::new(FrameCounters::default()),
                last_read: Mutex::new(LastRead::default()),
                local: RwLock::new(None),
                local_frame: Mutex::new(Vec::new()),
                exit: Latch::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                connection_flag: WorkerFlag::new(),
                read_flag: WorkerFlag::new(),
            }),
        }
    }

    /// Base service name. The directory scopes it at `init`.
    pub fn set_service_name(&self, service: impl Into<String>) {
        self.inner.settings.write().service_name = service.into();
    }

    /// Networks to look for the service on, most preferred first.
    pub fn set_networks(&self, networks: NetworkList) {
        self.inner.settings.write().networks = networks;
    }

    /// Overrides the barrier reconnect schedule. Takes effect at `start`.
    pub fn set_connect_backoff(&self, spec: BackoffSpec) {
        self.inner.settings.write().connect_backoff = spec;
    }

    /// Resolves the data and barrier service names through `directory`.
    pub fn init(&self, directory: Arc<dyn ServiceDirectory>) -> NetResult<()> {
        let inner = &self.inner;
        inner.refuse_local("init")?;
        let mut settings = inner.settings.write();
        if settings.service_name.is_empty() {
            tracing::error!(label = %inner.label, "sync data client has no service name");
            return Err(NetError::NotInitialized("sync data client service name"));
        }
        settings.data_service = directory.complex_service_name(&settings.service_name);
        let barrier_service = directory.complex_service_name(&format!("{}{}", settings.service_name, BARRIER_SERVICE_SUFFIX));
        inner.barrier.set_service_name(barrier_service);
        inner.barrier.init(Arc::clone(&directory));
        settings.directory = Some(directory);
        Ok(())
    }

    /// Starts the barrier client and the connection and read loops.
    pub fn start(&self) -> NetResult<()> {
        let inner = &self.inner;
        inner.refuse_local("start")?;
        {
            let settings = inner.settings.read();
            if settings.directory.is_none() {
                tracing::error!(label = %inner.label, "sync data client started before init");
                return Err(NetError::NotInitialized("sync data client directory"));
            }
            inner.barrier.set_networks(settings.networks.clone());
            inner.barrier.set_connect_backoff(settings.connect_backoff);
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyStarted("sync data client"));
        }
        inner.barrier.start()?;

        let connection = Arc::clone(inner);
        worker::spawn(format!("{}-data-connect", inner.label), &inner.connection_flag, move || connection.connection_loop())?;
        let read = Arc::clone(inner);
        worker::spawn(format!("{}-data-read", inner.label), &inner.read_flag, move || read.read_loop())?;
        tracing::info!(label = %inner.label, "sync data client started in {:?} mode", inner.mode);
        Ok(())
    }

    /// Receives frames from `server` in-process instead of over sockets.
    ///
    /// Must be called before `start`; the server must not be started yet
    /// either, so its send loop comes up in local mode.
    pub fn register_local_connection(&self, server: &SyncDataServer) -> NetResult<()> {
        let inner = &self.inner;
        if inner.started.load(Ordering::Acquire) {
            return Err(NetError::InvalidMode {
                operation: "register_local_connection",
                reason: "client already started",
            });
        }
        let (link, queue, dictionary) = server.attach_local()?;
        if !inner.consumer.lock().on_connect(&dictionary) {
            tracing::error!(label = %inner.label, "connection callback refused the local server");
        }
        *inner.local.write() = Some(LocalConnection { link, queue });
        tracing::info!(label = %inner.label, "consuming in-process");
        Ok(())
    }

    /// Runs one frame of consumer callbacks.
    ///
    /// In sync mode this waits for the next buffer and then for the
    /// barrier. Without a connection it runs `on_null` and returns.
    pub fn consume(&self) {
        let inner = &self.inner;
        if inner.local.read().is_some() {
            inner.consume_local();
            return;
        }

        let frame_start = Instant::now();
        let mut sample = FrameSample::default();
        if inner.connected.load(Ordering::Acquire) {
            if inner.wait_for_data() {
                inner.consume_frame(&mut sample);
            } else {
                inner.consumer.lock().on_null();
            }
        } else {
            inner.consume_disconnected();
        }

        let last_read = *inner.last_read.lock();
        sample.frame_us = micros(frame_start.elapsed());
        sample.recv_us = last_read.recv_us;
        sample.recv_size = last_read.size;
        sample.server_send_size = f64::from(inner.barrier.server_send_size());
        let tuning = {
            let mut counters = inner.counters.lock();
            counters.record(sample);
            counters.tuning()
        };
        inner.barrier.set_tuning_data(tuning);
    }

    /// Makes the next (or a blocked) `consume` run `on_null` instead of
    /// waiting for data.
    pub fn skip_consumption(&self) {
        self.inner.skip_consumption();
    }

    /// Stops the loops and the barrier client, releasing every blocked
    /// caller. Idempotent.
    pub fn stop(&self) -> NetResult<()> {
        let inner = &self.inner;
        inner.refuse_local("stop")?;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.exit.trip();
        inner.barrier.stop();
        if let Some(link) = inner.link.read().as_ref() {
            link.close();
        }
        {
            let mut swap = inner.swap.lock();
            swap.swap_ready = true;
            inner.swap_cv.notify_all();
        }
        {
            let mut state = inner.null_handshake.lock();
            *state = NullHandshake::Done;
            inner.null_cv.notify_all();
        }
        inner.skip_consumption();

        worker::wait_stopped(&[&inner.connection_flag, &inner.read_flag], BackoffSpec::DATA_CLIENT_STOP);
        tracing::info!(label = %inner.label, "sync data client stopped");
        Ok(())
    }

    /// True while the data connection is up.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// The inner barrier client.
    #[must_use]
    pub fn barrier(&self) -> &BarrierClient {
        &self.inner.barrier
    }

    /// Where the receive buffers are right now.
    #[must_use]
    pub fn buffer_stats(&self) -> BufferStats {
        self.inner.stacks.stats()
    }

    /// Smoothed send size reported by the server.
    #[must_use]
    pub fn server_send_size(&self) -> i32 {
        self.inner.counters.lock().server_send_size()
    }

    /// Smoothed `consume` time, microseconds.
    #[must_use]
    pub fn frame_time(&self) -> i32 {
        self.inner.counters.lock().frame_time()
    }

    /// Smoothed consumption time, microseconds.
    #[must_use]
    pub fn proc_time(&self) -> i32 {
        self.inner.counters.lock().proc_time()
    }

    /// Smoothed action callback time, microseconds.
    #[must_use]
    pub fn action_time(&self) -> i32 {
        self.inner.counters.lock().action_time()
    }

    /// Smoothed read time, microseconds.
    #[must_use]
    pub fn recv_time(&self) -> i32 {
        self.inner.counters.lock().recv_time()
    }

    /// Smoothed buffer size, bytes.
    #[must_use]
    pub fn recv_size(&self) -> i32 {
        self.inner.counters.lock().recv_size()
    }
}

impl Drop for SyncDataClient {
    fn drop(&mut self) {
        let inner = &self.inner;
        if inner.local.read().is_none() && inner.started.load(Ordering::Acquire) {
            // Cannot fail outside local mode.
            let _ = self.stop();
        }
    }
}

fn micros(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000_000.0
}

impl Inner {
    fn refuse_local(&self, operation: &'static str) -> NetResult<()> {
        if self.local.read().is_some() {
            tracing::error!(label = %self.label, "{} refused on a local connection", operation);
            return Err(NetError::InvalidMode {
                operation,
                reason: "client consumes a local connection",
            });
        }
        Ok(())
    }

    fn skip_consumption(&self) {
        let mut swap = self.swap.lock();
        swap.available = DataAvailable::Skip;
        self.data_cv.notify_all();
    }

    /// Waits for a buffer in sync mode. False means "run `on_null`".
    fn wait_for_data(&self) -> bool {
        let mut swap = self.swap.lock();
        while swap.available == DataAvailable::Empty && self.mode == ClientMode::Sync && !self.exit.is_tripped() {
            self.data_cv.wait(&mut swap);
        }
        let ready = swap.available != DataAvailable::Skip && !self.exit.is_tripped();
        swap.available = DataAvailable::Empty;
        ready
    }

    fn consume_frame(&self, sample: &mut FrameSample) {
        let drain = match self.mode {
            ClientMode::Sync => Drain::One,
            ClientMode::NoSync => Drain::All,
        };
        let process_start = Instant::now();
        let batch = self.stacks.begin_consume(drain);
        {
            let mut consumer = self.consumer.lock();
            for buffer in &batch {
                if !consumer.on_consume(buffer) {
                    tracing::error!(label = %self.label, "consumption callback failed");
                }
            }
        }
        self.stacks.finish_consume(batch);

        let action_start = Instant::now();
        sample.process_us = Some(micros(action_start - process_start));
        if !self.exit.is_tripped() && !self.consumer.lock().on_action() {
            tracing::error!(label = %self.label, "action callback failed");
        }
        sample.action_us = Some(micros(action_start.elapsed()));

        if !self.exit.is_tripped()
            && self.mode == ClientMode::Sync
            && self.connected.load(Ordering::Acquire)
            && !self.barrier.sync()
            && !self.exit.is_tripped()
        {
            tracing::error!(label = %self.label, "sync failed");
        }
        if !self.exit.is_tripped() && !self.consumer.lock().on_post_sync() {
            tracing::error!(label = %self.label, "post-sync callback failed");
        }

        let mut swap = self.swap.lock();
        swap.swap_ready = true;
        self.swap_cv.notify_all();
    }

    fn consume_disconnected(&self) {
        let mut consumer = self.consumer.lock();
        consumer.on_null();
        let mut state = self.null_handshake.lock();
        if *state == NullHandshake::Requested {
            if !consumer.on_disconnect() {
                tracing::error!(label = %self.label, "disconnect callback failed");
            }
            *state = NullHandshake::Done;
            self.null_cv.notify_all();
        }
    }

    fn consume_local(&self) {
        let local = self.local.read();
        let Some(local) = local.as_ref() else {
            return;
        };
        if !local.link.request_frame() {
            self.consumer.lock().on_null();
            return;
        }
        let mut frame = self.local_frame.lock();
        local.queue.copy_front(&mut frame);

        let mut consumer = self.consumer.lock();
        if !consumer.on_consume(&frame) {
            tracing::error!(label = %self.label, "consumption callback failed");
        }
        consumer.on_action();
        consumer.on_post_sync();
    }

    fn connection_loop(&self) {
        let running = self.connection_flag.adopt();
        let (directory, service, networks) = {
            let settings = self.settings.read();
            let Some(directory) = settings.directory.clone() else {
                return;
            };
            (directory, settings.data_service.clone(), settings.networks.clone())
        };
        let mut retry = worker::backoff(BackoffSpec::BARRIER_CONNECT);

        while !self.exit.is_tripped() {
            // Data without a barrier would never be paced.
            while !self.barrier.check_connection() && !self.exit.is_tripped() {
                thread::sleep(BARRIER_POLL);
            }
            if self.exit.is_tripped() {
                break;
            }

            running.park();
            let found = directory.discover_service(&service, &networks, &self.exit);
            running.resume();
            if self.exit.is_tripped() {
                break;
            }

            let Some(address) = found else {
                tracing::warn!(label = %self.label, "no service {} on networks {}", service, networks);
                retry.sleep();
                continue;
            };
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
                    tracing::warn!(label = %self.label, "cannot connect to {} at {}: {}", service, address.address, e);
                    retry.sleep();
                    continue;
                }
            };
            if !self.consumer.lock().on_connect(link.dictionary()) {
                tracing::error!(label = %self.label, "connection callback refused {}", service);
                link.close();
                retry.sleep();
                continue;
            }
            retry.reset();

            self.barrier.set_bonded_socket_id(link.remote_socket_id());
            *self.link.write() = Some(link);
            if self.exit.is_tripped() {
                // stop() may have looked for a link before this one was stored.
                if let Some(link) = self.link.read().as_ref() {
                    link.close();
                }
                break;
            }
            self.connected.store(true, Ordering::Release);
            tracing::info!(label = %self.label, "connected to {} at {}", service, address.address);

            while self.connected.load(Ordering::Acquire) && !self.exit.is_tripped() {
                thread::sleep(CONNECTED_POLL);
            }
            if self.exit.is_tripped() {
                break;
            }

            tracing::info!(label = %self.label, "disconnected from {}", service);
            if let Some(stale) = self.link.write().take() {
                stale.close();
            }
            self.skip_consumption();

            let mut state = self.null_handshake.lock();
            if *state != NullHandshake::Done {
                *state = NullHandshake::Requested;
                while *state != NullHandshake::Done {
                    self.null_cv.wait(&mut state);
                }
                *state = NullHandshake::Idle;
            }
        }
    }

    fn read_loop(&self) {
        let _running = self.read_flag.adopt();
        while !self.exit.is_tripped() {
            let current = self.link.read().clone();
            let link = match current {
                Some(link) if self.connected.load(Ordering::Acquire) => link,
                _ => {
                    thread::sleep(CONNECTED_POLL);
                    continue;
                }
            };
            // A passive data socket receives nothing until activation.
            if !self.barrier.check_activation() && !self.barrier.request_activation() {
                tracing::debug!(label = %self.label, "activation not completed, retrying");
                thread::sleep(CONNECTED_POLL);
                continue;
            }

            let mut storage = self.stacks.take_storage();
            let started = Instant::now();
            match link.receive(&mut storage) {
                Ok(()) => {
                    let elapsed = micros(started.elapsed());
                    {
                        let mut last_read = self.last_read.lock();
                        if elapsed > 0.0 {
                            last_read.recv_us = Some(elapsed);
                        }
                        #[allow(clippy::cast_precision_loss)]
                        let size = peek_size(&storage).unwrap_or(storage.len()) as f64;
                        last_read.size = size;
                    }
                    self.deliver(storage);
                }
                Err(e) => {
                    self.stacks.recycle(storage);
                    if !self.exit.is_tripped() {
                        tracing::warn!(label = %self.label, "data connection lost: {}", e);
                    }
                    self.first_consumption.store(true, Ordering::Release);
                    {
                        let mut swap = self.swap.lock();
                        swap.swap_ready = true;
                        swap.available = DataAvailable::Empty;
                        self.swap_cv.notify_all();
                    }
                    let dropped = self.stacks.recycle_received();
                    if dropped > 0 {
                        tracing::debug!(label = %self.label, "discarded {} unconsumed buffers", dropped);
                    }
                    self.connected.store(false, Ordering::Release);
                }
            }
        }
    }

    fn deliver(&self, buffer: Vec<u8>) {
        if self.first_consumption.swap(false, Ordering::AcqRel) && self.mode == ClientMode::Sync && !self.barrier.sync() {
            tracing::error!(label = %self.label, "first sync failed");
        }
        match self.mode {
            ClientMode::Sync => {
                let mut swap = self.swap.lock();
                while !swap.swap_ready {
                    self.swap_cv.wait(&mut swap);
                }
                swap.swap_ready = false;
                self.stacks.push_received(buffer);
                swap.available = DataAvailable::Ready;
                self.data_cv.notify_all();
            }
            ClientMode::NoSync => self.stacks.push_received(buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::LocalDirectory;
    use crate::transport::TcpConnector;

    #[derive(Default)]
    struct Counting {
        nulls: Arc<Mutex<usize>>,
    }

    impl SyncConsumer for Counting {
        fn on_consume(&mut self, _buffer: &[u8]) -> bool {
            true
        }

        fn on_null(&mut self) -> bool {
            *self.nulls.lock() += 1;
            true
        }
    }

    fn client(nulls: &Arc<Mutex<usize>>) -> SyncDataClient {
        SyncDataClient::new(
            "test",
            ClientMode::Sync,
            Arc::new(TcpConnector::new(true)),
            Box::new(Counting { nulls: Arc::clone(nulls) }),
        )
    }

    #[test]
    fn test_consume_without_connection_runs_null() {
        let nulls = Arc::new(Mutex::new(0));
        let client = client(&nulls);
        client.consume();
        client.consume();
        assert_eq!(*nulls.lock(), 2);
        assert!(!client.is_connected());
        // A frame far below the initial estimate replaces it.
        assert!(client.frame_time() < 100_000);
    }

    #[test]
    fn test_init_requires_service_name() {
        let client = client(&Arc::new(Mutex::new(0)));
        let directory: Arc<dyn ServiceDirectory> = Arc::new(LocalDirectory::loopback("test"));
        assert!(matches!(client.init(Arc::clone(&directory)), Err(NetError::NotInitialized(_))));
        assert!(matches!(client.start(), Err(NetError::NotInitialized(_))));

        client.set_service_name("FRAMES");
        client.init(directory).unwrap();
        client.start().unwrap();
        assert!(matches!(client.start(), Err(NetError::AlreadyStarted(_))));
        client.stop().unwrap();
        client.stop().unwrap();
    }

    #[test]
    fn test_skip_wakes_blocked_consumer() {
        let nulls = Arc::new(Mutex::new(0));
        let client = Arc::new(client(&nulls));
        client.inner.connected.store(true, Ordering::Release);

        let consumer = Arc::clone(&client);
        let handle = thread::spawn(move || consumer.consume());
        thread::sleep(Duration::from_millis(30));
        client.skip_consumption();
        handle.join().unwrap();
        assert_eq!(*nulls.lock(), 1);
    }
}
