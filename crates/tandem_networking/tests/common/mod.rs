//! Shared fixtures for the networking integration tests.

#![allow(dead_code)]

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem_core::Latch;
use tandem_networking::protocol::codec::peek_id;
use tandem_networking::{
    BarrierLanguage, BarrierRecord, Connector, Dictionary, FieldKind, LocalDirectory, NetError, NetResult,
    QueuedRecords, Record, RecordLink, RecordTemplate, ServiceAddress, ServiceDirectory, SocketId, SyncConsumer,
};
use tandem_shared::ServerTuning;

/// Upper bound for anything a test waits on.
pub const DEADLINE: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn directory() -> Arc<LocalDirectory> {
    Arc::new(LocalDirectory::loopback("test"))
}

/// One template, one int field carrying a sequence number.
pub fn frame_dictionary() -> Dictionary {
    let mut dictionary = Dictionary::new();
    dictionary.add(RecordTemplate::new("frame").with_field("sequence", FieldKind::Int));
    dictionary
}

pub fn frame_record(dictionary: &Dictionary, sequence: i32) -> Record {
    let mut record = Record::from_dictionary(dictionary, "frame").expect("frame template");
    record.set_ints(0, &[sequence]).expect("sequence field");
    record
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connect,
    Disconnect,
    Consume(Vec<i32>),
    Action,
    PostSync,
    Null,
}

/// Consumer that logs every callback and decodes sequence numbers.
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<Event>>>,
    dictionary: Arc<Mutex<Option<Dictionary>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events.lock().iter().filter(|event| *event == wanted).count()
    }

    /// Every sequence number consumed, in order.
    pub fn sequences(&self) -> Vec<i32> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Consume(values) => Some(values.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn consumed_buffers(&self) -> usize {
        self.events.lock().iter().filter(|event| matches!(event, Event::Consume(_))).count()
    }
}

impl SyncConsumer for Recorder {
    fn on_connect(&mut self, dictionary: &Dictionary) -> bool {
        *self.dictionary.lock() = Some(dictionary.clone());
        self.events.lock().push(Event::Connect);
        true
    }

    fn on_disconnect(&mut self) -> bool {
        self.events.lock().push(Event::Disconnect);
        true
    }

    fn on_consume(&mut self, buffer: &[u8]) -> bool {
        let dictionary = self.dictionary.lock().clone();
        let Some(dictionary) = dictionary else {
            return false;
        };
        let Ok(records) = QueuedRecords::decode_all(buffer, &dictionary) else {
            return false;
        };
        let values = records
            .iter()
            .filter_map(|record| record.ints(0).ok().and_then(|ints| ints.first().copied()))
            .collect();
        self.events.lock().push(Event::Consume(values));
        true
    }

    fn on_action(&mut self) -> bool {
        self.events.lock().push(Event::Action);
        true
    }

    fn on_post_sync(&mut self) -> bool {
        self.events.lock().push(Event::PostSync);
        true
    }

    fn on_null(&mut self) -> bool {
        self.events.lock().push(Event::Null);
        true
    }
}

// =============================================================================
// MOCK BARRIER TRANSPORT
// =============================================================================

/// Publishes `service` in `directory` without a listening server.
pub fn publish_fake(directory: &LocalDirectory, service: &str, port: u16) {
    directory.register_service(service, "lan", 1).expect("register");
    directory.confirm_ports(service, "lan", &[port]).expect("confirm");
}

/// Barrier server stand-in: answers every handshake with a probe (unless
/// told to stay silent) and every arrival with a release.
pub struct MockBarrierLink {
    language: BarrierLanguage,
    ignore_handshakes: bool,
    incoming: Receiver<Vec<u8>>,
    replies: Sender<Vec<u8>>,
    closed: AtomicBool,
    exit: Arc<Mutex<Option<Arc<Latch>>>>,
    arrivals_after_exit: Arc<AtomicUsize>,
}

impl MockBarrierLink {
    fn reply(&self, record: &Record) {
        let mut frame = Vec::new();
        record.encode(&mut frame);
        // The receiver lives as long as the link.
        let _ = self.replies.send(frame);
    }
}

impl RecordLink for MockBarrierLink {
    fn dictionary(&self) -> &Dictionary {
        self.language.dictionary()
    }

    fn remote_socket_id(&self) -> SocketId {
        SocketId(1)
    }

    fn send(&self, record: &Record) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Disconnected);
        }
        match self.language.classify(record.id()) {
            Some(BarrierRecord::Handshake) if !self.ignore_handshakes => {
                self.reply(&self.language.handshake_record(SocketId(2)));
            }
            Some(BarrierRecord::ClientTuning) => {
                let tripped = self.exit.lock().as_ref().is_some_and(|exit| exit.is_tripped());
                if tripped {
                    self.arrivals_after_exit.fetch_add(1, Ordering::AcqRel);
                }
                self.reply(&self.language.server_tuning_record(ServerTuning::new(64)));
            }
            _ => {}
        }
        Ok(())
    }

    fn receive(&self, buffer: &mut Vec<u8>) -> NetResult<()> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(NetError::Disconnected);
            }
            match self.incoming.recv_timeout(Duration::from_millis(5)) {
                Ok(frame) => {
                    debug_assert!(peek_id(&frame).is_some());
                    buffer.clear();
                    buffer.extend_from_slice(&frame);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(NetError::Disconnected),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Hands out [`MockBarrierLink`]s and counts arrivals sent after exit.
#[derive(Default)]
pub struct MockConnector {
    /// Links never answer an activation request.
    pub ignore_handshakes: bool,
    pub exit: Arc<Mutex<Option<Arc<Latch>>>>,
    pub arrivals_after_exit: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn watch(&self, exit: Arc<Latch>) {
        *self.exit.lock() = Some(exit);
    }
}

impl Connector for MockConnector {
    fn connect(&self, _address: &ServiceAddress) -> NetResult<Arc<dyn RecordLink>> {
        let (replies, incoming) = crossbeam_channel::unbounded();
        Ok(Arc::new(MockBarrierLink {
            language: BarrierLanguage::new(),
            ignore_handshakes: self.ignore_handshakes,
            incoming,
            replies,
            closed: AtomicBool::new(false),
            exit: Arc::clone(&self.exit),
            arrivals_after_exit: Arc::clone(&self.arrivals_after_exit),
        }))
    }
}
