//! State a sync data server shares with its send loop and with an
//! in-process consumer.

use crate::protocol::QueuedData;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct QueueState {
    pub(crate) data: QueuedData,
    /// A producer is parked waiting for the next swap.
    pub(crate) buffer_full: bool,
}

/// The producer's double-buffered queue.
pub(crate) struct SharedQueue {
    pub(crate) state: Mutex<QueueState>,
    pub(crate) not_full: Condvar,
}

impl SharedQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                data: QueuedData::new(),
                buffer_full: false,
            }),
            not_full: Condvar::new(),
        }
    }

    /// Seals the back buffer and wakes a throttled producer.
    pub(crate) fn swap(&self, state: &mut QueueState) {
        state.data.swap_buffers();
        state.buffer_full = false;
        self.not_full.notify_all();
    }

    /// Copies the front buffer into `out`.
    pub(crate) fn copy_front(&self, out: &mut Vec<u8>) {
        let state = self.state.lock();
        out.clear();
        out.extend_from_slice(state.data.front_buffer());
    }

    /// Lets every throttled producer through.
    pub(crate) fn release_producers(&self) {
        let mut state = self.state.lock();
        state.buffer_full = false;
        self.not_full.notify_all();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Readiness {
    Idle,
    Ready,
    Stopping,
}

/// One side's readiness flag.
struct Flag {
    state: Mutex<Readiness>,
    changed: Condvar,
}

impl Flag {
    fn new() -> Self {
        Self {
            state: Mutex::new(Readiness::Idle),
            changed: Condvar::new(),
        }
    }

    /// Marks ready. False once stopping.
    fn raise(&self) -> bool {
        let mut state = self.state.lock();
        if *state == Readiness::Stopping {
            return false;
        }
        *state = Readiness::Ready;
        self.changed.notify_all();
        true
    }

    /// Waits for ready and consumes it. False once stopping.
    fn take(&self) -> bool {
        let mut state = self.state.lock();
        while *state == Readiness::Idle {
            self.changed.wait(&mut state);
        }
        if *state == Readiness::Stopping {
            return false;
        }
        *state = Readiness::Idle;
        true
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        *state = Readiness::Stopping;
        self.changed.notify_all();
    }
}

/// In-process hand-off between a sync data server and one client.
///
/// ```text
/// consumer: raise consumer_ready ──> take producer_ready ──> read front buffer
/// producer: take consumer_ready ──> swap ──> raise producer_ready
/// ```
pub(crate) struct LocalLink {
    consumer_ready: Flag,
    producer_ready: Flag,
    connected: AtomicBool,
}

impl LocalLink {
    pub(crate) fn new() -> Self {
        Self {
            consumer_ready: Flag::new(),
            producer_ready: Flag::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn connect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Consumer side: asks for a frame and waits for it.
    pub(crate) fn request_frame(&self) -> bool {
        self.consumer_ready.raise() && self.producer_ready.take()
    }

    /// Producer side: waits until the consumer wants a frame.
    pub(crate) fn wait_for_consumer(&self) -> bool {
        self.consumer_ready.take()
    }

    /// Producer side: the front buffer holds a new frame.
    pub(crate) fn publish(&self) -> bool {
        self.producer_ready.raise()
    }

    /// Releases both sides for good.
    pub(crate) fn stop(&self) {
        self.consumer_ready.stop();
        self.producer_ready.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Dictionary, FieldKind, Record, RecordTemplate, FRAME_HEADER_SIZE};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_local_hand_off_then_stop() {
        let link = Arc::new(LocalLink::new());
        let producer = Arc::clone(&link);
        let handle = thread::spawn(move || {
            let mut frames = 0;
            while producer.wait_for_consumer() {
                if !producer.publish() {
                    break;
                }
                frames += 1;
            }
            frames
        });

        assert!(link.request_frame());
        assert!(link.request_frame());
        link.stop();
        assert!(!link.request_frame());
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn test_swap_clears_full_flag() {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("frame").with_field("n", FieldKind::Int));
        let mut record = Record::from_dictionary(&dictionary, "frame").unwrap();
        record.set_ints(0, &[7]).unwrap();

        let queue = SharedQueue::new();
        {
            let mut state = queue.state.lock();
            state.data.queue(&record);
            state.buffer_full = true;
            queue.swap(&mut state);
            assert!(!state.buffer_full);
            assert_eq!(state.data.back_buffer_size(), FRAME_HEADER_SIZE);
            assert_eq!(state.data.front_record_count(), 1);
        }
        let mut front = Vec::new();
        queue.copy_front(&mut front);
        assert_eq!(front.len(), queue.state.lock().data.front_buffer_size());
        assert!(!front.is_empty());
    }
}
