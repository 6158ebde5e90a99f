//! # Frame Stream
//!
//! What the node binaries send: one `frame` record per produced frame,
//! carrying its number, the master clock and the master's label. Render
//! nodes resolve the fields by name from the dictionary the master sends
//! at connect time.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tandem_networking::{Dictionary, FieldKind, NetResult, QueuedRecords, Record, RecordTemplate, SyncConsumer};

/// Template name of a frame record.
pub const FRAME_TEMPLATE: &str = "frame";

/// The master's dictionary: a single `frame` template.
#[must_use]
pub fn frame_dictionary() -> Dictionary {
    let mut dictionary = Dictionary::new();
    dictionary.add(
        RecordTemplate::new(FRAME_TEMPLATE)
            .with_field("number", FieldKind::Int)
            .with_field("clock", FieldKind::Float)
            .with_field("origin", FieldKind::Char),
    );
    dictionary
}

/// Field indices of the frame template in one dictionary.
#[derive(Clone, Copy, Debug)]
struct FrameFields {
    number: usize,
    clock: usize,
    origin: usize,
}

impl FrameFields {
    fn resolve(dictionary: &Dictionary) -> NetResult<Self> {
        Ok(Self {
            number: dictionary.field_index(FRAME_TEMPLATE, "number")?,
            clock: dictionary.field_index(FRAME_TEMPLATE, "clock")?,
            origin: dictionary.field_index(FRAME_TEMPLATE, "origin")?,
        })
    }
}

/// Produces numbered frame records.
pub struct FrameSource {
    dictionary: Dictionary,
    fields: FrameFields,
    origin: String,
    started: Instant,
    next: i32,
}

impl FrameSource {
    /// Creates a source over `dictionary`, which must hold the frame
    /// template.
    pub fn new(dictionary: Dictionary, origin: impl Into<String>) -> NetResult<Self> {
        let fields = FrameFields::resolve(&dictionary)?;
        Ok(Self {
            dictionary,
            fields,
            origin: origin.into(),
            started: Instant::now(),
            next: 0,
        })
    }

    /// Builds the next frame record.
    pub fn next_record(&mut self) -> NetResult<Record> {
        let mut record = Record::from_dictionary(&self.dictionary, FRAME_TEMPLATE)?;
        record.set_ints(self.fields.number, &[self.next])?;
        record.set_floats(self.fields.clock, &[self.started.elapsed().as_secs_f32()])?;
        record.set_bytes(self.fields.origin, self.origin.as_bytes())?;
        self.next = self.next.wrapping_add(1);
        Ok(record)
    }

    /// Records built so far.
    #[inline]
    #[must_use]
    pub fn produced(&self) -> i32 {
        self.next
    }
}

/// Counters a [`FrameLog`] updates; shared with whoever reports them.
#[derive(Debug)]
pub struct FrameTally {
    frames: AtomicU64,
    buffers: AtomicU64,
    gaps: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    nulls: AtomicU64,
    last_number: AtomicI64,
}

impl Default for FrameTally {
    fn default() -> Self {
        Self {
            frames: AtomicU64::new(0),
            buffers: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            nulls: AtomicU64::new(0),
            last_number: AtomicI64::new(-1),
        }
    }
}

/// Point-in-time copy of a [`FrameTally`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    /// Frame records decoded.
    pub frames: u64,
    /// Buffers consumed.
    pub buffers: u64,
    /// Times a frame number did not follow the previous one.
    pub gaps: u64,
    /// Connections made.
    pub connects: u64,
    /// Connections lost.
    pub disconnects: u64,
    /// Frames run without data.
    pub nulls: u64,
    /// Last frame number seen on the current connection.
    pub last_number: Option<i32>,
}

impl FrameTally {
    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> TallySnapshot {
        let last = self.last_number.load(Ordering::Acquire);
        TallySnapshot {
            frames: self.frames.load(Ordering::Acquire),
            buffers: self.buffers.load(Ordering::Acquire),
            gaps: self.gaps.load(Ordering::Acquire),
            connects: self.connects.load(Ordering::Acquire),
            disconnects: self.disconnects.load(Ordering::Acquire),
            nulls: self.nulls.load(Ordering::Acquire),
            last_number: i32::try_from(last).ok(),
        }
    }

    fn record_number(&self, number: i32) -> bool {
        let previous = self.last_number.swap(i64::from(number), Ordering::AcqRel);
        self.frames.fetch_add(1, Ordering::AcqRel);
        let in_order = previous < 0 || previous + 1 == i64::from(number);
        if !in_order {
            self.gaps.fetch_add(1, Ordering::AcqRel);
        }
        in_order
    }
}

/// Render-node consumer: decodes every buffer and tallies frame numbers.
pub struct FrameLog {
    label: String,
    tally: Arc<FrameTally>,
    decoding: Option<(Dictionary, FrameFields)>,
}

impl FrameLog {
    /// Creates a consumer reporting into `tally`.
    #[must_use]
    pub fn new(label: impl Into<String>, tally: Arc<FrameTally>) -> Self {
        Self {
            label: label.into(),
            tally,
            decoding: None,
        }
    }
}

impl SyncConsumer for FrameLog {
    fn on_connect(&mut self, dictionary: &Dictionary) -> bool {
        match FrameFields::resolve(dictionary) {
            Ok(fields) => {
                self.decoding = Some((dictionary.clone(), fields));
                self.tally.connects.fetch_add(1, Ordering::AcqRel);
                tracing::info!(label = %self.label, templates = dictionary.len(), "frame stream connected");
                true
            }
            Err(e) => {
                tracing::error!(label = %self.label, error = %e, "server does not send frames");
                false
            }
        }
    }

    fn on_disconnect(&mut self) -> bool {
        self.decoding = None;
        self.tally.last_number.store(-1, Ordering::Release);
        self.tally.disconnects.fetch_add(1, Ordering::AcqRel);
        tracing::warn!(label = %self.label, "frame stream lost");
        true
    }

    fn on_consume(&mut self, buffer: &[u8]) -> bool {
        let Some((dictionary, fields)) = self.decoding.as_ref() else {
            tracing::error!(label = %self.label, "buffer arrived before the dictionary");
            return false;
        };
        let records = match QueuedRecords::decode_all(buffer, dictionary) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(label = %self.label, error = %e, "undecodable frame buffer");
                return false;
            }
        };
        self.tally.buffers.fetch_add(1, Ordering::AcqRel);
        for record in &records {
            let Some(number) = record.data_int(fields.number) else {
                continue;
            };
            if !self.tally.record_number(number) {
                tracing::debug!(label = %self.label, number, "frame out of sequence");
            }
            tracing::trace!(label = %self.label, number, clock = ?record.floats(fields.clock).ok(), "frame");
        }
        true
    }

    fn on_null(&mut self) -> bool {
        self.tally.nulls.fetch_add(1, Ordering::AcqRel);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_networking::QueuedData;

    fn sealed(records: &[Record]) -> QueuedData {
        let mut queue = QueuedData::new();
        for record in records {
            queue.queue(record);
        }
        queue.swap_buffers();
        queue
    }

    #[test]
    fn test_source_numbers_frames() {
        let mut source = FrameSource::new(frame_dictionary(), "master").unwrap();
        let first = source.next_record().unwrap();
        let second = source.next_record().unwrap();
        assert_eq!(first.data_int(0), Some(0));
        assert_eq!(second.data_int(0), Some(1));
        assert_eq!(second.bytes(2).unwrap(), b"master");
        assert_eq!(source.produced(), 2);
    }

    #[test]
    fn test_source_rejects_foreign_dictionary() {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("pose").with_field("node", FieldKind::Int));
        assert!(FrameSource::new(dictionary, "master").is_err());
    }

    #[test]
    fn test_log_tallies_frames_and_gaps() {
        let dictionary = frame_dictionary();
        let tally = Arc::new(FrameTally::default());
        let mut log = FrameLog::new("render", Arc::clone(&tally));
        let mut source = FrameSource::new(dictionary.clone(), "master").unwrap();
        let records: Vec<Record> = (0..4).map(|_| source.next_record().unwrap()).collect();

        assert!(log.on_connect(&dictionary));
        assert!(log.on_consume(sealed(&records[..2]).front_buffer()));
        // Frame 2 never arrives.
        assert!(log.on_consume(sealed(&records[3..]).front_buffer()));

        let snapshot = tally.snapshot();
        assert_eq!(snapshot.frames, 3);
        assert_eq!(snapshot.buffers, 2);
        assert_eq!(snapshot.gaps, 1);
        assert_eq!(snapshot.last_number, Some(3));
    }

    #[test]
    fn test_log_needs_dictionary_first() {
        let tally = Arc::new(FrameTally::default());
        let mut log = FrameLog::new("render", Arc::clone(&tally));
        let empty = sealed(&[]);
        assert!(!log.on_consume(empty.front_buffer()));

        let mut other = Dictionary::new();
        other.add(RecordTemplate::new("pose").with_field("node", FieldKind::Int));
        assert!(!log.on_connect(&other));

        assert!(log.on_connect(&frame_dictionary()));
        assert!(log.on_consume(empty.front_buffer()));
        assert!(log.on_disconnect());
        let snapshot = tally.snapshot();
        assert_eq!(snapshot.connects, 1);
        assert_eq!(snapshot.disconnects, 1);
        assert_eq!(snapshot.last_number, None);
    }
}
