//! # Queued Data
//!
//! Double-buffered record queue. Producers append encoded records to the
//! back buffer; the send loop swaps and ships the front buffer as one
//! frame.
//!
//! ```text
//! queue buffer = [u32 total size][u32 record count][record frame]...
//! ```

use crate::error::{NetError, NetResult};
use crate::protocol::codec::{len_u32, peek_size, FrameReader, FRAME_HEADER_SIZE};
use crate::protocol::{Dictionary, Record};

/// Back/front record buffers.
#[derive(Debug)]
pub struct QueuedData {
    front: Vec<u8>,
    back: Vec<u8>,
    back_records: u32,
    front_records: u32,
}

impl QueuedData {
    /// Creates a queue whose front buffer is an empty frame.
    #[must_use]
    pub fn new() -> Self {
        let mut front = Vec::new();
        write_header(&mut front, 0);
        Self {
            front,
            back: empty_back(),
            back_records: 0,
            front_records: 0,
        }
    }

    /// Appends a record to the back buffer.
    pub fn queue(&mut self, record: &Record) {
        record.encode(&mut self.back);
        self.back_records += 1;
    }

    /// Appends an already encoded record frame to the back buffer.
    pub fn queue_raw(&mut self, frame: &[u8]) {
        self.back.extend_from_slice(frame);
        self.back_records += 1;
    }

    /// Bytes in the back buffer, header included.
    #[inline]
    #[must_use]
    pub fn back_buffer_size(&self) -> usize {
        self.back.len()
    }

    /// Records waiting in the back buffer.
    #[inline]
    #[must_use]
    pub const fn back_record_count(&self) -> u32 {
        self.back_records
    }

    /// Seals the back buffer and makes it the front. The old front is
    /// reused as the new, empty back buffer.
    pub fn swap_buffers(&mut self) {
        let size = len_u32(self.back.len());
        self.back[0..4].copy_from_slice(&size.to_le_bytes());
        self.back[4..8].copy_from_slice(&self.back_records.to_le_bytes());
        std::mem::swap(&mut self.front, &mut self.back);
        self.front_records = self.back_records;

        self.back.clear();
        write_header(&mut self.back, 0);
        self.back_records = 0;
    }

    /// The sealed front frame.
    #[inline]
    #[must_use]
    pub fn front_buffer(&self) -> &[u8] {
        &self.front
    }

    /// Bytes in the front frame.
    #[inline]
    #[must_use]
    pub fn front_buffer_size(&self) -> usize {
        self.front.len()
    }

    /// Records in the front frame.
    #[inline]
    #[must_use]
    pub const fn front_record_count(&self) -> u32 {
        self.front_records
    }
}

impl Default for QueuedData {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_back() -> Vec<u8> {
    let mut back = Vec::new();
    write_header(&mut back, 0);
    back
}

fn write_header(out: &mut Vec<u8>, count: u32) {
    out.extend_from_slice(&len_u32(FRAME_HEADER_SIZE).to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
}

/// Iterator over the record frames inside one queue buffer.
///
/// # Example
///
/// ```rust,ignore
/// for frame in QueuedRecords::new(buffer)? {
///     let record = Record::decode(frame?, &dictionary)?;
/// }
/// ```
pub struct QueuedRecords<'a> {
    reader: FrameReader<'a>,
    buffer: &'a [u8],
    remaining: u32,
}

impl<'a> QueuedRecords<'a> {
    /// Validates the queue header.
    pub fn new(buffer: &'a [u8]) -> NetResult<Self> {
        let mut reader = FrameReader::new(buffer);
        let size = reader.read_u32()? as usize;
        if size != buffer.len() {
            return Err(NetError::Truncated {
                needed: size,
                available: buffer.len(),
            });
        }
        let remaining = reader.read_u32()?;
        Ok(Self {
            reader,
            buffer,
            remaining,
        })
    }

    /// Records not yet yielded.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Decodes every record against `dictionary`.
    pub fn decode_all(buffer: &[u8], dictionary: &Dictionary) -> NetResult<Vec<Record>> {
        QueuedRecords::new(buffer)?
            .map(|frame| Record::decode(frame?, dictionary))
            .collect()
    }
}

impl<'a> Iterator for QueuedRecords<'a> {
    type Item = NetResult<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let start = self.reader.position();
        let Some(size) = peek_size(&self.buffer[start..]) else {
            self.remaining = 0;
            return Some(Err(NetError::Truncated {
                needed: 4,
                available: self.buffer.len() - start,
            }));
        };
        match self.reader.read_bytes(size) {
            Ok(frame) if size >= FRAME_HEADER_SIZE => Some(Ok(frame)),
            Ok(_) => {
                self.remaining = 0;
                Some(Err(NetError::BadFrameSize {
                    size,
                    min: FRAME_HEADER_SIZE,
                    max: self.buffer.len() - start,
                }))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldKind, RecordTemplate};

    fn dictionary() -> Dictionary {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("tick").with_field("n", FieldKind::Int));
        dictionary
    }

    fn tick(dictionary: &Dictionary, n: i32) -> Record {
        let mut record = Record::from_dictionary(dictionary, "tick").unwrap();
        record.set_ints(0, &[n]).unwrap();
        record
    }

    #[test]
    fn test_empty_front_is_valid_frame() {
        let queue = QueuedData::new();
        assert_eq!(queue.front_buffer_size(), FRAME_HEADER_SIZE);
        assert_eq!(QueuedRecords::new(queue.front_buffer()).unwrap().count(), 0);
    }

    #[test]
    fn test_swap_seals_back_buffer() {
        let dictionary = dictionary();
        let mut queue = QueuedData::new();
        queue.queue(&tick(&dictionary, 1));
        queue.queue(&tick(&dictionary, 2));
        assert_eq!(queue.back_record_count(), 2);

        queue.swap_buffers();
        assert_eq!(queue.back_buffer_size(), FRAME_HEADER_SIZE);
        assert_eq!(queue.front_record_count(), 2);
        assert_eq!(peek_size(queue.front_buffer()), Some(queue.front_buffer_size()));

        let records = QueuedRecords::decode_all(queue.front_buffer(), &dictionary).unwrap();
        let values: Vec<_> = records.iter().map(|r| r.data_int(0).unwrap()).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_records_queued_after_swap_wait_for_next_frame() {
        let dictionary = dictionary();
        let mut queue = QueuedData::new();
        queue.queue(&tick(&dictionary, 1));
        queue.swap_buffers();
        queue.queue(&tick(&dictionary, 2));

        let front = QueuedRecords::decode_all(queue.front_buffer(), &dictionary).unwrap();
        assert_eq!(front.len(), 1);

        queue.swap_buffers();
        let front = QueuedRecords::decode_all(queue.front_buffer(), &dictionary).unwrap();
        assert_eq!(front[0].data_int(0), Some(2));
    }

    #[test]
    fn test_truncated_queue_is_an_error() {
        let dictionary = dictionary();
        let mut queue = QueuedData::new();
        queue.queue(&tick(&dictionary, 1));
        queue.swap_buffers();

        let mut bytes = queue.front_buffer().to_vec();
        // Claim two records while carrying one.
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        let results: Vec<_> = QueuedRecords::new(&bytes).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
