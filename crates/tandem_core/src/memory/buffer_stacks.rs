//! # Buffer Stacks
//!
//! The storage / receive / consume rotation behind double-buffered frame
//! delivery. One reader thread takes storage buffers, fills them and pushes
//! them to the receive stack in arrival order. One consumer thread moves
//! them to the consume stack, processes them outside the lock, and hands
//! them back to storage.
//!
//! Every transition happens under one lock, so at any instant each buffer
//! sits on exactly one stack (or is held by exactly one thread).

use parking_lot::Mutex;
use std::collections::VecDeque;

/// How many received buffers a consume step takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Drain {
    /// Only the oldest received buffer.
    One,
    /// Every received buffer, oldest first.
    All,
}

/// Snapshot of where the buffers are.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Buffers ready for the reader.
    pub storage: usize,
    /// Filled buffers waiting for the consumer.
    pub received: usize,
    /// Buffers currently checked out by the consumer.
    pub consuming: usize,
    /// Buffers checked out by the reader.
    pub reading: usize,
    /// Buffers ever allocated.
    pub allocated: usize,
}

impl BufferStats {
    /// True when every allocated buffer is accounted for.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.storage + self.received + self.consuming + self.reading == self.allocated
    }
}

#[derive(Default)]
struct Stacks {
    storage: Vec<Vec<u8>>,
    received: VecDeque<Vec<u8>>,
    consuming: usize,
    reading: usize,
    allocated: usize,
}

/// Recycling storage / receive / consume stacks.
///
/// # Example
///
/// ```rust,ignore
/// let stacks = BufferStacks::new(10_000);
/// let mut buffer = stacks.take_storage();
/// buffer.extend_from_slice(b"frame");
/// stacks.push_received(buffer);
///
/// let batch = stacks.begin_consume(Drain::One);
/// assert_eq!(batch[0], b"frame");
/// stacks.finish_consume(batch);
/// ```
pub struct BufferStacks {
    inner: Mutex<Stacks>,
    initial_size: usize,
}

impl BufferStacks {
    /// Creates empty stacks. New buffers start with `initial_size` capacity.
    #[must_use]
    pub fn new(initial_size: usize) -> Self {
        Self {
            inner: Mutex::new(Stacks::default()),
            initial_size,
        }
    }

    /// Takes an empty buffer for the reader, allocating if storage is dry.
    pub fn take_storage(&self) -> Vec<u8> {
        let mut stacks = self.inner.lock();
        stacks.reading += 1;
        if let Some(mut buffer) = stacks.storage.pop() {
            buffer.clear();
            buffer
        } else {
            stacks.allocated += 1;
            Vec::with_capacity(self.initial_size)
        }
    }

    /// Pushes a filled buffer onto the receive stack.
    pub fn push_received(&self, buffer: Vec<u8>) {
        let mut stacks = self.inner.lock();
        stacks.reading = stacks.reading.saturating_sub(1);
        stacks.received.push_back(buffer);
    }

    /// Returns a reader buffer unused, e.g. after a failed read.
    pub fn recycle(&self, buffer: Vec<u8>) {
        let mut stacks = self.inner.lock();
        stacks.reading = stacks.reading.saturating_sub(1);
        stacks.storage.push(buffer);
    }

    /// Moves every pending received buffer back to storage.
    ///
    /// Returns how many buffers were discarded.
    pub fn recycle_received(&self) -> usize {
        let mut stacks = self.inner.lock();
        let count = stacks.received.len();
        while let Some(buffer) = stacks.received.pop_front() {
            stacks.storage.push(buffer);
        }
        count
    }

    /// Checks out received buffers for the consumer, oldest first.
    ///
    /// The batch must come back through [`BufferStacks::finish_consume`].
    pub fn begin_consume(&self, drain: Drain) -> Vec<Vec<u8>> {
        let mut stacks = self.inner.lock();
        let take = match drain {
            Drain::One => stacks.received.len().min(1),
            Drain::All => stacks.received.len(),
        };
        let batch: Vec<Vec<u8>> = stacks.received.drain(..take).collect();
        stacks.consuming += batch.len();
        batch
    }

    /// Returns a consumed batch to storage.
    pub fn finish_consume(&self, batch: Vec<Vec<u8>>) {
        let mut stacks = self.inner.lock();
        stacks.consuming = stacks.consuming.saturating_sub(batch.len());
        stacks.storage.extend(batch);
    }

    /// Number of filled buffers waiting for the consumer.
    #[must_use]
    pub fn received_len(&self) -> usize {
        self.inner.lock().received.len()
    }

    /// Current distribution of buffers.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let stacks = self.inner.lock();
        BufferStats {
            storage: stacks.storage.len(),
            received: stacks.received.len(),
            consuming: stacks.consuming,
            reading: stacks.reading,
            allocated: stacks.allocated,
        }
    }
}

impl std::fmt::Debug for BufferStacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStacks")
            .field("initial_size", &self.initial_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(stacks: &BufferStacks, tag: u8) {
        let mut buffer = stacks.take_storage();
        buffer.push(tag);
        stacks.push_received(buffer);
    }

    #[test]
    fn test_lazy_allocation_and_reuse() {
        let stacks = BufferStacks::new(64);
        let buffer = stacks.take_storage();
        assert!(buffer.capacity() >= 64);
        stacks.recycle(buffer);

        let again = stacks.take_storage();
        assert!(again.is_empty());
        stacks.recycle(again);
        assert_eq!(stacks.stats().allocated, 1);
    }

    #[test]
    fn test_consume_one_is_fifo() {
        let stacks = BufferStacks::new(8);
        filled(&stacks, 1);
        filled(&stacks, 2);
        filled(&stacks, 3);

        for expected in 1..=3u8 {
            let batch = stacks.begin_consume(Drain::One);
            assert_eq!(batch, vec![vec![expected]]);
            stacks.finish_consume(batch);
        }
        assert!(stacks.begin_consume(Drain::One).is_empty());
    }

    #[test]
    fn test_consume_all_drains_in_order() {
        let stacks = BufferStacks::new(8);
        filled(&stacks, 1);
        filled(&stacks, 2);
        filled(&stacks, 3);

        let batch = stacks.begin_consume(Drain::All);
        assert_eq!(batch, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(stacks.stats().consuming, 3);
        stacks.finish_consume(batch);
        assert_eq!(stacks.received_len(), 0);
    }

    #[test]
    fn test_recycle_received_discards_pending() {
        let stacks = BufferStacks::new(8);
        filled(&stacks, 1);
        filled(&stacks, 2);
        assert_eq!(stacks.recycle_received(), 2);
        assert_eq!(stacks.received_len(), 0);
        assert_eq!(stacks.stats().storage, 2);
    }

    #[test]
    fn test_accounting_stays_balanced() {
        let stacks = BufferStacks::new(8);
        let reading = stacks.take_storage();
        filled(&stacks, 1);
        filled(&stacks, 2);
        let batch = stacks.begin_consume(Drain::One);

        let stats = stacks.stats();
        assert!(stats.is_balanced());
        assert_eq!(stats.reading, 1);
        assert_eq!(stats.consuming, 1);

        stacks.finish_consume(batch);
        stacks.recycle(reading);
        stacks.recycle_received();
        let stats = stacks.stats();
        assert!(stats.is_balanced());
        assert_eq!(stats.storage, stats.allocated);
    }
}
