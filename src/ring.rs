//! Fixed-slot ring buffer
//!
//! Backing store for message queues. Items are `item_size` bytes; the
//! producer and consumer cursors wrap at `capacity`. A zero item size is a
//! counting semaphore: the count moves, memory is never touched.
//!
//! No atomics: every access happens inside the kernel critical section.
//!
//! Author: Moroya Sakamoto

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::QUEUE_MAX_BYTES;
use crate::error::{Error, Result};

/// Ring of equally sized slots
pub(crate) struct SlotRing {
    storage: Box<[u8]>,
    item_size: usize,
    capacity: usize,
    /// Next slot to write
    producer: usize,
    /// Next slot to read
    consumer: usize,
    /// Items currently held
    count: usize,
}

impl SlotRing {
    /// Allocate storage for `capacity` items
    pub(crate) fn new(item_size: usize, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument);
        }
        let bytes = item_size
            .checked_mul(capacity)
            .ok_or(Error::InvalidArgument)?;
        if bytes > QUEUE_MAX_BYTES {
            return Err(Error::OutOfMemory);
        }

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| Error::OutOfMemory)?;
        buffer.resize(bytes, 0u8);

        Ok(Self {
            storage: buffer.into_boxed_slice(),
            item_size,
            capacity,
            producer: 0,
            consumer: 0,
            count: 0,
        })
    }

    /// Copy `item` into the producer slot
    pub(crate) fn push(&mut self, item: &[u8]) {
        assert!(
            self.count < self.capacity,
            "push to a full ring ({} of {})",
            self.count,
            self.capacity
        );
        if !self.is_semaphore() {
            let start = self.producer * self.item_size;
            self.storage[start..start + self.item_size].copy_from_slice(item);
        }
        self.producer = (self.producer + 1) % self.capacity;
        self.count += 1;
    }

    /// Copy the consumer slot into `out`
    pub(crate) fn pop(&mut self, out: &mut [u8]) {
        assert!(self.count > 0, "pop from an empty ring");
        if !self.is_semaphore() {
            let start = self.consumer * self.item_size;
            out.copy_from_slice(&self.storage[start..start + self.item_size]);
        }
        self.consumer = (self.consumer + 1) % self.capacity;
        self.count -= 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub(crate) fn item_size(&self) -> usize {
        self.item_size
    }

    pub(crate) fn is_semaphore(&self) -> bool {
        self.item_size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let mut ring = SlotRing::new(4, 3).unwrap();
        for v in [1u32, 2, 3] {
            ring.push(&v.to_le_bytes());
        }
        assert!(ring.is_full());

        let mut out = [0u8; 4];
        for v in [1u32, 2, 3] {
            ring.pop(&mut out);
            assert_eq!(u32::from_le_bytes(out), v);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let mut ring = SlotRing::new(1, 2).unwrap();
        let mut out = [0u8; 1];
        for v in 0u8..10 {
            ring.push(&[v]);
            ring.pop(&mut out);
            assert_eq!(out[0], v);
        }
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_semaphore_mode_counts_only() {
        let mut ring = SlotRing::new(0, 2).unwrap();
        assert!(ring.is_semaphore());
        ring.push(&[]);
        ring.push(&[]);
        assert!(ring.is_full());
        ring.pop(&mut []);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_bad_sizes() {
        assert!(matches!(SlotRing::new(4, 0), Err(Error::InvalidArgument)));
        assert!(matches!(SlotRing::new(usize::MAX, 2), Err(Error::InvalidArgument)));
        assert!(matches!(
            SlotRing::new(QUEUE_MAX_BYTES, 2),
            Err(Error::OutOfMemory)
        ));
    }

    #[test]
    #[should_panic(expected = "full ring")]
    fn test_push_full_panics() {
        let mut ring = SlotRing::new(1, 1).unwrap();
        ring.push(&[1]);
        ring.push(&[2]);
    }
}
