//! Circular replay buffer for late-joining viewers.

use bytes::Bytes;

/// Default replay window (32 MiB).
pub const DEFAULT_REPLAY_CAPACITY: usize = 32 * 1024 * 1024;

/// A fixed-capacity byte ring that always holds the most recent bytes.
///
/// Storage grows on demand up to `capacity` and is then reused in place;
/// once full, every write overwrites the oldest bytes first. This buffer
/// has no internal locking; the relay guards it with its own lock.
pub struct ReplayBuffer {
    /// Backing storage. Its length only grows until it reaches `capacity`.
    buffer: Vec<u8>,
    /// Maximum number of bytes retained.
    capacity: usize,
    /// Position of the oldest byte once the buffer is full.
    head: usize,
}

impl ReplayBuffer {
    /// Create an empty buffer retaining at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
            head: 0,
        }
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn is_full(&self) -> bool {
        self.capacity > 0 && self.buffer.len() == self.capacity
    }

    /// Append data, discarding the oldest bytes on overflow.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }

        // Only the tail of an oversized write can survive.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let mut rest = data;
        if !self.is_full() {
            let room = self.capacity - self.buffer.len();
            let n = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if rest.is_empty() {
                return;
            }
            // Just became full; oldest byte is at index 0.
            self.head = 0;
        }

        let first_chunk = rest.len().min(self.capacity - self.head);
        self.buffer[self.head..self.head + first_chunk].copy_from_slice(&rest[..first_chunk]);
        let second_chunk = rest.len() - first_chunk;
        if second_chunk > 0 {
            self.buffer[..second_chunk].copy_from_slice(&rest[first_chunk..]);
        }
        self.head = (self.head + rest.len()) % self.capacity;
    }

    /// Copy out the retained bytes, oldest first.
    pub fn snapshot(&self) -> Bytes {
        if !self.is_full() || self.head == 0 {
            return Bytes::copy_from_slice(&self.buffer);
        }

        let mut out = Vec::with_capacity(self.buffer.len());
        out.extend_from_slice(&self.buffer[self.head..]);
        out.extend_from_slice(&self.buffer[..self.head]);
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_snapshot() {
        let mut buffer = ReplayBuffer::new(16);
        buffer.write(b"hello ");
        buffer.write(b"world");

        assert_eq!(buffer.len(), 11);
        assert_eq!(&buffer.snapshot()[..], b"hello world");
    }

    #[test]
    fn test_wrap_around_keeps_order() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.write(b"012345");
        buffer.write(b"6789");
        assert_eq!(&buffer.snapshot()[..], b"23456789");

        buffer.write(b"abc");
        assert_eq!(&buffer.snapshot()[..], b"56789abc");
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_oversized_write() {
        let mut buffer = ReplayBuffer::new(4);
        buffer.write(b"xy");
        buffer.write(b"0123456789");
        assert_eq!(&buffer.snapshot()[..], b"6789");

        buffer.write(b"A");
        assert_eq!(&buffer.snapshot()[..], b"789A");
    }

    #[test]
    fn test_many_small_writes() {
        let mut buffer = ReplayBuffer::new(188 * 3);
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let packet = [i; 188];
            buffer.write(&packet);
            expected.extend_from_slice(&packet);
        }
        let tail = &expected[expected.len() - 188 * 3..];
        assert_eq!(&buffer.snapshot()[..], tail);
    }

    #[test]
    fn test_zero_capacity() {
        let mut disabled = ReplayBuffer::new(0);
        disabled.write(b"ignored");
        assert!(disabled.is_empty());
        assert!(disabled.snapshot().is_empty());
    }
}
