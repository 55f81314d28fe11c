//! Per-connection stream reassembly buffer.
//!
//! A contiguous byte buffer with a fixed 65536-byte capacity. Incoming bytes
//! are appended at the tail; after each successful CBOR parse the consumed
//! prefix is dropped and the remainder compacted to offset zero (a
//! `SliceDeque` head-move does this without copying the unread tail around).

use slice_deque::SliceDeque;
use std::io;

pub const STREAM_BUFFER_CAPACITY: usize = 65536;

pub struct StreamBuffer {
    data: SliceDeque<u8>,
    capacity: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::with_capacity(STREAM_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut data = SliceDeque::new();
        data.reserve(capacity);
        StreamBuffer { data, capacity }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Drops `count` bytes from the front, the compaction step run after a
    /// successful parse.
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Appends `bytes` to the buffer. Returns `Err` when doing so would push
    /// the buffer past its fixed capacity — the spec's backpressure rule: a
    /// read that overflows an already-nonempty buffer is a fatal protocol
    /// error, not a partial accept.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(io::Error::new(io::ErrorKind::Other, "stream buffer overflow"));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume_round_trips() {
        let mut buffer = StreamBuffer::new();
        buffer.append(b"hello").unwrap();
        assert_eq!(buffer.as_slice(), b"hello");
        buffer.consume(3);
        assert_eq!(buffer.as_slice(), b"lo");
    }

    #[test]
    fn append_past_capacity_is_an_overflow_error() {
        let mut buffer = StreamBuffer::with_capacity(8);
        buffer.append(&[0u8; 8]).unwrap();
        let err = buffer.append(&[0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut buffer = StreamBuffer::new();
        buffer.append(b"data").unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn consume_then_append_compacts_rather_than_overflowing() {
        let mut buffer = StreamBuffer::with_capacity(8);
        buffer.append(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        buffer.consume(8);
        buffer.append(&[9, 10, 11]).unwrap();
        assert_eq!(buffer.as_slice(), &[9, 10, 11]);
    }
}
