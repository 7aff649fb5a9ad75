//! Sender-side byte buffer.

use bytes::{Buf, Bytes, BytesMut};

/// Bytes written by the application and not yet acknowledged.
///
/// Offsets are absolute stream offsets. `base` is the oldest unacknowledged
/// byte, `next` the next byte to transmit.
#[derive(Debug)]
pub struct SendBuffer {
    data: BytesMut,
    base: u64,
    next: u64,
    capacity: usize,
}

impl SendBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::new(),
            base: 0,
            next: 0,
            capacity,
        }
    }

    /// Oldest unacknowledged offset.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Next offset to transmit.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Offset just past the last written byte.
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// Room left for writes.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Written bytes not transmitted yet.
    pub fn unsent(&self) -> usize {
        (self.end() - self.next) as usize
    }

    /// Whether every written byte was acknowledged.
    pub fn is_drained(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy as much of `bytes` as fits. Returns the count taken.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free_space());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Next segment to transmit, at most `max` bytes and never reaching
    /// `limit`.
    pub fn next_segment(&mut self, max: usize, limit: u64) -> Option<(u64, Bytes)> {
        let stop = self.end().min(limit);
        if stop <= self.next {
            return None;
        }
        let len = ((stop - self.next) as usize).min(max);
        let start = (self.next - self.base) as usize;
        let offset = self.next;
        self.next += len as u64;
        Some((offset, Bytes::copy_from_slice(&self.data[start..start + len])))
    }

    /// Release everything below `ack`.
    pub fn ack(&mut self, ack: u64) {
        let ack = ack.min(self.end());
        if ack <= self.base {
            return;
        }
        self.data.advance((ack - self.base) as usize);
        self.base = ack;
        if self.next < self.base {
            self.next = self.base;
        }
    }

    /// Go back to the oldest unacknowledged byte.
    pub fn rewind(&mut self) {
        self.next = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_capacity() {
        let mut buffer = SendBuffer::new(8);
        assert_eq!(buffer.push(b"hello"), 5);
        assert_eq!(buffer.push(b"world"), 3);
        assert_eq!(buffer.free_space(), 0);
        assert_eq!(buffer.end(), 8);
    }

    #[test]
    fn test_segments_and_limit() {
        let mut buffer = SendBuffer::new(64);
        buffer.push(b"abcdefghij");

        assert_eq!(buffer.next_segment(4, u64::MAX), Some((0, Bytes::from_static(b"abcd"))));
        assert_eq!(buffer.next_segment(4, 6), Some((4, Bytes::from_static(b"ef"))));
        assert_eq!(buffer.next_segment(4, 6), None);
        assert_eq!(buffer.unsent(), 4);
    }

    #[test]
    fn test_ack_releases_space() {
        let mut buffer = SendBuffer::new(4);
        buffer.push(b"abcd");
        buffer.next_segment(4, u64::MAX);

        buffer.ack(3);
        assert_eq!(buffer.base(), 3);
        assert_eq!(buffer.free_space(), 3);
        assert!(!buffer.is_drained());

        // Ack past the end (a FIN) only drains what exists.
        buffer.ack(5);
        assert_eq!(buffer.base(), 4);
        assert!(buffer.is_drained());
    }

    #[test]
    fn test_rewind_resends_from_base() {
        let mut buffer = SendBuffer::new(64);
        buffer.push(b"abcdef");
        buffer.next_segment(3, u64::MAX);
        buffer.next_segment(3, u64::MAX);
        buffer.ack(2);

        buffer.rewind();
        assert_eq!(buffer.next_segment(64, u64::MAX), Some((2, Bytes::from_static(b"cdef"))));
    }
}
