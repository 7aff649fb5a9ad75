//! Receiver-side reordering.
//!
//! Segments may arrive out of order, duplicated or overlapping. The reorder
//! buffer keeps them keyed by byte offset and moves them into the readable
//! queue once the gap before them closes, so the application only ever sees
//! a gap-free, duplicate-free byte sequence.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};

/// Reorder buffer keyed by byte offset
#[derive(Debug)]
pub struct ReorderBuffer {
    /// Next expected offset
    next: u64,
    /// Segments past a gap
    pending: BTreeMap<u64, Bytes>,
    /// In-order bytes the application has not read yet
    ready: BytesMut,
    /// Final offset announced by the peer
    fin: Option<u64>,
    capacity: usize,
}

impl ReorderBuffer {
    /// Create a buffer advertising `capacity` bytes of window
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            ready: BytesMut::new(),
            fin: None,
            capacity,
        }
    }

    /// Insert a segment
    ///
    /// Returns the number of new in-order bytes it made readable.
    pub fn insert(&mut self, offset: u64, payload: Bytes) -> usize {
        let Some(end) = offset.checked_add(payload.len() as u64) else {
            return 0;
        };
        if payload.is_empty() || end <= self.next {
            return 0;
        }
        // Beyond the window we advertised.
        if offset >= self.window_end() {
            return 0;
        }
        // Past the peer's own FIN.
        if self.fin.is_some_and(|fin| end > fin) {
            return 0;
        }

        match self.pending.get(&offset) {
            Some(existing) if existing.len() >= payload.len() => {}
            _ => {
                self.pending.insert(offset, payload);
            }
        }

        let before = self.next;
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.next {
                break;
            }
            let mut segment = entry.remove();
            let seg_end = start + segment.len() as u64;
            if seg_end <= self.next {
                continue;
            }
            segment.advance((self.next - start) as usize);
            self.next = seg_end;
            self.ready.extend_from_slice(&segment);
        }
        (self.next - before) as usize
    }

    /// Record the peer's final offset
    ///
    /// Returns false for an offset behind the data already delivered or past
    /// the advertised window; such a FIN is ignored.
    pub fn set_fin(&mut self, offset: u64) -> bool {
        if let Some(fin) = self.fin {
            return fin == offset;
        }
        if offset < self.next || offset > self.window_end() {
            return false;
        }
        self.fin = Some(offset);
        true
    }

    fn window_end(&self) -> u64 {
        self.next.saturating_add(self.capacity as u64)
    }

    /// Whether every byte up to the peer's FIN arrived
    pub fn is_finished(&self) -> bool {
        self.fin == Some(self.next)
    }

    /// Finished and drained by the application
    pub fn at_eof(&self) -> bool {
        self.is_finished() && self.ready.is_empty()
    }

    /// Cumulative ack to send; the FIN counts as one sequence number
    pub fn ack_number(&self) -> u64 {
        if self.is_finished() {
            self.next + 1
        } else {
            self.next
        }
    }

    /// Free buffer space to advertise
    pub fn window(&self) -> u32 {
        self.capacity.saturating_sub(self.ready.len()) as u32
    }

    /// Readable bytes
    pub fn available(&self) -> usize {
        self.ready.len()
    }

    /// Take up to `max` readable bytes
    pub fn read(&mut self, max: usize) -> Bytes {
        let n = max.min(self.ready.len());
        self.ready.split_to(n).freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[test]
    fn test_in_order() {
        let mut buffer = ReorderBuffer::new(1024);
        assert_eq!(buffer.insert(0, seg(b"hello ")), 6);
        assert_eq!(buffer.insert(6, seg(b"world")), 5);
        assert_eq!(buffer.read(64), seg(b"hello world"));
        assert_eq!(buffer.ack_number(), 11);
    }

    #[test]
    fn test_reordered() {
        let mut buffer = ReorderBuffer::new(1024);
        assert_eq!(buffer.insert(6, seg(b"world")), 0);
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.ack_number(), 0);

        assert_eq!(buffer.insert(0, seg(b"hello ")), 11);
        assert_eq!(buffer.read(64), seg(b"hello world"));
    }

    #[test]
    fn test_duplicates_and_overlap() {
        let mut buffer = ReorderBuffer::new(1024);
        buffer.insert(0, seg(b"abcd"));
        assert_eq!(buffer.insert(0, seg(b"abcd")), 0);
        assert_eq!(buffer.insert(2, seg(b"cdef")), 2);
        assert_eq!(buffer.insert(8, seg(b"ij")), 0);
        assert_eq!(buffer.insert(5, seg(b"fgh")), 4);
        assert_eq!(buffer.read(64), seg(b"abcdefghij"));
    }

    #[test]
    fn test_window_shrinks_until_read() {
        let mut buffer = ReorderBuffer::new(8);
        buffer.insert(0, seg(b"abcdef"));
        assert_eq!(buffer.window(), 2);

        assert_eq!(buffer.read(4), seg(b"abcd"));
        assert_eq!(buffer.window(), 6);
    }

    #[test]
    fn test_rejects_beyond_window() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(buffer.insert(4, seg(b"zz")), 0);
        assert_eq!(buffer.insert(0, seg(b"ab")), 2);
        assert_eq!(buffer.available(), 2);
    }

    #[test]
    fn test_fin_after_gap() {
        let mut buffer = ReorderBuffer::new(64);
        buffer.insert(3, seg(b"def"));
        buffer.set_fin(6);
        assert!(!buffer.is_finished());

        buffer.insert(0, seg(b"abc"));
        assert!(buffer.is_finished());
        assert!(!buffer.at_eof());
        assert_eq!(buffer.ack_number(), 7);

        buffer.read(64);
        assert!(buffer.at_eof());
    }

    #[test]
    fn test_offset_near_max_is_dropped() {
        let mut buffer = ReorderBuffer::new(1024);
        assert_eq!(buffer.insert(u64::MAX - 2, seg(b"abcdef")), 0);
        assert_eq!(buffer.insert(u64::MAX, seg(b"a")), 0);
        assert_eq!(buffer.ack_number(), 0);

        assert_eq!(buffer.insert(0, seg(b"ok")), 2);
        assert_eq!(buffer.read(64), seg(b"ok"));
    }

    #[test]
    fn test_bogus_fin_ignored() {
        let mut buffer = ReorderBuffer::new(64);
        buffer.insert(0, seg(b"abcd"));
        assert!(!buffer.set_fin(2));
        assert!(!buffer.set_fin(u64::MAX));
        assert!(!buffer.is_finished());

        assert!(buffer.set_fin(6));
        assert!(!buffer.set_fin(9));
        assert_eq!(buffer.insert(4, seg(b"efgh")), 0);
        assert_eq!(buffer.insert(4, seg(b"ef")), 2);
        assert!(buffer.is_finished());
        assert_eq!(buffer.ack_number(), 7);
    }
}
