//! Contiguous-view, capacity-capped byte buffer backing socket read/write
//! queues (spec §3/§4.1, component C1).

use crate::error::{Error, Result};

/// A growable byte queue with an optional capacity cap.
///
/// `capacity == 0` means "unlimited until allocation fails", matching the
/// spec's convention. Reads and writes operate on a `Vec<u8>` with a read
/// cursor; `peek_all` compacts the backing storage so the returned slice is
/// always contiguous and valid until the next mutating call, the same
/// tradeoff the teacher's `net::Buffer` makes for its readable/writable
/// views.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<u8>,
    read_pos: usize,
    capacity: usize,
}

impl RingBuffer {
    /// Creates an empty buffer. `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            read_pos: 0,
            capacity,
        }
    }

    /// Bytes currently stored and not yet read.
    pub fn size(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `src` to the buffer. Fails with [`Error::Capacity`] if the
    /// append would exceed a nonzero capacity. A zero-length write is
    /// always a no-op success.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        if self.capacity > 0 && self.size() + src.len() > self.capacity {
            return Err(Error::Capacity);
        }
        // Compact before growing unboundedly behind a read cursor that has
        // drifted far from the front.
        if self.read_pos > 0 && self.read_pos == self.data.len() {
            self.data.clear();
            self.read_pos = 0;
        }
        self.data.extend_from_slice(src);
        Ok(())
    }

    /// Copies up to `dst.len()` bytes out, advancing the read cursor.
    /// Returns the number of bytes copied; 0 when empty.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let available = self.size();
        let n = dst.len().min(available);
        if n == 0 {
            return 0;
        }
        dst[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        if self.read_pos == self.data.len() {
            self.data.clear();
            self.read_pos = 0;
        }
        n
    }

    /// Returns a contiguous view of the unread content. Compacts the
    /// backing storage (dropping already-read bytes) to guarantee
    /// contiguity; the returned slice is valid until the next mutating
    /// call.
    pub fn peek_all(&mut self) -> &[u8] {
        if self.read_pos > 0 {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
        &self.data
    }

    /// Drops all buffered content; capacity is preserved.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Advances the read cursor by `n` bytes without copying them out, used
    /// after a caller has consumed a `peek_all` view directly.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.size());
        self.read_pos += n;
        if self.read_pos == self.data.len() {
            self.data.clear();
            self.read_pos = 0;
        }
    }

    /// Changes the capacity cap. Fails with [`Error::Configuration`] when
    /// shrinking below the current size (unless the new cap is 0,
    /// meaning unlimited).
    pub fn set_capacity(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity != 0 && self.size() > new_capacity {
            return Err(Error::configuration(
                "cannot shrink buffer capacity below current size",
            ));
        }
        self.capacity = new_capacity;
        Ok(())
    }

    /// Appends directly from a reader, up to the remaining capacity (or
    /// unboundedly when `capacity == 0`), used by [`crate::channel::IoChannel`]'s
    /// read loop which wants to avoid an intermediate copy per syscall.
    pub fn write_from<R: std::io::Read>(&mut self, mut reader: R, max: usize) -> std::io::Result<usize> {
        let start = self.data.len();
        self.data.resize(start + max, 0);
        match reader.read(&mut self.data[start..]) {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// Remaining room before a nonzero capacity is hit; `usize::MAX` when
    /// unbounded.
    pub fn remaining_capacity(&self) -> usize {
        if self.capacity == 0 {
            usize::MAX
        } else {
            self.capacity.saturating_sub(self.size())
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn write_then_read_preserves_order_and_bytes() {
        let mut buf = RingBuffer::new(0);
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        let mut out = [0u8; 11];
        let n = buf.read(&mut out);
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn zero_length_write_is_noop() {
        let mut buf = RingBuffer::new(4);
        buf.write(&[]).unwrap();
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn read_when_empty_returns_zero() {
        let mut buf = RingBuffer::new(0);
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 0);
    }

    #[test]
    fn write_exactly_at_capacity_succeeds_one_more_fails() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcd").unwrap();
        assert_eq!(buf.size(), 4);
        let err = buf.write(b"e").unwrap_err();
        assert!(matches!(err, Error::Capacity));
    }

    #[test]
    fn peek_all_is_contiguous_after_partial_read() {
        let mut buf = RingBuffer::new(0);
        buf.write(b"abcdef").unwrap();
        let mut out = [0u8; 2];
        buf.read(&mut out);
        assert_eq!(buf.peek_all(), b"cdef");
    }

    #[test]
    fn clear_preserves_capacity() {
        let mut buf = RingBuffer::new(10);
        buf.write(b"abc").unwrap();
        buf.clear();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.capacity(), 10);
    }

    #[test]
    fn set_capacity_rejects_shrink_below_size() {
        let mut buf = RingBuffer::new(0);
        buf.write(b"abcdef").unwrap();
        assert!(buf.set_capacity(3).is_err());
        assert!(buf.set_capacity(6).is_ok());
        assert!(buf.set_capacity(0).is_ok());
    }

    proptest! {
        /// Any sequence of writes, interleaved with partial reads, must come
        /// back out in the same order and with the same bytes as a plain
        /// `VecDeque` reference model (spec §8 "Quantified invariants":
        /// buffer never reorders or drops bytes it accepted).
        #[test]
        fn write_read_matches_reference_queue(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..16)) {
            let mut buf = RingBuffer::new(0);
            let mut reference: std::collections::VecDeque<u8> = std::collections::VecDeque::new();
            for chunk in &chunks {
                buf.write(chunk).unwrap();
                reference.extend(chunk);
                if reference.len() > 3 {
                    let mut out = vec![0u8; 3];
                    let n = buf.read(&mut out);
                    for b in out.iter().take(n) {
                        prop_assert_eq!(Some(*b), reference.pop_front());
                    }
                }
            }
            let remaining: Vec<u8> = reference.into_iter().collect();
            prop_assert_eq!(buf.peek_all(), remaining.as_slice());
        }

        /// A capacity-capped buffer never exceeds the cap and never silently
        /// drops a write it accepted (spec §8 "Boundary behaviors": writes
        /// either fully succeed or fully fail, never partially apply).
        #[test]
        fn capped_writes_never_exceed_capacity(cap in 1usize..64, chunk_lens in prop::collection::vec(0usize..20, 0..20)) {
            let mut buf = RingBuffer::new(cap);
            for len in chunk_lens {
                let chunk = vec![0xAAu8; len];
                let before = buf.size();
                match buf.write(&chunk) {
                    Ok(()) => prop_assert_eq!(buf.size(), before + len),
                    Err(Error::Capacity) => prop_assert_eq!(buf.size(), before),
                    Err(e) => prop_assert!(false, "unexpected error: {e:?}"),
                }
                prop_assert!(buf.size() <= cap);
            }
        }
    }
}
