//! Growable circular byte buffer.
//!
//! Holds everything received from the transport that the line syntax has not
//! consumed yet. Data is appended at the tail and drained from the head; reads
//! hand out direct slices which stop at the physical wrap point, so callers
//! walking the buffer re-fetch once they cross [`RingBuffer::len_no_wrap`].

use std::collections::TryReserveError;

/// Initial capacity of a new ring buffer.
pub const DEFAULT_CAPACITY: usize = 4096;

/// A circular byte buffer that grows on demand.
#[derive(Debug)]
pub struct RingBuffer {
    /// Backing store; its length is the capacity and always a power of two.
    storage: Vec<u8>,
    /// Physical index of the first buffered byte.
    head: usize,
    /// Number of buffered bytes.
    len: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    /// Create a buffer with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a buffer holding at least `capacity` bytes before it grows.
    pub fn with_capacity(capacity: usize) -> Self {
        RingBuffer {
            storage: vec![0; capacity.max(1).next_power_of_two()],
            head: 0,
            len: 0,
        }
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no data.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Free space before the buffer has to grow.
    pub fn avail(&self) -> usize {
        self.capacity() - self.len
    }

    /// Number of buffered bytes before the physical wrap point.
    pub fn len_no_wrap(&self) -> usize {
        self.len.min(self.capacity() - self.head)
    }

    /// Append bytes at the tail, growing the backing store if needed.
    ///
    /// Growing preserves byte order. Allocation failure leaves the buffer
    /// untouched.
    pub fn append(&mut self, data: &[u8]) -> Result<(), TryReserveError> {
        if data.len() > self.avail() {
            self.grow(self.len + data.len())?;
        }

        let cap = self.capacity();
        let tail = (self.head + self.len) & (cap - 1);
        let first = data.len().min(cap - tail);
        self.storage[tail..tail + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();

        Ok(())
    }

    /// Direct view of the buffered data starting `offset` bytes after the head.
    ///
    /// The slice ends at the physical wrap point or at the end of the data,
    /// whichever comes first. An offset at or past the end yields an empty
    /// slice.
    pub fn read_ptr(&self, offset: usize) -> &[u8] {
        if offset >= self.len {
            return &[];
        }

        let cap = self.capacity();
        let start = (self.head + offset) & (cap - 1);
        let remaining = self.len - offset;
        let end = if start >= self.head {
            // Still before the wrap point.
            start + remaining.min(cap - start)
        } else {
            start + remaining
        };

        &self.storage[start..end]
    }

    /// Copy up to `out.len()` bytes from the front into `out` and drain them.
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let mut copied = 0;

        while copied < n {
            let chunk = self.read_ptr(copied);
            let take = chunk.len().min(n - copied);
            out[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
        }

        self.drain(n);
        n
    }

    /// Remove `n` bytes from the front. Draining more than is buffered empties
    /// the buffer.
    pub fn drain(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.head = (self.head + n) & (self.capacity() - 1);
        self.len -= n;

        if self.len == 0 {
            self.head = 0;
        }

        n
    }

    /// Drop all buffered data.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn grow(&mut self, needed: usize) -> Result<(), TryReserveError> {
        let new_cap = needed.next_power_of_two();
        let mut storage = Vec::new();
        storage.try_reserve_exact(new_cap)?;
        storage.resize(new_cap, 0);

        let mut copied = 0;
        while copied < self.len {
            let chunk = self.read_ptr(copied);
            storage[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
        }

        self.storage = storage;
        self.head = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(buf: &RingBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < buf.len() {
            out.extend_from_slice(buf.read_ptr(out.len()));
        }
        out
    }

    #[test]
    fn test_append_and_read() {
        let mut buf = RingBuffer::with_capacity(16);
        buf.append(b"hello").unwrap();

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.read_ptr(0), b"hello");
        assert_eq!(buf.read_ptr(2), b"llo");
        assert!(buf.read_ptr(5).is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let mut buf = RingBuffer::with_capacity(8);
        buf.append(b"abcdef").unwrap();
        buf.drain(4);
        buf.append(b"ghij").unwrap();

        // "ef" sits at the end of storage, "ghij" wrapped to the front.
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.len_no_wrap(), 4);
        assert_eq!(buf.read_ptr(0), b"efgh");
        assert_eq!(buf.read_ptr(4), b"ij");
        assert_eq!(contents(&buf), b"efghij");
    }

    #[test]
    fn test_grow_preserves_order() {
        let mut buf = RingBuffer::with_capacity(8);
        buf.append(b"0123456").unwrap();
        buf.drain(5);
        buf.append(b"789abcdefghij").unwrap();

        assert!(buf.capacity() >= 15);
        assert_eq!(contents(&buf), b"56789abcdefghij");
        assert_eq!(buf.len_no_wrap(), buf.len());
    }

    #[test]
    fn test_read_copies_and_drains() {
        let mut buf = RingBuffer::with_capacity(4);
        buf.append(b"ab").unwrap();
        buf.drain(1);
        buf.append(b"cde").unwrap();

        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out, b"bcd");
        assert_eq!(contents(&buf), b"e");
    }

    #[test]
    fn test_drain_past_end_empties() {
        let mut buf = RingBuffer::new();
        buf.append(b"xyz").unwrap();

        assert_eq!(buf.drain(10), 3);
        assert!(buf.is_empty());
        assert_eq!(buf.len_no_wrap(), 0);
    }
}
