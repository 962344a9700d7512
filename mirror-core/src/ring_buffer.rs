//! A single-producer/single-consumer byte ring (spec.md section 4.1).
//!
//! Not thread-safe by design: each transport owns exactly one `RingBuffer`
//! and drives it from a single read loop, the same ownership discipline the
//! teacher applies to its `Framed<TcpStream, Codec>` per-connection state.

const DEFAULT_CAPACITY: usize = 1024 * 1024;

pub struct RingBuffer {
    buf: Vec<u8>,
    /// Index of the first valid byte.
    head: usize,
    /// Number of valid bytes starting at `head` (may wrap past `buf.len()`).
    len: usize,
    capacity: usize,
    dropped_bytes: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingBuffer {
            buf: vec![0u8; capacity],
            head: 0,
            len: 0,
            capacity,
            dropped_bytes: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    fn index(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity
    }

    /// Appends `data`. If the ring is full, the **oldest** bytes are dropped
    /// to make room (the producing socket thread must never block).
    pub fn write(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            // Keep only the tail that fits; everything before it is a drop.
            self.dropped_bytes += (self.len + data.len() - self.capacity) as u64;
            let start = data.len() - self.capacity;
            self.head = 0;
            self.len = self.capacity;
            self.buf.copy_from_slice(&data[start..]);
            return;
        }
        let free = self.capacity - self.len;
        if data.len() > free {
            let overflow = data.len() - free;
            self.discard(overflow);
            self.dropped_bytes += overflow as u64;
        }
        let write_start = self.index(self.len);
        let first_chunk = (self.capacity - write_start).min(data.len());
        self.buf[write_start..write_start + first_chunk].copy_from_slice(&data[..first_chunk]);
        if first_chunk < data.len() {
            let remaining = data.len() - first_chunk;
            self.buf[..remaining].copy_from_slice(&data[first_chunk..]);
        }
        self.len += data.len();
    }

    /// Returns up to `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.len);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.buf[self.index(i)]);
        }
        out
    }

    /// Reads and consumes up to `n` bytes.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let out = self.peek(n);
        self.discard(out.len());
        out
    }

    /// Drops `n` bytes from the front (or all remaining bytes if fewer).
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = self.index(n);
        self.len -= n;
    }

    /// Linear scan for the big-endian 32-bit `magic` value, aligned-word
    /// compare where possible. Returns the byte offset of the first match
    /// within the currently buffered bytes, if any.
    pub fn scan_for(&self, magic: u32) -> Option<usize> {
        if self.len < 4 {
            return None;
        }
        let needle = magic.to_be_bytes();
        // The ring may wrap; materialize a contiguous view once rather than
        // re-deriving indices on every comparison. For a 1 MiB ring this is
        // cheap relative to the socket read that triggered the scan.
        let contiguous = self.peek(self.len);
        contiguous
            .windows(4)
            .position(|w| w == needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"hello");
        assert_eq!(rb.len(), 5);
        assert_eq!(rb.read(5), b"hello");
        assert_eq!(rb.len(), 0);
    }

    #[test]
    fn wraps_around() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"1234567");
        rb.discard(5);
        rb.write(b"abcde"); // wraps: 2 bytes left ("67") + 5 new = 7, fits in 8
        assert_eq!(rb.read(7), b"67abcde");
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"abcd");
        rb.write(b"ef"); // over capacity by 2: drop "ab"
        assert_eq!(rb.dropped_bytes(), 2);
        assert_eq!(rb.read(4), b"cdef");
    }

    #[test]
    fn scan_finds_magic_after_garbage() {
        let mut rb = RingBuffer::new(64);
        rb.write(b"xx\x00\x01");
        rb.write(&0x56494430u32.to_be_bytes());
        rb.write(b"tail");
        assert_eq!(rb.scan_for(0x56494430), Some(4));
    }

    #[test]
    fn scan_returns_none_without_magic() {
        let mut rb = RingBuffer::new(64);
        rb.write(b"no magic in here");
        assert_eq!(rb.scan_for(0x56494430), None);
    }
}
