//! Growable byte buffer used for per-connection I/O and response
//! assembly.
//!
//! Valid bytes live in `data[start..end]`. Consuming from the front is a
//! pointer bump; `append` reclaims the dead prefix before reallocating,
//! so a connection that keeps up with its traffic settles into a single
//! allocation.

#[derive(Debug, Default)]
pub struct Buf {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buf {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
            end: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let needed = bytes.len();
        if self.end + needed > self.data.capacity() {
            self.make_room(needed);
        }
        if self.end + needed > self.data.len() {
            self.data.resize(self.end + needed, 0);
        }
        self.data[self.end..self.end + needed].copy_from_slice(bytes);
        self.end += needed;
    }

    /// Remove `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "cannot consume more bytes than available");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// First `n` bytes, if that many are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if n <= self.len() {
            Some(&self.data[self.start..self.start + n])
        } else {
            None
        }
    }

    fn make_room(&mut self, needed: usize) {
        let len = self.len();
        let free = self.start + (self.data.capacity() - self.end);
        if free >= needed {
            // Slide valid bytes back to the front.
            self.data.copy_within(self.start..self.end, 0);
        } else {
            let new_cap = (self.data.capacity() * 2).max(len + needed);
            let mut grown = Vec::with_capacity(new_cap);
            grown.extend_from_slice(&self.data[self.start..self.end]);
            self.data = grown;
        }
        self.start = 0;
        self.end = len;
    }

    pub fn append_u8(&mut self, v: u8) {
        self.append(&[v]);
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    pub fn append_f64(&mut self, v: f64) {
        self.append(&v.to_le_bytes());
    }

    /// Overwrite 4 bytes at `pos` (an offset into the valid region).
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        assert!(pos + 4 <= self.len());
        self.data[self.start + pos..self.start + pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Read back a byte previously written at `pos`.
    pub fn byte_at(&self, pos: usize) -> u8 {
        self.data[self.start + pos]
    }

    /// Drop everything written at or after `pos`, keeping the prefix.
    pub fn truncate_to(&mut self, pos: usize) {
        assert!(pos <= self.len());
        self.end = self.start + pos;
    }
}

impl std::ops::Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}
