//! Fixed-capacity byte ring buffers.
//!
//! A relay never copies bytes between its two connections. Instead the
//! inbound buffer of one connection is the very same [`RingBuffer`] the
//! peer connection drains to its socket, shared as `Arc<RingBuffer>`.
//! The socket layer deposits bytes directly where the peer consumes them.
//!
//! Two independent close operations exist:
//! - [`RingBuffer::close_input`] stops accepting new bytes while already
//!   stored bytes can still be drained (half-close).
//! - [`RingBuffer::release`] frees the storage (teardown).

use std::fmt;
use std::io::{self, Read, Write};

use parking_lot::Mutex;

/// A fixed-capacity circular byte buffer.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    /// `None` once released.
    storage: Option<Box<[u8]>>,
    /// Position of the first stored byte.
    head: usize,
    /// Number of stored bytes.
    len: usize,
    input_closed: bool,
}

impl Inner {
    /// Contiguous writable region `[start, end)`, if any.
    fn free_region(&mut self, capacity: usize) -> Option<(usize, usize)> {
        if self.storage.is_none() || self.input_closed || self.len == capacity {
            return None;
        }
        if self.len == 0 {
            self.head = 0;
        }
        let tail = (self.head + self.len) % capacity;
        let end = if tail < self.head { self.head } else { capacity };
        Some((tail, end))
    }

    /// Contiguous readable region `[start, end)`, if any.
    fn used_region(&self, capacity: usize) -> Option<(usize, usize)> {
        if self.storage.is_none() || self.len == 0 {
            return None;
        }
        let end = (self.head + self.len).min(capacity);
        Some((self.head, end))
    }

    fn consume(&mut self, n: usize, capacity: usize) {
        self.len -= n;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + n) % capacity
        };
    }
}

impl RingBuffer {
    /// Allocate a buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                storage: Some(vec![0u8; capacity].into_boxed_slice()),
                head: 0,
                len: 0,
                input_closed: false,
            }),
        }
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes waiting to be drained.
    pub fn used(&self) -> usize {
        let inner = self.inner.lock();
        if inner.storage.is_none() {
            0
        } else {
            inner.len
        }
    }

    /// Number of bytes that can still be stored.
    pub fn free(&self) -> usize {
        let inner = self.inner.lock();
        if inner.storage.is_none() || inner.input_closed {
            0
        } else {
            self.capacity - inner.len
        }
    }

    /// Stop accepting new bytes. Stored bytes remain drainable.
    pub fn close_input(&self) {
        self.inner.lock().input_closed = true;
    }

    /// Whether [`close_input`](Self::close_input) has been called.
    pub fn is_input_closed(&self) -> bool {
        self.inner.lock().input_closed
    }

    /// Free the storage, discarding any pending bytes.
    ///
    /// Idempotent. Returns `true` only for the call that actually freed
    /// the storage.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.head = 0;
        inner.len = 0;
        inner.input_closed = true;
        inner.storage.take().is_some()
    }

    /// Whether the storage has been released.
    pub fn is_released(&self) -> bool {
        self.inner.lock().storage.is_none()
    }

    /// Perform a single read from `src` into the free region.
    ///
    /// Returns `Ok(None)` when the buffer cannot take bytes (full, input
    /// closed or released), `Ok(Some(0))` when `src` reached EOF and
    /// `Ok(Some(n))` for `n` stored bytes.
    pub fn store_from<R: Read + ?Sized>(&self, src: &mut R) -> io::Result<Option<usize>> {
        let mut inner = self.inner.lock();
        let Some((start, end)) = inner.free_region(self.capacity) else {
            return Ok(None);
        };
        let n = match inner.storage.as_mut() {
            Some(storage) => src.read(&mut storage[start..end])?,
            None => return Ok(None),
        };
        inner.len += n;
        Ok(Some(n))
    }

    /// Perform a single write of stored bytes into `dst`.
    ///
    /// Returns the number of bytes drained; `Ok(0)` when nothing is stored.
    pub fn flush_to<W: Write + ?Sized>(&self, dst: &mut W) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let Some((start, end)) = inner.used_region(self.capacity) else {
            return Ok(0);
        };
        let n = match inner.storage.as_ref() {
            Some(storage) => dst.write(&storage[start..end])?,
            None => return Ok(0),
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "sink accepted no bytes",
            ));
        }
        inner.consume(n, self.capacity);
        Ok(n)
    }

    /// Copy as much of `data` as fits. Returns the number of bytes stored.
    pub fn push(&self, mut data: &[u8]) -> usize {
        let mut stored = 0;
        while !data.is_empty() {
            match self.store_from(&mut data) {
                Ok(Some(n)) if n > 0 => stored += n,
                _ => break,
            }
        }
        stored
    }

    /// Copy out all stored bytes without consuming them.
    pub fn peek(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let Some(storage) = inner.storage.as_ref() else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(inner.len);
        let first_end = (inner.head + inner.len).min(self.capacity);
        out.extend_from_slice(&storage[inner.head..first_end]);
        let wrapped = inner.len - (first_end - inner.head);
        out.extend_from_slice(&storage[..wrapped]);
        out
    }

    /// Drop up to `n` stored bytes. Returns how many were dropped.
    pub fn discard(&self, n: usize) -> usize {
        let mut inner = self.inner.lock();
        if inner.storage.is_none() {
            return 0;
        }
        let n = n.min(inner.len);
        inner.consume(n, self.capacity);
        n
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("used", &inner.len)
            .field("input_closed", &inner.input_closed)
            .field("released", &inner.storage.is_none())
            .finish()
    }
}
