//! Bounded byte ring buffer with two-phase (write, then commit) publishing.
//!
//! A producer stages any number of writes and then calls
//! [`RingBuffer::commit_write`]. Only committed bytes are visible to the
//! consumer, so a message made of several fields is published all at once
//! or not at all. If any staged write does not fit, the whole batch is
//! rolled back at commit time.
//!
//! One byte of capacity always stays free so that `head == tail` means
//! "empty" and never "full".

use std::fmt;

use crate::error::PoolError;

/// Capacity used by [`RingBuffer::default`] and the atom queues.
pub const DEFAULT_RING_CAPACITY: usize = 2048;

pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Committed write boundary, the consumer reads up to here.
    head: usize,
    /// Consumer read position.
    tail: usize,
    /// Producer's provisional write position.
    written: usize,
    invalidate_commit: bool,
}

impl RingBuffer {
    /// Creates a buffer holding `capacity` bytes, of which `capacity - 1`
    /// are usable. Allocates; call it off the audio thread.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is less than 2; see [`try_new`](Self::try_new).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring buffer capacity must be at least 2");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            written: 0,
            invalidate_commit: false,
        }
    }

    /// Like [`new`](Self::new), but reports a too-small capacity as an error.
    pub fn try_new(capacity: usize) -> Result<Self, PoolError> {
        if capacity < 2 {
            return Err(PoolError::RingTooSmall(capacity));
        }
        Ok(Self::new(capacity))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Whether committed data is waiting for the consumer.
    #[inline]
    pub fn data_available(&self) -> bool {
        self.tail != self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.data_available()
    }

    /// Committed bytes the consumer can read.
    #[inline]
    pub fn readable_len(&self) -> usize {
        let wrap = if self.head >= self.tail { 0 } else { self.capacity() };
        wrap + self.head - self.tail
    }

    /// Bytes the producer can still stage in the current batch.
    #[inline]
    pub fn writable_len(&self) -> usize {
        if self.invalidate_commit {
            return 0;
        }
        let wrap = if self.tail > self.written { 0 } else { self.capacity() };
        wrap + self.tail - self.written - 1
    }

    /// Stages `bytes` after the provisional write position.
    ///
    /// Returns `false` and marks the batch invalid when `bytes` does not
    /// fit; nothing is copied in that case.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return !self.invalidate_commit;
        }
        if bytes.len() > self.writable_len() {
            self.invalidate_commit = true;
            return false;
        }

        let capacity = self.capacity();
        let start = self.written;
        let end = start + bytes.len();
        if end > capacity {
            let first = capacity - start;
            self.buf[start..].copy_from_slice(&bytes[..first]);
            self.buf[..end - capacity].copy_from_slice(&bytes[first..]);
            self.written = end - capacity;
        } else {
            self.buf[start..end].copy_from_slice(bytes);
            self.written = if end == capacity { 0 } else { end };
        }
        true
    }

    /// Publishes the staged batch, or rolls it back if a write was rejected.
    ///
    /// Returns `true` only when new data became visible to the consumer.
    pub fn commit_write(&mut self) -> bool {
        if self.invalidate_commit {
            self.written = self.head;
            self.invalidate_commit = false;
            return false;
        }
        if self.head == self.written {
            return false;
        }
        self.head = self.written;
        true
    }

    /// Copies exactly `dst.len()` committed bytes into `dst`.
    ///
    /// Returns `false` and leaves `dst` untouched when fewer bytes are
    /// available.
    pub fn read(&mut self, dst: &mut [u8]) -> bool {
        if dst.is_empty() || !self.data_available() {
            return false;
        }
        if dst.len() > self.readable_len() {
            return false;
        }

        let capacity = self.capacity();
        let start = self.tail;
        let end = start + dst.len();
        if end > capacity {
            let first = capacity - start;
            dst[..first].copy_from_slice(&self.buf[start..]);
            dst[first..].copy_from_slice(&self.buf[..end - capacity]);
            self.tail = end - capacity;
        } else {
            dst.copy_from_slice(&self.buf[start..end]);
            self.tail = if end == capacity { 0 } else { end };
        }
        true
    }

    /// Drops all data, committed or staged.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.written = 0;
        self.invalidate_commit = false;
    }

    /// Takes over the contents and cursors of `other`, then clears it.
    ///
    /// Both buffers must have the same capacity; returns `false` otherwise.
    pub fn copy_from(&mut self, other: &mut RingBuffer) -> bool {
        if self.capacity() != other.capacity() {
            return false;
        }
        self.buf.copy_from_slice(&other.buf);
        self.head = other.head;
        self.tail = other.tail;
        self.written = other.written;
        self.invalidate_commit = other.invalidate_commit;
        other.clear();
        true
    }

    pub fn write_bool(&mut self, value: bool) -> bool {
        self.write(&[u8::from(value)])
    }

    pub fn write_u8(&mut self, value: u8) -> bool {
        self.write(&[value])
    }

    pub fn write_u32(&mut self, value: u32) -> bool {
        self.write(&value.to_ne_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> bool {
        self.write(&value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> bool {
        self.write(&value.to_ne_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> bool {
        self.write(&value.to_ne_bytes())
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|byte| byte != 0)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let mut bytes = [0u8; 1];
        self.read(&mut bytes).then_some(bytes[0])
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read(&mut bytes).then(|| u32::from_ne_bytes(bytes))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        let mut bytes = [0u8; 4];
        self.read(&mut bytes).then(|| i32::from_ne_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let mut bytes = [0u8; 8];
        self.read(&mut bytes).then(|| u64::from_ne_bytes(bytes))
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        let mut bytes = [0u8; 4];
        self.read(&mut bytes).then(|| f32::from_ne_bytes(bytes))
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("written", &self.written)
            .field("invalidate_commit", &self.invalidate_commit)
            .finish()
    }
}
