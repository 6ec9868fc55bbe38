//! Atom event queue: variable-length typed messages tagged with a port index,
//! framed on top of [`RingBuffer`].
//!
//! Each entry is laid out as an [`AtomHeader`], the port index as a native
//! endian `i32`, then `size` body bytes. An entry is published with a single
//! commit, so a reader never sees half of one.

use std::fmt;
use std::ptr;

use parking_lot::{Mutex, MutexGuard};

use crate::config::RtMemSettings;
use crate::error::{PoolError, QueueError};
use crate::ring::{RingBuffer, DEFAULT_RING_CAPACITY};

/// Largest atom body accepted by [`AtomEventQueue::new`].
pub const DEFAULT_MAX_ATOM_SIZE: usize = 8192;

/// Fixed-size atom header as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtomHeader {
    pub size: u32,
    pub kind: u32,
}

impl AtomHeader {
    pub const SIZE: usize = 8;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&self.size.to_ne_bytes());
        bytes[4..].copy_from_slice(&self.kind.to_ne_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let [s0, s1, s2, s3, k0, k1, k2, k3] = bytes;
        Self {
            size: u32::from_ne_bytes([s0, s1, s2, s3]),
            kind: u32::from_ne_bytes([k0, k1, k2, k3]),
        }
    }

    /// A zeroed header marks an entry that must not be delivered.
    pub fn is_null(&self) -> bool {
        self.size == 0 && self.kind == 0
    }
}

/// Borrowed view of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atom<'a> {
    pub kind: u32,
    pub body: &'a [u8],
}

impl<'a> Atom<'a> {
    pub fn new(kind: u32, body: &'a [u8]) -> Self {
        Self { kind, body }
    }

    /// Wire header for this atom. Saturates bodies longer than `u32::MAX`;
    /// [`AtomQueueGuard::put`] rejects those before framing.
    pub fn header(&self) -> AtomHeader {
        AtomHeader {
            size: u32::try_from(self.body.len()).unwrap_or(u32::MAX),
            kind: self.kind,
        }
    }

    pub fn to_buf(&self) -> AtomBuf {
        AtomBuf {
            kind: self.kind,
            body: self.body.to_vec(),
        }
    }
}

/// Owned atom, for keeping a message past the queue guard's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AtomBuf {
    pub kind: u32,
    pub body: Vec<u8>,
}

impl AtomBuf {
    pub fn new(kind: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn as_atom(&self) -> Atom<'_> {
        Atom::new(self.kind, &self.body)
    }
}

struct QueueState {
    ring: RingBuffer,
    /// Receives atom bodies on `get`; sized once at construction.
    scratch: Box<[u8]>,
}

/// Multi-producer queue of port-tagged atoms guarded by a single lock.
///
/// The audio thread should only use [`try_lock`](Self::try_lock) or
/// [`try_put`](Self::try_put) and treat [`QueueError::Busy`] as "try again
/// next cycle".
pub struct AtomEventQueue {
    state: Mutex<QueueState>,
    max_atom_size: usize,
}

impl AtomEventQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY, DEFAULT_MAX_ATOM_SIZE)
    }

    /// Creates a queue sized from persisted settings.
    pub fn from_settings(settings: &RtMemSettings) -> Result<Self, PoolError> {
        settings.validate()?;
        Ok(Self::with_capacity(
            settings.atom_queue_capacity,
            settings.max_atom_size,
        ))
    }

    /// Creates a queue over a `capacity`-byte ring that accepts atom bodies
    /// of up to `max_atom_size` bytes. Allocates both buffers up front.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is less than 2. Use
    /// [`from_settings`](Self::from_settings) for sizes that come from user
    /// configuration.
    pub fn with_capacity(capacity: usize, max_atom_size: usize) -> Self {
        tracing::debug!(capacity, max_atom_size, "atom queue created");
        Self {
            state: Mutex::new(QueueState {
                ring: RingBuffer::new(capacity),
                scratch: vec![0u8; max_atom_size].into_boxed_slice(),
            }),
            max_atom_size,
        }
    }

    pub fn max_atom_size(&self) -> usize {
        self.max_atom_size
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    pub fn lock(&self) -> AtomQueueGuard<'_> {
        AtomQueueGuard {
            state: self.state.lock(),
            max_atom_size: self.max_atom_size,
        }
    }

    pub fn try_lock(&self) -> Option<AtomQueueGuard<'_>> {
        self.state.try_lock().map(|state| AtomQueueGuard {
            state,
            max_atom_size: self.max_atom_size,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Appends an atom, waiting for the lock. Not for the audio thread.
    pub fn put(&self, atom: Atom<'_>, port_index: u32) -> Result<(), QueueError> {
        let result = self.lock().put(atom, port_index);
        if let Err(err) = result {
            tracing::debug!(kind = atom.kind, port_index, %err, "atom dropped");
        }
        result
    }

    /// Appends an atom without waiting; fails with [`QueueError::Busy`] when
    /// another thread holds the lock.
    pub fn try_put(&self, atom: Atom<'_>, port_index: u32) -> Result<(), QueueError> {
        self.try_lock()
            .ok_or(QueueError::Busy)?
            .put(atom, port_index)
    }

    /// Moves every pending entry of `other` into `self` and empties `other`.
    ///
    /// The two locks are always taken lowest address first, so two threads
    /// copying between the same pair of queues in opposite directions cannot
    /// deadlock. Any entries already in `self` are replaced. Returns `false`
    /// when the ring capacities differ, in which case neither queue changes.
    /// Calling it with the same queue twice is a no-op.
    pub fn copy_data_from(&self, other: &AtomEventQueue) -> bool {
        if ptr::eq(self, other) {
            return true;
        }
        let (mut target, mut source) = if ptr::addr_of!(self.state) < ptr::addr_of!(other.state) {
            let target = self.state.lock();
            (target, other.state.lock())
        } else {
            let source = other.state.lock();
            (self.state.lock(), source)
        };
        target.ring.copy_from(&mut source.ring)
    }

    /// Hands every pending atom to `f` in FIFO order, holding the queue lock
    /// only while the entries are copied out.
    ///
    /// Allocates a private queue; use it from the UI or idle thread.
    pub fn drain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(u32, Atom<'_>),
    {
        let private = AtomEventQueue::with_capacity(self.capacity(), self.max_atom_size);
        if !private.copy_data_from(self) {
            return 0;
        }
        let mut guard = private.lock();
        let mut delivered = 0;
        while !guard.is_empty() {
            let before = guard.readable_len();
            if let Some((port, atom)) = guard.get() {
                f(port, atom);
                delivered += 1;
            } else if guard.readable_len() == before {
                // truncated entry, nothing more can be decoded
                guard.clear();
            }
        }
        delivered
    }
}

impl Default for AtomEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomEventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomEventQueue")
            .field("max_atom_size", &self.max_atom_size)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to an [`AtomEventQueue`]; dropping it unlocks the queue.
pub struct AtomQueueGuard<'a> {
    state: MutexGuard<'a, QueueState>,
    max_atom_size: usize,
}

impl AtomQueueGuard<'_> {
    pub fn is_empty(&self) -> bool {
        self.state.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.state.ring.clear();
    }

    /// Frames and commits one entry. Either the whole entry becomes
    /// visible or nothing does.
    pub fn put(&mut self, atom: Atom<'_>, port_index: u32) -> Result<(), QueueError> {
        if atom.body.len() > self.max_atom_size {
            return Err(QueueError::Oversized {
                size: atom.body.len(),
                max: self.max_atom_size,
            });
        }
        let port = i32::try_from(port_index).map_err(|_| QueueError::InvalidPort(port_index))?;

        let ring = &mut self.state.ring;
        ring.write(&atom.header().to_bytes());
        ring.write_i32(port);
        ring.write(atom.body);
        if ring.commit_write() {
            Ok(())
        } else {
            Err(QueueError::Full)
        }
    }

    /// Pops the next entry and returns its port index with a view of the
    /// atom. The view borrows the queue's scratch buffer, so it is valid
    /// until the next call on this guard.
    ///
    /// Returns `None` when the queue is empty and for entries that cannot
    /// be delivered: a zeroed header, a negative port index, or a body
    /// larger than the scratch buffer. Skipped entries are still consumed
    /// so the next entry stays aligned.
    pub fn get(&mut self) -> Option<(u32, Atom<'_>)> {
        let QueueState { ring, scratch } = &mut *self.state;

        let mut header_bytes = [0u8; AtomHeader::SIZE];
        if !ring.read(&mut header_bytes) {
            return None;
        }
        let header = AtomHeader::from_bytes(header_bytes);
        let port = ring.read_i32()?;
        if header.is_null() {
            return None;
        }

        let size = header.size as usize;
        if size > scratch.len() {
            skip(ring, size);
            return None;
        }
        let body = &mut scratch[..size];
        if size > 0 && !ring.read(body) {
            return None;
        }
        let port = u32::try_from(port).ok()?;
        Some((port, Atom::new(header.kind, body)))
    }

    fn readable_len(&self) -> usize {
        self.state.ring.readable_len()
    }
}

impl fmt::Debug for AtomQueueGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomQueueGuard")
            .field("ring", &self.state.ring)
            .field("max_atom_size", &self.max_atom_size)
            .finish()
    }
}

fn skip(ring: &mut RingBuffer, mut remaining: usize) {
    let mut sink = [0u8; 64];
    while remaining > 0 {
        let step = remaining.min(sink.len());
        if !ring.read(&mut sink[..step]) {
            return;
        }
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes_round_trip() {
        let header = AtomHeader { size: 3, kind: 77 };
        assert_eq!(AtomHeader::from_bytes(header.to_bytes()), header);
        assert!(AtomHeader::default().is_null());
    }

    #[test]
    fn put_then_get_preserves_order_and_ports() {
        let queue = AtomEventQueue::new();
        queue.put(Atom::new(1, b"abc"), 0).unwrap();
        queue.put(Atom::new(2, b""), 5).unwrap();
        queue.put(Atom::new(3, &[9; 100]), 2).unwrap();

        let mut guard = queue.lock();
        let (port, atom) = guard.get().unwrap();
        assert_eq!((port, atom.kind, atom.body), (0, 1, &b"abc"[..]));
        let (port, atom) = guard.get().unwrap();
        assert_eq!((port, atom.kind, atom.body.len()), (5, 2, 0));
        let (port, atom) = guard.get().unwrap();
        assert_eq!((port, atom.kind, atom.body), (2, 3, &[9u8; 100][..]));
        assert!(guard.get().is_none());
        assert!(guard.is_empty());
    }

    #[test]
    fn rejects_oversized_and_full() {
        let queue = AtomEventQueue::with_capacity(64, 16);
        assert_eq!(
            queue.put(Atom::new(1, &[0; 17]), 0),
            Err(QueueError::Oversized { size: 17, max: 16 })
        );
        queue.put(Atom::new(1, &[1; 16]), 0).unwrap();
        queue.put(Atom::new(1, &[2; 16]), 0).unwrap();
        assert_eq!(queue.put(Atom::new(1, &[3; 16]), 0), Err(QueueError::Full));

        let mut guard = queue.lock();
        assert_eq!(guard.get().map(|(_, a)| a.body[0]), Some(1));
        assert_eq!(guard.get().map(|(_, a)| a.body[0]), Some(2));
        assert!(guard.get().is_none());
    }

    #[test]
    fn port_index_must_fit_wire_format() {
        let queue = AtomEventQueue::new();
        let port = u32::MAX;
        assert_eq!(
            queue.put(Atom::new(1, b"x"), port),
            Err(QueueError::InvalidPort(port))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn null_header_is_not_delivered() {
        let queue = AtomEventQueue::new();
        queue.put(Atom::new(0, b""), 1).unwrap();
        queue.put(Atom::new(4, b"ok"), 1).unwrap();
        let mut guard = queue.lock();
        assert!(guard.get().is_none());
        let (port, atom) = guard.get().unwrap();
        assert_eq!((port, atom.body), (1, &b"ok"[..]));
    }

    #[test]
    fn try_put_reports_contention() {
        let queue = AtomEventQueue::new();
        let guard = queue.lock();
        assert_eq!(queue.try_put(Atom::new(1, b"x"), 0), Err(QueueError::Busy));
        assert!(queue.try_lock().is_none());
        drop(guard);
        assert_eq!(queue.try_put(Atom::new(1, b"x"), 0), Ok(()));
    }

    #[test]
    fn copy_data_from_moves_entries() {
        let rt = AtomEventQueue::new();
        let ui = AtomEventQueue::new();
        rt.put(Atom::new(8, b"level"), 3).unwrap();
        assert!(ui.copy_data_from(&rt));
        assert!(rt.is_empty());
        assert!(ui.copy_data_from(&ui));

        let mut guard = ui.lock();
        let (port, atom) = guard.get().unwrap();
        assert_eq!(port, 3);
        assert_eq!(atom.to_buf(), AtomBuf::new(8, *b"level"));
    }

    #[test]
    fn copy_data_from_needs_matching_capacity() {
        let small = AtomEventQueue::with_capacity(128, 32);
        let large = AtomEventQueue::new();
        small.put(Atom::new(1, b"a"), 0).unwrap();
        assert!(!large.copy_data_from(&small));
        assert!(!small.is_empty());
    }

    #[test]
    fn from_settings_uses_persisted_sizes() {
        let settings = RtMemSettings {
            atom_queue_capacity: 512,
            max_atom_size: 32,
            ..RtMemSettings::default()
        };
        let queue = AtomEventQueue::from_settings(&settings).unwrap();
        assert_eq!(queue.capacity(), 512);
        assert_eq!(queue.max_atom_size(), 32);

        let tiny = RtMemSettings {
            atom_queue_capacity: 1,
            ..RtMemSettings::default()
        };
        assert_eq!(
            AtomEventQueue::from_settings(&tiny).unwrap_err(),
            PoolError::RingTooSmall(1)
        );
    }

    #[test]
    fn drain_visits_every_entry() {
        let queue = AtomEventQueue::new();
        for i in 0..10u8 {
            queue.put(Atom::new(u32::from(i), &[i; 4]), u32::from(i % 3)).unwrap();
        }
        let mut seen = Vec::new();
        let delivered = queue.drain(|port, atom| seen.push((port, atom.to_buf())));
        assert_eq!(delivered, 10);
        assert!(queue.is_empty());
        for (i, (port, atom)) in seen.iter().enumerate() {
            let i = i as u8;
            assert_eq!(*port, u32::from(i % 3));
            assert_eq!(atom, &AtomBuf::new(u32::from(i), vec![i; 4]));
        }
    }
}
