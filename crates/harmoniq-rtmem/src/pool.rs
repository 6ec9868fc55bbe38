//! Fixed-size record pool for the audio thread.
//!
//! Chunks live on exactly one of two index-linked lists: `unused` (ready to
//! hand out) and `used` (owned by a caller). Creating, growing and dropping
//! a pool talks to the system allocator and must happen off the audio
//! thread. [`RtMemPool::allocate_atomic`] and [`RtMemPool::deallocate`] only
//! relink slot indices and are safe to call from the realtime callback.
//!
//! Two flavours exist so the synchronisation choice is visible in the type:
//! [`RtMemPool`] is unsynchronised and needs `&mut self`, and
//! [`SharedRtMemPool`] is a cloneable handle guarded by a
//! [`parking_lot::Mutex`] whose critical sections never call the allocator.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::profiling::SpanTimer;

/// Alignment of chunks created through [`RtMemPool::new`].
pub const CHUNK_ALIGN: usize = 16;

const NIL: u32 = u32::MAX;

/// Handle to a chunk handed out by a pool.
///
/// The handle is plain data: the pointer stays valid until the chunk is
/// given back with `deallocate` or the pool is dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawChunk {
    index: u32,
    data: NonNull<u8>,
}

// SAFETY: a chunk handle is an address plus a slot number; reading or
// writing through it already requires `unsafe`.
unsafe impl Send for RawChunk {}
unsafe impl Sync for RawChunk {}

impl RawChunk {
    /// Rebuilds a handle from its parts, e.g. from a header stored inside
    /// the chunk itself.
    ///
    /// # Safety
    /// `index` and `data` must come from the same handle previously returned
    /// by a pool.
    #[inline]
    pub unsafe fn from_raw_parts(index: u32, data: NonNull<u8>) -> Self {
        Self { index, data }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.data
    }
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("index", &self.index)
            .field("data", &self.data.as_ptr())
            .finish()
    }
}

/// Occupancy snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub used: usize,
    pub unused: usize,
    pub min_preallocated: usize,
    pub max_preallocated: usize,
}

impl PoolStats {
    #[inline]
    pub fn total(&self) -> usize {
        self.used + self.unused
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Unused,
    Used,
}

struct Slot {
    data: NonNull<u8>,
    prev: u32,
    next: u32,
    state: ChunkState,
}

#[derive(Debug, Clone, Copy)]
struct ChunkList {
    head: u32,
    tail: u32,
    len: usize,
}

impl ChunkList {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        len: 0,
    };
}

#[inline]
fn push_back(slots: &mut [Slot], list: &mut ChunkList, index: u32) {
    let slot = &mut slots[index as usize];
    slot.prev = list.tail;
    slot.next = NIL;
    if list.tail == NIL {
        list.head = index;
    } else {
        slots[list.tail as usize].next = index;
    }
    list.tail = index;
    list.len += 1;
}

#[inline]
fn unlink(slots: &mut [Slot], list: &mut ChunkList, index: u32) {
    let (prev, next) = {
        let slot = &slots[index as usize];
        (slot.prev, slot.next)
    };
    if prev == NIL {
        list.head = next;
    } else {
        slots[prev as usize].next = next;
    }
    if next == NIL {
        list.tail = prev;
    } else {
        slots[next as usize].prev = prev;
    }
    let slot = &mut slots[index as usize];
    slot.prev = NIL;
    slot.next = NIL;
    list.len -= 1;
}

fn alloc_chunk(layout: Layout) -> Option<NonNull<u8>> {
    debug_assert!(layout.size() > 0);
    // SAFETY: pool construction rejects zero-sized layouts.
    NonNull::new(unsafe { alloc::alloc(layout) })
}

/// # Safety
/// `data` must come from `alloc_chunk(layout)` and not be freed yet.
unsafe fn free_chunk(data: NonNull<u8>, layout: Layout) {
    alloc::dealloc(data.as_ptr(), layout);
}

/// Unsynchronised pool of fixed-size chunks.
pub struct RtMemPool {
    name: Arc<str>,
    layout: Layout,
    min_preallocated: usize,
    max_preallocated: usize,
    slots: Vec<Slot>,
    used: ChunkList,
    unused: ChunkList,
}

// SAFETY: the pool exclusively owns every chunk it points to.
unsafe impl Send for RtMemPool {}

impl RtMemPool {
    /// Creates a pool of `data_size`-byte chunks aligned to [`CHUNK_ALIGN`],
    /// preallocating `min_preallocated` of them.
    pub fn new(
        name: &str,
        data_size: usize,
        min_preallocated: usize,
        max_preallocated: usize,
    ) -> Result<Self, PoolError> {
        if data_size == 0 {
            return Err(PoolError::ZeroDataSize);
        }
        let layout = Layout::from_size_align(data_size, CHUNK_ALIGN)
            .map_err(|err| PoolError::invalid_layout(err.to_string()))?;
        Self::with_layout(name, layout, min_preallocated, max_preallocated)
    }

    /// Creates a pool whose chunks follow `layout`.
    ///
    /// A failing system allocation during preallocation is not fatal: the
    /// pool keeps the chunks it managed to create and logs a warning.
    pub fn with_layout(
        name: &str,
        layout: Layout,
        min_preallocated: usize,
        max_preallocated: usize,
    ) -> Result<Self, PoolError> {
        if layout.size() == 0 {
            return Err(PoolError::ZeroDataSize);
        }
        if min_preallocated > max_preallocated {
            return Err(PoolError::InvalidBounds {
                min: min_preallocated,
                max: max_preallocated,
            });
        }
        if max_preallocated >= NIL as usize {
            return Err(PoolError::TooManyChunks {
                max: NIL as usize - 1,
            });
        }

        // Reserved once so neither growth nor the realtime path moves the table.
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(max_preallocated)
            .map_err(|_| PoolError::TooManyChunks {
                max: max_preallocated,
            })?;

        let mut pool = Self {
            name: Arc::from(name),
            layout: layout.pad_to_align(),
            min_preallocated,
            max_preallocated,
            slots,
            used: ChunkList::EMPTY,
            unused: ChunkList::EMPTY,
        };

        let span = SpanTimer::new("rtmem.preallocate", pool.name.clone());
        let created = pool.refill();
        span.finish(created);

        if created < min_preallocated {
            tracing::warn!(
                pool = %pool.name,
                requested = min_preallocated,
                created,
                "partial preallocation of realtime memory pool"
            );
        }
        tracing::debug!(
            pool = %pool.name,
            data_size = pool.layout.size(),
            align = pool.layout.align(),
            min = min_preallocated,
            max = max_preallocated,
            "created realtime memory pool"
        );
        Ok(pool)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn min_preallocated(&self) -> usize {
        self.min_preallocated
    }

    #[inline]
    pub fn max_preallocated(&self) -> usize {
        self.max_preallocated
    }

    #[inline]
    pub fn used_count(&self) -> usize {
        self.used.len
    }

    #[inline]
    pub fn unused_count(&self) -> usize {
        self.unused.len
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            used: self.used.len,
            unused: self.unused.len,
            min_preallocated: self.min_preallocated,
            max_preallocated: self.max_preallocated,
        }
    }

    /// Takes the oldest unused chunk. Realtime safe: never blocks and never
    /// calls the system allocator. `None` means the pool is exhausted.
    #[inline]
    pub fn allocate_atomic(&mut self) -> Option<RawChunk> {
        let index = self.unused.head;
        if index == NIL {
            return None;
        }
        unlink(&mut self.slots, &mut self.unused, index);
        push_back(&mut self.slots, &mut self.used, index);
        let slot = &mut self.slots[index as usize];
        slot.state = ChunkState::Used;
        Some(RawChunk {
            index,
            data: slot.data,
        })
    }

    /// Refills the unused list up to `min_preallocated` (bounded by
    /// `max_preallocated`) and then allocates. Not realtime safe.
    ///
    /// Each call makes at most one refill pass; `None` means growth was
    /// capped by `max_preallocated` or the system allocator failed.
    pub fn allocate_sleepy(&mut self) -> Option<RawChunk> {
        if self.growth_deficit() > 0 {
            let span = SpanTimer::new("rtmem.grow", self.name.clone());
            let added = self.refill();
            span.finish(added);
        }
        self.allocate_atomic()
    }

    /// Returns a chunk to the tail of the unused list. Realtime safe.
    ///
    /// Handing back a chunk that is not outstanding on this pool is a
    /// programming error: debug builds panic, release builds ignore it.
    #[inline]
    pub fn deallocate(&mut self, chunk: RawChunk) {
        let owned = self
            .slots
            .get(chunk.index as usize)
            .is_some_and(|slot| slot.data == chunk.data && slot.state == ChunkState::Used);
        debug_assert!(
            owned,
            "chunk {chunk:?} is not outstanding on pool `{}`",
            self.name
        );
        if !owned {
            return;
        }
        unlink(&mut self.slots, &mut self.used, chunk.index);
        push_back(&mut self.slots, &mut self.unused, chunk.index);
        self.slots[chunk.index as usize].state = ChunkState::Unused;
    }

    /// Number of chunks a refill pass would try to add.
    pub(crate) fn growth_deficit(&self) -> usize {
        let total = self.used.len + self.unused.len;
        self.min_preallocated
            .saturating_sub(self.unused.len)
            .min(self.max_preallocated.saturating_sub(total))
    }

    /// Links freshly allocated storage into the unused list. Hands the
    /// storage back when the pool already holds `max_preallocated` chunks.
    pub(crate) fn adopt(&mut self, data: NonNull<u8>) -> Result<(), NonNull<u8>> {
        if self.slots.len() >= self.max_preallocated {
            return Err(data);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            data,
            prev: NIL,
            next: NIL,
            state: ChunkState::Unused,
        });
        push_back(&mut self.slots, &mut self.unused, index);
        Ok(())
    }

    fn refill(&mut self) -> usize {
        let mut added = 0;
        for _ in 0..self.growth_deficit() {
            let Some(data) = alloc_chunk(self.layout) else {
                tracing::warn!(
                    pool = %self.name,
                    used = self.used.len,
                    unused = self.unused.len,
                    "system allocator refused a pool chunk"
                );
                break;
            };
            if let Err(data) = self.adopt(data) {
                // SAFETY: `data` was allocated just above with this layout.
                unsafe { free_chunk(data, self.layout) };
                break;
            }
            added += 1;
        }
        added
    }
}

impl fmt::Debug for RtMemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtMemPool")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("used", &self.used.len)
            .field("unused", &self.unused.len)
            .field("min_preallocated", &self.min_preallocated)
            .field("max_preallocated", &self.max_preallocated)
            .finish()
    }
}

impl Drop for RtMemPool {
    fn drop(&mut self) {
        let outstanding = self.used.len;
        if outstanding > 0 {
            if !std::thread::panicking() {
                debug_assert_eq!(
                    outstanding, 0,
                    "pool `{}` dropped with outstanding chunks",
                    self.name
                );
            }
            // Callers may still point into these chunks; leak them.
            tracing::error!(
                pool = %self.name,
                outstanding,
                "realtime memory pool dropped with outstanding chunks"
            );
        }

        let mut index = self.unused.head;
        while index != NIL {
            let slot = &self.slots[index as usize];
            // SAFETY: unused chunks are owned by the pool and freed once.
            unsafe { free_chunk(slot.data, self.layout) };
            index = slot.next;
        }
        tracing::debug!(pool = %self.name, freed = self.unused.len, "destroyed realtime memory pool");
    }
}

/// Thread-safe pool handle.
///
/// Clones share one [`RtMemPool`]. The lock is only held for index
/// relinking, never across a system allocation, so waiting on it is
/// bounded. Audio threads that must not wait at all use
/// [`SharedRtMemPool::try_allocate_atomic`].
#[derive(Clone)]
pub struct SharedRtMemPool {
    inner: Arc<Mutex<RtMemPool>>,
    name: Arc<str>,
    layout: Layout,
}

impl SharedRtMemPool {
    pub fn new(
        name: &str,
        data_size: usize,
        min_preallocated: usize,
        max_preallocated: usize,
    ) -> Result<Self, PoolError> {
        RtMemPool::new(name, data_size, min_preallocated, max_preallocated).map(Self::from_pool)
    }

    pub fn with_layout(
        name: &str,
        layout: Layout,
        min_preallocated: usize,
        max_preallocated: usize,
    ) -> Result<Self, PoolError> {
        RtMemPool::with_layout(name, layout, min_preallocated, max_preallocated)
            .map(Self::from_pool)
    }

    pub fn from_pool(pool: RtMemPool) -> Self {
        Self {
            name: pool.name.clone(),
            layout: pool.layout,
            inner: Arc::new(Mutex::new(pool)),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.layout.size()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    /// Whether both handles refer to the same pool.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Realtime allocation that gives up instead of waiting for the lock.
    #[inline]
    pub fn try_allocate_atomic(&self) -> Option<RawChunk> {
        self.inner.try_lock()?.allocate_atomic()
    }

    /// Realtime allocation; waits only for another relinking section.
    #[inline]
    pub fn allocate_atomic(&self) -> Option<RawChunk> {
        self.inner.lock().allocate_atomic()
    }

    /// Non-realtime allocation that may grow the pool.
    ///
    /// New chunks are allocated with the lock released and linked in
    /// afterwards, so a realtime thread contending for the lock never waits
    /// on the system allocator.
    pub fn allocate_sleepy(&self) -> Option<RawChunk> {
        let deficit = self.inner.lock().growth_deficit();
        if deficit == 0 {
            return self.allocate_atomic();
        }

        let span = SpanTimer::new("rtmem.grow", self.name.clone());
        let mut fresh = Vec::with_capacity(deficit);
        for _ in 0..deficit {
            match alloc_chunk(self.layout) {
                Some(data) => fresh.push(data),
                None => {
                    tracing::warn!(pool = %self.name, "system allocator refused a pool chunk");
                    break;
                }
            }
        }

        let mut surplus = Vec::new();
        let (adopted, chunk) = {
            let mut pool = self.inner.lock();
            let mut adopted = 0;
            for data in fresh {
                match pool.adopt(data) {
                    Ok(()) => adopted += 1,
                    Err(data) => surplus.push(data),
                }
            }
            (adopted, pool.allocate_atomic())
        };

        for data in surplus {
            // SAFETY: allocated above with `self.layout` and never adopted.
            unsafe { free_chunk(data, self.layout) };
        }
        span.finish(adopted);
        chunk
    }

    /// Returns a chunk to the pool. Realtime safe.
    #[inline]
    pub fn deallocate(&self, chunk: RawChunk) {
        self.inner.lock().deallocate(chunk);
    }
}

impl fmt::Debug for SharedRtMemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRtMemPool")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
