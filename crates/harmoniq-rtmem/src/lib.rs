//! Realtime-safe memory building blocks for the Harmoniq plugin host.
//!
//! * [`pool`]: fixed-size record pools that preallocate off the audio thread
//!   and hand out chunks without touching the system allocator.
//! * [`list`]: doubly-linked lists whose nodes come from those pools, with
//!   O(1) splicing between lists that share one.
//! * [`ring`]: a bounded byte ring buffer with write-then-commit publishing.
//! * [`atom`]: a port-tagged atom event queue framed on the ring buffer.
//! * [`events`]: the host's note and post-realtime event lists.
//!
//! Everything that may allocate or block is named as such
//! (`allocate_sleepy`, `append_sleepy`, `append_non_rt`, `lock`, ...).

pub mod atom;
pub mod config;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "fuzzing"))]
pub mod fuzz;
pub mod list;
pub mod pool;
pub mod profiling;
pub mod ring;

pub use atom::{Atom, AtomBuf, AtomEventQueue, AtomHeader, AtomQueueGuard};
pub use config::{PoolBounds, RtMemSettings};
pub use error::{PoolError, QueueError};
pub use events::{ExternalMidiNote, ExternalNotes, PostRtEvent, PostRtEvents};
pub use list::{HeapList, List, LocalRtList, NodeAllocator, RtList};
pub use pool::{PoolStats, RawChunk, RtMemPool, SharedRtMemPool};
pub use ring::RingBuffer;
