use std::alloc::Layout;

use thiserror::Error;

/// Errors raised while creating or configuring a record pool.
///
/// These only surface on the non-realtime side. Exhaustion on the audio
/// thread is reported through `Option`/`Result<(), T>` returns instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("record size must be non-zero")]
    ZeroDataSize,
    #[error("invalid preallocation bounds: min {min} > max {max}")]
    InvalidBounds { min: usize, max: usize },
    #[error("pool cannot track more than {max} chunks")]
    TooManyChunks { max: usize },
    #[error("ring capacity {0} is below the 2 byte minimum")]
    RingTooSmall(usize),
    #[error("invalid chunk layout: {0}")]
    InvalidLayout(String),
    #[error("pool chunk layout {chunk:?} cannot hold a node of layout {node:?}")]
    LayoutMismatch { chunk: Layout, node: Layout },
}

impl PoolError {
    pub fn invalid_layout(message: impl Into<String>) -> Self {
        PoolError::InvalidLayout(message.into())
    }
}

/// Errors returned by the atom event queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("port index {0} does not fit the wire format")]
    InvalidPort(u32),
    #[error("queue is locked by another thread")]
    Busy,
    #[error("atom of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
}
