//! Timing of non-realtime pool maintenance.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Measures one pool maintenance span (preallocation, growth, teardown).
///
/// Never create one on the audio thread: finishing a span emits a
/// [`tracing`] event.
#[derive(Debug)]
pub struct SpanTimer {
    label: &'static str,
    pool: Arc<str>,
    start: Instant,
    finished: bool,
}

impl SpanTimer {
    pub fn new(label: &'static str, pool: Arc<str>) -> Self {
        Self {
            label,
            pool,
            start: Instant::now(),
            finished: false,
        }
    }

    /// Finishes the span and reports how many chunks it touched.
    pub fn finish(mut self, chunks: usize) -> Duration {
        let duration = self.start.elapsed();
        self.finished = true;
        tracing::trace!(
            target: "profiling",
            label = self.label,
            pool = %self.pool,
            chunks,
            elapsed = ?duration
        );
        duration
    }
}

impl Drop for SpanTimer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let duration = self.start.elapsed();
        tracing::trace!(
            target: "profiling",
            label = self.label,
            pool = %self.pool,
            elapsed = ?duration,
            "pool span abandoned"
        );
    }
}
