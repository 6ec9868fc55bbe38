//! Host-side event lists built on the pool-backed lists.
//!
//! [`ExternalNotes`] carries notes from the UI into the audio thread;
//! [`PostRtEvents`] carries what the audio thread raises back out. The audio
//! thread only ever try-locks: when a lock is contended it skips the work
//! for this cycle instead of waiting.

use parking_lot::Mutex;

use crate::config::{PoolBounds, RtMemSettings};
use crate::error::PoolError;
use crate::list::{LocalRtList, RtList};

/// A note injected from outside the audio thread. A velocity of zero is a
/// note-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalMidiNote {
    /// MIDI channel, or a negative value for "the instrument's own".
    pub channel: i8,
    pub note: u8,
    pub velocity: u8,
}

impl ExternalMidiNote {
    pub fn note_on(channel: i8, note: u8, velocity: u8) -> Self {
        Self {
            channel,
            note,
            velocity,
        }
    }

    pub fn note_off(channel: i8, note: u8) -> Self {
        Self::note_on(channel, note, 0)
    }

    pub fn is_note_off(&self) -> bool {
        self.velocity == 0
    }
}

/// Notes queued by the UI for the audio thread.
pub struct ExternalNotes {
    notes: Mutex<LocalRtList<ExternalMidiNote>>,
}

impl ExternalNotes {
    pub fn new() -> Result<Self, PoolError> {
        Self::with_bounds(PoolBounds::EXTERNAL_NOTES)
    }

    pub fn from_settings(settings: &RtMemSettings) -> Result<Self, PoolError> {
        Self::with_bounds(settings.external_notes)
    }

    pub fn with_bounds(bounds: PoolBounds) -> Result<Self, PoolError> {
        let notes = LocalRtList::with_capacity(
            "external-notes",
            bounds.min_preallocated,
            bounds.max_preallocated,
        )?;
        Ok(Self {
            notes: Mutex::new(notes),
        })
    }

    /// Queues a note, growing the pool if needed. Not for the audio thread.
    pub fn append_non_rt(&self, note: ExternalMidiNote) -> bool {
        match self.notes.lock().append_sleepy(note) {
            Ok(()) => true,
            Err(note) => {
                tracing::warn!(?note, "external note pool exhausted, note dropped");
                false
            }
        }
    }

    /// Pops up to `max` notes in arrival order and hands them to `f`.
    ///
    /// Returns how many were delivered; `0` also when the UI thread holds
    /// the lock, in which case the notes wait for the next cycle.
    pub fn drain_rt<F>(&self, max: usize, mut f: F) -> usize
    where
        F: FnMut(ExternalMidiNote),
    {
        let Some(mut notes) = self.notes.try_lock() else {
            return 0;
        };
        let mut delivered = 0;
        while delivered < max {
            let Some(note) = notes.pop_first() else {
                break;
            };
            f(note);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.notes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.lock().is_empty()
    }

    pub fn clear(&self) {
        self.notes.lock().clear();
    }
}

impl std::fmt::Debug for ExternalNotes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalNotes").finish_non_exhaustive()
    }
}

/// Something that happened on the audio thread and must be reported to the
/// UI or host once the cycle is over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostRtEvent {
    ParameterChange { index: u32, value: f32 },
    ProgramChange { index: u32 },
    MidiProgramChange { index: u32 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    Debug { value: i32 },
}

/// Events raised on the audio thread.
///
/// The audio thread appends to `pending`; whenever it also wins the lock on
/// `data` it splices `pending` over in O(1). The non-realtime side only
/// touches `data`. Both lists share one pool, which is what makes the
/// splice possible.
pub struct PostRtEvents {
    pending: Mutex<RtList<PostRtEvent>>,
    data: Mutex<RtList<PostRtEvent>>,
}

impl PostRtEvents {
    pub fn new() -> Result<Self, PoolError> {
        Self::with_bounds(PoolBounds::POST_RT_EVENTS)
    }

    pub fn from_settings(settings: &RtMemSettings) -> Result<Self, PoolError> {
        Self::with_bounds(settings.post_rt_events)
    }

    pub fn with_bounds(bounds: PoolBounds) -> Result<Self, PoolError> {
        let pool = RtList::<PostRtEvent>::create_pool(
            "post-rt-events",
            bounds.min_preallocated,
            bounds.max_preallocated,
        )?;
        Ok(Self {
            pending: Mutex::new(RtList::new(pool.clone())?),
            data: Mutex::new(RtList::new(pool)?),
        })
    }

    /// Records an event from the audio thread. Returns `false` when the
    /// event was dropped because `pending` was locked or the pool ran dry.
    pub fn append_rt(&self, event: PostRtEvent) -> bool {
        let Some(mut pending) = self.pending.try_lock() else {
            return false;
        };
        pending.append(event).is_ok()
    }

    /// Publishes pending events to the non-realtime side if both locks can
    /// be taken without waiting.
    pub fn try_splice(&self) -> bool {
        let Some(mut pending) = self.pending.try_lock() else {
            return false;
        };
        if pending.is_empty() {
            return false;
        }
        let Some(mut data) = self.data.try_lock() else {
            return false;
        };
        pending.splice_append(&mut data)
    }

    /// Hands published events to `f` in order and releases them. Not for
    /// the audio thread.
    pub fn drain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(PostRtEvent),
    {
        let mut data = self.data.lock();
        let mut delivered = 0;
        while let Some(event) = data.pop_first() {
            f(event);
            delivered += 1;
        }
        delivered
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn published_len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
        self.data.lock().clear();
    }
}

impl std::fmt::Debug for PostRtEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostRtEvents").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_notes_drain_in_order_up_to_max() {
        let notes = ExternalNotes::with_bounds(PoolBounds::new(2, 8)).unwrap();
        for n in 60..65 {
            assert!(notes.append_non_rt(ExternalMidiNote::note_on(0, n, 100)));
        }
        let mut seen = Vec::new();
        assert_eq!(notes.drain_rt(3, |note| seen.push(note.note)), 3);
        assert_eq!(seen, [60, 61, 62]);
        assert_eq!(notes.len(), 2);
        notes.clear();
        assert!(notes.is_empty());
    }

    #[test]
    fn external_notes_respect_pool_maximum() {
        let notes = ExternalNotes::with_bounds(PoolBounds::new(1, 2)).unwrap();
        assert!(notes.append_non_rt(ExternalMidiNote::note_on(0, 1, 1)));
        assert!(notes.append_non_rt(ExternalMidiNote::note_off(0, 1)));
        assert!(!notes.append_non_rt(ExternalMidiNote::note_on(0, 2, 1)));
    }

    #[test]
    fn default_note_pool_holds_152_notes() {
        let notes = ExternalNotes::new().unwrap();
        for i in 0..152u32 {
            assert!(notes.append_non_rt(ExternalMidiNote::note_on(0, (i % 128) as u8, 1)));
        }
        assert!(!notes.append_non_rt(ExternalMidiNote::note_off(0, 0)));
        assert_eq!(notes.len(), 152);
    }

    #[test]
    fn drain_rt_skips_when_contended() {
        let notes = ExternalNotes::new().unwrap();
        notes.append_non_rt(ExternalMidiNote::note_on(-1, 64, 90));
        let guard = notes.notes.lock();
        assert_eq!(notes.drain_rt(16, |_| {}), 0);
        drop(guard);
        assert_eq!(notes.drain_rt(16, |_| {}), 1);
    }

    #[test]
    fn consumers_are_sized_from_settings() {
        let settings = RtMemSettings {
            external_notes: PoolBounds::new(1, 1),
            post_rt_events: PoolBounds::new(2, 2),
            ..RtMemSettings::default()
        };
        let notes = ExternalNotes::from_settings(&settings).unwrap();
        assert!(notes.append_non_rt(ExternalMidiNote::note_on(0, 60, 1)));
        assert!(!notes.append_non_rt(ExternalMidiNote::note_on(0, 61, 1)));

        let events = PostRtEvents::from_settings(&settings).unwrap();
        assert!(events.append_rt(PostRtEvent::Debug { value: 1 }));
        assert!(events.append_rt(PostRtEvent::Debug { value: 2 }));
        assert!(!events.append_rt(PostRtEvent::Debug { value: 3 }));

        let inverted = RtMemSettings {
            external_notes: PoolBounds::new(4, 1),
            ..RtMemSettings::default()
        };
        assert!(ExternalNotes::from_settings(&inverted).is_err());
    }

    #[test]
    fn post_rt_events_flow_through_splice() {
        let events = PostRtEvents::with_bounds(PoolBounds::new(4, 4)).unwrap();
        assert!(events.append_rt(PostRtEvent::ProgramChange { index: 1 }));
        assert!(events.append_rt(PostRtEvent::ParameterChange { index: 2, value: 0.5 }));
        assert_eq!(events.drain(|_| {}), 0);

        assert!(events.try_splice());
        assert_eq!(events.pending_len(), 0);
        assert_eq!(events.published_len(), 2);

        let mut seen = Vec::new();
        assert_eq!(events.drain(|event| seen.push(event)), 2);
        assert_eq!(
            seen,
            [
                PostRtEvent::ProgramChange { index: 1 },
                PostRtEvent::ParameterChange { index: 2, value: 0.5 },
            ]
        );
    }

    #[test]
    fn post_rt_events_drop_when_exhausted_or_locked() {
        let events = PostRtEvents::with_bounds(PoolBounds::new(1, 1)).unwrap();
        assert!(events.append_rt(PostRtEvent::Debug { value: 1 }));
        assert!(!events.append_rt(PostRtEvent::Debug { value: 2 }));

        let data = events.data.lock();
        assert!(!events.try_splice());
        drop(data);
        assert!(events.try_splice());
        // nodes drained on the host side go back to the shared pool
        assert_eq!(events.drain(|_| {}), 1);
        assert!(events.append_rt(PostRtEvent::NoteOff { channel: 0, note: 60 }));

        let pending = events.pending.lock();
        assert!(!events.append_rt(PostRtEvent::Debug { value: 3 }));
        drop(pending);
        events.clear();
        assert_eq!(events.pending_len(), 0);
    }
}
