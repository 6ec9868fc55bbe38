use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use harmoniq_rtmem::{ExternalMidiNote, ExternalNotes, PoolBounds, PostRtEvent, PostRtEvents};

#[test]
fn notes_from_ui_reach_audio_thread_in_order() {
    let notes = Arc::new(ExternalNotes::new().unwrap());
    let done = Arc::new(AtomicBool::new(false));
    const COUNT: usize = 2_000;

    let audio = {
        let notes = Arc::clone(&notes);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut received = Vec::with_capacity(COUNT);
            loop {
                let finished = done.load(Ordering::Acquire);
                notes.drain_rt(64, |note| received.push(note));
                if finished && notes.is_empty() {
                    break received;
                }
                thread::yield_now();
            }
        })
    };

    for i in 0..COUNT {
        let note = ExternalMidiNote::note_on((i % 16) as i8, (i % 128) as u8, 100);
        while !notes.append_non_rt(note) {
            thread::yield_now();
        }
    }
    done.store(true, Ordering::Release);

    let received = audio.join().unwrap();
    assert_eq!(received.len(), COUNT);
    for (i, note) in received.iter().enumerate() {
        assert_eq!(note.note, (i % 128) as u8);
        assert_eq!(note.channel, (i % 16) as i8);
    }
}

#[test]
fn post_rt_events_survive_contention() {
    let events = Arc::new(PostRtEvents::with_bounds(PoolBounds::new(256, 256)).unwrap());
    let stop = Arc::new(AtomicBool::new(false));
    const CYCLES: u32 = 3_000;

    let audio = {
        let events = Arc::clone(&events);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut accepted = 0u32;
            for cycle in 0..CYCLES {
                if events.append_rt(PostRtEvent::ParameterChange {
                    index: cycle,
                    value: cycle as f32,
                }) {
                    accepted += 1;
                }
                events.try_splice();
            }
            while events.pending_len() > 0 {
                events.try_splice();
                thread::yield_now();
            }
            stop.store(true, Ordering::Release);
            accepted
        })
    };

    let mut seen = Vec::new();
    loop {
        let finished = stop.load(Ordering::Acquire);
        events.drain(|event| seen.push(event));
        if finished {
            break;
        }
        thread::yield_now();
    }
    let accepted = audio.join().unwrap();

    assert_eq!(seen.len() as u32, accepted);
    let indices: Vec<u32> = seen
        .iter()
        .map(|event| match event {
            PostRtEvent::ParameterChange { index, .. } => *index,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
}
