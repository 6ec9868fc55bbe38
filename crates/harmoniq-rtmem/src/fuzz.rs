//! Operation-stream harnesses shared by the fuzz targets and tests.
//!
//! Each harness replays arbitrary bytes as a sequence of operations against
//! the real type and a trivially correct model, and panics on divergence.

use std::collections::VecDeque;

use crate::atom::{Atom, AtomEventQueue, AtomHeader};
use crate::error::QueueError;
use crate::ring::RingBuffer;

const FRAME_OVERHEAD: usize = AtomHeader::SIZE + std::mem::size_of::<i32>();

struct Ops<'a> {
    data: &'a [u8],
}

impl<'a> Ops<'a> {
    fn byte(&mut self) -> Option<u8> {
        let (&first, rest) = self.data.split_first()?;
        self.data = rest;
        Some(first)
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let len = len.min(self.data.len());
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        head
    }
}

/// Drives writes, commits and reads through a small [`RingBuffer`].
pub fn fuzz_ring_ops(data: &[u8]) {
    let mut ops = Ops { data };
    let Some(capacity) = ops.byte() else {
        return;
    };
    let capacity = usize::from(capacity % 64).max(2);
    let mut ring = RingBuffer::new(capacity);
    let mut committed = VecDeque::new();
    let mut staged = Vec::new();
    let mut invalid = false;

    while let Some(op) = ops.byte() {
        let len = usize::from(ops.byte().unwrap_or(0) % 32);
        match op % 4 {
            0 => {
                let payload = ops.bytes(len);
                let free = capacity - 1 - committed.len() - staged.len();
                let expected = if payload.is_empty() {
                    !invalid
                } else if invalid || payload.len() > free {
                    invalid = true;
                    false
                } else {
                    staged.extend_from_slice(payload);
                    true
                };
                assert_eq!(ring.write(payload), expected);
            }
            1 => {
                let expected = if invalid {
                    staged.clear();
                    invalid = false;
                    false
                } else if staged.is_empty() {
                    false
                } else {
                    committed.extend(staged.drain(..));
                    true
                };
                assert_eq!(ring.commit_write(), expected);
            }
            2 => {
                let mut out = vec![0u8; len];
                let expected = len > 0 && len <= committed.len();
                assert_eq!(ring.read(&mut out), expected);
                if expected {
                    let model: Vec<u8> = committed.drain(..len).collect();
                    assert_eq!(out, model);
                }
            }
            _ => {
                ring.clear();
                committed.clear();
                staged.clear();
                invalid = false;
            }
        }
        assert_eq!(ring.readable_len(), committed.len());
        assert_eq!(ring.is_empty(), committed.is_empty());
    }
}

/// Drives puts, gets and transfers through a small [`AtomEventQueue`].
pub fn fuzz_atom_queue_ops(data: &[u8]) {
    const CAPACITY: usize = 256;
    const MAX_ATOM: usize = 48;

    let mut ops = Ops { data };
    let queue = AtomEventQueue::with_capacity(CAPACITY, MAX_ATOM);
    let mut model: VecDeque<(u32, u32, Vec<u8>)> = VecDeque::new();
    let mut used = 0usize;

    while let Some(op) = ops.byte() {
        match op % 4 {
            0 => {
                let kind = u32::from(ops.byte().unwrap_or(0)) | 1;
                let port = u32::from(ops.byte().unwrap_or(0));
                let len = usize::from(ops.byte().unwrap_or(0) % 64);
                let body = ops.bytes(len);
                let result = queue.try_put(Atom::new(kind, body), port);
                if body.len() > MAX_ATOM {
                    assert_eq!(
                        result,
                        Err(QueueError::Oversized {
                            size: body.len(),
                            max: MAX_ATOM
                        })
                    );
                } else if used + FRAME_OVERHEAD + body.len() > CAPACITY - 1 {
                    assert_eq!(result, Err(QueueError::Full));
                } else {
                    assert_eq!(result, Ok(()));
                    used += FRAME_OVERHEAD + body.len();
                    model.push_back((port, kind, body.to_vec()));
                }
            }
            1 => {
                let mut guard = queue.lock();
                let got = guard.get().map(|(port, atom)| (port, atom.kind, atom.body.to_vec()));
                let expected = model.pop_front();
                if let Some((_, _, body)) = &expected {
                    used -= FRAME_OVERHEAD + body.len();
                }
                assert_eq!(got, expected);
            }
            2 => {
                let other = AtomEventQueue::with_capacity(CAPACITY, MAX_ATOM);
                assert!(other.copy_data_from(&queue));
                assert!(queue.is_empty());
                assert!(queue.copy_data_from(&other));
            }
            _ => {
                let mut drained = Vec::new();
                queue.drain(|port, atom| drained.push((port, atom.kind, atom.body.to_vec())));
                assert_eq!(drained, Vec::from(std::mem::take(&mut model)));
                used = 0;
            }
        }
        assert_eq!(queue.is_empty(), model.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn ring_harness_accepts_random_streams() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let len = rng.gen_range(0..512);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            fuzz_ring_ops(&data);
        }
    }

    #[test]
    fn atom_harness_accepts_random_streams() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let len = rng.gen_range(0..512);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            fuzz_atom_queue_ops(&data);
        }
    }
}
