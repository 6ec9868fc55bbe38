use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use harmoniq_rtmem::{Atom, AtomEventQueue, LocalRtList, RtList, RtMemPool, SharedRtMemPool};

fn pool_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("local_alloc_dealloc_64", |b| {
        let mut pool = RtMemPool::new("bench", 64, 64, 64).expect("pool");
        let mut held = Vec::with_capacity(64);
        b.iter(|| {
            while let Some(chunk) = pool.allocate_atomic() {
                held.push(chunk);
            }
            for chunk in held.drain(..) {
                pool.deallocate(black_box(chunk));
            }
        });
    });

    group.bench_function("shared_try_alloc_dealloc", |b| {
        let pool = SharedRtMemPool::new("bench-shared", 64, 64, 64).expect("pool");
        b.iter(|| {
            let chunk = pool.try_allocate_atomic().expect("chunk");
            pool.deallocate(black_box(chunk));
        });
    });

    group.finish();
}

fn list_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("list");

    group.bench_function("local_append_pop_256", |b| {
        let mut list = LocalRtList::<u64>::with_capacity("bench-list", 256, 256).expect("list");
        b.iter(|| {
            for value in 0..256u64 {
                let _ = list.append(value);
            }
            while let Some(value) = list.pop_first() {
                black_box(value);
            }
        });
    });

    group.bench_function("shared_splice_256", |b| {
        let pool = RtList::<u64>::create_pool("bench-splice", 256, 256).expect("pool");
        let mut pending = RtList::<u64>::new(pool.clone()).expect("list");
        let mut data = RtList::<u64>::new(pool).expect("list");
        b.iter(|| {
            for value in 0..256u64 {
                let _ = pending.append(value);
            }
            pending.splice_append(&mut data);
            data.clear();
        });
    });

    group.finish();
}

fn atom_queue_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("atom_queue");
    let body = [0x42u8; 32];

    group.bench_function("put_get_32b", |b| {
        let queue = AtomEventQueue::new();
        b.iter(|| {
            queue.try_put(Atom::new(1, &body), 0).expect("put");
            let mut guard = queue.lock();
            black_box(guard.get());
        });
    });

    group.bench_function("drain_32_entries", |b| {
        let queue = AtomEventQueue::new();
        b.iter(|| {
            for port in 0..32 {
                let _ = queue.put(Atom::new(2, &body), port);
            }
            queue.drain(|port, atom| {
                black_box((port, atom.body.len()));
            })
        });
    });

    group.finish();
}

criterion_group!(benches, pool_cycles, list_cycles, atom_queue_cycles);
criterion_main!(benches);
