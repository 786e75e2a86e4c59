use super::bench_heap;
use criterion::Criterion;
use genheap::AllocationSemantics;
use std::hint::black_box;

pub fn bench(c: &mut Criterion) {
    let fixture = bench_heap(8, 64);
    let mut m = fixture.heap.bind_mutator("bench");

    // Garbage only: measures the TLAB fast path plus the occasional young GC.
    c.bench_function("alloc_young", |b| {
        b.iter(|| black_box(m.alloc(fixture.node).unwrap()))
    });

    c.bench_function("alloc_mature", |b| {
        b.iter(|| {
            black_box(
                m.alloc_with_semantics(fixture.node, None, AllocationSemantics::Mature)
                    .unwrap(),
            )
        })
    });
}
