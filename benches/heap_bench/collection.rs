use super::bench_heap;
use criterion::Criterion;
use genheap::{CollectionKind, ObjectReference};

/// Build a list of `len` nodes in stack slot 0.
fn build_list(m: &mut genheap::Mutator, node: genheap::vm::TypeId, len: usize) {
    for i in 0..len {
        let o = m.alloc(node).unwrap();
        let head = m.slot(0);
        m.write_ref(o, 0, head);
        m.write_word(o, 1, i);
        m.set_slot(0, o);
    }
}

pub fn bench(c: &mut Criterion) {
    let fixture = bench_heap(8, 128);
    let mut m = fixture.heap.bind_mutator("bench");
    m.push_frame(1);

    // Every iteration promotes a fresh 10k node list.
    c.bench_function("young_gc_promote_10k", |b| {
        b.iter(|| {
            m.set_slot(0, ObjectReference::NULL);
            build_list(&mut m, fixture.node, 10_000);
            m.collect(CollectionKind::Young)
        })
    });

    m.set_slot(0, ObjectReference::NULL);
    m.collect(CollectionKind::Full);
    build_list(&mut m, fixture.node, 100_000);
    c.bench_function("full_gc_100k_live", |b| b.iter(|| m.collect(CollectionKind::Full)));
}
