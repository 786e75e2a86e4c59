use criterion::Criterion;
use genheap::util::constants::BYTES_IN_MBYTE;
use genheap::vm::{TypeDescriptor, TypeId};
use genheap::{Heap, HeapBuilder};
use std::sync::Arc;

mod alloc;
mod collection;

pub struct BenchHeap {
    pub heap: Arc<Heap>,
    pub node: TypeId,
}

/// `Node { next: ref, value: word }`
pub fn bench_heap(young_mb: usize, old_mb: usize) -> BenchHeap {
    let mut builder = HeapBuilder::new_no_env_vars();
    builder
        .set_option("young_size", &(young_mb * BYTES_IN_MBYTE).to_string())
        .unwrap();
    builder
        .set_option("old_size", &(old_mb * BYTES_IN_MBYTE).to_string())
        .unwrap();
    // Explicit young requests stay young.
    builder.set_option("full_heap_system_gc", "false").unwrap();
    let heap = builder.build();
    let node = heap
        .register_type(TypeDescriptor::instance("Node", 2, &[0]))
        .unwrap();
    BenchHeap { heap, node }
}

pub fn bench(c: &mut Criterion) {
    alloc::bench(c);
    collection::bench(c);
}
