// Each test binary uses a different subset of the helpers.
#![allow(dead_code)]

use genheap::util::constants::BYTES_IN_PAGE;
use genheap::util::options::Options;
use genheap::vm::{ReferenceKind, TypeDescriptor, TypeId};
use genheap::{Heap, HeapBuilder, Mutator, ObjectReference};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `Node { next: ref, value: word }`
pub const NEXT: usize = 0;
pub const VALUE: usize = 1;

pub struct Types {
    pub node: TypeId,
    pub ref_array: TypeId,
    pub word_array: TypeId,
    pub weak: TypeId,
    pub soft: TypeId,
    pub phantom: TypeId,
}

pub fn register_types(heap: &Heap) -> Types {
    Types {
        node: heap
            .register_type(TypeDescriptor::instance("Node", 2, &[NEXT]))
            .unwrap(),
        ref_array: heap.register_type(TypeDescriptor::ref_array("Object[]")).unwrap(),
        word_array: heap.register_type(TypeDescriptor::prim_array("long[]")).unwrap(),
        weak: heap
            .register_type(TypeDescriptor::reference("WeakReference", ReferenceKind::Weak))
            .unwrap(),
        soft: heap
            .register_type(TypeDescriptor::reference("SoftReference", ReferenceKind::Soft))
            .unwrap(),
        phantom: heap
            .register_type(TypeDescriptor::reference("PhantomReference", ReferenceKind::Phantom))
            .unwrap(),
    }
}

/// A small heap that verifies itself around every collection.
pub fn heap() -> Arc<Heap> {
    heap_with(|_| {})
}

pub fn heap_with<F: FnOnce(&mut Options)>(configure: F) -> Arc<Heap> {
    let mut builder = HeapBuilder::new_no_env_vars();
    {
        let options = builder.options_mut();
        options.young_size = 64 * BYTES_IN_PAGE;
        options.old_size = 256 * BYTES_IN_PAGE;
        options.los_size = 256 * BYTES_IN_PAGE;
        options.tlab_size = 2 * BYTES_IN_PAGE;
        options.large_object_threshold = 4 * BYTES_IN_PAGE;
        options.gc_threads = 2;
        options.verify_heap = true;
        configure(options);
    }
    builder.build()
}

pub fn new_node(m: &mut Mutator, types: &Types, next: ObjectReference, value: usize) -> ObjectReference {
    // `next` must survive the allocation.
    let fence = m.push_fence(next);
    let node = m.alloc(types.node).unwrap();
    let next = m.pop_fence(fence);
    m.write_ref(node, NEXT, next);
    m.write_word(node, VALUE, value);
    node
}

/// Build a list of `len` nodes with values `0..len` (head holds `len - 1`)
/// in stack slot `slot` of the top frame.
pub fn build_list(m: &mut Mutator, types: &Types, slot: usize, len: usize) {
    for i in 0..len {
        let head = m.slot(slot);
        let node = new_node(m, types, head, i);
        m.set_slot(slot, node);
    }
}

/// The values of a list, head first.
pub fn list_values(m: &Mutator, mut node: ObjectReference) -> Vec<usize> {
    let mut values = vec![];
    while !node.is_null() {
        values.push(m.read_word(node, VALUE));
        node = m.read_ref(node, NEXT);
    }
    values
}

/// Wait until `cond` holds, failing the test after `timeout`.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < timeout, "condition not reached within {:?}", timeout);
        std::thread::sleep(Duration::from_millis(1));
    }
}
