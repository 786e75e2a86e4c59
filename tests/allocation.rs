mod common;

use common::*;
use genheap::util::constants::{BYTES_IN_PAGE, BYTES_IN_WORD};
use genheap::util::options::CompactionPolicy;
use genheap::vm::{object_model, StackMap};
use genheap::{AllocError, AllocationSemantics, CollectionKind, Mutator, ObjectReference};
use std::panic::{self, AssertUnwindSafe};

#[test]
fn reachable_list_survives_young_and_full_collections() {
    let heap = heap_with(|o| o.full_heap_system_gc = false);
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    build_list(&mut m, &types, 0, 500);
    let expected: Vec<usize> = (0..500).rev().collect();
    let head = m.slot(0);

    let young = m.collect(CollectionKind::Young).unwrap();
    assert_eq!(young.kind, CollectionKind::Young);
    assert_eq!(young.promoted_bytes, 500 * object_model::object_words(2) * BYTES_IN_WORD);
    assert_ne!(m.slot(0), head, "promotion moves the object and updates the root");
    assert_eq!(list_values(&m, m.slot(0)), expected);

    let full = m.collect(CollectionKind::Full).unwrap();
    assert_eq!(full.kind, CollectionKind::Full);
    assert_eq!(list_values(&m, m.slot(0)), expected);
    assert_eq!(heap.gc_count(), 2);
}

#[test]
fn unreachable_objects_are_reclaimed_in_one_cycle() {
    let heap = heap();
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    build_list(&mut m, &types, 0, 1000);
    m.collect(CollectionKind::Full).unwrap();
    let used = heap.used_bytes();

    m.set_slot(0, ObjectReference::NULL);
    let gc = m.collect(CollectionKind::Full).unwrap();
    assert_eq!(gc.freed_objects(), 1000);
    assert!(heap.used_bytes() < used);
    assert_eq!(gc.live_objects, 0);
}

#[test]
fn allocation_after_out_of_memory_succeeds_once_roots_are_dropped() {
    let heap = heap_with(|o| {
        o.verify_heap = false;
        o.old_size = 32 * BYTES_IN_PAGE;
        o.young_size = 16 * BYTES_IN_PAGE;
    });
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    let mut allocated = 0;
    let err = loop {
        match m.alloc(types.node) {
            Ok(node) => {
                let head_now = m.slot(0);
                m.write_ref(node, NEXT, head_now);
                m.set_slot(0, node);
                allocated += 1;
            }
            Err(e) => {
                // The failed allocation must not have moved or lost the list.
                assert_eq!(list_values(&m, m.slot(0)).len(), allocated);
                break e;
            }
        }
    };
    assert!(matches!(err, AllocError::OutOfMemory { .. }), "{}", err);
    assert!(allocated > 1000);
    // The last resort collection cleared soft references.
    assert!(heap.last_iteration().unwrap().clear_soft_references);

    m.set_slot(0, ObjectReference::NULL);
    m.collect(CollectionKind::Full).unwrap();
    assert!(m.alloc(types.node).is_ok());
}

#[test]
fn too_large_fails_without_collecting() {
    let heap = heap();
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    let err = m.alloc_array(types.word_array, 1 << 20).unwrap_err();
    assert!(matches!(err, AllocError::TooLarge { .. }));
    assert_eq!(heap.gc_count(), 0);
}

#[test]
fn dead_stack_slots_are_cleared() {
    let heap = heap();
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(2);
    let a = new_node(&mut m, &types, ObjectReference::NULL, 1);
    m.set_slot(0, a);
    let b = new_node(&mut m, &types, ObjectReference::NULL, 2);
    m.set_slot(1, b);
    m.set_stack_map(StackMap::with_live(2, &[0])).unwrap();

    m.collect(CollectionKind::Full).unwrap();
    assert_eq!(m.read_word(m.slot(0), VALUE), 1);
    assert!(m.slot(1).is_null());
}

#[test]
fn frames_are_roots_until_popped() {
    let heap = heap();
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    build_list(&mut m, &types, 0, 10);
    m.push_frame(1);
    build_list(&mut m, &types, 0, 20);
    assert_eq!(m.stack_depth(), 2);
    assert!(m.pop_frame());
    let gc = m.collect(CollectionKind::Full).unwrap();
    assert_eq!(gc.freed_objects(), 20);
    assert_eq!(list_values(&m, m.slot(0)).len(), 10);
}

#[test]
fn large_objects_survive_in_place_and_are_reclaimed() {
    let heap = heap_with(|o| o.full_heap_system_gc = false);
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    // Above the threshold: goes to the large object space even with Default.
    let array = m.alloc_array(types.ref_array, BYTES_IN_PAGE).unwrap();
    m.set_slot(0, array);
    let child = new_node(&mut m, &types, ObjectReference::NULL, 42);
    let array = m.slot(0);
    m.write_ref(array, 7, child);

    m.collect(CollectionKind::Young).unwrap();
    assert_eq!(m.slot(0), array, "large objects never move");
    let child = m.read_ref(array, 7);
    assert_eq!(m.read_word(child, VALUE), 42);

    m.set_slot(0, ObjectReference::NULL);
    let gc = m.collect(CollectionKind::Full).unwrap();
    assert_eq!(gc.freed_objects(), 2);
}

#[test]
fn pretenured_objects_are_reached_through_the_card_table() {
    let heap = heap_with(|o| o.full_heap_system_gc = false);
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    let old = m
        .alloc_with_semantics(types.node, None, AllocationSemantics::Mature)
        .unwrap();
    m.set_slot(0, old);
    // The only reference to the young node is from the old object.
    let young = new_node(&mut m, &types, ObjectReference::NULL, 7);
    let old = m.slot(0);
    m.write_ref(old, NEXT, young);

    m.collect(CollectionKind::Young).unwrap();
    let moved = m.read_ref(m.slot(0), NEXT);
    assert_ne!(moved, young);
    assert_eq!(m.read_word(moved, VALUE), 7);
}

/// A reference array that fits in one page, allocated in the large object
/// space and kept in `slot`.
fn one_page_large_array(m: &mut Mutator, types: &Types, slot: usize) -> ObjectReference {
    let length = BYTES_IN_PAGE / BYTES_IN_WORD - object_model::object_words(0);
    let array = m
        .alloc_with_semantics(types.ref_array, Some(length), AllocationSemantics::Large)
        .unwrap();
    m.set_slot(slot, array);
    array
}

#[test]
fn every_large_object_on_a_dirty_card_is_scanned() {
    let heap = heap_with(|o| {
        o.full_heap_system_gc = false;
        o.card_size = 2 * BYTES_IN_PAGE;
    });
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(2);
    let a = one_page_large_array(&mut m, &types, 0);
    let b = one_page_large_array(&mut m, &types, 1);
    assert_eq!(b.to_address(), a.to_address() + BYTES_IN_PAGE);
    m.collect(CollectionKind::Young).unwrap();

    // Only the second array on the card refers to the young node.
    let node = new_node(&mut m, &types, ObjectReference::NULL, 4242);
    m.write_ref(m.slot(1), 0, node);
    m.collect(CollectionKind::Young).unwrap();
    let moved = m.read_ref(m.slot(1), 0);
    assert_ne!(moved, node);
    assert_eq!(m.read_word(moved, VALUE), 4242);
    assert!(heap.verify().is_ok());
}

#[test]
fn dirty_card_straddling_the_old_and_large_object_spaces() {
    let heap = heap_with(|o| {
        o.full_heap_system_gc = false;
        // The card holding the end of the 200-page old space also covers
        // the guard gap and the first pages of the large object space.
        o.card_size = 32 * BYTES_IN_PAGE;
        o.old_size = 200 * BYTES_IN_PAGE;
    });
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(2);
    one_page_large_array(&mut m, &types, 0);
    let old = m
        .alloc_with_semantics(types.node, None, AllocationSemantics::Mature)
        .unwrap();
    m.set_slot(1, old);
    m.collect(CollectionKind::Young).unwrap();

    let first = new_node(&mut m, &types, ObjectReference::NULL, 1);
    m.write_ref(m.slot(0), 3, first);
    let second = new_node(&mut m, &types, ObjectReference::NULL, 2);
    m.write_ref(m.slot(1), NEXT, second);
    m.collect(CollectionKind::Young).unwrap();
    assert_eq!(m.read_word(m.read_ref(m.slot(0), 3), VALUE), 1);
    assert_eq!(m.read_word(m.read_ref(m.slot(1), NEXT), VALUE), 2);
}

#[test]
fn heap_recovers_after_a_collection_panicked() {
    let heap = heap_with(|o| o.full_heap_system_gc = false);
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(2);
    let node = new_node(&mut m, &types, ObjectReference::NULL, 8);
    m.set_slot(0, node);
    // A root into the middle of an object fails verification.
    let interior = ObjectReference::from_address(node.to_address() + BYTES_IN_WORD);
    m.set_slot(1, interior);

    let outcome = m.in_native(|| panic::catch_unwind(AssertUnwindSafe(|| heap.collect(CollectionKind::Young))));
    assert!(outcome.is_err());
    assert!(!heap.is_in_gc());

    m.set_slot(1, ObjectReference::NULL);
    let gc = m.collect(CollectionKind::Young).unwrap();
    assert_eq!(gc.kind, CollectionKind::Young);
    assert_eq!(m.read_word(m.slot(0), VALUE), 8);
    let other = heap.bind_mutator("other");
    drop(other);
    assert!(m.collect(CollectionKind::Full).is_some());
}

#[test]
fn compaction_preserves_contents_and_identity_hashes() {
    let heap = heap_with(|o| o.compaction = CompactionPolicy::Always);
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(2);
    // Interleave kept and dropped nodes in the old space.
    for i in 0..400 {
        let slot = i % 2;
        let head = m.slot(slot);
        let node = m
            .alloc_with_semantics(types.node, None, AllocationSemantics::Mature)
            .unwrap();
        m.write_ref(node, NEXT, head);
        m.write_word(node, VALUE, i);
        m.set_slot(slot, node);
    }
    let hash = m.identity_hash(m.slot(0));
    let expected = list_values(&m, m.slot(0));
    m.set_slot(1, ObjectReference::NULL);

    let gc = m.collect(CollectionKind::Full).unwrap();
    assert!(gc.compacted);
    assert_eq!(gc.freed_objects(), 200);
    assert_eq!(list_values(&m, m.slot(0)), expected);
    assert_eq!(m.identity_hash(m.slot(0)), hash);
}

#[test]
fn compaction_falls_back_to_sweeping_without_scratch_space() {
    let heap = heap_with(|o| {
        o.compaction = CompactionPolicy::Always;
        o.compaction_scratch_limit = 0;
    });
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    build_list(&mut m, &types, 0, 100);
    let gc = m.collect(CollectionKind::Full).unwrap();
    assert!(!gc.compacted);
    assert!(gc.compaction_fallback);
    assert_eq!(list_values(&m, m.slot(0)).len(), 100);
}

#[test]
fn statics_are_roots_until_the_class_is_unloaded() {
    let heap = heap();
    let types = register_types(&heap);
    let class = heap.register_class("Config", 1);
    let mut m = heap.bind_mutator("main");
    let node = new_node(&mut m, &types, ObjectReference::NULL, 99);
    m.set_static(class, 0, node).unwrap();

    m.collect(CollectionKind::Full).unwrap();
    let node = m.get_static(class, 0).unwrap();
    assert_eq!(m.read_word(node, VALUE), 99);

    heap.unload_class(class).unwrap();
    assert!(m.get_static(class, 0).is_err());
    let gc = m.collect(CollectionKind::Full).unwrap();
    assert_eq!(gc.freed_objects(), 1);
}

#[test]
fn ignored_explicit_requests_do_not_collect() {
    let heap = heap_with(|o| o.ignore_system_gc = true);
    let mut m = heap.bind_mutator("main");
    assert!(m.collect(CollectionKind::Full).is_none());
    assert_eq!(heap.gc_count(), 0);
}

#[test]
fn stress_factor_triggers_young_collections() {
    let heap = heap_with(|o| o.stress_factor = 4 * BYTES_IN_PAGE);
    let types = register_types(&heap);
    let mut m = heap.bind_mutator("main");
    m.push_frame(1);
    build_list(&mut m, &types, 0, 2000);
    assert!(heap.gc_count() > 0);
    assert_eq!(list_values(&m, m.slot(0)).len(), 2000);
}
