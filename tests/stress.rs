//! Several mutators mutate private object graphs while allocation, stress
//! and explicit collections interleave. The heap is verified around every
//! collection.

mod common;

use common::*;
use genheap::util::constants::BYTES_IN_PAGE;
use genheap::{CollectionKind, ObjectReference};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const THREADS: usize = 4;
const SLOTS: usize = 8;
const STEPS: usize = 10_000;

fn tag(thread: usize, n: usize) -> usize {
    (thread << 32) | n
}

#[test]
fn concurrent_mutators_keep_their_graphs_intact() {
    let heap = heap_with(|o| {
        o.young_size = 32 * BYTES_IN_PAGE;
        o.old_size = 512 * BYTES_IN_PAGE;
        o.stress_factor = 64 * BYTES_IN_PAGE;
    });
    let types = std::sync::Arc::new(register_types(&heap));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = heap.clone();
            let types = types.clone();
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut m = heap.bind_mutator(&format!("stress-{}", t));
                m.push_frame(SLOTS);
                let weak_queue = heap.new_reference_queue();
                let mut created = 0;
                for _ in 0..STEPS {
                    let dst = rng.random_range(0..SLOTS);
                    let src = rng.random_range(0..SLOTS);
                    match rng.random_range(0..100) {
                        0..=49 => {
                            let next = m.slot(src);
                            let node = new_node(&mut m, &types, next, tag(t, created));
                            created += 1;
                            m.set_slot(dst, node);
                        }
                        50..=69 => {
                            let from = m.slot(src);
                            if !from.is_null() {
                                let next = m.read_ref(from, NEXT);
                                m.set_slot(dst, next);
                            }
                        }
                        70..=79 => {
                            // Link two graphs; old-to-young stores go through the barrier.
                            let (a, b) = (m.slot(src), m.slot(dst));
                            if !a.is_null() {
                                m.write_ref(a, NEXT, b);
                            }
                        }
                        80..=89 => m.set_slot(dst, ObjectReference::NULL),
                        90..=95 => {
                            let target = m.slot(src);
                            if !target.is_null() {
                                let weak = m.new_reference(types.weak, target, Some(weak_queue)).unwrap();
                                m.set_slot(dst, weak);
                            }
                        }
                        96..=98 => m.poll(),
                        _ => {
                            let kind = if rng.random_bool(0.5) {
                                CollectionKind::Young
                            } else {
                                CollectionKind::Full
                            };
                            m.collect(kind);
                        }
                    }
                    while m.poll_reference_queue(weak_queue).is_some() {}
                    check_slots(&m, &types, t);
                }
                m.pop_frame();
                created
            })
        })
        .collect();

    let created: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(created > THREADS * STEPS / 3);
    assert!(heap.gc_count() > 0);
    assert!(heap.verify().is_ok());
}

/// Every node reachable from this thread's slots was created by it. Cycles
/// are possible, so the walk is bounded.
fn check_slots(m: &genheap::Mutator, types: &Types, thread: usize) {
    for slot in 0..SLOTS {
        let mut node = m.slot(slot);
        let mut steps = 0;
        while !node.is_null() && steps < 16 {
            steps += 1;
            if m.type_of(node) == types.weak {
                node = m.reference_get(node).unwrap();
                continue;
            }
            assert_eq!(m.read_word(node, VALUE) >> 32, thread);
            node = m.read_ref(node, NEXT);
        }
    }
}
