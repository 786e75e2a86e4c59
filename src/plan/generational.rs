//! The collection driver: stop the world, run a young or a full collection,
//! process references and finalizers, reclaim, resume.

use crate::global_state::GcStatus;
use crate::heap::Heap;
use crate::plan::compactor::{self, Census};
use crate::plan::global::{choose_collection_kind, next_collection_kind, CollectionKind, GcCause};
use crate::plan::roots;
use crate::plan::tracing::{FullTracer, NurseryTracer, ObjectTracer};
use crate::policy::space::{Space, SpaceKind};
use crate::scheduler::{ThreadHandle, ThreadRecord};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::options::CompactionPolicy;
use crate::util::sanity;
use crate::util::statistics::{GcIteration, Reclaimed};
use crate::util::ObjectReference;
use crate::vm::object_model;
use crate::vm::types::{ReferenceKind, TypeTable};
use probe::probe;
use std::collections::HashSet;
use std::time::Instant;

/// What a requester asked for.
#[derive(Copy, Clone, Debug)]
pub(crate) struct CollectionRequest {
    pub kind: CollectionKind,
    pub cause: GcCause,
    pub clear_soft_references: bool,
}

impl CollectionRequest {
    pub fn new(kind: CollectionKind, cause: GcCause) -> Self {
        CollectionRequest {
            kind,
            cause,
            clear_soft_references: false,
        }
    }

    pub fn clearing_soft_references(mut self) -> Self {
        self.clear_soft_references = true;
        self
    }
}

/// Run one collection. The caller holds the collection lock of the heap's
/// [`GcRequester`](crate::plan::gc_requester::GcRequester); `requester` is
/// the calling mutator, if any, and must already be in a GC-safe state.
pub(crate) fn collect(heap: &Heap, requester: Option<&ThreadRecord>, request: CollectionRequest) -> GcIteration {
    let start = Instant::now();
    let id = heap.stats.lock().unwrap().gc_count() + 1;

    heap.state.set_gc_status(GcStatus::GcPrepare);
    heap.state
        .user_triggered_collection
        .store(request.cause == GcCause::Explicit, std::sync::atomic::Ordering::Relaxed);
    let world = StoppedWorld {
        heap,
        stopped: heap.threads.suspend_all(requester.map(|r| r.id())),
    };
    heap.state.set_gc_status(GcStatus::GcProper);

    let threads = heap.threads.snapshot();
    retire_tlabs(heap, &threads);

    let kind = choose_collection_kind(request.kind, &heap.spaces);
    probe!(genheap, gc_start, id, kind as usize);
    debug!("GC {} ({} {}), {} threads stopped", id, request.cause, kind, world.stopped.len());

    let mut iteration = GcIteration::new(id, kind, request.cause);
    iteration.clear_soft_references = request.clear_soft_references;
    iteration.used_before = heap.spaces.used_bytes();
    iteration.capacity = heap.spaces.capacity_bytes();

    let verify = heap.options.verify_heap || cfg!(feature = "extreme_assertions");
    if verify {
        verify_or_panic(heap, &threads, "before");
    }

    let types = heap.types.snapshot();
    match kind {
        CollectionKind::Young => young_collection(heap, &threads, &types, &mut iteration),
        CollectionKind::Full => full_collection(heap, &threads, &types, &mut iteration),
    }

    if verify {
        verify_or_panic(heap, &threads, "after");
    }

    let next = next_collection_kind(&heap.spaces);
    heap.state
        .next_collection_kind
        .store(next, std::sync::atomic::Ordering::Relaxed);
    iteration.used_after = heap.spaces.used_bytes();
    iteration.pause = start.elapsed();
    if heap.options.log_gc || request.cause == GcCause::Explicit {
        info!("{}", iteration.summary());
    } else {
        debug!("{}", iteration.summary());
    }
    heap.stats.lock().unwrap().record(iteration.clone());

    heap.state.reset_allocation_bytes();
    if iteration.finalizers_queued > 0 {
        heap.finalizer_signal.notify();
    }
    drop(world);
    probe!(genheap, gc_end, id);
    iteration
}

/// Leaves the GC state and resumes the stopped threads when dropped, so a
/// collection that panics does not leave the mutators parked for good.
struct StoppedWorld<'a> {
    heap: &'a Heap,
    stopped: Vec<ThreadHandle>,
}

impl Drop for StoppedWorld<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Collection panicked, resuming {} threads", self.stopped.len());
        }
        self.heap.state.set_gc_status(GcStatus::NotInGC);
        self.heap
            .state
            .user_triggered_collection
            .store(false, std::sync::atomic::Ordering::Relaxed);
        self.heap.threads.resume_all(&self.stopped);
    }
}

/// Give up every thread's TLAB so the young space can be walked.
pub(crate) fn retire_tlabs(heap: &Heap, threads: &[ThreadHandle]) {
    let young = heap.spaces.young.memory();
    for thread in threads {
        thread.locals.lock().unwrap().tlab.retire(young);
    }
}

pub(crate) fn verify_or_panic(heap: &Heap, threads: &[ThreadHandle], when: &str) {
    if let Err(errors) = sanity::verify_heap(heap, threads) {
        for e in errors.iter().take(20) {
            error!("Heap verification {} GC: {}", when, e);
        }
        panic!(
            "Heap verification {} GC failed with {} errors, first: {}",
            when,
            errors.len(),
            errors[0]
        );
    }
}

/// Reference processing and finalization, shared by both kinds of
/// collection. Runs after the closure over the strong roots.
fn process_weak_roots<T: ObjectTracer>(heap: &Heap, tracer: &mut T, iteration: &mut GcIteration) {
    let options = &heap.options;
    if options.no_reference_types {
        heap.references.lock().unwrap().forward_candidates(tracer);
    } else {
        let mut references = heap.references.lock().unwrap();
        if !iteration.clear_soft_references {
            references.retain_soft_referents(tracer);
        }
        let mut stats = references.scan(ReferenceKind::Soft, tracer, false);
        stats += references.scan(ReferenceKind::Weak, tracer, false);
        iteration.references_cleared += stats.cleared;
        iteration.references_enqueued += stats.enqueued;
    }

    if !options.no_finalizer {
        let queued = heap.finalizable.lock().unwrap().scan(tracer);
        tracer.process_closure();
        iteration.finalizers_queued = queued;
    }

    if !options.no_reference_types {
        let mut references = heap.references.lock().unwrap();
        let mut stats = references.scan(ReferenceKind::Soft, tracer, true);
        stats += references.scan(ReferenceKind::Weak, tracer, true);
        stats += references.scan(ReferenceKind::Phantom, tracer, true);
        iteration.references_cleared += stats.cleared;
        iteration.references_enqueued += stats.enqueued;
    }

    iteration.weak_globals_cleared = roots::sweep_weak_globals(heap, |o| {
        if tracer.is_live(o) {
            tracer.get_forwarded(o)
        } else {
            ObjectReference::NULL
        }
    });
}

fn young_collection(heap: &Heap, threads: &[ThreadHandle], types: &TypeTable, iteration: &mut GcIteration) {
    let spaces = &heap.spaces;
    spaces.los.prepare(false);
    let mut tracer = NurseryTracer::new(spaces, types, heap.options.no_reference_types);

    roots::scan_roots(heap, threads, &mut |_, slot| *slot = tracer.trace_object(*slot));

    // Mature objects on dirty cards. A card can hold several large objects
    // or straddle the end of the old space and the start of the LOS.
    let dirty = heap.cards.dirty_cards();
    let old = spaces.old.memory();
    let large = spaces.los.memory();
    let mut large_scanned = HashSet::new();
    for (start, end) in dirty.iter().copied() {
        let mut objects = vec![];
        let (from, to) = (start.max(old.start()), end.min(old.end()));
        if from < to {
            spaces.old.for_each_object_overlapping(from, to, &mut |o| objects.push(o));
        }
        let (from, to) = (start.max(large.start()), end.min(large.end()));
        if from < to {
            spaces.los.for_each_object_overlapping(from, to, &mut |o| {
                if !object_model::is_young_large(large, o) && large_scanned.insert(o) {
                    objects.push(o);
                }
            });
        }
        objects.into_iter().for_each(|o| tracer.scan_object(o));
    }
    trace!("Scanned {} dirty cards", dirty.len());
    tracer.process_closure();

    process_weak_roots(heap, &mut tracer, iteration);

    // Everything in the young space that was not copied is garbage.
    let young = spaces.young.memory();
    let mut dead = Reclaimed::default();
    spaces.young.for_each_object(&mut |o| {
        if object_model::get_forwarded(young, o).is_none() {
            dead.objects += 1;
            dead.bytes += object_model::size_words(young, o) * BYTES_IN_WORD;
        }
    });
    spaces.young.reset();
    iteration.reclaimed[SpaceKind::Young] = dead;
    iteration.reclaimed[SpaceKind::Large] = spaces.los.release(false);
    iteration.promoted_bytes = tracer.promoted_bytes;
    iteration.live_objects = tracer.promoted_objects + tracer.large_survivors;
    heap.cards.clear_all();
}

fn full_collection(heap: &Heap, threads: &[ThreadHandle], types: &TypeTable, iteration: &mut GcIteration) {
    let spaces = &heap.spaces;
    let options = &heap.options;
    spaces.los.prepare(true);
    let mut tracer = FullTracer::new(spaces, types, options.no_reference_types, &heap.workers);

    roots::scan_roots(heap, threads, &mut |_, slot| {
        tracer.trace_object(*slot);
    });
    tracer.process_closure();
    process_weak_roots(heap, &mut tracer, iteration);
    iteration.live_objects = tracer.marked;

    let census = Census::take(spaces);
    let compact = match options.compaction {
        CompactionPolicy::Never => false,
        CompactionPolicy::Always => true,
        CompactionPolicy::WhenFragmented => {
            census.old_fragmentation_percent(spaces) >= options.fragmentation_threshold
        }
    };
    let mut compacted = false;
    if compact {
        match compactor::plan(spaces, &census, options.compaction_scratch_limit) {
            Ok(plan) => {
                compactor::compact(heap, threads, types, plan);
                iteration.reclaimed[SpaceKind::Young] = census.dead[SpaceKind::Young];
                iteration.reclaimed[SpaceKind::Old] = census.dead[SpaceKind::Old];
                compacted = true;
            }
            Err(e) => {
                warn!("Compaction skipped, sweeping instead: {}", e);
                iteration.compaction_fallback = true;
            }
        }
    }
    if !compacted {
        iteration.reclaimed[SpaceKind::Old] = spaces.old.sweep();
        iteration.reclaimed[SpaceKind::Young] = spaces.young.sweep();
    }
    iteration.compacted = compacted;
    iteration.reclaimed[SpaceKind::Large] = spaces.los.release(true);
    if spaces.young.used_bytes() > 0 {
        heap.finalizable.lock().unwrap().reset_nursery_index();
    }
    rebuild_cards(heap, types);
}

/// After a full collection, young survivors (if any stayed in the young
/// space) may be referenced from old objects. Dirty exactly those cards.
fn rebuild_cards(heap: &Heap, types: &TypeTable) {
    let spaces = &heap.spaces;
    heap.cards.clear_all();
    if spaces.young.used_bytes() == 0 {
        return;
    }
    let old_spaces: [&dyn Space; 2] = [&spaces.old, &spaces.los];
    for space in old_spaces {
        let mem = space.memory();
        space.for_each_object(&mut |o| {
            let desc = types.get(object_model::type_id(mem, o));
            desc.for_each_ref_field(object_model::field_count(mem, o), |i| {
                let target = object_model::read_ref(mem, o, i);
                if !target.is_null() && spaces.is_young(target) {
                    heap.cards.mark(object_model::field_address(o, i));
                }
            });
        });
    }
    debug!("Rebuilt card table, {} dirty cards", heap.cards.dirty_count());
}
