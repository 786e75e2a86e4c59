//! Sliding compaction of the old space (LISP2 style) after a full-heap mark.
//!
//! Everything that can fail, the forwarding table in particular, is set up
//! in [`plan`] before a single object moves. Once a plan exists, [`compact`]
//! cannot fail.

use crate::heap::Heap;
use crate::plan::roots;
use crate::policy::space::{HeapSpaces, Space, SpaceKind};
use crate::scheduler::ThreadHandle;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::raw_memory::RawMemory;
use crate::util::statistics::Reclaimed;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::types::TypeTable;
use enum_map::EnumMap;
use thiserror::Error;

/// Why compaction could not run. The collection sweeps in place instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompactionError {
    #[error("forwarding table needs {needed} entries, the limit is {limit}")]
    ScratchLimit { needed: usize, limit: usize },
    #[error("cannot allocate a forwarding table of {0} entries")]
    ScratchUnavailable(usize),
}

/// Live and dead objects found by walking the marked young and old spaces.
#[derive(Clone, Debug, Default)]
pub(crate) struct Census {
    pub live_objects: EnumMap<SpaceKind, usize>,
    pub live_words: EnumMap<SpaceKind, usize>,
    pub dead: EnumMap<SpaceKind, Reclaimed>,
}

impl Census {
    pub fn take(spaces: &HeapSpaces) -> Self {
        let mut census = Census::default();
        let mut count = |kind: SpaceKind, space: &dyn Space| {
            let mem = space.memory();
            space.for_each_object(&mut |o| {
                let words = object_model::size_words(mem, o);
                if object_model::is_marked(mem, o) {
                    census.live_objects[kind] += 1;
                    census.live_words[kind] += words;
                } else {
                    census.dead[kind].objects += 1;
                    census.dead[kind].bytes += words * BYTES_IN_WORD;
                }
            });
        };
        count(SpaceKind::Young, &spaces.young);
        count(SpaceKind::Old, &spaces.old);
        census
    }

    /// Share of the free old space, in percent, that would be scattered
    /// below the frontier after sweeping.
    pub fn old_fragmentation_percent(&self, spaces: &HeapSpaces) -> usize {
        let live = self.live_words[SpaceKind::Old] * BYTES_IN_WORD;
        let below_frontier = spaces.old.frontier() - spaces.old.memory().start();
        let holes = below_frontier.saturating_sub(live);
        let free = spaces.old.capacity_bytes().saturating_sub(live);
        if free == 0 {
            100
        } else {
            holes * 100 / free
        }
    }
}

/// Sorted `(from, to)` pairs for every object that survives compaction.
pub(crate) struct ForwardingTable {
    entries: Vec<(ObjectReference, ObjectReference)>,
}

impl ForwardingTable {
    pub fn lookup(&self, from: ObjectReference) -> Option<ObjectReference> {
        self.entries
            .binary_search_by_key(&from, |(f, _)| *f)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Update a slot that may point at a moving object.
    fn update(&self, slot: &mut ObjectReference) {
        if let Some(to) = self.lookup(*slot) {
            *slot = to;
        }
    }
}

/// Where everything goes.
pub(crate) struct CompactionPlan {
    table: ForwardingTable,
    /// Young survivors are moved into the old space rather than slid down
    /// within the young space.
    young_to_old: bool,
    old_top: Address,
    young_top: Address,
}

impl CompactionPlan {
    pub fn forwarded(&self) -> usize {
        self.table.len()
    }

    pub fn promotes_young(&self) -> bool {
        self.young_to_old
    }
}

/// Compute the destination of every marked young and old object.
pub(crate) fn plan(
    spaces: &HeapSpaces,
    census: &Census,
    scratch_limit: usize,
) -> Result<CompactionPlan, CompactionError> {
    let needed = census.live_objects[SpaceKind::Young] + census.live_objects[SpaceKind::Old];
    if needed > scratch_limit {
        return Err(CompactionError::ScratchLimit {
            needed,
            limit: scratch_limit,
        });
    }
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(needed)
        .map_err(|_| CompactionError::ScratchUnavailable(needed))?;

    let old_start = spaces.old.memory().start();
    let old_live_bytes = census.live_words[SpaceKind::Old] * BYTES_IN_WORD;
    let young_live_bytes = census.live_words[SpaceKind::Young] * BYTES_IN_WORD;
    let young_to_old = old_live_bytes + young_live_bytes <= spaces.old.capacity_bytes();

    // The young space sits below the old space, so young entries come first
    // and the table stays sorted by source address.
    let mut young_dest = if young_to_old {
        old_start + old_live_bytes
    } else {
        spaces.young.memory().start()
    };
    let young = spaces.young.memory();
    spaces.young.for_each_object(&mut |o| {
        if object_model::is_marked(young, o) {
            entries.push((o, ObjectReference::from_address(young_dest)));
            young_dest += object_model::size_bytes(young, o);
        }
    });
    let mut old_dest = old_start;
    let old = spaces.old.memory();
    spaces.old.for_each_object(&mut |o| {
        if object_model::is_marked(old, o) {
            entries.push((o, ObjectReference::from_address(old_dest)));
            old_dest += object_model::size_bytes(old, o);
        }
    });
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

    let (old_top, young_top) = if young_to_old {
        (young_dest, spaces.young.memory().start())
    } else {
        (old_dest, young_dest)
    };
    Ok(CompactionPlan {
        table: ForwardingTable { entries },
        young_to_old,
        old_top,
        young_top,
    })
}

/// Update every reference to a moving object, then move the objects.
pub(crate) fn compact(
    heap: &Heap,
    threads: &[ThreadHandle],
    types: &TypeTable,
    plan: CompactionPlan,
) {
    let spaces = &heap.spaces;
    let table = &plan.table;

    // Roots, weak globals and the processors' lists.
    roots::scan_roots(heap, threads, &mut |_, slot| table.update(slot));
    roots::sweep_weak_globals(heap, |o| table.lookup(o).unwrap_or(o));
    heap.references
        .lock()
        .unwrap()
        .update_candidates(|slot| table.update(slot));
    heap.finalizable
        .lock()
        .unwrap()
        .forward(|slot| table.update(slot));

    // Fields of every surviving object, at their old locations.
    let update_fields = |mem: &RawMemory, object: ObjectReference| {
        let desc = types.get(object_model::type_id(mem, object));
        desc.for_each_ref_field(object_model::field_count(mem, object), |i| {
            let child = object_model::read_ref(mem, object, i);
            if let Some(to) = table.lookup(child) {
                object_model::write_ref(mem, object, i, to);
            }
        });
    };
    for (from, _) in table.entries.iter() {
        update_fields(spaces.memory_of(*from), *from);
    }
    let los = spaces.los.memory();
    spaces.los.for_each_object(&mut |o| {
        if object_model::is_marked(los, o) {
            update_fields(los, o);
        }
    });

    // Slide the old objects down first: young survivors moving into the old
    // space land above the final old top, where old objects may still sit.
    let young_start = spaces.young.memory().start();
    let young_end = spaces.young.memory().end();
    let split = table
        .entries
        .partition_point(|(from, _)| from.to_address() < young_end);
    let (young_entries, old_entries) = table.entries.split_at(split);
    debug_assert!(young_entries
        .iter()
        .all(|(from, _)| from.to_address() >= young_start));

    let old = spaces.old.memory();
    for (from, to) in old_entries {
        let words = object_model::size_words(old, *from);
        if from != to {
            old.copy_within(from.to_address(), to.to_address(), words);
        }
        object_model::clear_mark(old, *to);
    }
    let young = spaces.young.memory();
    for (from, to) in young_entries {
        let words = object_model::size_words(young, *from);
        if plan.young_to_old {
            old.copy_from(young, from.to_address(), to.to_address(), words);
            object_model::clear_mark(old, *to);
        } else {
            if from != to {
                young.copy_within(from.to_address(), to.to_address(), words);
            }
            object_model::clear_mark(young, *to);
        }
    }

    spaces.old.reset_after_compaction(plan.old_top);
    if plan.young_to_old {
        spaces.young.reset();
    } else {
        spaces.young.set_cursor(plan.young_top);
    }
    debug!(
        "Compacted {} objects, old top {}, young survivors {}",
        table.len(),
        plan.old_top,
        if plan.young_to_old { "promoted" } else { "slid" }
    );
}
