use crate::policy::space::{sweep_region, Space, SpaceKind};
use crate::util::constants::*;
use crate::util::raw_memory::RawMemory;
use crate::util::statistics::Reclaimed;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model::{self, HEADER_WORDS};
use crate::vm::types::FILLER_TYPE;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// The old space. Objects get here by promotion from the young space or by
/// pretenured allocation. Allocation takes the first free chunk that fits
/// and falls back to bumping the frontier. A full collection either sweeps
/// dead objects into the free list or slides live objects to the bottom.
///
/// The space is always walkable from its start to the frontier: free chunks
/// are filler objects. A per-card crossing map records the first object
/// starting in each card, so a dirty card can be scanned without walking the
/// whole space.
pub struct MarkCompactSpace {
    name: &'static str,
    memory: RawMemory,
    sync: Mutex<FreeListSync>,
    log_card_size: usize,
    /// Lowest object start in each card, or 0.
    crossing_map: Box<[AtomicUsize]>,
}

struct FreeListSync {
    frontier: Address,
    /// Free chunks: start -> size in words.
    free: BTreeMap<Address, usize>,
    free_words: usize,
}

impl Space for MarkCompactSpace {
    fn name(&self) -> &'static str {
        self.name
    }
    fn kind(&self) -> SpaceKind {
        SpaceKind::Old
    }
    fn memory(&self) -> &RawMemory {
        &self.memory
    }
    fn is_movable(&self) -> bool {
        true
    }
    fn used_bytes(&self) -> usize {
        let sync = self.sync.lock().unwrap();
        (sync.frontier - self.memory.start()) - sync.free_words * BYTES_IN_WORD
    }
    fn for_each_object(&self, f: &mut dyn FnMut(ObjectReference)) {
        object_model::walk(&self.memory, self.memory.start(), self.frontier(), |addr, ty, _| {
            if ty != FILLER_TYPE {
                f(ObjectReference::from_address(addr))
            }
        });
    }
}

impl MarkCompactSpace {
    pub fn new(name: &'static str, start: Address, bytes: usize, card_size: usize) -> Self {
        debug_assert!(card_size.is_power_of_two());
        let cards = bytes.div_ceil(card_size);
        MarkCompactSpace {
            name,
            memory: RawMemory::new(start, bytes),
            sync: Mutex::new(FreeListSync {
                frontier: start,
                free: BTreeMap::new(),
                free_words: 0,
            }),
            log_card_size: card_size.trailing_zeros() as usize,
            crossing_map: (0..cards).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn frontier(&self) -> Address {
        self.sync.lock().unwrap().frontier
    }

    /// Bytes that can be bump allocated above the frontier.
    pub fn room_at_frontier(&self) -> usize {
        self.memory.end() - self.frontier()
    }

    /// Bytes held in the free list.
    pub fn free_list_bytes(&self) -> usize {
        self.sync.lock().unwrap().free_words * BYTES_IN_WORD
    }

    pub fn free_bytes(&self) -> usize {
        let sync = self.sync.lock().unwrap();
        (self.memory.end() - sync.frontier) + sync.free_words * BYTES_IN_WORD
    }

    /// Share of free memory, in percent, that sits in free-list chunks rather than above the frontier.
    pub fn fragmentation_percent(&self) -> usize {
        let free = self.free_bytes();
        if free == 0 {
            return 100;
        }
        self.free_list_bytes() * 100 / free
    }

    /// Allocate `words` words. The caller initializes the object.
    pub fn allocate(&self, words: usize) -> Option<Address> {
        debug_assert!(words >= HEADER_WORDS);
        let mut sync = self.sync.lock().unwrap();
        let fit = sync
            .free
            .iter()
            .find(|(_, size)| **size >= words)
            .map(|(start, size)| (*start, *size));
        let addr = if let Some((start, size)) = fit {
            sync.free.remove(&start);
            sync.free_words -= size;
            let rest = size - words;
            if rest > 0 {
                let rest_start = start + words * BYTES_IN_WORD;
                object_model::write_filler(&self.memory, rest_start, rest);
                self.record_object_start(rest_start);
                if rest >= HEADER_WORDS {
                    sync.free.insert(rest_start, rest);
                    sync.free_words += rest;
                }
            }
            start
        } else {
            let start = sync.frontier;
            if start + words * BYTES_IN_WORD > self.memory.end() {
                trace!("{}: cannot allocate {} words", self.name, words);
                return None;
            }
            sync.frontier = start + words * BYTES_IN_WORD;
            start
        };
        self.record_object_start(addr);
        Some(addr)
    }

    fn card_index(&self, addr: Address) -> usize {
        (addr - self.memory.start()) >> self.log_card_size
    }

    fn record_object_start(&self, addr: Address) {
        self.crossing_map[self.card_index(addr)].fetch_min_nonzero(addr.as_usize());
    }

    /// Recompute the crossing map by walking the whole space.
    pub fn rebuild_crossing_map(&self) {
        for entry in self.crossing_map.iter() {
            entry.store(0, Ordering::Relaxed);
        }
        object_model::walk(&self.memory, self.memory.start(), self.frontier(), |addr, _, _| {
            let entry = &self.crossing_map[self.card_index(addr)];
            if entry.load(Ordering::Relaxed) == 0 {
                entry.store(addr.as_usize(), Ordering::Relaxed);
            }
        });
    }

    /// Visit every object that overlaps `[start, end)`.
    pub fn for_each_object_overlapping(
        &self,
        start: Address,
        end: Address,
        f: &mut dyn FnMut(ObjectReference),
    ) {
        let frontier = self.frontier();
        let end = end.min(frontier);
        if start >= end {
            return;
        }
        // Find an object start at or below `start`.
        let mut card = self.card_index(start);
        let mut cursor = self.memory.start();
        loop {
            let first = self.crossing_map[card].load(Ordering::Relaxed);
            if first != 0 && first <= start.as_usize() {
                cursor = Address::from_usize(first);
                break;
            }
            if card == 0 {
                break;
            }
            card -= 1;
        }
        while cursor < end {
            let words = object_model::size_words_at(&self.memory, cursor);
            let next = cursor + words * BYTES_IN_WORD;
            if next > start && !object_model::is_filler_at(&self.memory, cursor) {
                f(ObjectReference::from_address(cursor));
            }
            cursor = next;
        }
    }

    /// Sweep dead objects into the free list.
    pub fn sweep(&self) -> Reclaimed {
        let frontier = self.frontier();
        let mut free = BTreeMap::new();
        let mut free_words = 0;
        let result = sweep_region(
            &self.memory,
            self.memory.start(),
            frontier,
            &mut |start, words| {
                if words >= HEADER_WORDS {
                    free.insert(start, words);
                    free_words += words;
                }
            },
        );
        {
            let mut sync = self.sync.lock().unwrap();
            sync.free = free;
            sync.free_words = free_words;
            if let Some(trailing) = result.trailing_free {
                sync.frontier = trailing;
            }
        }
        self.rebuild_crossing_map();
        debug!(
            "{}: swept {} objects, {} bytes in the free list",
            self.name,
            result.reclaimed.objects,
            free_words * BYTES_IN_WORD
        );
        result.reclaimed
    }

    /// Live objects have been slid to `[start, top)`. There is nothing free below `top`.
    pub fn reset_after_compaction(&self, top: Address) {
        {
            let mut sync = self.sync.lock().unwrap();
            sync.free.clear();
            sync.free_words = 0;
            sync.frontier = top;
        }
        self.rebuild_crossing_map();
    }

    /// Move the frontier up after objects were copied directly above it.
    pub fn bump_frontier_to(&self, top: Address) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(top >= sync.frontier && top <= self.memory.end());
        sync.frontier = top;
    }
}

trait FetchMinNonZero {
    fn fetch_min_nonzero(&self, value: usize);
}

impl FetchMinNonZero for AtomicUsize {
    fn fetch_min_nonzero(&self, value: usize) {
        let mut old = self.load(Ordering::Relaxed);
        while old == 0 || value < old {
            match self.compare_exchange_weak(old, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(x) => old = x,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object_model::{initialize_object, object_words, FinalizerState};
    use crate::vm::TypeId;

    const START: Address = Address::from_usize(0x5000_0000);

    fn new_space() -> MarkCompactSpace {
        MarkCompactSpace::new("old", START, 16 * BYTES_IN_PAGE, 512)
    }

    fn alloc(space: &MarkCompactSpace, fields: usize) -> ObjectReference {
        let words = object_words(fields);
        let addr = space.allocate(words).unwrap();
        initialize_object(space.memory(), addr, TypeId(1), words, FinalizerState::NotFinalizable)
    }

    #[test]
    fn bump_then_free_list() {
        let space = new_space();
        let a = alloc(&space, 5);
        let b = alloc(&space, 5);
        let c = alloc(&space, 5);
        object_model::test_and_mark(space.memory(), a);
        object_model::test_and_mark(space.memory(), c);
        let reclaimed = space.sweep();
        assert_eq!(reclaimed.objects, 1);
        assert_eq!(space.free_list_bytes(), object_words(5) * BYTES_IN_WORD);
        // A smaller object reuses the hole left by `b`.
        let d = alloc(&space, 2);
        assert_eq!(d, b);
        let mut objects = vec![];
        space.for_each_object(&mut |o| objects.push(o));
        assert_eq!(objects, vec![a, d, c]);
    }

    #[test]
    fn trailing_garbage_lowers_frontier() {
        let space = new_space();
        let a = alloc(&space, 1);
        let _b = alloc(&space, 1);
        object_model::test_and_mark(space.memory(), a);
        space.sweep();
        assert_eq!(space.frontier(), a.to_address() + object_words(1) * BYTES_IN_WORD);
        assert_eq!(space.free_list_bytes(), 0);
    }

    #[test]
    fn overlapping_objects() {
        let space = new_space();
        // 100 words each, spanning several 512-byte cards.
        let objs: Vec<_> = (0..4).map(|_| alloc(&space, 97)).collect();
        let card = START + 2usize * 512;
        let mut seen = vec![];
        space.for_each_object_overlapping(card, card + 512usize, &mut |o| seen.push(o));
        // Object 1 spans [800, 1600), object 2 spans [1600, 2400); the card is [1024, 1536).
        assert_eq!(seen, vec![objs[1]]);
        space.rebuild_crossing_map();
        let mut again = vec![];
        space.for_each_object_overlapping(card, card + 512usize, &mut |o| again.push(o));
        assert_eq!(seen, again);
    }

    #[test]
    fn exhaustion() {
        let space = MarkCompactSpace::new("old", START, BYTES_IN_PAGE, 512);
        let words = BYTES_IN_PAGE / BYTES_IN_WORD;
        assert!(space.allocate(words + 1).is_none());
        assert!(space.allocate(words).is_some());
        assert_eq!(space.room_at_frontier(), 0);
        assert!(space.allocate(HEADER_WORDS).is_none());
    }
}
