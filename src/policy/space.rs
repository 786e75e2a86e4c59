use crate::policy::copyspace::CopySpace;
use crate::policy::largeobjectspace::LargeObjectSpace;
use crate::policy::markcompactspace::MarkCompactSpace;
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::raw_memory::RawMemory;
use crate::util::statistics::Reclaimed;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use enum_map::Enum;
use strum_macros::Display;

/// Identifies one of the three spaces of a heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, Display)]
pub enum SpaceKind {
    Young,
    Old,
    Large,
}

/// Per-space semantics that the collector dispatches on by address rather
/// than by object type: which space an object lives in decides whether it can
/// move, how liveness is determined and how it is reclaimed.
pub trait Space: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> SpaceKind;
    fn memory(&self) -> &RawMemory;

    /// Is the address inside this space's region?
    fn address_in_space(&self, addr: Address) -> bool {
        self.memory().contains(addr)
    }

    fn in_space(&self, object: ObjectReference) -> bool {
        self.address_in_space(object.to_address())
    }

    /// Can objects in this space be moved by the collector?
    fn is_movable(&self) -> bool;

    /// Is the object marked live in the current collection?
    fn is_live(&self, object: ObjectReference) -> bool {
        object_model::is_marked(self.memory(), object)
    }

    /// Bytes currently allocated, including fragmentation.
    fn used_bytes(&self) -> usize;

    fn capacity_bytes(&self) -> usize {
        self.memory().bytes()
    }

    /// Visit every non-filler object in the space, dead or alive. Only valid
    /// while mutators are stopped and TLABs are retired.
    fn for_each_object(&self, f: &mut dyn FnMut(ObjectReference));
}

/// The three spaces of a heap, laid out one after another in the virtual
/// address range, each separated by a guard gap:
///
/// ```text
/// HEAP_START | young | guard | old | guard | large objects |
/// ```
pub struct HeapSpaces {
    pub young: CopySpace,
    pub old: MarkCompactSpace,
    pub los: LargeObjectSpace,
}

impl HeapSpaces {
    pub fn new(options: &Options) -> Self {
        let young_start = Address::from_usize(HEAP_START);
        let young_bytes = options.young_size.align_up_to_page();
        let old_start = (young_start + young_bytes + SPACE_GUARD_BYTES).align_up(BYTES_IN_PAGE);
        let old_bytes = options.old_size.align_up_to_page();
        let los_start = (old_start + old_bytes + SPACE_GUARD_BYTES).align_up(BYTES_IN_PAGE);
        let los_bytes = options.los_size.align_up_to_page();
        debug!(
            "Heap layout: young [{}, {}), old [{}, {}), large [{}, {})",
            young_start,
            young_start + young_bytes,
            old_start,
            old_start + old_bytes,
            los_start,
            los_start + los_bytes
        );
        HeapSpaces {
            young: CopySpace::new("young", young_start, young_bytes),
            old: MarkCompactSpace::new("old", old_start, old_bytes, options.card_size),
            los: LargeObjectSpace::new("large", los_start, los_bytes),
        }
    }

    pub fn all(&self) -> [&dyn Space; 3] {
        [&self.young, &self.old, &self.los]
    }

    /// The space an address belongs to, if any.
    #[inline]
    pub fn space_of(&self, addr: Address) -> Option<&dyn Space> {
        if self.young.address_in_space(addr) {
            Some(&self.young)
        } else if self.old.address_in_space(addr) {
            Some(&self.old)
        } else if self.los.address_in_space(addr) {
            Some(&self.los)
        } else {
            None
        }
    }

    #[inline]
    pub fn kind_of(&self, object: ObjectReference) -> Option<SpaceKind> {
        self.space_of(object.to_address()).map(|s| s.kind())
    }

    /// The memory holding an object. Panics if the reference does not point into the heap.
    #[inline]
    pub fn memory_of(&self, object: ObjectReference) -> &RawMemory {
        let addr = object.to_address();
        if self.young.address_in_space(addr) {
            self.young.memory()
        } else if self.old.address_in_space(addr) {
            self.old.memory()
        } else if self.los.address_in_space(addr) {
            self.los.memory()
        } else {
            panic!("{} is not a heap object", object)
        }
    }

    pub fn contains(&self, object: ObjectReference) -> bool {
        self.space_of(object.to_address()).is_some()
    }

    /// Young objects: everything in the young space, plus large objects
    /// allocated since the last collection.
    #[inline]
    pub fn is_young(&self, object: ObjectReference) -> bool {
        let addr = object.to_address();
        self.young.address_in_space(addr)
            || (self.los.address_in_space(addr)
                && object_model::is_young_large(self.los.memory(), object))
    }

    /// Old objects: the old space and large objects that survived a collection.
    #[inline]
    pub fn is_old(&self, object: ObjectReference) -> bool {
        let addr = object.to_address();
        self.old.address_in_space(addr)
            || (self.los.address_in_space(addr)
                && !object_model::is_young_large(self.los.memory(), object))
    }

    /// The address range covered by the card table.
    pub fn card_range(&self) -> (Address, Address) {
        (self.old.memory().start(), self.los.memory().end())
    }

    pub fn used_bytes(&self) -> usize {
        self.all().iter().map(|s| s.used_bytes()).sum()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.all().iter().map(|s| s.capacity_bytes()).sum()
    }
}

/// Result of sweeping one region.
pub(crate) struct SweepResult {
    pub reclaimed: Reclaimed,
    /// Start of the dead run at the end of the region, if the region ends with garbage.
    pub trailing_free: Option<Address>,
}

/// Sweep `[start, end)` in place: unmarked objects and fillers are merged
/// into runs, each run except a trailing one becomes a single filler that is
/// handed to `free_run(start, words)`. Marks of live objects are cleared.
pub(crate) fn sweep_region(
    mem: &RawMemory,
    start: Address,
    end: Address,
    free_run: &mut dyn FnMut(Address, usize),
) -> SweepResult {
    let mut reclaimed = Reclaimed::default();
    let mut run_start: Option<Address> = None;
    let mut cursor = start;
    while cursor < end {
        let words = object_model::size_words_at(mem, cursor);
        debug_assert!(words > 0, "Unparsable heap at {}", cursor);
        let object = ObjectReference::from_address(cursor);
        let filler = object_model::is_filler_at(mem, cursor);
        if filler || !object_model::is_marked(mem, object) {
            if !filler {
                trace!("Reclaim {} ({} words)", object, words);
                reclaimed.objects += 1;
                reclaimed.bytes += words * BYTES_IN_WORD;
            }
            if run_start.is_none() {
                run_start = Some(cursor);
            }
        } else {
            object_model::clear_mark(mem, object);
            if let Some(run) = run_start.take() {
                let run_words = (cursor - run) / BYTES_IN_WORD;
                object_model::write_filler(mem, run, run_words);
                free_run(run, run_words);
            }
        }
        cursor += words * BYTES_IN_WORD;
    }
    SweepResult {
        reclaimed,
        trailing_free: run_start,
    }
}

trait AlignToPage {
    fn align_up_to_page(self) -> usize;
}

impl AlignToPage for usize {
    fn align_up_to_page(self) -> usize {
        crate::util::conversions::raw_align_up(self, BYTES_IN_PAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_disjoint() {
        let mut options = Options::default();
        options.young_size = 64 * 1024;
        options.old_size = 128 * 1024;
        options.los_size = 128 * 1024;
        let spaces = HeapSpaces::new(&options);
        let young_end = spaces.young.memory().end();
        let old_start = spaces.old.memory().start();
        assert!(young_end < old_start);
        assert!(spaces.old.memory().end() < spaces.los.memory().start());
        assert!(spaces.space_of(young_end).is_none());
        assert_eq!(
            spaces.kind_of(ObjectReference::from_address(old_start)),
            Some(SpaceKind::Old)
        );
        assert!(spaces.is_old(ObjectReference::from_address(old_start)));
        assert!(spaces.is_young(ObjectReference::from_address(spaces.young.memory().start())));
        assert!(!spaces.contains(ObjectReference::NULL));
    }
}
