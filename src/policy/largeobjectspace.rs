use crate::policy::space::{Space, SpaceKind};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::raw_memory::RawMemory;
use crate::util::statistics::Reclaimed;
use crate::util::treadmill::TreadMill;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model::{self, FinalizerState};
use crate::vm::TypeId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Objects at or above the large object threshold. Each object gets its own
/// run of pages and never moves. Objects allocated since the last collection
/// carry the young-large bit and are collected by young collections too.
pub struct LargeObjectSpace {
    name: &'static str,
    memory: RawMemory,
    sync: Mutex<LargeObjectSync>,
    reserved: AtomicUsize,
}

struct LargeObjectSync {
    treadmill: TreadMill,
    /// Free page runs: start -> bytes.
    free: BTreeMap<Address, usize>,
    /// Allocated objects: start -> bytes reserved.
    objects: BTreeMap<Address, usize>,
}

impl Space for LargeObjectSpace {
    fn name(&self) -> &'static str {
        self.name
    }
    fn kind(&self) -> SpaceKind {
        SpaceKind::Large
    }
    fn memory(&self) -> &RawMemory {
        &self.memory
    }
    fn is_movable(&self) -> bool {
        false
    }
    fn used_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }
    fn for_each_object(&self, f: &mut dyn FnMut(ObjectReference)) {
        let starts: Vec<Address> = self.sync.lock().unwrap().objects.keys().copied().collect();
        starts
            .into_iter()
            .for_each(|s| f(ObjectReference::from_address(s)));
    }
}

impl LargeObjectSpace {
    pub fn new(name: &'static str, start: Address, bytes: usize) -> Self {
        let memory = RawMemory::new(start, bytes);
        let mut free = BTreeMap::new();
        free.insert(start, memory.bytes());
        LargeObjectSpace {
            name,
            memory,
            sync: Mutex::new(LargeObjectSync {
                treadmill: TreadMill::new(),
                free,
                objects: BTreeMap::new(),
            }),
            reserved: AtomicUsize::new(0),
        }
    }

    /// Allocate and initialize a young large object of `words` words.
    pub fn allocate(
        &self,
        type_id: TypeId,
        words: usize,
        finalizer_state: FinalizerState,
    ) -> Option<ObjectReference> {
        let bytes = conversions::pages_to_bytes(conversions::bytes_to_pages_up(
            words * BYTES_IN_WORD,
        ));
        let mut sync = self.sync.lock().unwrap();
        let (start, run) = sync
            .free
            .iter()
            .find(|(_, run)| **run >= bytes)
            .map(|(s, r)| (*s, *r))?;
        sync.free.remove(&start);
        if run > bytes {
            sync.free.insert(start + bytes, run - bytes);
        }
        sync.objects.insert(start, bytes);
        let object = object_model::initialize_object(&self.memory, start, type_id, words, finalizer_state);
        object_model::set_young_large(&self.memory, object);
        sync.treadmill.add_to_treadmill(object, true);
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        trace!("{}: allocated {} ({} bytes)", self.name, object, bytes);
        Some(object)
    }

    pub fn prepare(&self, full_heap: bool) {
        let mut sync = self.sync.lock().unwrap();
        if full_heap {
            debug_assert!(sync.treadmill.is_from_space_empty());
        }
        sync.treadmill.flip(full_heap);
    }

    /// Mark a large object. Returns true if this call marked it, in which case
    /// the caller must scan it.
    pub fn trace_object(&self, object: ObjectReference) -> bool {
        if object_model::test_and_mark(&self.memory, object) {
            let nursery = object_model::is_young_large(&self.memory, object);
            self.sync.lock().unwrap().treadmill.copy(object, nursery);
            true
        } else {
            false
        }
    }

    /// Free every object that was not traced and reset the survivors.
    pub fn release(&self, full_heap: bool) -> Reclaimed {
        let mut sync = self.sync.lock().unwrap();
        let mut dead = sync.treadmill.collect_nursery();
        if full_heap {
            dead.extend(sync.treadmill.collect());
        }
        let mut reclaimed = Reclaimed::default();
        for object in dead {
            let start = object.to_address();
            reclaimed.objects += 1;
            reclaimed.bytes += object_model::size_bytes(&self.memory, object);
            if let Some(bytes) = sync.objects.remove(&start) {
                self.reserved.fetch_sub(bytes, Ordering::Relaxed);
                Self::free_pages(&mut sync.free, start, bytes);
            }
            trace!("{}: freed {}", self.name, object);
        }
        for start in sync.objects.keys() {
            let object = ObjectReference::from_address(*start);
            object_model::clear_mark(&self.memory, object);
            object_model::clear_young_large(&self.memory, object);
        }
        reclaimed
    }

    fn free_pages(free: &mut BTreeMap<Address, usize>, mut start: Address, mut bytes: usize) {
        if let Some((prev, prev_bytes)) = free.range(..start).next_back().map(|(s, b)| (*s, *b)) {
            if prev + prev_bytes == start {
                free.remove(&prev);
                start = prev;
                bytes += prev_bytes;
            }
        }
        if let Some(next_bytes) = free.remove(&(start + bytes)) {
            bytes += next_bytes;
        }
        free.insert(start, bytes);
    }

    /// The object whose pages contain `addr`.
    pub fn object_containing(&self, addr: Address) -> Option<ObjectReference> {
        let sync = self.sync.lock().unwrap();
        sync.objects
            .range(..=addr)
            .next_back()
            .filter(|(start, bytes)| addr < **start + **bytes)
            .map(|(start, _)| ObjectReference::from_address(*start))
    }

    /// Call `f` for every object that overlaps `[start, end)`, lowest first.
    pub fn for_each_object_overlapping(&self, start: Address, end: Address, f: &mut dyn FnMut(ObjectReference)) {
        if start >= end {
            return;
        }
        let sync = self.sync.lock().unwrap();
        let first = sync
            .objects
            .range(..=start)
            .next_back()
            .filter(|(s, bytes)| start < **s + **bytes)
            .map(|(s, _)| *s);
        let rest = sync.objects.range(start..end).map(|(s, _)| *s).filter(|s| Some(*s) != first);
        first.into_iter().chain(rest).for_each(|s| f(ObjectReference::from_address(s)));
    }

    /// Is `object` the start of a live large object?
    pub fn is_object_start(&self, object: ObjectReference) -> bool {
        self.sync
            .lock()
            .unwrap()
            .objects
            .contains_key(&object.to_address())
    }

    /// Largest request that can ever be satisfied.
    pub fn max_object_bytes(&self) -> usize {
        self.memory.bytes()
    }

    pub fn object_count(&self) -> usize {
        self.sync.lock().unwrap().objects.len()
    }
}
