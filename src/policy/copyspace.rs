use crate::policy::space::{sweep_region, Space, SpaceKind};
use crate::util::constants::*;
use crate::util::raw_memory::RawMemory;
use crate::util::statistics::Reclaimed;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The young space. Mutators carve thread-local allocation buffers out of it
/// with an atomic bump pointer. A young collection copies every reachable
/// object out and resets the space; a full collection either slides the
/// survivors down or sweeps in place.
pub struct CopySpace {
    name: &'static str,
    memory: RawMemory,
    cursor: AtomicUsize,
}

impl Space for CopySpace {
    fn name(&self) -> &'static str {
        self.name
    }
    fn kind(&self) -> SpaceKind {
        SpaceKind::Young
    }
    fn memory(&self) -> &RawMemory {
        &self.memory
    }
    fn is_movable(&self) -> bool {
        true
    }
    fn is_live(&self, object: ObjectReference) -> bool {
        object_model::get_forwarded(&self.memory, object).is_some()
            || object_model::is_marked(&self.memory, object)
    }
    fn used_bytes(&self) -> usize {
        self.cursor() - self.memory.start()
    }
    fn for_each_object(&self, f: &mut dyn FnMut(ObjectReference)) {
        object_model::walk(&self.memory, self.memory.start(), self.cursor(), |addr, ty, _| {
            if ty != crate::vm::types::FILLER_TYPE {
                f(ObjectReference::from_address(addr))
            }
        });
    }
}

impl CopySpace {
    pub fn new(name: &'static str, start: Address, bytes: usize) -> Self {
        CopySpace {
            name,
            memory: RawMemory::new(start, bytes),
            cursor: AtomicUsize::new(start.as_usize()),
        }
    }

    pub fn cursor(&self) -> Address {
        Address::from_usize(self.cursor.load(Ordering::Acquire))
    }

    pub fn available_bytes(&self) -> usize {
        self.memory.end() - self.cursor()
    }

    /// Hand out `bytes` bytes for a TLAB or a direct allocation.
    /// Returns `None` when the space is exhausted.
    pub fn acquire(&self, bytes: usize) -> Option<Range<Address>> {
        debug_assert!(bytes % BYTES_IN_WORD == 0);
        let end = self.memory.end().as_usize();
        let mut old = self.cursor.load(Ordering::Relaxed);
        loop {
            let new = old + bytes;
            if new > end {
                trace!("{}: cannot acquire {} bytes", self.name, bytes);
                return None;
            }
            match self
                .cursor
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(Address::from_usize(old)..Address::from_usize(new)),
                Err(x) => old = x,
            }
        }
    }

    /// Like [`CopySpace::acquire`], but hands out whatever is left (at least
    /// `min_bytes`) if `bytes` does not fit.
    pub fn acquire_up_to(&self, min_bytes: usize, bytes: usize) -> Option<Range<Address>> {
        self.acquire(bytes).or_else(|| {
            let left = crate::util::conversions::raw_align_down(self.available_bytes(), BYTES_IN_WORD);
            if left >= min_bytes {
                self.acquire(left).or_else(|| self.acquire(min_bytes))
            } else {
                self.acquire(min_bytes)
            }
        })
    }

    /// Every object has been evacuated. Start allocating from the bottom again.
    pub fn reset(&self) {
        self.cursor
            .store(self.memory.start().as_usize(), Ordering::Release);
    }

    /// Survivors now end at `top`.
    pub fn set_cursor(&self, top: Address) {
        debug_assert!(top >= self.memory.start() && top <= self.memory.end());
        self.cursor.store(top.as_usize(), Ordering::Release);
    }

    /// Sweep the space without moving anything. Dead objects become fillers
    /// that are never reused before the next young collection evacuates the
    /// space.
    pub fn sweep(&self) -> Reclaimed {
        let result = sweep_region(
            &self.memory,
            self.memory.start(),
            self.cursor(),
            &mut |_, _| {},
        );
        if let Some(trailing) = result.trailing_free {
            self.set_cursor(trailing);
        }
        result.reclaimed
    }
}
