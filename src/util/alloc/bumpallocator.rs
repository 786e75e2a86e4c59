use crate::util::constants::BYTES_IN_WORD;
use crate::util::raw_memory::RawMemory;
use crate::util::Address;
use crate::vm::object_model;

/// A thread-local allocation buffer. The owning mutator bumps `cursor`
/// towards `limit` without synchronization; the buffer itself is carved out
/// of the young space by the allocation slow path.
#[derive(Debug)]
pub struct BumpAllocator {
    cursor: Address,
    limit: Address,
}

impl BumpAllocator {
    pub fn new() -> Self {
        BumpAllocator {
            cursor: Address::ZERO,
            limit: Address::ZERO,
        }
    }

    pub fn set_limit(&mut self, cursor: Address, limit: Address) {
        self.cursor = cursor;
        self.limit = limit;
    }

    pub fn reset(&mut self) {
        self.cursor = Address::ZERO;
        self.limit = Address::ZERO;
    }

    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.cursor
    }

    /// The fast path. Returns `None` when the buffer cannot hold `bytes`.
    #[inline(always)]
    pub fn alloc(&mut self, bytes: usize) -> Option<Address> {
        debug_assert!(bytes % BYTES_IN_WORD == 0);
        let new_cursor = self.cursor + bytes;
        if new_cursor > self.limit {
            trace!("Thread local buffer used up, go to alloc slow path");
            None
        } else {
            let result = self.cursor;
            self.cursor = new_cursor;
            trace!(
                "Bump allocation size: {}, result: {}, new_cursor: {}, limit: {}",
                bytes,
                result,
                self.cursor,
                self.limit
            );
            Some(result)
        }
    }

    /// Give the buffer up. The unused tail becomes a filler so that the young
    /// space stays walkable.
    pub fn retire(&mut self, mem: &RawMemory) {
        if self.cursor < self.limit {
            object_model::write_filler(mem, self.cursor, self.remaining() / BYTES_IN_WORD);
        }
        self.reset();
    }
}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}
