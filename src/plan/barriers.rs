//! The card table and the generational write barrier.

use crate::policy::space::HeapSpaces;
use crate::util::{Address, ObjectReference};
use std::sync::atomic::{AtomicU8, Ordering};

const CARD_CLEAN: u8 = 0;
const CARD_DIRTY: u8 = 1;

/// One byte per card over the old and large object spaces. A dirty card may
/// hold a reference from an old object to a young object. Mutators only ever
/// store `CARD_DIRTY`, so marking needs no synchronization beyond a relaxed store.
pub struct CardTable {
    start: Address,
    end: Address,
    log_card_size: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(start: Address, end: Address, card_size: usize) -> Self {
        debug_assert!(card_size.is_power_of_two());
        let log_card_size = card_size.trailing_zeros() as usize;
        let count = (end - start).div_ceil(card_size);
        CardTable {
            start,
            end,
            log_card_size,
            cards: (0..count).map(|_| AtomicU8::new(CARD_CLEAN)).collect(),
        }
    }

    pub fn covers(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    fn index(&self, addr: Address) -> usize {
        (addr - self.start) >> self.log_card_size
    }

    /// Dirty the card holding `addr`.
    #[inline]
    pub fn mark(&self, addr: Address) {
        debug_assert!(self.covers(addr), "{} is not covered by the card table", addr);
        self.cards[self.index(addr)].store(CARD_DIRTY, Ordering::Relaxed);
    }

    pub fn is_dirty(&self, addr: Address) -> bool {
        self.cards[self.index(addr)].load(Ordering::Relaxed) == CARD_DIRTY
    }

    /// Address range of every dirty card.
    pub fn dirty_cards(&self) -> Vec<(Address, Address)> {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, c)| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .map(|(i, _)| self.card_bounds(i))
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    fn card_bounds(&self, index: usize) -> (Address, Address) {
        let start = self.start + (index << self.log_card_size);
        let end = (start + (1usize << self.log_card_size)).min(self.end);
        (start, end)
    }

    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// The write barrier, run after `src.field = target` has been stored at
    /// `slot`. Only old-to-young stores are remembered.
    #[inline]
    pub fn object_reference_write_post(
        &self,
        spaces: &HeapSpaces,
        src: ObjectReference,
        slot: Address,
        target: ObjectReference,
    ) {
        if !target.is_null() && spaces.is_old(src) && spaces.is_young(target) {
            trace!("Card barrier: {} -> {} at {}", src, target, slot);
            self.mark(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::space::Space;
    use crate::util::constants::*;
    use crate::util::options::Options;
    use crate::vm::object_model::{self, FinalizerState};
    use crate::vm::TypeId;

    #[test]
    fn dirty_and_clear() {
        let start = Address::from_usize(0x7000_0000);
        let cards = CardTable::new(start, start + 4usize * 512, 512);
        cards.mark(start + 513usize);
        cards.mark(start + 600usize);
        assert!(cards.is_dirty(start + 1000usize));
        assert!(!cards.is_dirty(start));
        assert_eq!(cards.dirty_cards(), vec![(start + 512usize, start + 1024usize)]);
        cards.clear_all();
        assert_eq!(cards.dirty_count(), 0);
    }

    #[test]
    fn barrier_only_remembers_old_to_young() {
        let mut options = Options::default();
        options.young_size = 4 * BYTES_IN_PAGE;
        options.old_size = 4 * BYTES_IN_PAGE;
        options.los_size = 4 * BYTES_IN_PAGE;
        let spaces = HeapSpaces::new(&options);
        let (start, end) = spaces.card_range();
        let cards = CardTable::new(start, end, 512);

        let words = object_model::object_words(2);
        let young_range = spaces.young.acquire(words * BYTES_IN_WORD).unwrap();
        let young = object_model::initialize_object(
            spaces.young.memory(),
            young_range.start,
            TypeId(1),
            words,
            FinalizerState::NotFinalizable,
        );
        let old_addr = spaces.old.allocate(words).unwrap();
        let old = object_model::initialize_object(
            spaces.old.memory(),
            old_addr,
            TypeId(1),
            words,
            FinalizerState::NotFinalizable,
        );

        cards.object_reference_write_post(&spaces, old, object_model::field_address(old, 0), old);
        assert_eq!(cards.dirty_count(), 0);
        cards.object_reference_write_post(&spaces, old, object_model::field_address(old, 1), young);
        assert!(cards.is_dirty(object_model::field_address(old, 1)));
        cards.clear_all();
        cards.object_reference_write_post(&spaces, old, object_model::field_address(old, 1), ObjectReference::NULL);
        assert_eq!(cards.dirty_count(), 0);
    }
}
