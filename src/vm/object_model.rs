//! Object header layout and accessors.
//!
//! An object is `HEADER_WORDS` header words followed by its fields:
//!
//! ```text
//! word 0  type word    (size in words << 32) | type id
//! word 1  status word  mark bit, finalizer state, young large object bit, enqueued bit
//! word 2  lock word    0, an identity hash, or a forwarding address during a copying GC
//! word 3.. fields      one word each
//! ```
//!
//! A filler only has a valid type word, so a filler can be as small as one word.

use crate::util::constants::*;
use crate::util::raw_memory::RawMemory;
use crate::util::{Address, ObjectReference};
use crate::vm::types::{TypeId, FILLER_TYPE};
use std::sync::atomic::Ordering;

pub const HEADER_WORDS: usize = 3;
pub const HEADER_BYTES: usize = HEADER_WORDS * BYTES_IN_WORD;

const TYPE_WORD: usize = 0;
const STATUS_WORD: usize = BYTES_IN_WORD;
const LOCK_WORD: usize = 2 * BYTES_IN_WORD;

const SIZE_SHIFT: usize = 32;
const TYPE_MASK: usize = (1 << SIZE_SHIFT) - 1;

const MARK_BIT: usize = 1;
const FINALIZER_SHIFT: usize = 1;
const FINALIZER_MASK: usize = 0b11 << FINALIZER_SHIFT;
const YOUNG_LOS_BIT: usize = 1 << 3;
const ENQUEUED_BIT: usize = 1 << 4;

const LOCK_TAG_MASK: usize = 0b11;
const LOCK_TAG_FORWARDED: usize = 0b01;
const LOCK_TAG_HASH: usize = 0b10;

// The status bits must not overlap, and the size must fit above the type id.
static_assertions::const_assert_eq!(FINALIZER_MASK & (MARK_BIT | YOUNG_LOS_BIT | ENQUEUED_BIT), 0);
static_assertions::const_assert_eq!(YOUNG_LOS_BIT & ENQUEUED_BIT, 0);
static_assertions::const_assert!(BYTES_IN_WORD == 8);

/// Finalization state of an object, kept in its status word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FinalizerState {
    /// The type has no finalizer.
    NotFinalizable = 0,
    /// Registered for finalization; the finalizer has not been scheduled.
    NotFinalized = 1,
    /// Found unreachable and resurrected onto the ready list.
    Queued = 2,
    /// The finalizer has run. The object is reclaimed the next time it is unreachable.
    Finalized = 3,
}

impl FinalizerState {
    fn from_bits(bits: usize) -> Self {
        match bits {
            0 => FinalizerState::NotFinalizable,
            1 => FinalizerState::NotFinalized,
            2 => FinalizerState::Queued,
            _ => FinalizerState::Finalized,
        }
    }
}

/// Size of an object with `fields` fields, in words.
pub const fn object_words(fields: usize) -> usize {
    HEADER_WORDS + fields
}

/* Header initialization */

/// Write the header of a freshly allocated object and zero its fields.
pub fn initialize_object(
    mem: &RawMemory,
    addr: Address,
    type_id: TypeId,
    size_words: usize,
    finalizer_state: FinalizerState,
) -> ObjectReference {
    debug_assert!(size_words >= HEADER_WORDS);
    debug_assert!(size_words < (1 << 32));
    mem.zero(addr + HEADER_BYTES..addr + size_words * BYTES_IN_WORD);
    mem.store(addr + LOCK_WORD, 0, Ordering::Relaxed);
    mem.store(
        addr + STATUS_WORD,
        (finalizer_state as usize) << FINALIZER_SHIFT,
        Ordering::Relaxed,
    );
    mem.store(
        addr + TYPE_WORD,
        (size_words << SIZE_SHIFT) | type_id.0 as usize,
        Ordering::Release,
    );
    ObjectReference::from_address(addr)
}

/// Turn `words` words at `addr` into a filler object.
pub fn write_filler(mem: &RawMemory, addr: Address, words: usize) {
    if words == 0 {
        return;
    }
    mem.store(
        addr + TYPE_WORD,
        (words << SIZE_SHIFT) | FILLER_TYPE.0 as usize,
        Ordering::Relaxed,
    );
}

/* Type word */

#[inline]
pub fn type_id_at(mem: &RawMemory, addr: Address) -> TypeId {
    TypeId((mem.load(addr + TYPE_WORD, Ordering::Relaxed) & TYPE_MASK) as u32)
}

#[inline]
pub fn size_words_at(mem: &RawMemory, addr: Address) -> usize {
    mem.load(addr + TYPE_WORD, Ordering::Relaxed) >> SIZE_SHIFT
}

#[inline]
pub fn is_filler_at(mem: &RawMemory, addr: Address) -> bool {
    type_id_at(mem, addr) == FILLER_TYPE
}

#[inline]
pub fn type_id(mem: &RawMemory, object: ObjectReference) -> TypeId {
    type_id_at(mem, object.to_address())
}

#[inline]
pub fn size_words(mem: &RawMemory, object: ObjectReference) -> usize {
    size_words_at(mem, object.to_address())
}

#[inline]
pub fn size_bytes(mem: &RawMemory, object: ObjectReference) -> usize {
    size_words(mem, object) * BYTES_IN_WORD
}

#[inline]
pub fn field_count(mem: &RawMemory, object: ObjectReference) -> usize {
    size_words(mem, object) - HEADER_WORDS
}

/* Fields */

#[inline]
pub fn field_address(object: ObjectReference, index: usize) -> Address {
    object.to_address() + HEADER_BYTES + index * BYTES_IN_WORD
}

#[inline]
pub fn read_word(mem: &RawMemory, object: ObjectReference, index: usize, order: Ordering) -> usize {
    mem.load(field_address(object, index), order)
}

#[inline]
pub fn write_word(
    mem: &RawMemory,
    object: ObjectReference,
    index: usize,
    value: usize,
    order: Ordering,
) {
    mem.store(field_address(object, index), value, order)
}

#[inline]
pub fn read_ref(mem: &RawMemory, object: ObjectReference, index: usize) -> ObjectReference {
    ObjectReference::from_raw(read_word(mem, object, index, Ordering::Relaxed))
}

#[inline]
pub fn write_ref(mem: &RawMemory, object: ObjectReference, index: usize, value: ObjectReference) {
    write_word(mem, object, index, value.value(), Ordering::Relaxed)
}

/* Mark bit */

#[inline]
pub fn is_marked(mem: &RawMemory, object: ObjectReference) -> bool {
    mem.load(object.to_address() + STATUS_WORD, Ordering::Relaxed) & MARK_BIT != 0
}

/// Atomically set the mark bit. Returns true if this call marked the object,
/// false if it was already marked.
#[inline]
pub fn test_and_mark(mem: &RawMemory, object: ObjectReference) -> bool {
    mem.fetch_or(object.to_address() + STATUS_WORD, MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
}

#[inline]
pub fn clear_mark(mem: &RawMemory, object: ObjectReference) {
    mem.fetch_and(object.to_address() + STATUS_WORD, !MARK_BIT, Ordering::Relaxed);
}

/* Finalizer state */

pub fn finalizer_state(mem: &RawMemory, object: ObjectReference) -> FinalizerState {
    let status = mem.load(object.to_address() + STATUS_WORD, Ordering::Acquire);
    FinalizerState::from_bits((status & FINALIZER_MASK) >> FINALIZER_SHIFT)
}

pub fn set_finalizer_state(mem: &RawMemory, object: ObjectReference, state: FinalizerState) {
    let addr = object.to_address() + STATUS_WORD;
    mem.fetch_and(addr, !FINALIZER_MASK, Ordering::Relaxed);
    mem.fetch_or(addr, (state as usize) << FINALIZER_SHIFT, Ordering::Release);
}

/* Young large objects */

pub fn is_young_large(mem: &RawMemory, object: ObjectReference) -> bool {
    mem.load(object.to_address() + STATUS_WORD, Ordering::Relaxed) & YOUNG_LOS_BIT != 0
}

pub fn set_young_large(mem: &RawMemory, object: ObjectReference) {
    mem.fetch_or(object.to_address() + STATUS_WORD, YOUNG_LOS_BIT, Ordering::Relaxed);
}

pub fn clear_young_large(mem: &RawMemory, object: ObjectReference) {
    mem.fetch_and(object.to_address() + STATUS_WORD, !YOUNG_LOS_BIT, Ordering::Relaxed);
}

/* Reference objects */

pub fn is_enqueued(mem: &RawMemory, object: ObjectReference) -> bool {
    mem.load(object.to_address() + STATUS_WORD, Ordering::Acquire) & ENQUEUED_BIT != 0
}

/// Mark a reference object as enqueued. Returns false if it already was.
pub fn test_and_set_enqueued(mem: &RawMemory, object: ObjectReference) -> bool {
    mem.fetch_or(object.to_address() + STATUS_WORD, ENQUEUED_BIT, Ordering::AcqRel) & ENQUEUED_BIT
        == 0
}

/* Lock word: forwarding and identity hash */

/// The new location of an object copied during this collection.
#[inline]
pub fn get_forwarded(mem: &RawMemory, object: ObjectReference) -> Option<ObjectReference> {
    let lock = mem.load(object.to_address() + LOCK_WORD, Ordering::Acquire);
    if lock & LOCK_TAG_MASK == LOCK_TAG_FORWARDED {
        Some(ObjectReference::from_raw(lock & !LOCK_TAG_MASK))
    } else {
        None
    }
}

/// Install a forwarding address. The old lock word must have been copied
/// to the new location first.
#[inline]
pub fn set_forwarded(mem: &RawMemory, object: ObjectReference, to: ObjectReference) {
    debug_assert!(to.to_address().is_aligned_to(BYTES_IN_WORD));
    mem.store(
        object.to_address() + LOCK_WORD,
        to.value() | LOCK_TAG_FORWARDED,
        Ordering::Release,
    );
}

/// The identity hash code of an object, installed on first request and
/// preserved when the object moves.
pub fn identity_hash(mem: &RawMemory, object: ObjectReference, seed: usize) -> u32 {
    let addr = object.to_address() + LOCK_WORD;
    loop {
        let lock = mem.load(addr, Ordering::Acquire);
        if lock & LOCK_TAG_MASK == LOCK_TAG_HASH {
            return (lock >> 2) as u32;
        }
        debug_assert_eq!(lock, 0, "{} has a forwarding word outside of a GC", object);
        // Any nonzero 31-bit value will do.
        let hash = ((seed.wrapping_mul(0x9E37_79B9) ^ (seed >> 16)) as u32 & 0x7fff_ffff).max(1);
        let new = ((hash as usize) << 2) | LOCK_TAG_HASH;
        if mem
            .compare_exchange(addr, lock, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return hash;
        }
    }
}

/// Does the lock word hold anything other than a hash or nothing?
pub fn has_forwarding_word(mem: &RawMemory, object: ObjectReference) -> bool {
    mem.load(object.to_address() + LOCK_WORD, Ordering::Relaxed) & LOCK_TAG_MASK
        == LOCK_TAG_FORWARDED
}

/// Walk objects (fillers included) in `[start, end)`, calling
/// `f(address, type, size_in_words)` for each one.
pub fn walk<F: FnMut(Address, TypeId, usize)>(mem: &RawMemory, start: Address, end: Address, mut f: F) {
    let mut cursor = start;
    while cursor < end {
        let words = size_words_at(mem, cursor);
        assert!(words > 0, "Unparsable heap at {} (zero-sized object)", cursor);
        let ty = type_id_at(mem, cursor);
        f(cursor, ty, words);
        cursor += words * BYTES_IN_WORD;
    }
    debug_assert_eq!(cursor, end, "object walk overran the end of the range");
}
