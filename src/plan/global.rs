//! Collection kinds, causes, allocation semantics and the policy that picks
//! the kind of the next collection.

use crate::policy::space::{HeapSpaces, Space};
use bytemuck::NoUninit;
use enum_map::Enum;
use strum_macros::Display;

/// What a collection covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, Display, NoUninit)]
#[repr(u8)]
pub enum CollectionKind {
    /// Evacuate the young space into the old space. Old objects are roots
    /// through the card table and are not traced.
    Young,
    /// Mark the whole heap, then sweep or compact.
    Full,
}

/// Why a collection ran.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum GcCause {
    /// An allocation could not be satisfied.
    Alloc,
    /// Requested by the application.
    Explicit,
    /// The stress factor was reached.
    Stress,
    /// The collection that runs before an allocation fails with an
    /// out-of-memory error. It also clears soft references.
    LastResort,
}

/// Allocation semantics. Each allocation request names the semantic it wants.
#[derive(Clone, Copy, Debug, Enum, PartialEq, Eq, Display)]
pub enum AllocationSemantics {
    /// Bump allocate in the young space. Requests at or above the large
    /// object threshold are redirected to the large object space.
    Default,
    /// Pretenure: allocate directly in the old space.
    Mature,
    /// Allocate in the large object space. The object never moves.
    Large,
}

/// Pick the kind of collection to run when `requested` was asked for.
///
/// A young collection must be able to promote every young byte into the
/// old space without failing halfway, so it is upgraded to a full
/// collection unless the old space frontier can absorb the whole young
/// space in use.
pub(crate) fn choose_collection_kind(requested: CollectionKind, spaces: &HeapSpaces) -> CollectionKind {
    match requested {
        CollectionKind::Full => CollectionKind::Full,
        CollectionKind::Young => {
            let needed = spaces.young.used_bytes();
            let room = spaces.old.room_at_frontier();
            if room < needed {
                debug!(
                    "Upgrading to a full collection: {} bytes at the old space frontier, {} young bytes",
                    room, needed
                );
                CollectionKind::Full
            } else {
                CollectionKind::Young
            }
        }
    }
}

/// Plan the kind of the next allocation-triggered collection.
///
/// After any collection the next one is young unless the old space has
/// less free room than the young space can hold.
pub(crate) fn next_collection_kind(spaces: &HeapSpaces) -> CollectionKind {
    if spaces.old.free_bytes() < spaces.young.capacity_bytes() {
        CollectionKind::Full
    } else {
        CollectionKind::Young
    }
}
