use std::collections::HashSet;
use std::mem::swap;

use crate::util::ObjectReference;

/// Membership sets for a non-moving space collected by marking.
///
/// Newly allocated objects enter `alloc_nursery`. At the start of a
/// collection [`TreadMill::flip`] turns the sets being collected into
/// "from" sets; every object found live is moved to `to_space` by
/// [`TreadMill::copy`], and whatever is left in the "from" sets after tracing
/// is dead.
#[derive(Debug, Default)]
pub struct TreadMill {
    from_space: HashSet<ObjectReference>,
    to_space: HashSet<ObjectReference>,
    collect_nursery: HashSet<ObjectReference>,
    alloc_nursery: HashSet<ObjectReference>,
}

impl TreadMill {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_treadmill(&mut self, object: ObjectReference, nursery: bool) {
        if nursery {
            self.alloc_nursery.insert(object);
        } else {
            self.to_space.insert(object);
        }
    }

    /// Record a survivor of the current collection.
    pub fn copy(&mut self, object: ObjectReference, is_in_nursery: bool) {
        if is_in_nursery {
            debug_assert!(
                self.collect_nursery.contains(&object),
                "copy source object ({}) is not in the nursery",
                object
            );
            self.collect_nursery.remove(&object);
        } else {
            debug_assert!(
                self.from_space.contains(&object),
                "copy source object ({}) is not in the from space",
                object
            );
            self.from_space.remove(&object);
        }
        self.to_space.insert(object);
    }

    /// Take the dead nursery objects.
    pub fn collect_nursery(&mut self) -> Vec<ObjectReference> {
        self.collect_nursery.drain().collect()
    }

    /// Take the dead mature objects.
    pub fn collect(&mut self) -> Vec<ObjectReference> {
        self.from_space.drain().collect()
    }

    pub fn is_to_space_empty(&self) -> bool {
        self.to_space.is_empty()
    }

    pub fn is_from_space_empty(&self) -> bool {
        self.from_space.is_empty()
    }

    pub fn is_nursery_empty(&self) -> bool {
        self.collect_nursery.is_empty()
    }

    pub fn len(&self) -> usize {
        self.from_space.len()
            + self.to_space.len()
            + self.collect_nursery.len()
            + self.alloc_nursery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flip(&mut self, full_heap: bool) {
        swap(&mut self.alloc_nursery, &mut self.collect_nursery);
        trace!("Flipped alloc_nursery and collect_nursery");
        if full_heap {
            swap(&mut self.from_space, &mut self.to_space);
            trace!("Flipped from_space and to_space");
        }
    }
}
