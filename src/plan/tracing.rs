//! Object tracers: how a collection marks or copies one object and how it
//! computes the transitive closure of what it traced.

use crate::policy::space::{HeapSpaces, Space};
use crate::scheduler::worker::WorkerPool;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::ObjectReference;
use crate::vm::object_model;
use crate::vm::types::{TypeDescriptor, TypeTable};

/// The operations reference processing, finalization and root scanning
/// need from a collection.
pub(crate) trait ObjectTracer {
    fn spaces(&self) -> &HeapSpaces;

    /// Is this a young collection?
    fn is_nursery(&self) -> bool;

    /// Make `object` live. Returns its location after this collection.
    /// The object's children are traced by the next `process_closure`.
    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference;

    /// Has `object` been found live so far in this collection?
    fn is_live(&self, object: ObjectReference) -> bool;

    /// The location of a live object after this collection.
    fn get_forwarded(&self, object: ObjectReference) -> ObjectReference;

    /// Trace everything reachable from the objects traced so far.
    fn process_closure(&mut self);
}

/// Visit the fields of `object` that the collector traces through. When
/// reference types are disabled, the referent is traced like any other field.
#[inline]
fn for_each_traced_field<F: FnMut(usize)>(
    desc: &TypeDescriptor,
    nfields: usize,
    referents_are_strong: bool,
    f: F,
) {
    if referents_are_strong {
        desc.for_each_ref_field(nfields, f)
    } else {
        desc.for_each_strong_field(nfields, f)
    }
}

/// Copies reachable young objects into the old space (Cheney style, with a
/// gray stack) and marks reachable young large objects. Everything old is
/// considered live.
pub(crate) struct NurseryTracer<'a> {
    spaces: &'a HeapSpaces,
    types: &'a TypeTable,
    referents_are_strong: bool,
    gray: Vec<ObjectReference>,
    pub promoted_bytes: usize,
    pub promoted_objects: usize,
    pub large_survivors: usize,
}

impl<'a> NurseryTracer<'a> {
    pub fn new(spaces: &'a HeapSpaces, types: &'a TypeTable, referents_are_strong: bool) -> Self {
        NurseryTracer {
            spaces,
            types,
            referents_are_strong,
            gray: vec![],
            promoted_bytes: 0,
            promoted_objects: 0,
            large_survivors: 0,
        }
    }

    fn promote(&mut self, object: ObjectReference) -> ObjectReference {
        let young = self.spaces.young.memory();
        if let Some(new) = object_model::get_forwarded(young, object) {
            return new;
        }
        let words = object_model::size_words(young, object);
        // The collection is upgraded to a full one unless everything in the
        // young space fits above the old frontier.
        let to = match self.spaces.old.allocate(words) {
            Some(to) => to,
            None => panic!("Promotion of {} ({} words) failed", object, words),
        };
        self.spaces
            .old
            .memory()
            .copy_from(young, object.to_address(), to, words);
        let new = ObjectReference::from_address(to);
        object_model::set_forwarded(young, object, new);
        trace!("Promote {} -> {}", object, new);
        self.promoted_bytes += words * BYTES_IN_WORD;
        self.promoted_objects += 1;
        self.gray.push(new);
        new
    }

    /// Trace the young objects referenced from the fields of `object`.
    pub fn scan_object(&mut self, object: ObjectReference) {
        let spaces = self.spaces;
        let types = self.types;
        let mem = spaces.memory_of(object);
        let desc = types.get(object_model::type_id(mem, object));
        let nfields = object_model::field_count(mem, object);
        for_each_traced_field(desc, nfields, self.referents_are_strong, |i| {
            let child = object_model::read_ref(mem, object, i);
            if !child.is_null() && spaces.is_young(child) {
                let new = self.trace_object(child);
                if new != child {
                    object_model::write_ref(mem, object, i, new);
                }
            }
        });
    }
}

impl ObjectTracer for NurseryTracer<'_> {
    fn spaces(&self) -> &HeapSpaces {
        self.spaces
    }

    fn is_nursery(&self) -> bool {
        true
    }

    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        if object.is_null() {
            return object;
        }
        let addr = object.to_address();
        if self.spaces.young.address_in_space(addr) {
            self.promote(object)
        } else if self.spaces.los.address_in_space(addr) {
            if object_model::is_young_large(self.spaces.los.memory(), object)
                && self.spaces.los.trace_object(object)
            {
                self.large_survivors += 1;
                self.gray.push(object);
            }
            object
        } else {
            object
        }
    }

    fn is_live(&self, object: ObjectReference) -> bool {
        let addr = object.to_address();
        if self.spaces.young.address_in_space(addr) {
            object_model::get_forwarded(self.spaces.young.memory(), object).is_some()
        } else if self.spaces.los.address_in_space(addr) {
            let mem = self.spaces.los.memory();
            !object_model::is_young_large(mem, object) || object_model::is_marked(mem, object)
        } else {
            true
        }
    }

    fn get_forwarded(&self, object: ObjectReference) -> ObjectReference {
        if self.spaces.young.in_space(object) {
            object_model::get_forwarded(self.spaces.young.memory(), object).unwrap_or(object)
        } else {
            object
        }
    }

    fn process_closure(&mut self) {
        while let Some(object) = self.gray.pop() {
            self.scan_object(object);
        }
    }
}

/// Marks every reachable object in place. Newly marked objects are queued
/// and scanned in parallel by `process_closure`.
pub(crate) struct FullTracer<'a> {
    spaces: &'a HeapSpaces,
    types: &'a TypeTable,
    referents_are_strong: bool,
    workers: &'a WorkerPool,
    pending: Vec<ObjectReference>,
    pub marked: usize,
}

impl<'a> FullTracer<'a> {
    pub fn new(
        spaces: &'a HeapSpaces,
        types: &'a TypeTable,
        referents_are_strong: bool,
        workers: &'a WorkerPool,
    ) -> Self {
        FullTracer {
            spaces,
            types,
            referents_are_strong,
            workers,
            pending: vec![],
            marked: 0,
        }
    }
}

/// Set the mark of any heap object. Returns true if this call marked it.
fn mark(spaces: &HeapSpaces, object: ObjectReference) -> bool {
    if spaces.los.in_space(object) {
        spaces.los.trace_object(object)
    } else {
        object_model::test_and_mark(spaces.memory_of(object), object)
    }
}

impl ObjectTracer for FullTracer<'_> {
    fn spaces(&self) -> &HeapSpaces {
        self.spaces
    }

    fn is_nursery(&self) -> bool {
        false
    }

    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        if !object.is_null() && mark(self.spaces, object) {
            self.pending.push(object);
        }
        object
    }

    fn is_live(&self, object: ObjectReference) -> bool {
        object_model::is_marked(self.spaces.memory_of(object), object)
    }

    fn get_forwarded(&self, object: ObjectReference) -> ObjectReference {
        object
    }

    fn process_closure(&mut self) {
        let roots = std::mem::take(&mut self.pending);
        let spaces = self.spaces;
        let types = self.types;
        let referents_are_strong = self.referents_are_strong;
        let scanned = self.workers.parallel_scan(roots, |object, push| {
            let mem = spaces.memory_of(object);
            let desc = types.get(object_model::type_id(mem, object));
            let nfields = object_model::field_count(mem, object);
            for_each_traced_field(desc, nfields, referents_are_strong, |i| {
                let child = object_model::read_ref(mem, object, i);
                if !child.is_null() && mark(spaces, child) {
                    push(child);
                }
            });
        });
        self.marked += scanned;
        trace!("Closure scanned {} objects", scanned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::fixtures::SpacesFixture;

    #[test]
    fn nursery_tracer_promotes_once() {
        let f = SpacesFixture::new();
        let leaf = f.young_node(ObjectReference::NULL);
        let a = f.young_node(leaf);
        let b = f.young_node(leaf);
        let mut tracer = NurseryTracer::new(&f.spaces, &f.types, false);
        let a2 = tracer.trace_object(a);
        let b2 = tracer.trace_object(b);
        tracer.process_closure();
        assert!(f.spaces.old.in_space(a2));
        assert_eq!(tracer.promoted_objects, 3);
        let leaf_a = object_model::read_ref(f.spaces.old.memory(), a2, 0);
        let leaf_b = object_model::read_ref(f.spaces.old.memory(), b2, 0);
        assert_eq!(leaf_a, leaf_b);
        assert!(f.spaces.old.in_space(leaf_a));
        assert!(tracer.is_live(leaf));
        assert_eq!(tracer.get_forwarded(leaf), leaf_a);
    }

    #[test]
    fn full_tracer_marks_reachable_objects() {
        let f = SpacesFixture::new();
        let dead = f.young_node(ObjectReference::NULL);
        let leaf = f.old_node(ObjectReference::NULL);
        let root = f.young_node(leaf);
        let mut tracer = FullTracer::new(&f.spaces, &f.types, false, &f.workers);
        tracer.trace_object(root);
        tracer.process_closure();
        assert_eq!(tracer.marked, 2);
        assert!(tracer.is_live(root));
        assert!(tracer.is_live(leaf));
        assert!(!tracer.is_live(dead));
    }
}
