use crate::heap::Heap;
use crate::plan::roots::{self, RootKind};
use crate::policy::space::Space;
use crate::scheduler::ThreadHandle;
use crate::util::raw_memory::RawMemory;
use crate::util::ObjectReference;
use crate::vm::object_model::{self, HEADER_WORDS};
use crate::vm::types::{TypeId, TypeTable};
use std::collections::HashSet;
use std::fmt;

/// A heap invariant that does not hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationError {
    /// The header names a type that was never registered.
    UnknownType { object: ObjectReference, type_id: TypeId },
    /// The size in the header is smaller than a header.
    BadSize { object: ObjectReference, words: usize },
    /// A mark bit survived a collection.
    StaleMark(ObjectReference),
    /// A forwarding address survived a collection.
    StaleForwarding(ObjectReference),
    /// A reference field points somewhere that is not the start of an object.
    DanglingField {
        object: ObjectReference,
        field: usize,
        target: ObjectReference,
    },
    /// A root points somewhere that is not the start of an object.
    DanglingRoot { kind: RootKind, target: ObjectReference },
    /// An old object references a young one and its card is clean.
    MissingCard {
        object: ObjectReference,
        field: usize,
        target: ObjectReference,
    },
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VerificationError::UnknownType { object, type_id } => {
                write!(f, "{} has unregistered {}", object, type_id)
            }
            VerificationError::BadSize { object, words } => {
                write!(f, "{} has invalid size {} words", object, words)
            }
            VerificationError::StaleMark(object) => write!(f, "{} is still marked", object),
            VerificationError::StaleForwarding(object) => {
                write!(f, "{} still has a forwarding word", object)
            }
            VerificationError::DanglingField {
                object,
                field,
                target,
            } => write!(f, "{}.{} points to non-object {}", object, field, target),
            VerificationError::DanglingRoot { kind, target } => {
                write!(f, "{} root points to non-object {}", kind, target)
            }
            VerificationError::MissingCard {
                object,
                field,
                target,
            } => write!(
                f,
                "old {}.{} references young {} but its card is clean",
                object, field, target
            ),
        }
    }
}

struct SanityChecker<'a> {
    heap: &'a Heap,
    types: TypeTable,
    /// Every object start in the heap.
    refs: HashSet<ObjectReference>,
    errors: Vec<VerificationError>,
}

impl<'a> SanityChecker<'a> {
    fn new(heap: &'a Heap) -> Self {
        Self {
            heap,
            types: heap.types.snapshot(),
            refs: HashSet::new(),
            errors: vec![],
        }
    }

    fn collect_objects(&mut self) {
        let spaces = &self.heap.spaces;
        let spaces: [&dyn Space; 3] = [&spaces.young, &spaces.old, &spaces.los];
        for space in spaces {
            let refs = &mut self.refs;
            space.for_each_object(&mut |o| {
                refs.insert(o);
            });
        }
    }

    fn check_object(&mut self, mem: &RawMemory, object: ObjectReference) {
        let type_id = object_model::type_id(mem, object);
        if !self.types.contains(type_id) {
            self.errors
                .push(VerificationError::UnknownType { object, type_id });
            return;
        }
        let words = object_model::size_words(mem, object);
        if words < HEADER_WORDS {
            self.errors.push(VerificationError::BadSize { object, words });
            return;
        }
        if object_model::is_marked(mem, object) {
            self.errors.push(VerificationError::StaleMark(object));
        }
        if object_model::has_forwarding_word(mem, object) {
            self.errors.push(VerificationError::StaleForwarding(object));
        }
        let spaces = &self.heap.spaces;
        let old = spaces.is_old(object);
        let desc = self.types.get(type_id);
        let mut errors = vec![];
        desc.for_each_ref_field(words - HEADER_WORDS, |field| {
            let target = object_model::read_ref(mem, object, field);
            if target.is_null() {
                return;
            }
            if !self.refs.contains(&target) {
                errors.push(VerificationError::DanglingField {
                    object,
                    field,
                    target,
                });
            } else if old
                && spaces.is_young(target)
                && !self
                    .heap
                    .cards
                    .is_dirty(object_model::field_address(object, field))
            {
                errors.push(VerificationError::MissingCard {
                    object,
                    field,
                    target,
                });
            }
        });
        self.errors.extend(errors);
    }

    fn check_roots(&mut self, threads: &[ThreadHandle]) {
        let refs = &self.refs;
        let errors = &mut self.errors;
        roots::for_each_root(self.heap, threads, &mut |kind, target| {
            if !refs.contains(&target) {
                errors.push(VerificationError::DanglingRoot { kind, target });
            }
        });
        let weak = self.heap.weak_globals.lock().unwrap();
        weak.for_each_root(|target| {
            if !refs.contains(&target) {
                errors.push(VerificationError::DanglingRoot {
                    kind: RootKind::GlobalHandle,
                    target,
                });
            }
        });
    }
}

/// Check the heap invariants: every object has a registered type and a
/// sane size, no GC state is left in any header, every reference field and
/// root points at an object start, and every old-to-young reference is
/// covered by a dirty card. Mutators must be stopped and their allocation
/// buffers retired.
pub fn verify_heap(heap: &Heap, threads: &[ThreadHandle]) -> Result<(), Vec<VerificationError>> {
    let mut checker = SanityChecker::new(heap);
    checker.collect_objects();
    let objects: Vec<ObjectReference> = checker.refs.iter().copied().collect();
    for object in objects {
        let mem = heap.spaces.memory_of(object);
        checker.check_object(mem, object);
    }
    checker.check_roots(threads);
    debug!(
        "Verified {} objects, {} errors",
        checker.refs.len(),
        checker.errors.len()
    );
    if checker.errors.is_empty() {
        Ok(())
    } else {
        Err(checker.errors)
    }
}
