//! Runtime-to-heap interface: free functions over [`Heap`] and [`Mutator`].
//!
//! This module mirrors the methods of [`Heap`] and [`Mutator`] as a flat
//! API, the shape an embedding runtime usually wants when it exposes the
//! collector to native code. A binding is expected to extend it with its own
//! entry points rather than reach into the heap's internals.
//!
//! A typical startup sequence is:
//!
//! 1. Create a [`HeapBuilder`] and set options with [`process`] or
//!    [`process_bulk`]. `GENHEAP_*` environment variables are read first.
//! 2. Build the heap with [`heap_init`]. This installs the built-in logger
//!    unless the runtime already installed one.
//! 3. Register types with [`register_type`] and classes with [`register_class`].
//! 4. Bind every thread that touches the heap with [`bind_mutator`].
//! 5. Optionally start a [`FinalizerDaemon`] with [`start_finalizer_daemon`].

use crate::heap::{Heap, HeapBuilder};
use crate::plan::{AllocationSemantics, CollectionKind, Mutator};
use crate::scheduler::{CheckpointFn, FinalizerDaemon, ThreadHandle};
use crate::util::error::{AllocError, OptionError, SuspendError};
use crate::util::statistics::GcIteration;
use crate::util::ObjectReference;
use crate::vm::types::{TypeDescriptor, TypeId};
use crate::vm::ClassId;
use std::sync::Arc;

/// Build a heap from the builder's options.
pub fn heap_init(builder: &HeapBuilder) -> Arc<Heap> {
    builder.build()
}

/// Set one option by name. Returns an error if the name is unknown or the
/// value does not parse or validate; the option keeps its old value then.
pub fn process(builder: &mut HeapBuilder, name: &str, value: &str) -> Result<(), OptionError> {
    builder.set_option(name, value)
}

/// Set options from a whitespace separated list of `name=value` pairs.
pub fn process_bulk(builder: &mut HeapBuilder, options: &str) -> Result<(), OptionError> {
    builder.options_mut().set_bulk_from_command_line(options)
}

pub fn register_type(heap: &Heap, desc: TypeDescriptor) -> Result<TypeId, AllocError> {
    heap.register_type(desc)
}

pub fn register_class(heap: &Heap, name: &str, static_slots: usize) -> ClassId {
    heap.register_class(name, static_slots)
}

/// Bind the calling thread to the heap.
pub fn bind_mutator(heap: &Arc<Heap>, name: &str) -> Mutator {
    heap.bind_mutator(name)
}

/// Unbind a mutator. Its roots are dropped and its TLAB is retired.
pub fn destroy_mutator(mutator: Mutator) {
    drop(mutator);
}

/// Allocate an object.
///
/// Arguments:
/// * `mutator`: The allocating thread.
/// * `ty`: A registered type.
/// * `length`: The element count for array types, `None` otherwise.
/// * `semantics`: Where the object should go.
pub fn alloc(
    mutator: &mut Mutator,
    ty: TypeId,
    length: Option<usize>,
    semantics: AllocationSemantics,
) -> Result<ObjectReference, AllocError> {
    mutator.alloc_with_semantics(ty, length, semantics)
}

/// Store a reference into a field, with the write barrier.
pub fn object_reference_write(mutator: &mut Mutator, src: ObjectReference, field: usize, target: ObjectReference) {
    mutator.write_ref(src, field, target)
}

/// A safepoint poll. Compiled code calls this at loop back edges and
/// method entries.
pub fn gc_poll(mutator: &mut Mutator) {
    mutator.poll()
}

/// Handle an explicit collection request from the application.
pub fn handle_user_collection_request(mutator: &mut Mutator) -> Option<GcIteration> {
    mutator.collect(CollectionKind::Full)
}

pub fn request_suspend(mutator: &mut Mutator, target: &ThreadHandle) -> Result<(), SuspendError> {
    mutator.request_suspend(target)
}

pub fn resume(mutator: &mut Mutator, target: &ThreadHandle) {
    mutator.resume(target)
}

pub fn run_checkpoint(mutator: &mut Mutator, closure: CheckpointFn) -> usize {
    mutator.run_checkpoint(closure)
}

pub fn start_finalizer_daemon(heap: &Arc<Heap>) -> std::io::Result<FinalizerDaemon> {
    FinalizerDaemon::spawn(heap)
}

/// The number of bytes currently in use.
pub fn used_bytes(heap: &Heap) -> usize {
    heap.used_bytes()
}

/// The number of bytes that can still be allocated without a collection.
pub fn free_bytes(heap: &Heap) -> usize {
    heap.free_bytes()
}

/// The capacity of all spaces together.
pub fn total_bytes(heap: &Heap) -> usize {
    heap.capacity_bytes()
}

/// Is `object` an object in one of the heap's spaces?
pub fn is_in_heap(heap: &Heap, object: ObjectReference) -> bool {
    heap.is_in_heap(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn process_options() {
        let mut builder = HeapBuilder::new_no_env_vars();
        process(&mut builder, "young_size", "65536").unwrap();
        assert_eq!(builder.options().young_size, 65536);
        assert!(matches!(
            process(&mut builder, "young_size", "lots"),
            Err(OptionError::ParseError { .. })
        ));
        assert!(matches!(
            process(&mut builder, "no_such_option", "1"),
            Err(OptionError::UnknownOption(_))
        ));
        process_bulk(&mut builder, "gc_threads=3 log_gc=true").unwrap();
        assert_eq!(builder.options().gc_threads, 3);
        assert!(builder.options().log_gc);
    }

    #[test]
    fn environment_overrides_defaults() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("GENHEAP_OLD_SIZE", "1048576");
                    std::env::set_var("GENHEAP_CARD_SIZE", "500");
                    let builder = HeapBuilder::new();
                    assert_eq!(builder.options().old_size, 1 << 20);
                    // Not a power of two: ignored with a warning.
                    assert_eq!(builder.options().card_size, 512);
                },
                || {
                    std::env::remove_var("GENHEAP_OLD_SIZE");
                    std::env::remove_var("GENHEAP_CARD_SIZE");
                },
            )
        })
    }

    #[test]
    fn init_and_bind() {
        let mut builder = HeapBuilder::new_no_env_vars();
        process_bulk(&mut builder, "young_size=262144 old_size=524288 los_size=524288").unwrap();
        let heap = heap_init(&builder);
        let ty = register_type(&heap, TypeDescriptor::instance("Point", 2, &[])).unwrap();
        let mut m = bind_mutator(&heap, "main");
        let p = alloc(&mut m, ty, None, AllocationSemantics::Default).unwrap();
        assert!(is_in_heap(&heap, p));
        assert!(used_bytes(&heap) > 0);
        assert_eq!(used_bytes(&heap) + free_bytes(&heap), total_bytes(&heap));
        destroy_mutator(m);
    }
}
