//! A mutator: one thread bound to a heap.
//!
//! Raw [`ObjectReference`]s returned by a mutator are valid only until its
//! next poll point. Every allocation, [`Mutator::poll`], [`Mutator::in_native`]
//! and every call that may wait for another thread is a poll point; objects
//! that must survive one have to be stored in a root first: a stack slot, a
//! reachability fence, a handle or a static slot.

use crate::heap::Heap;
use crate::plan::generational::{self, CollectionRequest};
use crate::plan::global::{AllocationSemantics, CollectionKind, GcCause};
use crate::policy::space::Space;
use crate::scheduler::{CheckpointFn, ThreadHandle, ThreadState};
use crate::util::alloc::BumpAllocator;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::error::{AllocError, HandleError, ReferenceError, StackError, StaticsError, SuspendError};
use crate::util::raw_memory::RawMemory;
use crate::util::reference_processor::QueueId;
use crate::util::sanity::VerificationError;
use crate::util::statistics::GcIteration;
use crate::util::{Address, ObjectReference};
use crate::vm::handles::{HandleKind, IndirectRef, IndirectReferenceTable, LocalFrameCookie};
use crate::vm::object_model::{self, FinalizerState};
use crate::vm::stack::{FenceId, FenceStack, ShadowStack, StackMap};
use crate::vm::statics::ClassId;
use crate::vm::types::{ReferenceKind, TypeDescriptor, TypeId, FILLER_TYPE, QUEUE_FIELD, REFERENT_FIELD};
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

/// The per-thread state the collector reads and updates while the thread
/// is stopped.
pub(crate) struct MutatorLocals {
    pub stack: ShadowStack,
    pub fences: FenceStack,
    pub handles: IndirectReferenceTable,
    pub tlab: BumpAllocator,
    pub allocated_bytes: usize,
    pub allocated_objects: usize,
}

impl MutatorLocals {
    pub fn new() -> Self {
        MutatorLocals {
            stack: ShadowStack::new(),
            fences: FenceStack::default(),
            handles: IndirectReferenceTable::new(HandleKind::Local),
            tlab: BumpAllocator::new(),
            allocated_bytes: 0,
            allocated_objects: 0,
        }
    }
}

/// Panic on a misused stack or fence. Callers release the locals lock
/// first so that a caught panic does not poison it.
fn misuse<T>(result: Result<T, StackError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{}", e),
    }
}

/// Escalation steps of an allocation that keeps failing.
const ALLOC_ATTEMPTS: usize = 3;

pub struct Mutator {
    heap: Arc<Heap>,
    thread: ThreadHandle,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, thread: ThreadHandle) -> Self {
        Mutator { heap, thread }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn id(&self) -> usize {
        self.thread.id()
    }

    fn locals(&self) -> MutexGuard<MutatorLocals> {
        self.thread.locals.lock().unwrap()
    }

    /* Allocation */

    /// Allocate an instance of a fixed-size type in the young space.
    pub fn alloc(&mut self, ty: TypeId) -> Result<ObjectReference, AllocError> {
        self.alloc_with_semantics(ty, None, AllocationSemantics::Default)
    }

    /// Allocate an array of `length` elements.
    pub fn alloc_array(&mut self, ty: TypeId, length: usize) -> Result<ObjectReference, AllocError> {
        self.alloc_with_semantics(ty, Some(length), AllocationSemantics::Default)
    }

    /// Allocate an object with the given semantics. `length` is the element
    /// count of an array and must be `None` for fixed-size types. Fields are
    /// zeroed. This is a poll point and may run a collection.
    pub fn alloc_with_semantics(
        &mut self,
        ty: TypeId,
        length: Option<usize>,
        semantics: AllocationSemantics,
    ) -> Result<ObjectReference, AllocError> {
        let desc = self.allocatable_type(ty)?;
        let fields = match (desc.fixed_fields(), length) {
            (Some(fields), None) => fields,
            (None, Some(length)) => length,
            (Some(_), Some(_)) => {
                return Err(AllocError::InvalidType(format!(
                    "{} ({}) is not an array type",
                    desc.name, ty
                )))
            }
            (None, None) => {
                return Err(AllocError::InvalidType(format!(
                    "{} ({}) is an array type and needs a length",
                    desc.name, ty
                )))
            }
        };
        let words = object_model::object_words(fields);
        let bytes = words * BYTES_IN_WORD;
        let semantics = if semantics == AllocationSemantics::Default
            && bytes >= self.heap.options.large_object_threshold
        {
            AllocationSemantics::Large
        } else {
            semantics
        };
        let (capacity, space) = self.capacity_for(semantics);
        if bytes > capacity {
            return Err(AllocError::TooLarge { bytes, space });
        }
        let state = if desc.is_finalizable() && !self.heap.options.no_finalizer {
            FinalizerState::NotFinalized
        } else {
            FinalizerState::NotFinalizable
        };

        if self
            .heap
            .state
            .increase_allocation_bytes_by(bytes, self.heap.options.stress_factor)
        {
            trace!("Stress GC triggered by a {} byte allocation", bytes);
            self.collect_with(CollectionRequest::new(CollectionKind::Young, GcCause::Stress), None);
        }

        let object = self.allocate_with_retries(ty, words, state, semantics, space)?;
        self.post_alloc(object, &desc, state, bytes);
        Ok(object)
    }

    fn allocatable_type(&self, ty: TypeId) -> Result<Arc<TypeDescriptor>, AllocError> {
        if ty == FILLER_TYPE {
            return Err(AllocError::InvalidType("the filler type cannot be allocated".to_string()));
        }
        self.heap
            .types
            .get(ty)
            .ok_or_else(|| AllocError::InvalidType(format!("{} is not registered", ty)))
    }

    fn capacity_for(&self, semantics: AllocationSemantics) -> (usize, &'static str) {
        let spaces = &self.heap.spaces;
        match semantics {
            AllocationSemantics::Default => (spaces.young.capacity_bytes(), "young"),
            AllocationSemantics::Mature => (spaces.old.capacity_bytes(), "old"),
            AllocationSemantics::Large => (spaces.los.max_object_bytes(), "large"),
        }
    }

    /// Try to allocate, collecting between attempts: first the planned
    /// collection, then a full collection that also clears soft references.
    fn allocate_with_retries(
        &mut self,
        ty: TypeId,
        words: usize,
        state: FinalizerState,
        semantics: AllocationSemantics,
        space: &'static str,
    ) -> Result<ObjectReference, AllocError> {
        let mut attempt = 0;
        loop {
            let observed = self.heap.gc_requester.completed();
            if let Some(object) = self.try_allocate(ty, words, state, semantics) {
                return Ok(object);
            }
            if attempt + 1 == ALLOC_ATTEMPTS {
                warn!(
                    "Out of memory: thread {} failed to allocate {} bytes in the {} space",
                    self.thread.id(),
                    words * BYTES_IN_WORD,
                    space
                );
                return Err(AllocError::OutOfMemory {
                    bytes: words * BYTES_IN_WORD,
                    space,
                });
            }
            let request = if attempt == 0 {
                let kind = match semantics {
                    AllocationSemantics::Default => self.heap.state.next_collection_kind.load(Ordering::Relaxed),
                    _ => CollectionKind::Full,
                };
                CollectionRequest::new(kind, GcCause::Alloc)
            } else {
                CollectionRequest::new(CollectionKind::Full, GcCause::LastResort).clearing_soft_references()
            };
            // If another thread collected since the allocation failed, retry
            // before collecting again.
            if self.collect_with(request, Some(observed)).is_some() {
                attempt += 1;
            }
        }
    }

    fn try_allocate(
        &mut self,
        ty: TypeId,
        words: usize,
        state: FinalizerState,
        semantics: AllocationSemantics,
    ) -> Option<ObjectReference> {
        let heap = self.heap.clone();
        let spaces = &heap.spaces;
        match semantics {
            AllocationSemantics::Default => {
                let addr = self.alloc_young(words * BYTES_IN_WORD)?;
                Some(object_model::initialize_object(spaces.young.memory(), addr, ty, words, state))
            }
            AllocationSemantics::Mature => {
                let addr = spaces.old.allocate(words)?;
                Some(object_model::initialize_object(spaces.old.memory(), addr, ty, words, state))
            }
            AllocationSemantics::Large => spaces.los.allocate(ty, words, state),
        }
    }

    #[inline]
    fn alloc_young(&mut self, bytes: usize) -> Option<Address> {
        if let Some(addr) = self.locals().tlab.alloc(bytes) {
            return Some(addr);
        }
        self.alloc_young_slow(bytes)
    }

    /// Refill the TLAB. This is a poll point.
    fn alloc_young_slow(&mut self, bytes: usize) -> Option<Address> {
        self.poll();
        let young = &self.heap.spaces.young;
        let tlab_size = self.heap.options.tlab_size;
        let mut locals = self.thread.locals.lock().unwrap();
        if bytes > tlab_size / 2 {
            // Keep the current TLAB for smaller objects.
            return young.acquire(bytes).map(|range| range.start);
        }
        locals.tlab.retire(young.memory());
        let range = young.acquire_up_to(bytes, tlab_size)?;
        trace!("Thread {} new TLAB [{}, {})", self.thread.id(), range.start, range.end);
        locals.tlab.set_limit(range.start, range.end);
        locals.tlab.alloc(bytes)
    }

    fn post_alloc(&mut self, object: ObjectReference, desc: &TypeDescriptor, state: FinalizerState, bytes: usize) {
        if state == FinalizerState::NotFinalized {
            self.heap.finalizable.lock().unwrap().add(object);
        }
        if let Some(kind) = desc.reference_kind() {
            self.heap.references.lock().unwrap().add_candidate(kind, object);
        }
        let mut locals = self.locals();
        locals.allocated_bytes += bytes;
        locals.allocated_objects += 1;
    }

    /// Bytes allocated by this thread so far.
    pub fn allocated_bytes(&self) -> usize {
        self.locals().allocated_bytes
    }

    pub fn allocated_objects(&self) -> usize {
        self.locals().allocated_objects
    }

    /* Object access */

    fn checked_field(&self, object: ObjectReference, field: usize) -> &RawMemory {
        assert!(!object.is_null(), "field access on a null reference");
        let mem = self.heap.spaces.memory_of(object);
        let count = object_model::field_count(mem, object);
        assert!(field < count, "field {} out of bounds for {} with {} fields", field, object, count);
        mem
    }

    pub fn read_ref(&self, object: ObjectReference, field: usize) -> ObjectReference {
        let mem = self.checked_field(object, field);
        object_model::read_ref(mem, object, field)
    }

    /// Store a reference into a reference field, with the card marking
    /// write barrier.
    pub fn write_ref(&mut self, object: ObjectReference, field: usize, value: ObjectReference) {
        let mem = self.checked_field(object, field);
        debug_assert!(
            self.heap
                .types
                .get(object_model::type_id(mem, object))
                .is_some_and(|d| d.is_ref_field(field)),
            "{}.{} is not a reference field",
            object,
            field
        );
        object_model::write_ref(mem, object, field, value);
        self.heap.cards.object_reference_write_post(
            &self.heap.spaces,
            object,
            object_model::field_address(object, field),
            value,
        );
    }

    pub fn read_word(&self, object: ObjectReference, field: usize) -> usize {
        let mem = self.checked_field(object, field);
        object_model::read_word(mem, object, field, Ordering::Relaxed)
    }

    /// Store a primitive word. Reference fields must use [`Mutator::write_ref`].
    pub fn write_word(&mut self, object: ObjectReference, field: usize, value: usize) {
        let mem = self.checked_field(object, field);
        debug_assert!(
            !self
                .heap
                .types
                .get(object_model::type_id(mem, object))
                .is_some_and(|d| d.is_ref_field(field)),
            "{}.{} is a reference field",
            object,
            field
        );
        object_model::write_word(mem, object, field, value, Ordering::Relaxed);
    }

    pub fn field_count(&self, object: ObjectReference) -> usize {
        object_model::field_count(self.heap.spaces.memory_of(object), object)
    }

    pub fn type_of(&self, object: ObjectReference) -> TypeId {
        object_model::type_id(self.heap.spaces.memory_of(object), object)
    }

    /// The identity hash code. It stays the same when the object moves.
    pub fn identity_hash(&self, object: ObjectReference) -> u32 {
        let mem = self.heap.spaces.memory_of(object);
        object_model::identity_hash(mem, object, self.heap.state.next_hash_seed())
    }

    /* Safepoints */

    /// A poll point: run pending checkpoints and park while suspended.
    #[inline]
    pub fn poll(&mut self) {
        if self.thread.has_pending_request() {
            self.thread.handle_requests();
        }
    }

    /// Run `f` in the native state. The thread is GC-safe while `f` runs, so
    /// `f` must not touch the heap. Returning is a poll point.
    pub fn in_native<R, F: FnOnce() -> R>(&mut self, f: F) -> R {
        self.thread.transition_to_safe(ThreadState::Native);
        let result = f();
        self.thread.transition_to_runnable();
        result
    }

    /* Shadow stack and reachability fences */

    /// Push a frame with `slots` null reference slots, all live.
    pub fn push_frame(&mut self, slots: usize) {
        self.locals().stack.push_frame(slots)
    }

    pub fn pop_frame(&mut self) -> bool {
        self.locals().stack.pop_frame()
    }

    /// Read a slot of the top frame. Panics if there is no frame or the
    /// slot is out of bounds.
    pub fn slot(&self, slot: usize) -> ObjectReference {
        let result = self.locals().stack.get(slot);
        misuse(result)
    }

    pub fn set_slot(&mut self, slot: usize, value: ObjectReference) {
        let result = self.locals().stack.set(slot, value);
        misuse(result)
    }

    /// Describe which slots of the top frame are live from now on. Dead
    /// slots are cleared by the next collection. A map of the wrong size
    /// is rejected and the frame keeps its previous map.
    pub fn set_stack_map(&mut self, map: StackMap) -> Result<(), StackError> {
        self.locals().stack.set_stack_map(map)
    }

    pub fn stack_depth(&self) -> usize {
        self.locals().stack.depth()
    }

    /// Keep `object` reachable until the fence is popped.
    pub fn push_fence(&mut self, object: ObjectReference) -> FenceId {
        self.locals().fences.push(object)
    }

    /// Pop the innermost fence. Returns the object's current location.
    pub fn pop_fence(&mut self, fence: FenceId) -> ObjectReference {
        let result = self.locals().fences.pop(fence);
        misuse(result)
    }

    /// The current location of a fenced object.
    pub fn fenced(&self, fence: FenceId) -> ObjectReference {
        let result = self.locals().fences.get(fence);
        misuse(result)
    }

    /// Run `f` with `object` kept reachable. `f` reads the object's current
    /// location through [`Mutator::fenced`].
    pub fn with_reachability_fence<R, F: FnOnce(&mut Self, FenceId) -> R>(
        &mut self,
        object: ObjectReference,
        f: F,
    ) -> R {
        let fence = self.push_fence(object);
        let result = f(self, fence);
        self.pop_fence(fence);
        result
    }

    /* Handles */

    pub fn new_local(&mut self, object: ObjectReference) -> Result<IndirectRef, HandleError> {
        self.locals().handles.add(object)
    }

    pub fn delete_local(&mut self, handle: IndirectRef) -> Result<(), HandleError> {
        self.locals().handles.remove(handle)
    }

    pub fn push_local_frame(&mut self) -> LocalFrameCookie {
        self.locals().handles.push_frame()
    }

    /// Release every local handle created since the matching push. If
    /// `result` is given, the object it refers to gets a new handle in the
    /// outer frame, which is returned.
    pub fn pop_local_frame(
        &mut self,
        cookie: LocalFrameCookie,
        result: Option<IndirectRef>,
    ) -> Result<Option<IndirectRef>, HandleError> {
        let mut locals = self.locals();
        let object = result.map(|h| locals.handles.get(h)).transpose()?;
        locals.handles.pop_frame(cookie)?;
        match object {
            Some(o) if !o.is_null() => locals.handles.add(o).map(Some),
            _ => Ok(None),
        }
    }

    pub fn new_global(&mut self, object: ObjectReference) -> Result<IndirectRef, HandleError> {
        self.heap.globals.lock().unwrap().add(object)
    }

    pub fn delete_global(&mut self, handle: IndirectRef) -> Result<(), HandleError> {
        self.heap.globals.lock().unwrap().remove(handle)
    }

    /// A handle that does not keep its object alive. It reads as null once
    /// the object has been collected.
    pub fn new_weak_global(&mut self, object: ObjectReference) -> Result<IndirectRef, HandleError> {
        self.heap.weak_globals.lock().unwrap().add(object)
    }

    pub fn delete_weak_global(&mut self, handle: IndirectRef) -> Result<(), HandleError> {
        self.heap.weak_globals.lock().unwrap().remove(handle)
    }

    /// The object a handle of any kind currently refers to.
    pub fn resolve(&self, handle: IndirectRef) -> Result<ObjectReference, HandleError> {
        match handle.kind() {
            HandleKind::Local => self.locals().handles.get(handle),
            HandleKind::Global => self.heap.globals.lock().unwrap().get(handle),
            HandleKind::WeakGlobal => self.heap.weak_globals.lock().unwrap().get(handle),
        }
    }

    /* Class statics */

    pub fn get_static(&self, class: ClassId, slot: usize) -> Result<ObjectReference, StaticsError> {
        self.heap.statics.lock().unwrap().get(class, slot)
    }

    pub fn set_static(&mut self, class: ClassId, slot: usize, value: ObjectReference) -> Result<(), StaticsError> {
        self.heap.statics.lock().unwrap().set(class, slot, value)
    }

    /* Reference objects */

    /// Allocate a reference object of type `ty` for `referent`, delivered to
    /// `queue` once cleared by the collector.
    pub fn new_reference(
        &mut self,
        ty: TypeId,
        referent: ObjectReference,
        queue: Option<QueueId>,
    ) -> Result<ObjectReference, AllocError> {
        let desc = self.allocatable_type(ty)?;
        if desc.reference_kind().is_none() {
            return Err(AllocError::InvalidType(format!(
                "{} ({}) is not a reference type",
                desc.name, ty
            )));
        }
        if let Some(q) = queue {
            if !self.heap.references.lock().unwrap().queues.is_valid(q) {
                return Err(AllocError::InvalidType(format!("unknown reference queue {}", q.0)));
            }
        }
        // The allocation may collect.
        let fence = self.push_fence(referent);
        let reference = self.alloc(ty);
        let referent = self.pop_fence(fence);
        let reference = reference?;
        self.write_ref(reference, REFERENT_FIELD, referent);
        let mem = self.heap.spaces.memory_of(reference);
        object_model::write_word(mem, reference, QUEUE_FIELD, queue.map_or(0, |q| q.0), Ordering::Relaxed);
        Ok(reference)
    }

    fn reference_kind(&self, reference: ObjectReference) -> Result<ReferenceKind, ReferenceError> {
        if reference.is_null() || !self.heap.spaces.contains(reference) {
            return Err(ReferenceError::NotAReference(reference));
        }
        self.heap
            .types
            .get(self.type_of(reference))
            .and_then(|d| d.reference_kind())
            .ok_or(ReferenceError::NotAReference(reference))
    }

    /// The referent, or null once the collector (or [`Mutator::reference_clear`])
    /// cleared it. Phantom references always read as null.
    pub fn reference_get(&self, reference: ObjectReference) -> Result<ObjectReference, ReferenceError> {
        if self.reference_kind(reference)? == ReferenceKind::Phantom {
            return Ok(ObjectReference::NULL);
        }
        let mem = self.heap.spaces.memory_of(reference);
        Ok(ObjectReference::from_raw(object_model::read_word(
            mem,
            reference,
            REFERENT_FIELD,
            Ordering::Acquire,
        )))
    }

    pub fn reference_clear(&mut self, reference: ObjectReference) -> Result<(), ReferenceError> {
        self.reference_kind(reference)?;
        let mem = self.heap.spaces.memory_of(reference);
        object_model::write_word(mem, reference, REFERENT_FIELD, 0, Ordering::Release);
        Ok(())
    }

    /// Has the collector put this reference on its queue?
    pub fn is_enqueued(&self, reference: ObjectReference) -> Result<bool, ReferenceError> {
        self.reference_kind(reference)?;
        Ok(object_model::is_enqueued(self.heap.spaces.memory_of(reference), reference))
    }

    /// Take the oldest reference off a queue.
    pub fn poll_reference_queue(&mut self, queue: QueueId) -> Option<ObjectReference> {
        self.heap.references.lock().unwrap().queues.poll(queue)
    }

    /* Finalization */

    /// Run the finalizer of an object taken off the ready list.
    pub(crate) fn run_finalizer(&mut self, object: ObjectReference) {
        let cookie = self.push_local_frame();
        // The frame was just pushed, so the table has room for one handle.
        let handle = match self.new_local(object) {
            Ok(h) => h,
            Err(e) => panic!("Cannot create a handle for finalizable {}: {}", object, e),
        };
        let ty = self.type_of(object);
        if let Some(finalizer) = self.heap.types.get(ty).and_then(|d| d.finalizer.clone()) {
            trace!("Finalizing {} ({})", object, ty);
            finalizer(self, handle);
        }
        if let Ok(object) = self.resolve(handle) {
            object_model::set_finalizer_state(self.heap.spaces.memory_of(object), object, FinalizerState::Finalized);
        }
        if let Err(e) = self.locals().handles.pop_frame(cookie) {
            panic!("Finalizer of {} left the local frames unbalanced: {}", ty, e);
        }
    }

    /* Threads */

    /// Suspend `target` and wait until it is GC-safe. A thread may suspend
    /// itself, in which case this returns only once another thread resumed it.
    pub fn request_suspend(&mut self, target: &ThreadHandle) -> Result<(), SuspendError> {
        if target.id() == self.thread.id() {
            return self.thread.request_suspend(true, None);
        }
        let timeout = self.heap.suspend_timeout();
        self.thread.transition_to_safe(ThreadState::WaitingForGc);
        let result = target.request_suspend(false, Some(timeout));
        self.thread.transition_to_runnable();
        result
    }

    /// # Panics
    /// If the target's suspend count is zero.
    pub fn resume(&mut self, target: &ThreadHandle) {
        target.resume()
    }

    /// Run `closure` once on every mutator, this one included, and wait
    /// until it ran everywhere. Returns the number of threads it ran for.
    pub fn run_checkpoint(&mut self, closure: CheckpointFn) -> usize {
        self.thread.transition_to_safe(ThreadState::WaitingForGc);
        let count = self.heap.threads.run_checkpoint(Some(&self.thread), closure);
        self.thread.transition_to_runnable();
        count
    }

    /* Collection */

    /// An explicit collection. Returns `None` if the heap ignores explicit
    /// requests.
    pub fn collect(&mut self, kind: CollectionKind) -> Option<GcIteration> {
        let request = self.heap.explicit_request(kind)?;
        self.collect_with(request, None)
    }

    /// Run a collection, or wait for the one in progress. The thread is
    /// GC-safe meanwhile. Returns `None` if another thread's collection
    /// completed since `observed`, or ran instead of this one.
    pub(crate) fn collect_with(&mut self, request: CollectionRequest, observed: Option<usize>) -> Option<GcIteration> {
        self.thread.transition_to_safe(ThreadState::WaitingForGc);
        let heap = &self.heap;
        let thread = &self.thread;
        let mut result = None;
        heap.gc_requester.run_or_wait(observed, || {
            result = Some(generational::collect(heap, Some(thread), request));
        });
        self.thread.transition_to_runnable();
        result
    }

    /// Stop every other mutator and check the heap invariants.
    pub fn verify_heap(&mut self) -> Result<(), Vec<VerificationError>> {
        self.thread.transition_to_safe(ThreadState::WaitingForGc);
        let heap = &self.heap;
        let me = self.thread.id();
        let mut result = Ok(());
        heap.gc_requester.run_or_wait(None, || {
            let stopped = heap.threads.suspend_all(Some(me));
            let threads = heap.threads.snapshot();
            generational::retire_tlabs(heap, &threads);
            result = crate::util::sanity::verify_heap(heap, &threads);
            heap.threads.resume_all(&stopped);
        });
        self.thread.transition_to_runnable();
        result
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        {
            // Unbind even after a panic poisoned the lock.
            let mut locals = self.thread.locals.lock().unwrap_or_else(|e| e.into_inner());
            locals.tlab.retire(self.heap.spaces.young.memory());
            *locals = MutatorLocals::new();
        }
        self.thread.transition_to_safe(ThreadState::Terminated);
        self.heap.threads.unregister(self.thread.id());
        trace!("Mutator {} unbound", self.thread.id());
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Mutator").field("thread", &self.thread).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::test_util::fixtures::{small_heap, small_heap_with};
    use crate::vm::types::TypeDescriptor;

    #[test]
    fn tlab_allocation_is_contiguous() {
        let heap = small_heap();
        let node = heap.register_type(TypeDescriptor::instance("Node", 2, &[0])).unwrap();
        let mut m = heap.bind_mutator("main");
        let a = m.alloc(node).unwrap();
        let b = m.alloc(node).unwrap();
        assert_eq!(b.to_address(), a.to_address() + object_model::object_words(2) * BYTES_IN_WORD);
        assert_eq!(m.field_count(a), 2);
        assert_eq!(m.type_of(b), node);
        assert_eq!(m.read_ref(a, 0), ObjectReference::NULL);
        assert_eq!(m.allocated_objects(), 2);
    }

    #[test]
    fn stack_misuse_leaves_the_mutator_usable() {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        let heap = small_heap();
        let mut m = heap.bind_mutator("main");
        assert!(catch_unwind(AssertUnwindSafe(|| m.slot(0))).is_err());
        m.push_frame(1);
        assert_eq!(
            m.set_stack_map(StackMap::all_live(2)),
            Err(StackError::MapMismatch { map: 2, slots: 1 })
        );
        assert!(catch_unwind(AssertUnwindSafe(|| m.set_slot(1, ObjectReference::NULL))).is_err());
        // The locals lock is not poisoned.
        assert!(m.slot(0).is_null());
        assert!(m.collect(CollectionKind::Full).is_some());
    }

    #[test]
    fn instance_and_array_lengths_are_checked() {
        let heap = small_heap();
        let node = heap.register_type(TypeDescriptor::instance("Node", 1, &[0])).unwrap();
        let array = heap.register_type(TypeDescriptor::ref_array("Object[]")).unwrap();
        let mut m = heap.bind_mutator("main");
        assert!(matches!(m.alloc_array(node, 3), Err(AllocError::InvalidType(_))));
        assert!(matches!(m.alloc(array), Err(AllocError::InvalidType(_))));
        assert!(matches!(m.alloc(FILLER_TYPE), Err(AllocError::InvalidType(_))));
        assert!(matches!(m.alloc(TypeId(999)), Err(AllocError::InvalidType(_))));
        let a = m.alloc_array(array, 10).unwrap();
        assert_eq!(m.field_count(a), 10);
    }

    #[test]
    fn large_arrays_go_to_the_large_object_space() {
        let heap = small_heap_with(|o| o.large_object_threshold = BYTES_IN_PAGE);
        let words = heap.register_type(TypeDescriptor::prim_array("long[]")).unwrap();
        let mut m = heap.bind_mutator("main");
        let small = m.alloc_array(words, 8).unwrap();
        let large = m.alloc_array(words, BYTES_IN_PAGE / BYTES_IN_WORD).unwrap();
        assert!(heap.spaces.young.in_space(small));
        assert!(heap.spaces.los.in_space(large));
        let mature = m
            .alloc_with_semantics(words, Some(8), AllocationSemantics::Mature)
            .unwrap();
        assert!(heap.spaces.old.in_space(mature));
    }

    #[test]
    fn write_barrier_marks_old_to_young_cards() {
        let heap = small_heap();
        let node = heap.register_type(TypeDescriptor::instance("Node", 1, &[0])).unwrap();
        let mut m = heap.bind_mutator("main");
        let old = m
            .alloc_with_semantics(node, None, AllocationSemantics::Mature)
            .unwrap();
        let young = m.alloc(node).unwrap();
        m.write_ref(young, 0, old);
        assert_eq!(heap.cards.dirty_count(), 0);
        m.write_ref(old, 0, young);
        assert!(heap.cards.is_dirty(object_model::field_address(old, 0)));
    }

    #[test]
    fn too_large_is_not_out_of_memory() {
        let heap = small_heap();
        let words = heap.register_type(TypeDescriptor::prim_array("long[]")).unwrap();
        let mut m = heap.bind_mutator("main");
        let huge = heap.spaces.los.capacity_bytes() / BYTES_IN_WORD * 2;
        assert!(matches!(
            m.alloc_array(words, huge),
            Err(AllocError::TooLarge { space: "large", .. })
        ));
        assert_eq!(heap.gc_count(), 0);
    }

    #[test]
    fn identity_hash_is_stable() {
        let heap = small_heap_with(|o| o.full_heap_system_gc = false);
        let node = heap.register_type(TypeDescriptor::instance("Node", 1, &[0])).unwrap();
        let mut m = heap.bind_mutator("main");
        m.push_frame(1);
        let o = m.alloc(node).unwrap();
        m.set_slot(0, o);
        let hash = m.identity_hash(o);
        assert_eq!(m.identity_hash(o), hash);
        m.collect(CollectionKind::Young).unwrap();
        let moved = m.slot(0);
        assert_ne!(moved, o);
        assert_eq!(m.identity_hash(moved), hash);
    }

    #[test]
    fn local_frames_return_a_result_handle() {
        let heap = small_heap();
        let node = heap.register_type(TypeDescriptor::instance("Node", 1, &[0])).unwrap();
        let mut m = heap.bind_mutator("main");
        let cookie = m.push_local_frame();
        let o = m.alloc(node).unwrap();
        let inner = m.new_local(o).unwrap();
        let scratch = m.new_local(o).unwrap();
        let outer = m.pop_local_frame(cookie, Some(inner)).unwrap().unwrap();
        assert_eq!(m.resolve(scratch), Err(HandleError::Stale(HandleKind::Local)));
        assert_eq!(m.resolve(outer), Ok(o));
        assert_eq!(m.thread().local_handle_count(), 1);
    }

    #[test]
    fn dropping_a_mutator_unregisters_it() {
        let heap = small_heap();
        let m = heap.bind_mutator("short lived");
        let id = m.id();
        assert_eq!(heap.threads().len(), 1);
        drop(m);
        assert!(heap.find_thread(id).is_none());
        assert!(heap.threads().is_empty());
    }
}
