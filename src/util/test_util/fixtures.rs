// Not every fixture is used by every test configuration.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use crate::heap::{Heap, HeapBuilder};
use crate::policy::space::{HeapSpaces, Space};
use crate::scheduler::worker::WorkerPool;
use crate::util::constants::*;
use crate::util::options::Options;
use crate::util::reference_processor::QueueId;
use crate::util::ObjectReference;
use crate::vm::object_model::{self, FinalizerState};
use crate::vm::types::{ReferenceKind, TypeDescriptor, TypeId, TypeRegistry, TypeTable, QUEUE_FIELD, REFERENT_FIELD};

pub trait FixtureContent {
    fn create() -> Self;
}

/// SerialFixture ensures all `with_fixture()` calls will be executed serially.
pub struct SerialFixture<T: FixtureContent> {
    content: Mutex<Option<Box<T>>>,
}

impl<T: FixtureContent> SerialFixture<T> {
    pub fn new() -> Self {
        Self {
            content: Mutex::new(None),
        }
    }

    pub fn with_fixture<F: Fn(&T)>(&self, func: F) {
        let mut c = self.content.lock().unwrap_or_else(|e| e.into_inner());
        if c.is_none() {
            *c = Some(Box::new(T::create()));
        }
        func(c.as_ref().unwrap())
    }
}

impl<T: FixtureContent> Default for SerialFixture<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Small spaces with a fixed set of types, for testing collector components
/// without a heap or mutators.
pub struct SpacesFixture {
    pub spaces: HeapSpaces,
    pub types: TypeTable,
    /// One reference field.
    pub node: TypeId,
    /// One reference field, finalizable.
    pub finalizable: TypeId,
    pub weak: TypeId,
    pub soft: TypeId,
    pub phantom: TypeId,
    /// Two marking workers.
    pub workers: WorkerPool,
}

impl SpacesFixture {
    pub fn new() -> Self {
        let mut options = Options::default();
        options.young_size = 16 * BYTES_IN_PAGE;
        options.old_size = 32 * BYTES_IN_PAGE;
        options.los_size = 32 * BYTES_IN_PAGE;
        let registry = TypeRegistry::new();
        let node = registry.register(TypeDescriptor::instance("Node", 1, &[0])).unwrap();
        let finalizable = registry
            .register(TypeDescriptor::instance("Finalizable", 1, &[0]).with_finalizer(|_, _| {}))
            .unwrap();
        let weak = registry
            .register(TypeDescriptor::reference("WeakReference", ReferenceKind::Weak))
            .unwrap();
        let soft = registry
            .register(TypeDescriptor::reference("SoftReference", ReferenceKind::Soft))
            .unwrap();
        let phantom = registry
            .register(TypeDescriptor::reference("PhantomReference", ReferenceKind::Phantom))
            .unwrap();
        SpacesFixture {
            spaces: HeapSpaces::new(&options),
            types: registry.snapshot(),
            node,
            finalizable,
            weak,
            soft,
            phantom,
            workers: WorkerPool::new(2),
        }
    }

    fn young(&self, ty: TypeId, fields: usize, state: FinalizerState) -> ObjectReference {
        let words = object_model::object_words(fields);
        let range = self.spaces.young.acquire(words * BYTES_IN_WORD).unwrap();
        object_model::initialize_object(self.spaces.young.memory(), range.start, ty, words, state)
    }

    fn old(&self, ty: TypeId, fields: usize, state: FinalizerState) -> ObjectReference {
        let words = object_model::object_words(fields);
        let addr = self.spaces.old.allocate(words).unwrap();
        object_model::initialize_object(self.spaces.old.memory(), addr, ty, words, state)
    }

    pub fn young_node(&self, child: ObjectReference) -> ObjectReference {
        let o = self.young(self.node, 1, FinalizerState::NotFinalizable);
        object_model::write_ref(self.spaces.young.memory(), o, 0, child);
        o
    }

    pub fn old_node(&self, child: ObjectReference) -> ObjectReference {
        let o = self.old(self.node, 1, FinalizerState::NotFinalizable);
        object_model::write_ref(self.spaces.old.memory(), o, 0, child);
        o
    }

    pub fn young_finalizable(&self) -> ObjectReference {
        self.young(self.finalizable, 1, FinalizerState::NotFinalized)
    }

    pub fn old_finalizable(&self, child: ObjectReference) -> ObjectReference {
        let o = self.old(self.finalizable, 1, FinalizerState::NotFinalized);
        object_model::write_ref(self.spaces.old.memory(), o, 0, child);
        o
    }

    pub fn old_reference(
        &self,
        kind: ReferenceKind,
        referent: ObjectReference,
        queue: Option<QueueId>,
    ) -> ObjectReference {
        let ty = match kind {
            ReferenceKind::Soft => self.soft,
            ReferenceKind::Weak => self.weak,
            ReferenceKind::Phantom => self.phantom,
        };
        let o = self.old(ty, 2, FinalizerState::NotFinalizable);
        let mem = self.spaces.old.memory();
        object_model::write_ref(mem, o, REFERENT_FIELD, referent);
        object_model::write_word(
            mem,
            o,
            QUEUE_FIELD,
            queue.map_or(0, |q| q.0),
            std::sync::atomic::Ordering::Relaxed,
        );
        o
    }
}

impl Default for SpacesFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A small heap without environment variable overrides, marking with two
/// threads and verifying itself before and after every collection.
pub fn small_heap() -> Arc<Heap> {
    small_heap_with(|_| {})
}

pub fn small_heap_with<F: FnOnce(&mut Options)>(configure: F) -> Arc<Heap> {
    let mut builder = HeapBuilder::new_no_env_vars();
    {
        let options = builder.options_mut();
        options.young_size = 64 * BYTES_IN_PAGE;
        options.old_size = 128 * BYTES_IN_PAGE;
        options.los_size = 128 * BYTES_IN_PAGE;
        options.tlab_size = 4 * BYTES_IN_PAGE;
        options.gc_threads = 2;
        options.verify_heap = true;
        configure(options);
    }
    builder.build()
}
