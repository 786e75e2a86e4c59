//! The heap: spaces, collector state and runtime tables shared by every
//! mutator bound to it. A process may create any number of heaps.

use crate::global_state::GlobalState;
use crate::plan::barriers::CardTable;
use crate::plan::gc_requester::GcRequester;
use crate::plan::generational::{self, CollectionRequest};
use crate::plan::global::{CollectionKind, GcCause};
use crate::plan::Mutator;
use crate::policy::space::{HeapSpaces, Space};
use crate::scheduler::finalizer_daemon::FinalizerSignal;
use crate::scheduler::thread_list::ThreadList;
use crate::scheduler::worker::WorkerPool;
use crate::scheduler::{CheckpointFn, ThreadHandle};
use crate::util::error::{AllocError, OptionError, StaticsError, SuspendError};
use crate::util::finalizable_processor::FinalizableProcessor;
use crate::util::options::Options;
use crate::util::reference_processor::{QueueId, ReferenceProcessor};
use crate::util::sanity::{self, VerificationError};
use crate::util::statistics::{GcIteration, GcStats};
use crate::util::{logger, ObjectReference};
use crate::vm::handles::{HandleKind, IndirectReferenceTable};
use crate::vm::statics::{ClassId, ClassStatics};
use crate::vm::types::{TypeDescriptor, TypeId, TypeRegistry};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builds a [`Heap`]. Options are taken from `GENHEAP_*` environment
/// variables first, then from [`HeapBuilder::set_option`].
pub struct HeapBuilder {
    options: Options,
}

impl HeapBuilder {
    /// Create a builder with options read from the environment.
    pub fn new() -> Self {
        let mut builder = Self::new_no_env_vars();
        builder.options.read_env_var_settings();
        builder
    }

    /// Create a builder with default options, ignoring the environment.
    pub fn new_no_env_vars() -> Self {
        HeapBuilder {
            options: Options::default(),
        }
    }

    /// Set an option by name, e.g. `set_option("young_size", "8388608")`.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        self.options.set_from_str(name, value)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn build(&self) -> Arc<Heap> {
        logger::init();
        let heap = Heap::new(self.options.clone());
        info!(
            "Initialized heap: young {}, old {}, large {}, {} GC threads",
            heap.spaces.young.capacity_bytes(),
            heap.spaces.old.capacity_bytes(),
            heap.spaces.los.capacity_bytes(),
            heap.workers.workers()
        );
        #[cfg(feature = "extreme_assertions")]
        warn!("The feature 'extreme_assertions' is enabled. The heap is verified around every collection.");
        Arc::new(heap)
    }
}

impl Default for HeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Heap {
    pub(crate) options: Options,
    pub(crate) spaces: HeapSpaces,
    pub(crate) types: TypeRegistry,
    pub(crate) cards: CardTable,
    pub(crate) state: GlobalState,
    pub(crate) threads: ThreadList,
    pub(crate) globals: Mutex<IndirectReferenceTable>,
    pub(crate) weak_globals: Mutex<IndirectReferenceTable>,
    pub(crate) statics: Mutex<ClassStatics>,
    pub(crate) references: Mutex<ReferenceProcessor>,
    pub(crate) finalizable: Mutex<FinalizableProcessor>,
    pub(crate) gc_requester: GcRequester,
    pub(crate) stats: Mutex<GcStats>,
    pub(crate) finalizer_signal: FinalizerSignal,
    pub(crate) workers: WorkerPool,
}

impl Heap {
    fn new(options: Options) -> Self {
        let spaces = HeapSpaces::new(&options);
        let (card_start, card_end) = spaces.card_range();
        let cards = CardTable::new(card_start, card_end, options.card_size);
        Heap {
            spaces,
            cards,
            types: TypeRegistry::new(),
            state: GlobalState::default(),
            threads: ThreadList::new(),
            globals: Mutex::new(IndirectReferenceTable::new(HandleKind::Global)),
            weak_globals: Mutex::new(IndirectReferenceTable::new(HandleKind::WeakGlobal)),
            statics: Mutex::new(ClassStatics::new()),
            references: Mutex::new(ReferenceProcessor::new()),
            finalizable: Mutex::new(FinalizableProcessor::new()),
            gc_requester: GcRequester::new(),
            stats: Mutex::new(GcStats::default()),
            finalizer_signal: FinalizerSignal::new(),
            workers: WorkerPool::new(options.gc_threads),
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /* Threads */

    /// Register the calling thread as a mutator. The returned [`Mutator`] is
    /// runnable; it unregisters itself when dropped. If a collection is in
    /// progress this waits for it to finish.
    pub fn bind_mutator(self: &Arc<Self>, name: &str) -> Mutator {
        let thread = self.threads.register(name);
        thread.transition_to_runnable();
        Mutator::new(self.clone(), thread)
    }

    /// Every registered mutator thread.
    pub fn threads(&self) -> Vec<ThreadHandle> {
        self.threads.snapshot()
    }

    pub fn find_thread(&self, id: usize) -> Option<ThreadHandle> {
        self.threads.find(id)
    }

    /// Suspend a mutator from a thread that is not bound to this heap. A
    /// bound thread must use [`Mutator::request_suspend`] instead.
    pub fn request_suspend(&self, thread: &ThreadHandle) -> Result<(), SuspendError> {
        thread.request_suspend(false, Some(self.suspend_timeout()))
    }

    /// # Panics
    /// If the thread's suspend count is zero.
    pub fn resume(&self, thread: &ThreadHandle) {
        thread.resume()
    }

    /// Run `closure` once for every mutator, from a thread that is not bound
    /// to this heap. Returns the number of threads it ran for.
    pub fn run_checkpoint(&self, closure: CheckpointFn) -> usize {
        self.threads.run_checkpoint(None, closure)
    }

    pub(crate) fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.options.suspend_timeout_ms)
    }

    /* Types and classes */

    pub fn register_type(&self, desc: TypeDescriptor) -> Result<TypeId, AllocError> {
        self.types.register(desc).map_err(AllocError::InvalidType)
    }

    pub fn type_descriptor(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.types.get(id)
    }

    /// Register a class with `slots` static reference slots, all null.
    pub fn register_class(&self, name: &str, slots: usize) -> ClassId {
        self.statics.lock().unwrap().register_class(name, slots)
    }

    /// Unload a class. Its static slots stop being roots.
    pub fn unload_class(&self, class: ClassId) -> Result<(), StaticsError> {
        self.statics.lock().unwrap().unload(class)
    }

    /* References and finalization */

    pub fn new_reference_queue(&self) -> QueueId {
        self.references.lock().unwrap().queues.create()
    }

    pub fn reference_queue_len(&self, queue: QueueId) -> usize {
        self.references.lock().unwrap().queues.len(queue)
    }

    /// Number of objects whose finalizer is due.
    pub fn pending_finalizers(&self) -> usize {
        self.finalizable.lock().unwrap().ready_count()
    }

    /// Run every pending finalizer on `mutator`. Each object is held by a
    /// local handle while its finalizer runs, then marked finalized so that
    /// the next collection that finds it unreachable reclaims it. Returns the
    /// number of finalizers run.
    pub fn run_finalization(&self, mutator: &mut Mutator) -> usize {
        let mut count = 0;
        loop {
            let object = match self.finalizable.lock().unwrap().get_ready_object() {
                Some(o) => o,
                None => break,
            };
            mutator.run_finalizer(object);
            count += 1;
        }
        if count > 0 {
            debug!("Ran {} finalizers", count);
        }
        count
    }

    /* Collection */

    /// Collect from a thread that is not bound to this heap. Bound threads
    /// must use [`Mutator::collect`], which makes the caller GC-safe first.
    /// Returns `None` if the request was ignored.
    pub fn collect(&self, kind: CollectionKind) -> Option<GcIteration> {
        let request = match self.explicit_request(kind) {
            Some(r) => r,
            None => return None,
        };
        let mut result = None;
        self.gc_requester.run_or_wait(None, || {
            result = Some(generational::collect(self, None, request));
        });
        result
    }

    /// Turn an explicit collection request into what actually runs, honouring
    /// `ignore_system_gc` and `full_heap_system_gc`.
    pub(crate) fn explicit_request(&self, kind: CollectionKind) -> Option<CollectionRequest> {
        if self.options.ignore_system_gc {
            info!("Explicit collection request ignored");
            return None;
        }
        let kind = if self.options.full_heap_system_gc {
            CollectionKind::Full
        } else {
            kind
        };
        Some(CollectionRequest::new(kind, GcCause::Explicit))
    }

    /// Check the heap invariants with every mutator stopped.
    pub fn verify(&self) -> Result<(), Vec<VerificationError>> {
        let mut result = Ok(());
        self.gc_requester.run_or_wait(None, || {
            let stopped = self.threads.suspend_all(None);
            let threads = self.threads.snapshot();
            generational::retire_tlabs(self, &threads);
            result = sanity::verify_heap(self, &threads);
            self.threads.resume_all(&stopped);
        });
        result
    }

    pub fn is_in_gc(&self) -> bool {
        self.state.is_in_gc()
    }

    /* Statistics */

    pub fn stats(&self) -> GcStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn last_iteration(&self) -> Option<GcIteration> {
        self.stats.lock().unwrap().last.clone()
    }

    pub fn gc_count(&self) -> usize {
        self.stats.lock().unwrap().gc_count()
    }

    pub fn used_bytes(&self) -> usize {
        self.spaces.used_bytes()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.spaces.capacity_bytes()
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity_bytes() - self.used_bytes()
    }

    pub fn total_allocated_bytes(&self) -> usize {
        self.state.total_allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn total_allocated_objects(&self) -> usize {
        self.state.total_allocated_objects.load(Ordering::Relaxed)
    }

    /// Is `object` the start of an object in this heap's spaces? Only
    /// meaningful while the caller keeps the object reachable.
    pub fn is_in_heap(&self, object: ObjectReference) -> bool {
        self.spaces.contains(object)
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("used", &self.used_bytes())
            .field("capacity", &self.capacity_bytes())
            .field("threads", &self.threads.len())
            .field("collections", &self.gc_count())
            .finish()
    }
}
