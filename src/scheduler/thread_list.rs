use crate::plan::mutator_context::MutatorLocals;
use crate::scheduler::checkpoint::{Barrier, CheckpointFn, PendingCheckpoint};
use crate::scheduler::thread::{CheckpointTarget, ThreadHandle, ThreadRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Every mutator thread bound to a heap.
pub(crate) struct ThreadList {
    sync: Mutex<ThreadListSync>,
    next_id: AtomicUsize,
}

struct ThreadListSync {
    threads: Vec<Arc<ThreadRecord>>,
    /// Number of outstanding suspend-all requests. Threads registered
    /// meanwhile start with this suspend count.
    suspend_all_count: usize,
    /// Threads registered while a suspend-all was in effect.
    registered_while_suspended: Vec<usize>,
}

impl ThreadList {
    pub fn new() -> Self {
        ThreadList {
            sync: Mutex::new(ThreadListSync {
                threads: vec![],
                suspend_all_count: 0,
                registered_while_suspended: vec![],
            }),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Register a new thread. It starts GC-safe and becomes runnable when it
    /// first calls `transition_to_runnable`, after any collection in progress.
    pub fn register(&self, name: &str) -> Arc<ThreadRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sync = self.sync.lock().unwrap();
        let record = Arc::new(ThreadRecord::new(
            id,
            name,
            sync.suspend_all_count,
            MutatorLocals::new(),
        ));
        if sync.suspend_all_count > 0 {
            sync.registered_while_suspended.push(id);
        }
        sync.threads.push(record.clone());
        debug!("Registered thread {} ({}), {} threads", id, name, sync.threads.len());
        record
    }

    pub fn unregister(&self, id: usize) {
        let mut sync = self.sync.lock().unwrap();
        sync.threads.retain(|t| t.id() != id);
        debug!("Unregistered thread {}, {} threads", id, sync.threads.len());
    }

    pub fn snapshot(&self) -> Vec<ThreadHandle> {
        self.sync.lock().unwrap().threads.clone()
    }

    pub fn find(&self, id: usize) -> Option<ThreadHandle> {
        self.sync
            .lock()
            .unwrap()
            .threads
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sync.lock().unwrap().threads.len()
    }

    /// Suspend every thread except `requester` and wait until all of them are
    /// GC-safe. Returns the threads that are now stopped.
    pub fn suspend_all(&self, requester: Option<usize>) -> Vec<ThreadHandle> {
        let threads: Vec<ThreadHandle> = {
            let mut sync = self.sync.lock().unwrap();
            debug_assert_eq!(sync.suspend_all_count, 0, "collections are serialized");
            sync.suspend_all_count += 1;
            sync.threads
                .iter()
                .filter(|t| Some(t.id()) != requester)
                .filter(|t| t.increment_suspend_count().is_ok())
                .cloned()
                .collect()
        };
        for thread in threads.iter() {
            if let Err(e) = thread.wait_for_acknowledgement(None) {
                // A terminated thread is as good as stopped.
                trace!("Suspend all: {}", e);
            }
        }
        debug!("Suspended {} threads", threads.len());
        threads
    }

    /// Undo a `suspend_all`. `stopped` is what `suspend_all` returned.
    pub fn resume_all(&self, stopped: &[ThreadHandle]) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.suspend_all_count > 0);
        sync.suspend_all_count -= 1;
        let late = std::mem::take(&mut sync.registered_while_suspended);
        let mut resumed = 0;
        for thread in sync.threads.iter() {
            if stopped.iter().any(|t| t.id() == thread.id()) || late.contains(&thread.id()) {
                thread.resume();
                resumed += 1;
            }
        }
        debug!("Resumed {} threads", resumed);
    }

    /// Run `closure` once for every registered thread. Running threads run it
    /// at their next poll point; GC-safe threads are held while the requester
    /// runs it for them. Returns the number of threads the closure ran for,
    /// once all of them have.
    pub fn run_checkpoint(&self, requester: Option<&ThreadRecord>, closure: CheckpointFn) -> usize {
        let barrier = Arc::new(Barrier::new());
        let mut held = vec![];
        let mut count = 0;
        {
            let sync = self.sync.lock().unwrap();
            for thread in sync.threads.iter() {
                if Some(thread.id()) == requester.map(|r| r.id()) {
                    continue;
                }
                barrier.increment();
                let checkpoint = PendingCheckpoint::new(closure.clone(), barrier.clone());
                match thread.request_checkpoint(checkpoint) {
                    CheckpointTarget::Queued => count += 1,
                    CheckpointTarget::Held => {
                        barrier.pass();
                        held.push(thread.clone());
                    }
                    CheckpointTarget::Skipped => barrier.pass(),
                }
            }
        }
        for thread in held {
            closure(&thread);
            thread.resume();
            count += 1;
        }
        if let Some(me) = requester {
            closure(me);
            count += 1;
        }
        barrier.wait();
        debug!("Checkpoint ran on {} threads", count);
        count
    }
}
