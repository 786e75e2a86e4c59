//! Parallel marking workers.
//!
//! A heap owns one [`WorkerPool`]. Its threads are spawned when the heap is
//! built and park between collections; the thread that runs a collection
//! takes part as worker 0.
//!
//! Each worker owns a LIFO deque of gray objects and steals from the shared
//! injector (the roots) and from the other workers when it runs dry. A
//! worker that finds nothing to do goes idle; marking terminates once every
//! worker is idle, which can only happen when every deque is empty because
//! workers only push to their own deque while they are active.

use crate::util::ObjectReference;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = dyn Fn(usize) + Sync;

struct PoolSync {
    /// The job of the current round. Only set while `run` waits for it.
    job: Option<&'static Job>,
    round: usize,
    /// Pool threads still running the current round.
    running: usize,
    panicked: bool,
    shutdown: bool,
}

struct PoolShared {
    sync: Mutex<PoolSync>,
    job_available: Condvar,
    job_finished: Condvar,
}

/// Worker threads that live as long as their heap.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    /// Serializes rounds.
    run_lock: Mutex<()>,
}

impl WorkerPool {
    /// A pool of `workers` workers, counting the caller of [`WorkerPool::run`].
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            sync: Mutex::new(PoolSync {
                job: None,
                round: 0,
                running: 0,
                panicked: false,
                shutdown: false,
            }),
            job_available: Condvar::new(),
            job_finished: Condvar::new(),
        });
        let mut handles = vec![];
        for ordinal in 1..workers.max(1) {
            let thread_shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("gc-worker-{}", ordinal))
                .spawn(move || work(&thread_shared, ordinal));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!("Could not spawn GC worker {}, using {} workers: {}", ordinal, ordinal, e);
                    break;
                }
            }
        }
        debug!("Spawned {} GC workers", handles.len());
        WorkerPool {
            shared,
            handles,
            run_lock: Mutex::new(()),
        }
    }

    /// Number of workers, counting the caller of [`WorkerPool::run`].
    pub fn workers(&self) -> usize {
        self.handles.len() + 1
    }

    /// Run `job(ordinal)` once on every worker and wait for all of them.
    /// The calling thread runs ordinal 0. A panic in any worker is raised
    /// again here once every worker has finished.
    pub fn run<'a>(&self, job: &'a (dyn Fn(usize) + Sync + 'a)) {
        // A panicking round leaves the pool consistent.
        let _round = self.run_lock.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: pool threads only use the job between the round starting
        // here and `running` dropping to zero, and this function does not
        // return (or unwind) before then.
        let erased: &'static Job =
            unsafe { std::mem::transmute::<&'a (dyn Fn(usize) + Sync + 'a), &'static Job>(job) };
        {
            let mut sync = self.shared.sync.lock().unwrap();
            sync.job = Some(erased);
            sync.round += 1;
            sync.running = self.handles.len();
            sync.panicked = false;
            self.shared.job_available.notify_all();
        }
        let local = panic::catch_unwind(AssertUnwindSafe(|| job(0)));
        let panicked = {
            let mut sync = self.shared.sync.lock().unwrap();
            while sync.running > 0 {
                sync = self.shared.job_finished.wait(sync).unwrap();
            }
            sync.job = None;
            sync.panicked
        };
        if let Err(payload) = local {
            panic::resume_unwind(payload);
        }
        if panicked {
            panic!("a GC worker panicked");
        }
    }

    /// Scan the transitive closure of `roots` with every worker.
    ///
    /// `scan(object, push)` visits the children of a gray object and calls
    /// `push` for every child that this call marked. Objects must be marked
    /// by the caller before they are pushed, so each object is scanned once.
    /// Returns the number of objects scanned.
    pub fn parallel_scan<F>(&self, roots: Vec<ObjectReference>, scan: F) -> usize
    where
        F: Fn(ObjectReference, &mut dyn FnMut(ObjectReference)) + Sync,
    {
        if roots.is_empty() {
            return 0;
        }
        let threads = self.workers();
        let global = Injector::new();
        roots.into_iter().for_each(|r| global.push(r));
        let locals: Vec<Worker<ObjectReference>> = (0..threads).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<ObjectReference>> = locals.iter().map(|w| w.stealer()).collect();
        let locals: Vec<Mutex<Option<Worker<ObjectReference>>>> =
            locals.into_iter().map(|w| Mutex::new(Some(w))).collect();
        let active = AtomicUsize::new(threads);
        let aborted = AtomicBool::new(false);
        let scanned = AtomicUsize::new(0);

        self.run(&|ordinal: usize| {
            let local = match locals[ordinal].lock().unwrap().take() {
                Some(local) => local,
                None => return,
            };
            let _abort = AbortOnUnwind(&aborted);
            let mut count = 0;
            loop {
                while let Some(object) = find_task(&local, &global, &stealers) {
                    scan(object, &mut |child| local.push(child));
                    count += 1;
                }
                active.fetch_sub(1, Ordering::SeqCst);
                loop {
                    if active.load(Ordering::SeqCst) == 0 || aborted.load(Ordering::SeqCst) {
                        scanned.fetch_add(count, Ordering::Relaxed);
                        trace!("Marking worker {} scanned {} objects", ordinal, count);
                        return;
                    }
                    if has_work(&global, &stealers) {
                        active.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        });
        scanned.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut sync = self.shared.sync.lock().unwrap_or_else(|e| e.into_inner());
            sync.shutdown = true;
            self.shared.job_available.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn work(shared: &PoolShared, ordinal: usize) {
    let mut seen = 0;
    loop {
        let job = {
            let mut sync = shared.sync.lock().unwrap();
            while !sync.shutdown && sync.round == seen {
                sync = shared.job_available.wait(sync).unwrap();
            }
            if sync.shutdown {
                return;
            }
            seen = sync.round;
            sync.job
        };
        let result = job.map(|job| panic::catch_unwind(AssertUnwindSafe(|| job(ordinal))));
        let mut sync = shared.sync.lock().unwrap();
        if matches!(result, Some(Err(_))) {
            sync.panicked = true;
        }
        sync.running -= 1;
        if sync.running == 0 {
            shared.job_finished.notify_all();
        }
    }
}

/// Tells idle workers to stop waiting when a scanning worker panics.
struct AbortOnUnwind<'a>(&'a AtomicBool);

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}

/// Find the next gray object: the local deque first, then a batch from the
/// injector, then one object from another worker.
fn find_task(
    local: &Worker<ObjectReference>,
    global: &Injector<ObjectReference>,
    stealers: &[Stealer<ObjectReference>],
) -> Option<ObjectReference> {
    local.pop().or_else(|| {
        iter::repeat_with(|| {
            global
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(|s| s.steal()).collect())
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    })
}

fn has_work(global: &Injector<ObjectReference>, stealers: &[Stealer<ObjectReference>]) -> bool {
    !global.is_empty() || stealers.iter().any(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;
    use std::collections::HashSet;

    fn obj(i: usize) -> ObjectReference {
        ObjectReference::from_address(Address::from_usize(0x1000 + i * 8))
    }

    fn index(o: ObjectReference) -> usize {
        (o.to_address().as_usize() - 0x1000) / 8
    }

    /// Scan a binary tree of `n` nodes plus back edges to node 0.
    fn scan_tree(pool: &WorkerPool, n: usize) -> (usize, usize) {
        let marks: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
        marks[0].store(1, Ordering::SeqCst);
        let seen = Mutex::new(HashSet::new());
        let scanned = pool.parallel_scan(vec![obj(0)], |o, push| {
            let i = index(o);
            seen.lock().unwrap().insert(i);
            for child in [2 * i + 1, 2 * i + 2, 0] {
                if child < n && marks[child].fetch_add(1, Ordering::SeqCst) == 0 {
                    push(obj(child));
                }
            }
        });
        let distinct = seen.lock().unwrap().len();
        (scanned, distinct)
    }

    #[test]
    fn each_object_scanned_once() {
        assert_eq!(scan_tree(&WorkerPool::new(1), 1000), (1000, 1000));
        assert_eq!(scan_tree(&WorkerPool::new(4), 10_000), (10_000, 10_000));
    }

    #[test]
    fn threads_are_reused_across_rounds() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.workers(), 3);
        let names = Mutex::new(HashSet::new());
        for _ in 0..10 {
            pool.run(&|_: usize| {
                names
                    .lock()
                    .unwrap()
                    .insert(std::thread::current().name().map(str::to_string));
            });
        }
        // Two pool threads plus the caller, however many rounds ran.
        assert_eq!(names.lock().unwrap().len(), 3);
        assert_eq!(scan_tree(&pool, 500), (500, 500));
    }

    #[test]
    fn worker_panic_is_raised_in_the_caller() {
        let pool = WorkerPool::new(2);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.run(&|ordinal: usize| {
                if ordinal == 1 {
                    panic!("worker failed");
                }
            })
        }));
        assert!(result.is_err());
        // The pool is still usable.
        let count = AtomicUsize::new(0);
        pool.run(&|_: usize| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_roots() {
        assert_eq!(WorkerPool::new(4).parallel_scan(vec![], |_, _| unreachable!()), 0);
    }
}
