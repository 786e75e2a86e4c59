//! Checkpoints: closures that every mutator runs once, at its next poll
//! point if it is running, or on its behalf if it is in a GC-safe state.

use crate::scheduler::thread::ThreadRecord;
use std::sync::{Arc, Condvar, Mutex};

/// A closure run once for every mutator thread.
pub type CheckpointFn = Arc<dyn Fn(&ThreadRecord) + Send + Sync>;

/// Counts down the threads that still have to run a checkpoint.
pub(crate) struct Barrier {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Barrier {
    pub fn new() -> Self {
        Barrier {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    pub fn pass(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0, "checkpoint barrier passed too many times");
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every thread passed.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }
}

/// A checkpoint queued on a running thread.
pub(crate) struct PendingCheckpoint {
    closure: CheckpointFn,
    barrier: Arc<Barrier>,
}

impl PendingCheckpoint {
    pub fn new(closure: CheckpointFn, barrier: Arc<Barrier>) -> Self {
        PendingCheckpoint { closure, barrier }
    }

    pub fn run(self, thread: &ThreadRecord) {
        trace!("Thread {} runs a checkpoint", thread.id());
        (self.closure)(thread);
        self.barrier.pass();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn barrier_releases_after_last_pass() {
        let barrier = Arc::new(Barrier::new());
        barrier.increment();
        barrier.increment();
        let b = barrier.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            b.pass();
            b.pass();
        });
        barrier.wait();
        t.join().unwrap();
        assert_eq!(*barrier.count.lock().unwrap(), 0);
    }

    #[test]
    fn empty_barrier_does_not_block() {
        Barrier::new().wait();
    }
}
