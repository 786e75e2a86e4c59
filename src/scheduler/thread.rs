//! Per-thread suspension state.
//!
//! Each mutator has a [`ThreadRecord`] shared with the rest of the heap. The
//! owning thread checks its poll flags at poll points (allocation slow path,
//! [`crate::Mutator::poll`], leaving a GC-safe region) and acts on pending
//! suspend and checkpoint requests there. Other threads never touch a
//! running thread's roots: they wait until it is in a GC-safe state
//! ([`ThreadState::is_gc_safe`]).
//!
//! Suspension is reference counted. Every `request_suspend` adds one to the
//! target's suspend count, every `resume` removes one, and the target runs
//! again only when the count is back to zero.

use crate::plan::mutator_context::MutatorLocals;
use crate::scheduler::checkpoint::PendingCheckpoint;
use crate::util::error::SuspendError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use strum_macros::Display;

/// A handle to a registered mutator thread.
pub type ThreadHandle = Arc<ThreadRecord>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum ThreadState {
    /// Running managed code. Must reach a poll point before it can be suspended.
    Runnable,
    /// Parked at a poll point because its suspend count is positive.
    Suspended,
    /// In native code or a blocking call. Does not poll and holds no heap references.
    Native,
    /// Waiting for a collection, a suspension or a checkpoint requested by this thread.
    WaitingForGc,
    /// Unbound from the heap.
    Terminated,
}

impl ThreadState {
    /// Can the collector treat the thread as stopped?
    pub fn is_gc_safe(self) -> bool {
        self != ThreadState::Runnable
    }
}

const SUSPEND_REQUEST: u32 = 1;
const CHECKPOINT_REQUEST: u32 = 1 << 1;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) struct SuspendSync {
    state: ThreadState,
    suspend_count: usize,
    checkpoints: VecDeque<PendingCheckpoint>,
}

/// What `request_checkpoint` did with a thread.
pub(crate) enum CheckpointTarget {
    /// The thread is running and will run the checkpoint at its next poll point.
    Queued,
    /// The thread is GC-safe. Its suspend count was raised so that it stays
    /// so; the requester runs the checkpoint for it and then resumes it.
    Held,
    /// The thread has terminated.
    Skipped,
}

pub struct ThreadRecord {
    id: usize,
    name: String,
    /// Set when there is a suspend or checkpoint request. Read without the lock.
    flags: AtomicU32,
    sync: Mutex<SuspendSync>,
    /// Notified when the suspend count drops to zero.
    resume_cond: Condvar,
    /// Notified when the thread changes state or a request is withdrawn.
    state_cond: Condvar,
    pub(crate) locals: Mutex<MutatorLocals>,
}

impl ThreadRecord {
    /// A new record starts GC-safe; the thread becomes runnable with
    /// [`ThreadRecord::transition_to_runnable`].
    pub(crate) fn new(id: usize, name: &str, suspend_count: usize, locals: MutatorLocals) -> Self {
        let record = ThreadRecord {
            id,
            name: name.to_string(),
            flags: AtomicU32::new(0),
            sync: Mutex::new(SuspendSync {
                state: ThreadState::Native,
                suspend_count,
                checkpoints: VecDeque::new(),
            }),
            resume_cond: Condvar::new(),
            state_cond: Condvar::new(),
            locals: Mutex::new(locals),
        };
        record.update_flags(&record.sync.lock().unwrap());
        record
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.sync.lock().unwrap().state
    }

    pub fn suspend_count(&self) -> usize {
        self.sync.lock().unwrap().suspend_count
    }

    /// Has the thread acknowledged a suspend request? A thread with a positive
    /// suspend count that is still running towards its next poll point is not suspended yet.
    pub fn is_suspended(&self) -> bool {
        let sync = self.sync.lock().unwrap();
        sync.suspend_count > 0 && sync.state.is_gc_safe()
    }

    /// Number of frames on the thread's shadow stack.
    pub fn stack_depth(&self) -> usize {
        self.locals.lock().unwrap().stack.depth()
    }

    /// Number of live local handles.
    pub fn local_handle_count(&self) -> usize {
        self.locals.lock().unwrap().handles.len()
    }

    fn update_flags(&self, sync: &SuspendSync) {
        let mut flags = 0;
        if sync.suspend_count > 0 {
            flags |= SUSPEND_REQUEST;
        }
        if !sync.checkpoints.is_empty() {
            flags |= CHECKPOINT_REQUEST;
        }
        self.flags.store(flags, Ordering::Release);
    }

    #[inline]
    pub(crate) fn has_pending_request(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    /* Called by the owning thread */

    /// Run pending checkpoints and park while the suspend count is positive.
    /// The thread must be runnable and must not hold its locals lock.
    pub(crate) fn handle_requests(&self) {
        loop {
            let mut sync = self.sync.lock().unwrap();
            debug_assert_eq!(sync.state, ThreadState::Runnable);
            if let Some(checkpoint) = sync.checkpoints.pop_front() {
                self.update_flags(&sync);
                drop(sync);
                checkpoint.run(self);
                continue;
            }
            if sync.suspend_count == 0 {
                return;
            }
            sync.state = ThreadState::Suspended;
            self.state_cond.notify_all();
            trace!("Thread {} suspended", self.id);
            sync = self.wait_for_resume(sync);
            sync.state = ThreadState::Runnable;
            trace!("Thread {} resumed", self.id);
        }
    }

    fn wait_for_resume<'a>(&self, mut sync: MutexGuard<'a, SuspendSync>) -> MutexGuard<'a, SuspendSync> {
        while sync.suspend_count > 0 {
            sync = self.resume_cond.wait(sync).unwrap();
        }
        sync
    }

    /// Leave the runnable state. Checkpoints queued while the thread was
    /// running are run first, so none is left behind in a GC-safe state.
    pub(crate) fn transition_to_safe(&self, state: ThreadState) {
        debug_assert!(state.is_gc_safe());
        loop {
            let mut sync = self.sync.lock().unwrap();
            if let Some(checkpoint) = sync.checkpoints.pop_front() {
                self.update_flags(&sync);
                drop(sync);
                checkpoint.run(self);
                continue;
            }
            sync.state = state;
            self.state_cond.notify_all();
            return;
        }
    }

    /// Become runnable, waiting first while the suspend count is positive.
    pub(crate) fn transition_to_runnable(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.state.is_gc_safe());
        sync = self.wait_for_resume(sync);
        sync.state = ThreadState::Runnable;
    }

    /* Called by requesters */

    pub(crate) fn increment_suspend_count(&self) -> Result<(), SuspendError> {
        let mut sync = self.sync.lock().unwrap();
        if sync.state == ThreadState::Terminated {
            return Err(SuspendError::NotRegistered(self.id));
        }
        sync.suspend_count += 1;
        self.update_flags(&sync);
        Ok(())
    }

    /// Add a suspend request and wait for the thread to acknowledge it.
    ///
    /// `by_self` means the thread suspends itself: it parks right away until
    /// another thread resumes it. Otherwise the caller waits with backoff for
    /// the target to reach a GC-safe state. If `timeout` expires first the
    /// request is withdrawn.
    pub(crate) fn request_suspend(&self, by_self: bool, timeout: Option<Duration>) -> Result<(), SuspendError> {
        self.increment_suspend_count()?;
        if by_self {
            self.handle_requests();
            return Ok(());
        }
        let result = self.wait_for_acknowledgement(timeout);
        if let Err(SuspendError::Timeout { .. }) = result {
            self.withdraw();
        }
        result
    }

    /// Wait until the thread is GC-safe while the suspend count stays positive.
    pub(crate) fn wait_for_acknowledgement(&self, timeout: Option<Duration>) -> Result<(), SuspendError> {
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut sync = self.sync.lock().unwrap();
        loop {
            if sync.suspend_count == 0 {
                return Err(SuspendError::Withdrawn(self.id));
            }
            if sync.state == ThreadState::Terminated {
                return Err(SuspendError::NotRegistered(self.id));
            }
            if sync.state.is_gc_safe() {
                return Ok(());
            }
            let wait = match timeout {
                Some(t) => {
                    let elapsed = start.elapsed();
                    if elapsed >= t {
                        warn!(
                            "Thread {} ({}) did not reach a safepoint within {:?}, withdrawing the suspend request",
                            self.id, self.name, t
                        );
                        return Err(SuspendError::Timeout {
                            thread: self.id,
                            millis: t.as_millis() as u64,
                        });
                    }
                    backoff.min(t - elapsed)
                }
                None => backoff,
            };
            let (guard, result) = self.state_cond.wait_timeout(sync, wait).unwrap();
            sync = guard;
            if result.timed_out() {
                if backoff == MAX_BACKOFF {
                    warn!(
                        "Still waiting for thread {} ({}) to suspend after {:?}",
                        self.id,
                        self.name,
                        start.elapsed()
                    );
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    fn withdraw(&self) {
        let mut sync = self.sync.lock().unwrap();
        if sync.suspend_count > 0 {
            sync.suspend_count -= 1;
            self.update_flags(&sync);
            if sync.suspend_count == 0 {
                self.resume_cond.notify_all();
            }
        }
    }

    /// Drop one suspend request. The thread runs again when none is left.
    ///
    /// # Panics
    /// If the suspend count is already zero.
    pub(crate) fn resume(&self) {
        let mut sync = self.sync.lock().unwrap();
        if sync.suspend_count == 0 {
            panic!(
                "Resuming thread {} ({}) whose suspend count is zero",
                self.id, self.name
            );
        }
        sync.suspend_count -= 1;
        self.update_flags(&sync);
        if sync.suspend_count == 0 {
            self.resume_cond.notify_all();
            self.state_cond.notify_all();
        }
    }

    /// Queue a checkpoint on a running thread, or hold a GC-safe thread so the
    /// requester can run the checkpoint for it.
    pub(crate) fn request_checkpoint(&self, checkpoint: PendingCheckpoint) -> CheckpointTarget {
        let mut sync = self.sync.lock().unwrap();
        match sync.state {
            ThreadState::Terminated => CheckpointTarget::Skipped,
            ThreadState::Runnable => {
                sync.checkpoints.push_back(checkpoint);
                self.update_flags(&sync);
                CheckpointTarget::Queued
            }
            _ => {
                sync.suspend_count += 1;
                self.update_flags(&sync);
                CheckpointTarget::Held
            }
        }
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let sync = self.sync.lock().unwrap();
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &sync.state)
            .field("suspend_count", &sync.suspend_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::checkpoint::Barrier;
    use crate::util::test_util::panic_after;
    use std::sync::atomic::AtomicUsize;

    fn runnable(id: usize) -> Arc<ThreadRecord> {
        let record = Arc::new(ThreadRecord::new(id, "test", 0, MutatorLocals::new()));
        record.transition_to_runnable();
        record
    }

    #[test]
    fn native_thread_is_suspended_immediately() {
        let record = runnable(1);
        record.transition_to_safe(ThreadState::Native);
        record.request_suspend(false, Some(Duration::from_millis(100))).unwrap();
        assert!(record.is_suspended());
        record.resume();
        assert!(!record.is_suspended());
        record.transition_to_runnable();
        assert_eq!(record.state(), ThreadState::Runnable);
    }

    #[test]
    fn running_thread_times_out() {
        let record = runnable(1);
        let err = record
            .request_suspend(false, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, SuspendError::Timeout { thread: 1, .. }));
        // The request was withdrawn.
        assert_eq!(record.suspend_count(), 0);
        assert!(!record.has_pending_request());
    }

    #[test]
    fn polling_thread_parks_until_resumed() {
        panic_after(5000, || {
            let record = runnable(1);
            let polls = Arc::new(AtomicUsize::new(0));
            let r = record.clone();
            let p = polls.clone();
            let t = std::thread::spawn(move || {
                while p.load(Ordering::SeqCst) < 1000 {
                    if r.has_pending_request() {
                        r.handle_requests();
                    }
                    p.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(100));
                }
            });
            record.request_suspend(false, None).unwrap();
            assert_eq!(record.state(), ThreadState::Suspended);
            let before = polls.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            assert_eq!(polls.load(Ordering::SeqCst), before);
            record.resume();
            t.join().unwrap();
        })
    }

    #[test]
    #[should_panic(expected = "suspend count is zero")]
    fn resume_underflow_panics() {
        runnable(1).resume();
    }

    #[test]
    fn checkpoint_on_native_thread_is_held() {
        let record = runnable(1);
        record.transition_to_safe(ThreadState::Native);
        let barrier = Arc::new(Barrier::new());
        let checkpoint = PendingCheckpoint::new(Arc::new(|_: &ThreadRecord| {}), barrier);
        let target = record.request_checkpoint(checkpoint);
        assert!(matches!(target, CheckpointTarget::Held));
        assert_eq!(record.suspend_count(), 1);
        record.resume();
    }

    #[test]
    fn pending_checkpoints_run_before_going_native() {
        let record = runnable(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new());
        barrier.increment();
        let r = ran.clone();
        let checkpoint = PendingCheckpoint::new(
            Arc::new(move |_: &ThreadRecord| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            barrier.clone(),
        );
        let target = record.request_checkpoint(checkpoint);
        assert!(matches!(target, CheckpointTarget::Queued));
        record.transition_to_safe(ThreadState::Native);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        barrier.wait();
    }
}
