use crate::heap::Heap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the daemon sleeps when nobody signals it.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Wakes the finalizer daemon when a collection queued finalizers.
pub(crate) struct FinalizerSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl FinalizerSignal {
    pub fn new() -> Self {
        FinalizerSignal {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.pending.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Wait for a notification or the timeout. Returns true if notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.pending.lock().unwrap();
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |pending| !*pending)
            .unwrap();
        std::mem::replace(&mut *pending, false)
    }
}

/// A thread bound to the heap as a mutator that runs finalizers as
/// collections queue them.
pub struct FinalizerDaemon {
    heap: Arc<Heap>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl FinalizerDaemon {
    pub fn spawn(heap: &Arc<Heap>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let heap = heap.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("genheap-finalizer".to_string())
                .spawn(move || {
                    let mut mutator = heap.bind_mutator("finalizer");
                    let mut finalized = 0;
                    while !stop.load(Ordering::Acquire) {
                        finalized += heap.run_finalization(&mut mutator);
                        let signal = &heap.finalizer_signal;
                        mutator.in_native(|| signal.wait_timeout(IDLE_WAIT));
                    }
                    // Drain what is left so that no finalizer is lost on shutdown.
                    finalized += heap.run_finalization(&mut mutator);
                    debug!("Finalizer daemon exiting after {} finalizers", finalized);
                    finalized
                })?
        };
        info!("Started the finalizer daemon");
        Ok(FinalizerDaemon {
            heap: heap.clone(),
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the daemon and wait for it. Returns the number of finalizers it ran.
    /// A mutator of the same heap must call this from [`crate::Mutator::in_native`]:
    /// the daemon may need a collection before it can exit.
    pub fn stop(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        let handle = match self.handle.take() {
            Some(h) => h,
            None => return 0,
        };
        self.stop.store(true, Ordering::Release);
        self.heap.finalizer_signal.notify();
        match handle.join() {
            Ok(n) => n,
            Err(_) => {
                error!("The finalizer daemon panicked");
                0
            }
        }
    }
}

impl Drop for FinalizerDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn signal_wakes_waiter() {
        let signal = Arc::new(FinalizerSignal::new());
        let s = signal.clone();
        let t = std::thread::spawn(move || s.wait_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(10));
        signal.notify();
        assert!(t.join().unwrap());
    }

    #[test]
    fn signal_times_out() {
        let signal = FinalizerSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
