use std::sync::{Condvar, Mutex};

struct RequestSync {
    /// Is a collection running?
    gc_running: bool,
    /// Collections completed so far.
    completed: usize,
}

/// Serializes collections. Mutators that need a collection while another
/// one is running wait for it and then decide whether they still need their own.
pub struct GcRequester {
    request_sync: Mutex<RequestSync>,
    gc_complete: Condvar,
}

impl GcRequester {
    pub fn new() -> Self {
        GcRequester {
            request_sync: Mutex::new(RequestSync {
                gc_running: false,
                completed: 0,
            }),
            gc_complete: Condvar::new(),
        }
    }

    /// Number of collections completed. Pass it back to [`GcRequester::run_or_wait`]
    /// to skip the request if another thread collected in the meantime.
    pub fn completed(&self) -> usize {
        self.request_sync.lock().unwrap().completed
    }

    pub fn is_gc_running(&self) -> bool {
        self.request_sync.lock().unwrap().gc_running
    }

    /// Run `collection` once no other collection is running. If `observed`
    /// is given and a collection completed since then, nothing runs.
    /// Returns true if `collection` ran.
    pub fn run_or_wait<F: FnOnce()>(&self, observed: Option<usize>, collection: F) -> bool {
        {
            let mut guard = self.request_sync.lock().unwrap();
            loop {
                if observed.is_some_and(|o| o != guard.completed) {
                    trace!("A collection completed while waiting, request dropped");
                    return false;
                }
                if !guard.gc_running {
                    break;
                }
                guard = self.gc_complete.wait(guard).unwrap();
            }
            guard.gc_running = true;
        }

        // Release the request even if the collection panics, so that other
        // threads see the panic instead of hanging.
        struct Finish<'a>(&'a GcRequester);
        impl Drop for Finish<'_> {
            fn drop(&mut self) {
                let mut guard = self.0.request_sync.lock().unwrap_or_else(|e| e.into_inner());
                guard.gc_running = false;
                guard.completed += 1;
                self.0.gc_complete.notify_all();
            }
        }
        let _finish = Finish(self);
        collection();
        true
    }
}

impl Default for GcRequester {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn stale_request_is_dropped() {
        let requester = GcRequester::new();
        let observed = requester.completed();
        assert!(requester.run_or_wait(None, || {}));
        assert!(!requester.run_or_wait(Some(observed), || panic!("should not run")));
        assert!(requester.run_or_wait(Some(requester.completed()), || {}));
        assert_eq!(requester.completed(), 2);
    }

    #[test]
    fn concurrent_requests_are_serialized() {
        let requester = Arc::new(GcRequester::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let requester = requester.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    requester.run_or_wait(None, || {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(requester.completed(), 4);
        assert!(!requester.is_gc_running());
    }
}
