use crate::plan::tracing::ObjectTracer;
use crate::util::ObjectReference;
use crate::vm::object_model::{self, FinalizerState};

/// Objects whose type declares a finalizer. Candidates found unreachable by
/// a collection are resurrected and moved to the ready list, where they stay
/// (as roots) until a finalizing thread takes them.
pub struct FinalizableProcessor {
    candidates: Vec<ObjectReference>,
    /// Candidates below this index survived at least one collection and are
    /// old, so a young collection does not need to look at them.
    nursery_index: usize,
    ready_for_finalize: Vec<ObjectReference>,
}

impl FinalizableProcessor {
    pub fn new() -> Self {
        Self {
            candidates: vec![],
            nursery_index: 0,
            ready_for_finalize: vec![],
        }
    }

    pub fn add(&mut self, object: ObjectReference) {
        self.candidates.push(object);
    }

    /// Move dead candidates to the ready list. Returns how many were queued.
    /// The caller must run the transitive closure afterwards so that
    /// everything the resurrected objects reference stays alive too.
    pub(crate) fn scan<T: ObjectTracer>(&mut self, tracer: &mut T) -> usize {
        let start = if tracer.is_nursery() {
            self.nursery_index.min(self.candidates.len())
        } else {
            0
        };
        let mut queued = 0;
        for reff in self.candidates.drain(start..).collect::<Vec<ObjectReference>>() {
            if tracer.is_live(reff) {
                let res = tracer.get_forwarded(reff);
                trace!("{} is live, push {} back to candidates", reff, res);
                self.candidates.push(res);
                continue;
            }
            let retained = tracer.trace_object(reff);
            object_model::set_finalizer_state(
                tracer.spaces().memory_of(retained),
                retained,
                FinalizerState::Queued,
            );
            self.ready_for_finalize.push(retained);
            queued += 1;
            trace!("{} is not live, push {} to ready_for_finalize", reff, retained);
        }
        self.nursery_index = self.candidates.len();
        debug!(
            "Finalization: {} candidates, {} ready to finalize",
            self.candidates.len(),
            self.ready_for_finalize.len()
        );
        queued
    }

    /// Make the next young collection look at every candidate. Needed when a
    /// full collection leaves survivors in the young space.
    pub(crate) fn reset_nursery_index(&mut self) {
        self.nursery_index = 0;
    }

    /// Apply `f` to every candidate and ready object after objects moved.
    pub(crate) fn forward<F: FnMut(&mut ObjectReference)>(&mut self, mut f: F) {
        self.candidates.iter_mut().for_each(&mut f);
        self.ready_for_finalize.iter_mut().for_each(f);
    }

    /// The ready list is a root set.
    pub fn scan_roots<F: FnMut(&mut ObjectReference)>(&mut self, f: F) {
        self.ready_for_finalize.iter_mut().for_each(f);
    }

    pub fn for_each_root<F: FnMut(ObjectReference)>(&self, mut f: F) {
        self.ready_for_finalize.iter().for_each(|o| f(*o));
    }

    pub(crate) fn for_each_candidate<F: FnMut(ObjectReference)>(&self, mut f: F) {
        self.candidates.iter().for_each(|o| f(*o));
    }

    pub fn get_ready_object(&mut self) -> Option<ObjectReference> {
        self.ready_for_finalize.pop()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_for_finalize.len()
    }
}

impl Default for FinalizableProcessor {
    fn default() -> Self {
        Self::new()
    }
}
