//! Soft, weak and phantom reference processing, and the reference queues
//! cleared references are delivered to.

use crate::plan::tracing::ObjectTracer;
use crate::util::ObjectReference;
use crate::vm::object_model;
use crate::vm::types::{ReferenceKind, QUEUE_FIELD, REFERENT_FIELD};
use enum_map::EnumMap;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;

/// Identifies a reference queue. Stored in the queue field of a reference
/// object; 0 there means the reference has no queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);

impl QueueId {
    pub(crate) fn from_field(raw: usize) -> Option<QueueId> {
        if raw == 0 {
            None
        } else {
            Some(QueueId(raw))
        }
    }
}

/// Cleared reference objects waiting to be polled. Queued references are
/// strong roots until they are polled.
#[derive(Default)]
pub struct ReferenceQueues {
    queues: Vec<VecDeque<ObjectReference>>,
}

impl ReferenceQueues {
    pub fn create(&mut self) -> QueueId {
        self.queues.push(VecDeque::new());
        QueueId(self.queues.len())
    }

    pub fn is_valid(&self, queue: QueueId) -> bool {
        queue.0 >= 1 && queue.0 <= self.queues.len()
    }

    fn enqueue(&mut self, queue: QueueId, reference: ObjectReference) {
        if let Some(q) = self.queues.get_mut(queue.0 - 1) {
            q.push_back(reference);
        } else {
            warn!("{} names unknown reference queue {}", reference, queue.0);
        }
    }

    pub fn poll(&mut self, queue: QueueId) -> Option<ObjectReference> {
        self.queues.get_mut(queue.0.wrapping_sub(1))?.pop_front()
    }

    pub fn len(&self, queue: QueueId) -> usize {
        self.queues
            .get(queue.0.wrapping_sub(1))
            .map_or(0, |q| q.len())
    }

    pub fn scan_roots<F: FnMut(&mut ObjectReference)>(&mut self, mut f: F) {
        self.queues.iter_mut().flatten().for_each(|r| f(r));
    }

    pub fn for_each_root<F: FnMut(ObjectReference)>(&self, mut f: F) {
        self.queues.iter().flatten().for_each(|r| f(*r));
    }
}

/// What one pass over the reference objects did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    pub cleared: usize,
    pub enqueued: usize,
}

impl std::ops::AddAssign for ReferenceStats {
    fn add_assign(&mut self, other: ReferenceStats) {
        self.cleared += other.cleared;
        self.enqueued += other.enqueued;
    }
}

/// Tracks every reference object allocated, by strength. A reference object
/// is dropped from its list once it died.
#[derive(Default)]
pub struct ReferenceProcessor {
    candidates: EnumMap<ReferenceKind, Vec<ObjectReference>>,
    pub queues: ReferenceQueues,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&mut self, kind: ReferenceKind, reference: ObjectReference) {
        trace!("Add {} reference candidate {}", kind, reference);
        self.candidates[kind].push(reference);
    }

    pub fn candidate_count(&self, kind: ReferenceKind) -> usize {
        self.candidates[kind].len()
    }

    /// Keep the referents of live soft references alive. Repeats until no
    /// new soft reference becomes reachable.
    pub(crate) fn retain_soft_referents<T: ObjectTracer>(&mut self, tracer: &mut T) {
        loop {
            let mut retained = 0;
            for reference in self.candidates[ReferenceKind::Soft].iter() {
                if !tracer.is_live(*reference) {
                    continue;
                }
                let reference = tracer.get_forwarded(*reference);
                let referent = object_model::read_ref(
                    tracer.spaces().memory_of(reference),
                    reference,
                    REFERENT_FIELD,
                );
                if !referent.is_null() && !tracer.is_live(referent) {
                    let new = tracer.trace_object(referent);
                    let mem = tracer.spaces().memory_of(reference);
                    object_model::write_ref(mem, reference, REFERENT_FIELD, new);
                    retained += 1;
                }
            }
            if retained == 0 {
                break;
            }
            trace!("Retained {} soft referents", retained);
            tracer.process_closure();
        }
    }

    /// Process the live reference objects of `kind`: live referents are
    /// forwarded, dead referents are cleared and the reference is enqueued.
    /// Reference objects that are not live are kept for a later pass, unless
    /// this is the last one.
    pub(crate) fn scan<T: ObjectTracer>(
        &mut self,
        kind: ReferenceKind,
        tracer: &T,
        last_pass: bool,
    ) -> ReferenceStats {
        let mut stats = ReferenceStats::default();
        let candidates = std::mem::take(&mut self.candidates[kind]);
        let before = candidates.len();
        let mut kept = Vec::with_capacity(before);
        for reference in candidates {
            if !tracer.is_live(reference) {
                if !last_pass {
                    kept.push(reference);
                } else {
                    trace!("{} reference {} died", kind, reference);
                }
                continue;
            }
            let reference = tracer.get_forwarded(reference);
            let mem = tracer.spaces().memory_of(reference);
            // A live reference object stays a candidate even with a null
            // referent: the program may store a new referent later.
            kept.push(reference);
            let referent = object_model::read_ref(mem, reference, REFERENT_FIELD);
            if referent.is_null() {
                continue;
            }
            if tracer.is_live(referent) {
                let new = tracer.get_forwarded(referent);
                if new != referent {
                    object_model::write_ref(mem, reference, REFERENT_FIELD, new);
                }
                continue;
            }
            trace!("Clear {} reference {} to {}", kind, reference, referent);
            object_model::write_word(mem, reference, REFERENT_FIELD, 0, Ordering::Release);
            stats.cleared += 1;
            let queue = object_model::read_word(mem, reference, QUEUE_FIELD, Ordering::Relaxed);
            if let Some(queue) = QueueId::from_field(queue) {
                if object_model::test_and_set_enqueued(mem, reference) {
                    self.queues.enqueue(queue, reference);
                    stats.enqueued += 1;
                }
            }
        }
        debug!(
            "{} references: {} candidates, {} kept, {} cleared",
            kind,
            before,
            kept.len(),
            stats.cleared
        );
        self.candidates[kind] = kept;
        stats
    }

    /// Forward the surviving reference objects without looking at their
    /// referents. Used when reference types are disabled.
    pub(crate) fn forward_candidates<T: ObjectTracer>(&mut self, tracer: &T) {
        for list in self.candidates.values_mut() {
            list.retain(|r| tracer.is_live(*r));
            list.iter_mut().for_each(|r| *r = tracer.get_forwarded(*r));
        }
    }

    /// Apply `f` to every candidate after objects moved.
    pub(crate) fn update_candidates<F: FnMut(&mut ObjectReference)>(&mut self, mut f: F) {
        self.candidates.values_mut().flatten().for_each(|r| f(r));
    }

    pub(crate) fn for_each_candidate<F: FnMut(ObjectReference)>(&self, mut f: F) {
        self.candidates.values().flatten().for_each(|r| f(*r));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::space::Space;
    use crate::plan::tracing::FullTracer;
    use crate::util::test_util::fixtures::SpacesFixture;

    #[test]
    fn queue_ids_start_at_one() {
        let mut queues = ReferenceQueues::default();
        let q = queues.create();
        assert_eq!(q, QueueId(1));
        assert!(queues.is_valid(q));
        assert!(!queues.is_valid(QueueId(0)));
        assert_eq!(queues.poll(QueueId(0)), None);
        assert_eq!(queues.poll(QueueId(7)), None);
        assert_eq!(queues.len(q), 0);
    }

    #[test]
    fn weak_reference_to_dead_object_is_cleared_and_enqueued() {
        let f = SpacesFixture::new();
        let mut processor = ReferenceProcessor::new();
        let queue = processor.queues.create();
        let live = f.old_node(ObjectReference::NULL);
        let dead = f.old_node(ObjectReference::NULL);
        let weak_live = f.old_reference(ReferenceKind::Weak, live, Some(queue));
        let weak_dead = f.old_reference(ReferenceKind::Weak, dead, Some(queue));
        processor.add_candidate(ReferenceKind::Weak, weak_live);
        processor.add_candidate(ReferenceKind::Weak, weak_dead);

        let mut tracer = FullTracer::new(&f.spaces, &f.types, false, &f.workers);
        tracer.trace_object(weak_live);
        tracer.trace_object(weak_dead);
        tracer.trace_object(live);
        tracer.process_closure();

        let stats = processor.scan(ReferenceKind::Weak, &tracer, true);
        assert_eq!(stats, ReferenceStats { cleared: 1, enqueued: 1 });
        let mem = f.spaces.old.memory();
        assert_eq!(object_model::read_ref(mem, weak_live, REFERENT_FIELD), live);
        assert!(object_model::read_ref(mem, weak_dead, REFERENT_FIELD).is_null());
        assert_eq!(processor.queues.poll(queue), Some(weak_dead));
        // Both stay candidates while the reference objects live.
        assert_eq!(processor.candidate_count(ReferenceKind::Weak), 2);

        // A second pass does not enqueue the cleared reference again.
        let stats = processor.scan(ReferenceKind::Weak, &tracer, true);
        assert_eq!(stats, ReferenceStats::default());
        assert_eq!(processor.queues.poll(queue), None);
    }

    #[test]
    fn cleared_reference_stays_a_candidate_for_a_new_referent() {
        let f = SpacesFixture::new();
        let mut processor = ReferenceProcessor::new();
        let weak = f.old_reference(ReferenceKind::Weak, ObjectReference::NULL, None);
        processor.add_candidate(ReferenceKind::Weak, weak);
        let mut tracer = FullTracer::new(&f.spaces, &f.types, false, &f.workers);
        tracer.trace_object(weak);
        tracer.process_closure();
        processor.scan(ReferenceKind::Weak, &tracer, true);
        assert_eq!(processor.candidate_count(ReferenceKind::Weak), 1);
    }

    #[test]
    fn soft_referents_are_retained() {
        let f = SpacesFixture::new();
        let mut processor = ReferenceProcessor::new();
        let leaf = f.old_node(ObjectReference::NULL);
        let referent = f.old_node(leaf);
        let soft = f.old_reference(ReferenceKind::Soft, referent, None);
        processor.add_candidate(ReferenceKind::Soft, soft);

        let mut tracer = FullTracer::new(&f.spaces, &f.types, false, &f.workers);
        tracer.trace_object(soft);
        tracer.process_closure();
        assert!(!tracer.is_live(referent));
        processor.retain_soft_referents(&mut tracer);
        assert!(tracer.is_live(referent));
        assert!(tracer.is_live(leaf));
        let stats = processor.scan(ReferenceKind::Soft, &tracer, true);
        assert_eq!(stats.cleared, 0);
    }

    #[test]
    fn dead_reference_objects_wait_for_the_last_pass() {
        let f = SpacesFixture::new();
        let mut processor = ReferenceProcessor::new();
        let referent = f.old_node(ObjectReference::NULL);
        let weak = f.old_reference(ReferenceKind::Weak, referent, None);
        processor.add_candidate(ReferenceKind::Weak, weak);
        let mut tracer = FullTracer::new(&f.spaces, &f.types, false, &f.workers);
        processor.scan(ReferenceKind::Weak, &tracer, false);
        assert_eq!(processor.candidate_count(ReferenceKind::Weak), 1);
        processor.scan(ReferenceKind::Weak, &tracer, true);
        assert_eq!(processor.candidate_count(ReferenceKind::Weak), 0);
    }
}
