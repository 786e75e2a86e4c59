use crate::plan::global::CollectionKind;
use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// This stores some global states for a heap instance. Components that need
/// them (mutators, the collection driver, the allocation slow path) hold a
/// reference to the heap and read them here rather than through the plan.
pub struct GlobalState {
    /// The current GC status.
    pub(crate) gc_status: Atomic<GcStatus>,
    /// Is the current GC triggered by the user?
    pub(crate) user_triggered_collection: AtomicBool,
    /// The kind of collection the policy picked for the next allocation-triggered GC.
    pub(crate) next_collection_kind: Atomic<CollectionKind>,
    /// A counter that keeps tracks of the number of bytes allocated since last stress GC
    pub(crate) allocation_bytes: AtomicUsize,
    /// Bytes allocated since the heap was created.
    pub(crate) total_allocated_bytes: AtomicUsize,
    /// Objects allocated since the heap was created.
    pub(crate) total_allocated_objects: AtomicUsize,
    /// Seed for identity hash codes.
    pub(crate) hash_seed: AtomicUsize,
}

impl GlobalState {
    /// Are we in the middle of a collection?
    pub fn is_in_gc(&self) -> bool {
        self.gc_status.load(Ordering::SeqCst) != GcStatus::NotInGC
    }

    pub fn set_gc_status(&self, s: GcStatus) {
        self.gc_status.store(s, Ordering::SeqCst);
    }

    /// Return true if this collection was triggered by application code.
    pub fn is_user_triggered_collection(&self) -> bool {
        self.user_triggered_collection.load(Ordering::Relaxed)
    }

    /// Count an allocation. Returns true if a stress GC is due.
    pub(crate) fn increase_allocation_bytes_by(&self, size: usize, stress_factor: usize) -> bool {
        let old = self.allocation_bytes.fetch_add(size, Ordering::Relaxed);
        self.total_allocated_bytes.fetch_add(size, Ordering::Relaxed);
        self.total_allocated_objects.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Stress GC: old_allocation_bytes = {}, size = {}, allocation_bytes = {}",
            old,
            size,
            old + size,
        );
        old + size >= stress_factor
    }

    /// Forget allocation since the last stress GC.
    pub(crate) fn reset_allocation_bytes(&self) {
        self.allocation_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn next_hash_seed(&self) -> usize {
        self.hash_seed.fetch_add(0x61c8_8647, Ordering::Relaxed)
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            gc_status: Atomic::new(GcStatus::NotInGC),
            user_triggered_collection: AtomicBool::new(false),
            next_collection_kind: Atomic::new(CollectionKind::Young),
            allocation_bytes: AtomicUsize::new(0),
            total_allocated_bytes: AtomicUsize::new(0),
            total_allocated_objects: AtomicUsize::new(0),
            hash_seed: AtomicUsize::new(0x2545_f491),
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, NoUninit)]
#[repr(u8)]
pub enum GcStatus {
    NotInGC,
    /// Mutators are being suspended.
    GcPrepare,
    /// Every other mutator is suspended and the collector is running.
    GcProper,
}
