//! Per-collection records and cumulative collector statistics.

use crate::plan::global::{CollectionKind, GcCause};
use crate::policy::SpaceKind;
use crate::util::conversions::bytes_to_formatted_string;
use enum_map::EnumMap;
use itertools::Itertools;
use std::time::Duration;

/// Objects and bytes reclaimed by one sweep or release.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub objects: usize,
    pub bytes: usize,
}

impl std::ops::AddAssign for Reclaimed {
    fn add_assign(&mut self, other: Reclaimed) {
        self.objects += other.objects;
        self.bytes += other.bytes;
    }
}

/// What happened in one collection.
#[derive(Clone, Debug)]
pub struct GcIteration {
    /// Sequence number, starting at 1.
    pub id: usize,
    pub kind: CollectionKind,
    pub cause: GcCause,
    pub clear_soft_references: bool,
    /// Time from the request to the point where mutators were resumed.
    pub pause: Duration,
    /// Reclaimed per space.
    pub reclaimed: EnumMap<SpaceKind, Reclaimed>,
    /// Bytes copied from the young to the old space.
    pub promoted_bytes: usize,
    /// Objects that survived in place or were moved.
    pub live_objects: usize,
    /// Reference objects whose referent was cleared.
    pub references_cleared: usize,
    /// Reference objects added to a queue.
    pub references_enqueued: usize,
    /// Objects newly queued for finalization.
    pub finalizers_queued: usize,
    /// Weak global handles cleared.
    pub weak_globals_cleared: usize,
    /// The old space was compacted.
    pub compacted: bool,
    /// Compaction was wanted but its scratch space was not available.
    pub compaction_fallback: bool,
    pub used_before: usize,
    pub used_after: usize,
    pub capacity: usize,
}

impl GcIteration {
    pub fn new(id: usize, kind: CollectionKind, cause: GcCause) -> Self {
        GcIteration {
            id,
            kind,
            cause,
            clear_soft_references: false,
            pause: Duration::ZERO,
            reclaimed: EnumMap::default(),
            promoted_bytes: 0,
            live_objects: 0,
            references_cleared: 0,
            references_enqueued: 0,
            finalizers_queued: 0,
            weak_globals_cleared: 0,
            compacted: false,
            compaction_fallback: false,
            used_before: 0,
            used_after: 0,
            capacity: 0,
        }
    }

    pub fn freed_objects(&self) -> usize {
        self.reclaimed.values().map(|r| r.objects).sum()
    }

    pub fn freed_bytes(&self) -> usize {
        self.reclaimed.values().map(|r| r.bytes).sum()
    }

    pub fn percent_free(&self) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        100 - (self.used_after * 100 / self.capacity).min(100)
    }

    /// One-line summary in the format of a VM's GC log, e.g.
    /// `Explicit Full GC freed 120(4.5KB) objects, 2(64.0KB) large objects, 87% free, 1.2MB/9.0MB, paused 1.4ms`.
    pub fn summary(&self) -> String {
        let large = self.reclaimed[SpaceKind::Large];
        let small_objects = self.freed_objects() - large.objects;
        let small_bytes = self.freed_bytes() - large.bytes;
        let mut extras = vec![];
        if self.promoted_bytes > 0 {
            extras.push(format!("promoted {}", bytes_to_formatted_string(self.promoted_bytes)));
        }
        if self.references_cleared > 0 {
            extras.push(format!("{} references cleared", self.references_cleared));
        }
        if self.finalizers_queued > 0 {
            extras.push(format!("{} finalizers queued", self.finalizers_queued));
        }
        if self.compacted {
            extras.push("compacted".to_string());
        }
        if self.compaction_fallback {
            extras.push("compaction fell back to sweeping".to_string());
        }
        let extras = if extras.is_empty() {
            String::new()
        } else {
            format!(" [{}]", extras.iter().join(", "))
        };
        format!(
            "{} {} GC freed {}({}) objects, {}({}) large objects, {}% free, {}/{}, paused {:.3}ms{}",
            self.cause,
            self.kind,
            small_objects,
            bytes_to_formatted_string(small_bytes),
            large.objects,
            bytes_to_formatted_string(large.bytes),
            self.percent_free(),
            bytes_to_formatted_string(self.used_after),
            bytes_to_formatted_string(self.capacity),
            self.pause.as_secs_f64() * 1000.0,
            extras
        )
    }
}

/// Totals over the lifetime of a heap.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub collections: EnumMap<CollectionKind, usize>,
    pub total_pause: Duration,
    pub max_pause: Duration,
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub promoted_bytes: usize,
    pub compactions: usize,
    pub compaction_fallbacks: usize,
    pub last: Option<GcIteration>,
}

impl GcStats {
    pub fn record(&mut self, iteration: GcIteration) {
        self.collections[iteration.kind] += 1;
        self.total_pause += iteration.pause;
        self.max_pause = self.max_pause.max(iteration.pause);
        self.freed_objects += iteration.freed_objects();
        self.freed_bytes += iteration.freed_bytes();
        self.promoted_bytes += iteration.promoted_bytes;
        if iteration.compacted {
            self.compactions += 1;
        }
        if iteration.compaction_fallback {
            self.compaction_fallbacks += 1;
        }
        self.last = Some(iteration);
    }

    pub fn gc_count(&self) -> usize {
        self.collections.values().sum()
    }
}
