//! Indirect reference tables for native code.
//!
//! Native code never holds a raw [`ObjectReference`]: it holds an
//! [`IndirectRef`], an index into a table that the collector scans and
//! updates. Each slot carries a serial number that changes whenever the slot
//! is reused, so a handle that was deleted (or whose local frame was popped)
//! is detected as stale instead of silently reading another object.
//!
//! Local tables are split into segments. `push_frame` starts a new segment
//! and `pop_frame` releases every handle created since the matching push.

use crate::util::constants::MAX_HANDLES_PER_TABLE;
use crate::util::error::HandleError;
use crate::util::ObjectReference;
use strum_macros::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum HandleKind {
    Local,
    Global,
    WeakGlobal,
}

/// A handle to an object held by an [`IndirectReferenceTable`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndirectRef {
    kind: HandleKind,
    index: u32,
    serial: u32,
}

impl IndirectRef {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

/// Marks the segment that was current before a `push_frame`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocalFrameCookie(usize);

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    serial: u32,
    in_use: bool,
    reference: ObjectReference,
}

pub struct IndirectReferenceTable {
    kind: HandleKind,
    slots: Vec<Slot>,
    /// Number of slots in use by any segment. Slots above it keep their
    /// serial numbers so stale handles stay detectable.
    top: usize,
    segment_start: usize,
    max_entries: usize,
    frames: usize,
}

impl IndirectReferenceTable {
    pub fn new(kind: HandleKind) -> Self {
        Self::with_capacity(kind, MAX_HANDLES_PER_TABLE)
    }

    pub fn with_capacity(kind: HandleKind, max_entries: usize) -> Self {
        IndirectReferenceTable {
            kind,
            slots: vec![],
            top: 0,
            segment_start: 0,
            max_entries,
            frames: 0,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Add a reference to the current segment, reusing a hole if there is one.
    pub fn add(&mut self, object: ObjectReference) -> Result<IndirectRef, HandleError> {
        if object.is_null() {
            return Err(HandleError::Null);
        }
        let index = match (self.segment_start..self.top).find(|i| !self.slots[*i].in_use) {
            Some(hole) => hole,
            None => {
                if self.top >= self.max_entries {
                    return Err(HandleError::TableFull {
                        kind: self.kind,
                        max: self.max_entries,
                    });
                }
                if self.top == self.slots.len() {
                    self.slots.push(Slot::default());
                }
                self.top += 1;
                self.top - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.serial = slot.serial.wrapping_add(1);
        slot.in_use = true;
        slot.reference = object;
        trace!("{} handle #{} -> {}", self.kind, index, object);
        Ok(IndirectRef {
            kind: self.kind,
            index: index as u32,
            serial: slot.serial,
        })
    }

    fn check(&self, iref: IndirectRef) -> Result<usize, HandleError> {
        if iref.kind != self.kind {
            return Err(HandleError::WrongKind {
                expected: self.kind,
                actual: iref.kind,
            });
        }
        let index = iref.index as usize;
        if index >= self.top {
            return Err(HandleError::Stale(self.kind));
        }
        let slot = &self.slots[index];
        if !slot.in_use || slot.serial != iref.serial {
            return Err(HandleError::Stale(self.kind));
        }
        Ok(index)
    }

    /// Read the object a handle refers to. A cleared weak global reads as null.
    pub fn get(&self, iref: IndirectRef) -> Result<ObjectReference, HandleError> {
        self.check(iref).map(|i| self.slots[i].reference)
    }

    /// Point an existing handle at another object.
    pub fn set(&mut self, iref: IndirectRef, object: ObjectReference) -> Result<(), HandleError> {
        let i = self.check(iref)?;
        self.slots[i].reference = object;
        Ok(())
    }

    /// Delete a handle. Local handles can only be deleted from the current segment.
    pub fn remove(&mut self, iref: IndirectRef) -> Result<(), HandleError> {
        let index = self.check(iref)?;
        if index < self.segment_start {
            warn!(
                "Attempt to remove {} handle #{} from an enclosing frame",
                self.kind, index
            );
            return Err(HandleError::Stale(self.kind));
        }
        let slot = &mut self.slots[index];
        slot.in_use = false;
        slot.reference = ObjectReference::NULL;
        // Shrink over trailing holes of the current segment.
        while self.top > self.segment_start && !self.slots[self.top - 1].in_use {
            self.top -= 1;
        }
        Ok(())
    }

    /// Start a new segment.
    pub fn push_frame(&mut self) -> LocalFrameCookie {
        let cookie = LocalFrameCookie(self.segment_start);
        self.segment_start = self.top;
        self.frames += 1;
        cookie
    }

    /// Release every handle of the current segment and return to the enclosing one.
    pub fn pop_frame(&mut self, cookie: LocalFrameCookie) -> Result<(), HandleError> {
        if self.frames == 0 || cookie.0 > self.segment_start {
            return Err(HandleError::FrameUnderflow);
        }
        for slot in &mut self.slots[self.segment_start..self.top] {
            slot.in_use = false;
            slot.reference = ObjectReference::NULL;
        }
        self.top = self.segment_start;
        self.segment_start = cookie.0;
        self.frames -= 1;
        Ok(())
    }

    /// Number of handles in use.
    pub fn len(&self) -> usize {
        self.slots[..self.top].iter().filter(|s| s.in_use).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every non-null entry as a root slot.
    pub fn scan_roots<F: FnMut(&mut ObjectReference)>(&mut self, mut f: F) {
        for slot in &mut self.slots[..self.top] {
            if slot.in_use && !slot.reference.is_null() {
                f(&mut slot.reference);
            }
        }
    }

    pub fn for_each_root<F: FnMut(ObjectReference)>(&self, mut f: F) {
        for slot in &self.slots[..self.top] {
            if slot.in_use && !slot.reference.is_null() {
                f(slot.reference);
            }
        }
    }

    /// Process weak entries after marking: `f` returns the new location of a
    /// live object or null for a dead one. Cleared entries stay allocated and read as null.
    pub fn sweep<F: FnMut(ObjectReference) -> ObjectReference>(&mut self, mut f: F) -> usize {
        let mut cleared = 0;
        for slot in &mut self.slots[..self.top] {
            if slot.in_use && !slot.reference.is_null() {
                slot.reference = f(slot.reference);
                if slot.reference.is_null() {
                    cleared += 1;
                }
            }
        }
        cleared
    }
}
