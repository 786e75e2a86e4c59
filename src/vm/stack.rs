//! Precise stack roots.
//!
//! Compiled code is not part of this crate, so each mutator keeps a shadow
//! stack of frames. A frame has a fixed number of reference slots and a
//! [`StackMap`] describing which of them are live at the frame's current
//! safepoint, the way a compiler's GC map would. Only live slots are roots;
//! the collector clears dead slots so a stale pointer can never be read back.

use crate::util::error::StackError;
use crate::util::ObjectReference;

/// Which reference slots of a frame are live at the current safepoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackMap {
    live: Vec<bool>,
}

impl StackMap {
    /// All `slots` slots live.
    pub fn all_live(slots: usize) -> Self {
        StackMap {
            live: vec![true; slots],
        }
    }

    /// Only the listed slots are live. Listing a slot at or past `slots`
    /// widens the map, which then no longer fits a frame of `slots` slots.
    pub fn with_live(slots: usize, live_slots: &[usize]) -> Self {
        let len = live_slots.iter().map(|s| s + 1).max().unwrap_or(0).max(slots);
        let mut live = vec![false; len];
        for slot in live_slots {
            live[*slot] = true;
        }
        StackMap { live }
    }

    pub fn is_live(&self, slot: usize) -> bool {
        self.live.get(slot).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[derive(Debug)]
struct Frame {
    slots: Vec<ObjectReference>,
    map: StackMap,
}

/// The reference slots of every active frame of one thread.
#[derive(Debug, Default)]
pub struct ShadowStack {
    frames: Vec<Frame>,
}

impl ShadowStack {
    pub fn new() -> Self {
        ShadowStack { frames: vec![] }
    }

    /// Push a frame with `slots` null slots, all live.
    pub fn push_frame(&mut self, slots: usize) {
        self.frames.push(Frame {
            slots: vec![ObjectReference::NULL; slots],
            map: StackMap::all_live(slots),
        });
    }

    /// Pop the top frame. Returns false if there is none.
    pub fn pop_frame(&mut self) -> bool {
        self.frames.pop().is_some()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn top(&self) -> Result<&Frame, StackError> {
        self.frames.last().ok_or(StackError::NoFrame)
    }

    fn top_mut(&mut self) -> Result<&mut Frame, StackError> {
        self.frames.last_mut().ok_or(StackError::NoFrame)
    }

    /// Read a slot of the top frame.
    pub fn get(&self, slot: usize) -> Result<ObjectReference, StackError> {
        let frame = self.top()?;
        frame.slots.get(slot).copied().ok_or(StackError::SlotOutOfBounds {
            slot,
            slots: frame.slots.len(),
        })
    }

    /// Write a slot of the top frame.
    pub fn set(&mut self, slot: usize, value: ObjectReference) -> Result<(), StackError> {
        let frame = self.top_mut()?;
        let slots = frame.slots.len();
        let target = frame
            .slots
            .get_mut(slot)
            .ok_or(StackError::SlotOutOfBounds { slot, slots })?;
        *target = value;
        Ok(())
    }

    /// Install the stack map for the top frame's current safepoint.
    pub fn set_stack_map(&mut self, map: StackMap) -> Result<(), StackError> {
        let frame = self.top_mut()?;
        if map.len() != frame.slots.len() {
            return Err(StackError::MapMismatch {
                map: map.len(),
                slots: frame.slots.len(),
            });
        }
        frame.map = map;
        Ok(())
    }

    /// Visit live, non-null slots of every frame. Dead slots are cleared.
    pub fn scan_roots<F: FnMut(&mut ObjectReference)>(&mut self, mut f: F) {
        for frame in self.frames.iter_mut() {
            for (i, slot) in frame.slots.iter_mut().enumerate() {
                if !frame.map.is_live(i) {
                    *slot = ObjectReference::NULL;
                } else if !slot.is_null() {
                    f(slot);
                }
            }
        }
    }

    /// Visit live, non-null slots without modifying anything.
    pub fn for_each_root<F: FnMut(ObjectReference)>(&self, mut f: F) {
        for frame in self.frames.iter() {
            for (i, slot) in frame.slots.iter().enumerate() {
                if frame.map.is_live(i) && !slot.is_null() {
                    f(*slot);
                }
            }
        }
    }
}

/// Reachability fences: explicit roots pushed and popped around a region
/// in which an object must stay reachable, even if no live slot refers to it.
#[derive(Debug, Default)]
pub struct FenceStack {
    fences: Vec<ObjectReference>,
}

/// Index of a fence in its thread's fence stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FenceId(usize);

impl FenceStack {
    pub fn push(&mut self, object: ObjectReference) -> FenceId {
        self.fences.push(object);
        FenceId(self.fences.len() - 1)
    }

    /// Pop the given fence, which must be the innermost one.
    pub fn pop(&mut self, id: FenceId) -> Result<ObjectReference, StackError> {
        if id.0 + 1 != self.fences.len() {
            return Err(StackError::FenceOrder {
                fence: id.0,
                depth: self.fences.len(),
            });
        }
        Ok(self.fences.pop().unwrap_or(ObjectReference::NULL))
    }

    /// The current location of the fenced object.
    pub fn get(&self, id: FenceId) -> Result<ObjectReference, StackError> {
        self.fences.get(id.0).copied().ok_or(StackError::FenceOrder {
            fence: id.0,
            depth: self.fences.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn scan_roots<F: FnMut(&mut ObjectReference)>(&mut self, f: F) {
        self.fences.iter_mut().filter(|f| !f.is_null()).for_each(f);
    }

    pub fn for_each_root<F: FnMut(ObjectReference)>(&self, f: F) {
        self.fences.iter().copied().filter(|f| !f.is_null()).for_each(f);
    }
}
