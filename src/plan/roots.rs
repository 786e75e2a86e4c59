//! Root enumeration. Every strong root slot of the heap and of its threads
//! is visited exactly once per pass; weak globals are handled separately.

use crate::heap::Heap;
use crate::scheduler::ThreadHandle;
use crate::util::ObjectReference;
use strum_macros::Display;

/// Where a root slot lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum RootKind {
    Stack,
    Fence,
    LocalHandle,
    GlobalHandle,
    Static,
    FinalizerQueue,
    ReferenceQueue,
}

/// Visit every strong root slot. `f` may update the slot. Dead shadow stack
/// slots are cleared instead of visited.
pub(crate) fn scan_roots(
    heap: &Heap,
    threads: &[ThreadHandle],
    f: &mut dyn FnMut(RootKind, &mut ObjectReference),
) {
    let mut visit = |kind: RootKind, slot: &mut ObjectReference| {
        if !slot.is_null() {
            f(kind, slot)
        }
    };
    for thread in threads {
        let mut locals = thread.locals.lock().unwrap();
        locals.stack.scan_roots(|s| visit(RootKind::Stack, s));
        locals.fences.scan_roots(|s| visit(RootKind::Fence, s));
        locals.handles.scan_roots(|s| visit(RootKind::LocalHandle, s));
    }
    heap.globals
        .lock()
        .unwrap()
        .scan_roots(|s| visit(RootKind::GlobalHandle, s));
    heap.statics
        .lock()
        .unwrap()
        .scan_roots(|s| visit(RootKind::Static, s));
    heap.finalizable
        .lock()
        .unwrap()
        .scan_roots(|s| visit(RootKind::FinalizerQueue, s));
    heap.references
        .lock()
        .unwrap()
        .queues
        .scan_roots(|s| visit(RootKind::ReferenceQueue, s));
}

/// Visit every strong root without changing anything.
pub(crate) fn for_each_root(
    heap: &Heap,
    threads: &[ThreadHandle],
    f: &mut dyn FnMut(RootKind, ObjectReference),
) {
    let mut visit = |kind: RootKind, object: ObjectReference| {
        if !object.is_null() {
            f(kind, object)
        }
    };
    for thread in threads {
        let locals = thread.locals.lock().unwrap();
        locals.stack.for_each_root(|o| visit(RootKind::Stack, o));
        locals.fences.for_each_root(|o| visit(RootKind::Fence, o));
        locals.handles.for_each_root(|o| visit(RootKind::LocalHandle, o));
    }
    heap.globals
        .lock()
        .unwrap()
        .for_each_root(|o| visit(RootKind::GlobalHandle, o));
    heap.statics
        .lock()
        .unwrap()
        .for_each_root(|o| visit(RootKind::Static, o));
    heap.finalizable
        .lock()
        .unwrap()
        .for_each_root(|o| visit(RootKind::FinalizerQueue, o));
    heap.references
        .lock()
        .unwrap()
        .queues
        .for_each_root(|o| visit(RootKind::ReferenceQueue, o));
}

/// Clear weak global handles whose object died, and forward the rest.
/// `resolve` returns the new location of a live object or null. Returns the
/// number of handles cleared.
pub(crate) fn sweep_weak_globals<F: FnMut(ObjectReference) -> ObjectReference>(
    heap: &Heap,
    resolve: F,
) -> usize {
    let cleared = heap.weak_globals.lock().unwrap().sweep(resolve);
    if cleared > 0 {
        debug!("Cleared {} weak global handles", cleared);
    }
    cleared
}
