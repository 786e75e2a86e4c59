//! genheap: a generational, stop-the-world, precise garbage collector.
//!
//! A [`Heap`] owns a young copying space, an old mark-compact space and a
//! large object space. Threads bind to it as [`Mutator`]s, allocate through
//! thread-local buffers and keep their references in precise roots: shadow
//! stack slots described by stack maps, reachability fences, handle tables
//! and class statics. Collections stop every mutator at a poll point, so no
//! mutator ever observes a half-moved heap.
//!
//! ```ignore
//! let heap = HeapBuilder::new().build();
//! let node = heap.register_type(TypeDescriptor::instance("Node", 2, &[0, 1]))?;
//! let mut m = heap.bind_mutator("main");
//! m.push_frame(1);
//! let o = m.alloc(node)?;
//! m.set_slot(0, o);
//! m.collect(CollectionKind::Full);
//! let o = m.slot(0); // the object may have moved
//! ```

#[macro_use]
extern crate log;
#[cfg(test)]
#[macro_use]
extern crate lazy_static;

mod global_state;
pub mod heap;
pub mod memory_manager;
pub mod plan;
pub mod policy;
pub mod scheduler;
pub mod util;
pub mod vm;

pub use crate::heap::{Heap, HeapBuilder};
pub use crate::plan::{AllocationSemantics, CollectionKind, GcCause, Mutator};
pub use crate::scheduler::{FinalizerDaemon, ThreadHandle, ThreadState};
pub use crate::util::error::{
    AllocError, HandleError, OptionError, ReferenceError, StackError, StaticsError, SuspendError,
};
pub use crate::util::reference_processor::QueueId;
pub use crate::util::statistics::{GcIteration, GcStats};
pub use crate::util::{Address, ObjectReference};
