//! The generational plan: collection kinds and policy, the mutator
//! interface, tracing, reference processing order and compaction.
//!
//! A collection is driven by [`generational`]: the requesting thread stops
//! every other mutator, runs a young (copying) or full (mark, then sweep or
//! compact) collection, and resumes them.

pub mod barriers;
pub(crate) mod compactor;
pub(crate) mod gc_requester;
pub(crate) mod generational;
pub mod global;
pub mod mutator_context;
pub mod roots;
pub(crate) mod tracing;

pub use self::compactor::CompactionError;
pub use self::global::{AllocationSemantics, CollectionKind, GcCause};
pub use self::mutator_context::Mutator;
pub use self::roots::RootKind;
