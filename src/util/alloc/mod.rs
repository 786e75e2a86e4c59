//! Mutator-side allocators.

mod bumpallocator;

pub use self::bumpallocator::BumpAllocator;
