//! Utilities shared by the plan, the policies and the runtime interface.

pub mod address;
pub mod alloc;
pub mod constants;
pub mod conversions;
pub mod error;
pub mod finalizable_processor;
pub(crate) mod logger;
pub mod options;
pub mod raw_memory;
pub mod reference_processor;
pub mod sanity;
pub mod statistics;
pub(crate) mod treadmill;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
