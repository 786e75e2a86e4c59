//! Errors that can be observed by the embedding runtime.
//!
//! Invariant violations inside the collector (suspend count underflow, a
//! corrupted header found by heap verification) are not represented here.
//! They panic.

use crate::util::ObjectReference;
use crate::vm::handles::HandleKind;
use thiserror::Error;

/// Allocation failed even after the collector ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No space could satisfy the request after a young collection, a full
    /// collection and a full collection that cleared soft references.
    #[error("out of memory: failed to allocate {bytes} bytes in the {space} space")]
    OutOfMemory { bytes: usize, space: &'static str },
    /// The request can never be satisfied, no matter how much is freed.
    #[error("allocation of {bytes} bytes exceeds the capacity of the {space} space")]
    TooLarge { bytes: usize, space: &'static str },
    /// The type id has not been registered, or the type cannot be allocated that way.
    #[error("invalid allocation request: {0}")]
    InvalidType(String),
}

/// Errors from external thread suspension.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuspendError {
    /// The target did not reach a GC-safe state in time. The request has been withdrawn.
    #[error("thread {thread} did not acknowledge the suspend request within {millis}ms")]
    Timeout { thread: usize, millis: u64 },
    /// Another thread resumed the target before it acknowledged. The request no longer holds.
    #[error("suspend request for thread {0} was withdrawn by a concurrent resume")]
    Withdrawn(usize),
    /// The target thread has been unregistered.
    #[error("thread {0} is not registered")]
    NotRegistered(usize),
}

/// Misuse of the shadow stack or the reachability fences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("no active frame")]
    NoFrame,
    #[error("slot {slot} out of bounds for a frame with {slots} slots")]
    SlotOutOfBounds { slot: usize, slots: usize },
    #[error("stack map for {map} slots does not match a frame with {slots} slots")]
    MapMismatch { map: usize, slots: usize },
    /// Fences must be popped innermost first.
    #[error("fence {fence} popped out of order, {depth} fences are active")]
    FenceOrder { fence: usize, depth: usize },
}

/// Errors from indirect reference tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The handle refers to a slot that was deleted, reused or popped.
    #[error("stale {0:?} handle")]
    Stale(HandleKind),
    /// The handle belongs to a table of another kind.
    #[error("expected a {expected:?} handle, got a {actual:?} handle")]
    WrongKind {
        expected: HandleKind,
        actual: HandleKind,
    },
    /// The table reached its capacity.
    #[error("{kind:?} reference table overflow (max={max})")]
    TableFull { kind: HandleKind, max: usize },
    /// A null reference cannot be stored in a handle table.
    #[error("cannot create a handle for a null reference")]
    Null,
    /// Popping a local frame that was never pushed.
    #[error("local reference frame underflow")]
    FrameUnderflow,
}

/// Errors from class static storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaticsError {
    #[error("class {0} has been unloaded")]
    Unloaded(usize),
    #[error("class {0} is not registered")]
    Unknown(usize),
    #[error("static slot {slot} out of bounds for class {class} with {len} slots")]
    OutOfBounds { class: usize, slot: usize, len: usize },
}

/// Errors from setting heap options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("unknown option {0}")]
    UnknownOption(String),
    #[error("cannot parse {value:?} for option {name}")]
    ParseError { name: String, value: String },
    #[error("invalid value {value:?} for option {name}")]
    InvalidValue { name: String, value: String },
}

/// Errors from reference object accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("{0} is not a reference object")]
    NotAReference(ObjectReference),
}
