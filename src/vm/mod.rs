//! Contracts with the rest of the runtime.
//!
//! The compiler provides type descriptors and stack maps, the native
//! interface provides handle tables, and the class loader provides static
//! slots. This module holds those collaborator interfaces and the object
//! header layout that the whole collector agrees on.

pub mod handles;
pub mod object_model;
pub mod stack;
pub mod statics;
pub mod types;

pub use self::handles::{HandleKind, IndirectRef, IndirectReferenceTable, LocalFrameCookie};
pub use self::stack::{FenceId, StackMap};
pub use self::statics::ClassId;
pub use self::types::{ReferenceKind, TypeDescriptor, TypeId, TypeLayout};
