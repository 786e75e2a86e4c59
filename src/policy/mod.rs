//! Memory policies: how objects are laid out, allocated and reclaimed in
//! each space.

pub mod copyspace;
pub mod largeobjectspace;
pub mod markcompactspace;
pub mod space;

pub use self::space::{HeapSpaces, Space, SpaceKind};
