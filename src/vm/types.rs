//! Type descriptors: the reference map the compiler hands to the collector.
//!
//! Every object header carries a [`TypeId`]. The descriptor registered for
//! that id tells the collector how many fields a fixed-size object has,
//! which of them hold references, whether the type is a reference object
//! (soft, weak or phantom) and whether it declares a finalizer.

use crate::plan::Mutator;
use crate::vm::handles::IndirectRef;
use enum_map::Enum;
use std::fmt;
use std::sync::{Arc, RwLock};
use strum_macros::{Display, EnumIter};

/// Index of a registered type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// The filler type. Free chunks and retired TLAB tails are filler objects,
/// which keeps every space walkable from bottom to top.
pub const FILLER_TYPE: TypeId = TypeId(0);

/// Strength of a reference object.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Enum, Display, EnumIter)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

/// Field holding the referent of a reference object.
pub const REFERENT_FIELD: usize = 0;
/// Field holding the queue id of a reference object (0 = no queue).
pub const QUEUE_FIELD: usize = 1;
/// Number of fields of a reference object.
pub const REFERENCE_FIELDS: usize = 2;

/// Field layout of a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeLayout {
    /// A fixed number of fields. The listed fields hold references.
    Instance {
        fields: usize,
        ref_fields: Vec<usize>,
    },
    /// An array whose elements are all references. The length is chosen at allocation.
    RefArray,
    /// An array of primitive words.
    PrimArray,
    /// A reference object: `[referent, queue]`. The referent is not traced strongly.
    Reference(ReferenceKind),
}

/// A finalizer. It receives the finalizing thread and a local handle that
/// keeps the object alive while the finalizer runs.
pub type Finalizer = Arc<dyn Fn(&mut Mutator, IndirectRef) + Send + Sync>;

/// Everything the collector needs to know about one type.
#[derive(Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub layout: TypeLayout,
    pub finalizer: Option<Finalizer>,
}

impl TypeDescriptor {
    pub fn instance(name: &str, fields: usize, ref_fields: &[usize]) -> Self {
        TypeDescriptor {
            name: name.to_string(),
            layout: TypeLayout::Instance {
                fields,
                ref_fields: ref_fields.to_vec(),
            },
            finalizer: None,
        }
    }

    pub fn ref_array(name: &str) -> Self {
        TypeDescriptor {
            name: name.to_string(),
            layout: TypeLayout::RefArray,
            finalizer: None,
        }
    }

    pub fn prim_array(name: &str) -> Self {
        TypeDescriptor {
            name: name.to_string(),
            layout: TypeLayout::PrimArray,
            finalizer: None,
        }
    }

    pub fn reference(name: &str, kind: ReferenceKind) -> Self {
        TypeDescriptor {
            name: name.to_string(),
            layout: TypeLayout::Reference(kind),
            finalizer: None,
        }
    }

    /// Declare a finalizer for this type. Every instance is registered for
    /// finalization at allocation time.
    pub fn with_finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn(&mut Mutator, IndirectRef) + Send + Sync + 'static,
    {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn is_array(&self) -> bool {
        matches!(self.layout, TypeLayout::RefArray | TypeLayout::PrimArray)
    }

    pub fn is_finalizable(&self) -> bool {
        self.finalizer.is_some()
    }

    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        match self.layout {
            TypeLayout::Reference(kind) => Some(kind),
            _ => None,
        }
    }

    /// Number of fields for fixed-size types, `None` for arrays.
    pub fn fixed_fields(&self) -> Option<usize> {
        match &self.layout {
            TypeLayout::Instance { fields, .. } => Some(*fields),
            TypeLayout::Reference(_) => Some(REFERENCE_FIELDS),
            TypeLayout::RefArray | TypeLayout::PrimArray => None,
        }
    }

    /// Is field `index` a reference slot (including the referent of a reference object)?
    pub fn is_ref_field(&self, index: usize) -> bool {
        match &self.layout {
            TypeLayout::Instance { ref_fields, .. } => ref_fields.contains(&index),
            TypeLayout::RefArray => true,
            TypeLayout::PrimArray => false,
            TypeLayout::Reference(_) => index == REFERENT_FIELD,
        }
    }

    /// Visit the strongly traced reference fields of an object with `nfields` fields.
    /// The referent of a reference object is not visited.
    #[inline]
    pub fn for_each_strong_field<F: FnMut(usize)>(&self, nfields: usize, mut f: F) {
        match &self.layout {
            TypeLayout::Instance { ref_fields, .. } => ref_fields.iter().for_each(|i| f(*i)),
            TypeLayout::RefArray => (0..nfields).for_each(f),
            TypeLayout::PrimArray | TypeLayout::Reference(_) => {}
        }
    }

    /// Visit every reference field, the referent included. Used when
    /// updating pointers after objects moved.
    #[inline]
    pub fn for_each_ref_field<F: FnMut(usize)>(&self, nfields: usize, mut f: F) {
        self.for_each_strong_field(nfields, &mut f);
        if self.reference_kind().is_some() {
            f(REFERENT_FIELD);
        }
    }

    fn validate(&self) -> Result<(), String> {
        if let TypeLayout::Instance { fields, ref_fields } = &self.layout {
            if let Some(bad) = ref_fields.iter().find(|i| **i >= *fields) {
                return Err(format!(
                    "{}: reference field {} out of range for {} fields",
                    self.name, bad, fields
                ));
            }
        }
        if self.reference_kind().is_some() && self.finalizer.is_some() {
            return Err(format!("{}: reference objects cannot be finalizable", self.name));
        }
        Ok(())
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("finalizable", &self.is_finalizable())
            .finish()
    }
}

/// All types known to a heap, indexed by [`TypeId`].
pub struct TypeRegistry {
    types: RwLock<Vec<Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            types: RwLock::new(vec![Arc::new(TypeDescriptor::prim_array("<filler>"))]),
        }
    }

    /// Register a type and return its id.
    pub fn register(&self, desc: TypeDescriptor) -> Result<TypeId, String> {
        desc.validate()?;
        let mut types = self.types.write().unwrap();
        let id = TypeId(types.len() as u32);
        debug!("Register {} as {}", desc.name, id);
        types.push(Arc::new(desc));
        Ok(id)
    }

    pub fn get(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        if id == FILLER_TYPE {
            return None;
        }
        self.types.read().unwrap().get(id.0 as usize).cloned()
    }

    /// A consistent view of all descriptors. The collector takes one at the
    /// start of a cycle so the scanning loop does not take the lock per object.
    pub fn snapshot(&self) -> TypeTable {
        TypeTable {
            types: self.types.read().unwrap().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.types.read().unwrap().len()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable copy of the registry used during a collection.
#[derive(Clone)]
pub struct TypeTable {
    types: Vec<Arc<TypeDescriptor>>,
}

impl TypeTable {
    #[inline]
    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        &self.types[id.0 as usize]
    }

    pub fn contains(&self, id: TypeId) -> bool {
        (id.0 as usize) < self.types.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = TypeRegistry::new();
        let node = registry
            .register(TypeDescriptor::instance("Node", 3, &[0, 1]))
            .unwrap();
        assert_ne!(node, FILLER_TYPE);
        let desc = registry.get(node).unwrap();
        assert_eq!(desc.name, "Node");
        assert_eq!(desc.fixed_fields(), Some(3));
        assert!(desc.is_ref_field(1));
        assert!(!desc.is_ref_field(2));
        assert!(registry.get(FILLER_TYPE).is_none());
        assert!(registry.get(TypeId(99)).is_none());
    }

    #[test]
    fn reject_bad_layout() {
        let registry = TypeRegistry::new();
        assert!(registry
            .register(TypeDescriptor::instance("Bad", 2, &[2]))
            .is_err());
        assert!(registry
            .register(TypeDescriptor::reference("BadRef", ReferenceKind::Weak).with_finalizer(|_, _| {}))
            .is_err());
    }

    #[test]
    fn referent_is_not_strong() {
        let desc = TypeDescriptor::reference("WeakRef", ReferenceKind::Weak);
        let mut strong = vec![];
        desc.for_each_strong_field(REFERENCE_FIELDS, |i| strong.push(i));
        assert!(strong.is_empty());
        let mut all = vec![];
        desc.for_each_ref_field(REFERENCE_FIELDS, |i| all.push(i));
        assert_eq!(all, vec![REFERENT_FIELD]);
    }

    #[test]
    fn ref_array_fields() {
        let desc = TypeDescriptor::ref_array("Object[]");
        let mut fields = vec![];
        desc.for_each_strong_field(4, |i| fields.push(i));
        assert_eq!(fields, vec![0, 1, 2, 3]);
        assert!(desc.is_array());
        assert_eq!(desc.fixed_fields(), None);
    }
}
