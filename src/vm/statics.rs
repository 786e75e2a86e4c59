//! Static reference slots of loaded classes.
//!
//! The class loader registers one entry per class with its number of static
//! reference slots. Slots of loaded classes are roots. Unloading a class
//! retires its slots: they stop being roots and further accesses fail.

use crate::util::error::StaticsError;
use crate::util::ObjectReference;

/// Identifies a registered class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClassId(pub usize);

struct ClassEntry {
    name: String,
    slots: Vec<ObjectReference>,
    loaded: bool,
}

#[derive(Default)]
pub struct ClassStatics {
    classes: Vec<ClassEntry>,
}

impl ClassStatics {
    pub fn new() -> Self {
        ClassStatics { classes: vec![] }
    }

    pub fn register_class(&mut self, name: &str, slots: usize) -> ClassId {
        self.classes.push(ClassEntry {
            name: name.to_string(),
            slots: vec![ObjectReference::NULL; slots],
            loaded: true,
        });
        let id = ClassId(self.classes.len() - 1);
        debug!("Loaded class {} ({:?}) with {} static slots", name, id, slots);
        id
    }

    fn entry(&self, class: ClassId) -> Result<&ClassEntry, StaticsError> {
        let entry = self
            .classes
            .get(class.0)
            .ok_or(StaticsError::Unknown(class.0))?;
        if !entry.loaded {
            return Err(StaticsError::Unloaded(class.0));
        }
        Ok(entry)
    }

    fn entry_mut(&mut self, class: ClassId) -> Result<&mut ClassEntry, StaticsError> {
        let entry = self
            .classes
            .get_mut(class.0)
            .ok_or(StaticsError::Unknown(class.0))?;
        if !entry.loaded {
            return Err(StaticsError::Unloaded(class.0));
        }
        Ok(entry)
    }

    pub fn get(&self, class: ClassId, slot: usize) -> Result<ObjectReference, StaticsError> {
        let entry = self.entry(class)?;
        entry
            .slots
            .get(slot)
            .copied()
            .ok_or(StaticsError::OutOfBounds {
                class: class.0,
                slot,
                len: entry.slots.len(),
            })
    }

    pub fn set(
        &mut self,
        class: ClassId,
        slot: usize,
        value: ObjectReference,
    ) -> Result<(), StaticsError> {
        let entry = self.entry_mut(class)?;
        let len = entry.slots.len();
        let target = entry.slots.get_mut(slot).ok_or(StaticsError::OutOfBounds {
            class: class.0,
            slot,
            len,
        })?;
        *target = value;
        Ok(())
    }

    /// Unload a class. Its static slots are no longer roots.
    pub fn unload(&mut self, class: ClassId) -> Result<(), StaticsError> {
        let entry = self.entry_mut(class)?;
        entry.loaded = false;
        entry.slots.clear();
        debug!("Unloaded class {} ({:?})", entry.name, class);
        Ok(())
    }

    pub fn is_loaded(&self, class: ClassId) -> bool {
        self.classes.get(class.0).map(|c| c.loaded).unwrap_or(false)
    }

    pub fn scan_roots<F: FnMut(&mut ObjectReference)>(&mut self, mut f: F) {
        for class in self.classes.iter_mut().filter(|c| c.loaded) {
            class.slots.iter_mut().filter(|s| !s.is_null()).for_each(&mut f);
        }
    }

    pub fn for_each_root<F: FnMut(ObjectReference)>(&self, mut f: F) {
        for class in self.classes.iter().filter(|c| c.loaded) {
            class.slots.iter().copied().filter(|s| !s.is_null()).for_each(&mut f);
        }
    }
}
