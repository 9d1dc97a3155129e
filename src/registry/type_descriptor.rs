use std::rc::Rc;

use refbridge_core::{ClassDef, ClassId, ClassKind, FunctionId};
use rustc_hash::FxHashMap;

use crate::marshal::PropertyDescriptor;

/// Bytes the script runtime reserves in front of a boxed value.
pub const USERDATA_HEADER: u32 = 8;

/// Padding between the userdata header and a value with the given alignment.
pub fn userdata_padding(align: u32) -> u32 {
    let align = align.max(1);
    (align - USERDATA_HEADER % align) % align
}

/// Whether a field is a property or a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Property,
    Function,
}

/// A resolved field: an index into the owning type's property or function list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Name of the type the field is cached on.
    pub owner: String,
    pub kind: FieldKind,
    pub index: usize,
    /// Declared on an ancestor of the type it was looked up on.
    pub inherited: bool,
}

/// Cached view of one host class, struct or interface.
#[derive(Debug)]
pub struct TypeDescriptor {
    name: String,
    class: ClassId,
    kind: ClassKind,
    native: bool,
    pub(crate) ref_count: u32,
    userdata_padding: u32,
    pub(crate) properties: Vec<Rc<PropertyDescriptor>>,
    pub(crate) functions: Vec<FunctionId>,
    pub(crate) fields: FxHashMap<String, FieldDescriptor>,
}

impl TypeDescriptor {
    pub(crate) fn new(def: &ClassDef, class: ClassId) -> Self {
        Self {
            name: def.name.clone(),
            class,
            kind: def.kind,
            native: def.is_native(),
            ref_count: 0,
            userdata_padding: userdata_padding(def.align),
            properties: Vec::new(),
            functions: Vec::new(),
            fields: FxHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host class this descriptor was resolved to.
    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Declared by native host code. Native descriptors survive a zero refcount.
    pub fn is_native(&self) -> bool {
        self.native
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Padding in front of boxed values of this type.
    pub fn userdata_padding(&self) -> u32 {
        self.userdata_padding
    }

    /// Number of fields resolved on this type so far.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_follows_alignment() {
        assert_eq!(userdata_padding(1), 0);
        assert_eq!(userdata_padding(8), 0);
        assert_eq!(userdata_padding(16), 8);
        assert_eq!(userdata_padding(32), 24);
    }
}
