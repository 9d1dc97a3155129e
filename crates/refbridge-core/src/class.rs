//! Class, struct, and interface definitions.
//!
//! A [`ClassDef`] is built with the `with_*` methods and handed to
//! [`Host::register_class`](crate::Host::register_class), which assigns field
//! offsets, size, and alignment.
//!
//! # Example
//!
//! ```
//! use refbridge_core::{ClassDef, Host, PropertyType};
//!
//! let mut host = Host::new();
//! let vector = host
//!     .register_class(
//!         ClassDef::structure("Vector")
//!             .with_property("X", PropertyType::Float(refbridge_core::FloatKind::F32))
//!             .with_property("Y", PropertyType::Float(refbridge_core::FloatKind::F32)),
//!     )
//!     .unwrap();
//! assert_eq!(host.class(vector).unwrap().size, 8);
//! ```

use std::fmt;

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::{ClassId, FunctionId, ObjectHandle, PropertyDef, PropertyType, TypeHash};

/// What kind of type a [`ClassDef`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Reference type instantiated as host objects.
    Class,
    /// Value type stored inline.
    Struct,
    /// Interface implemented by classes; never instantiated.
    Interface,
}

bitflags! {
    /// Class-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClassFlags: u32 {
        /// Declared by native host code rather than loaded content.
        const NATIVE = 1 << 0;
        /// Cannot be instantiated directly.
        const ABSTRACT = 1 << 1;
    }
}

/// A registered class, struct, or interface.
#[derive(Clone)]
pub struct ClassDef {
    /// Type name, unique across the host.
    pub name: String,
    /// Hash of `name`.
    pub hash: TypeHash,
    /// Class, struct, or interface.
    pub kind: ClassKind,
    /// Class flags.
    pub flags: ClassFlags,
    /// Parent type.
    pub super_class: Option<ClassId>,
    /// Implemented interfaces.
    pub interfaces: Vec<ClassId>,
    /// Properties declared on this type. Offsets include the parent's size.
    pub properties: Vec<PropertyDef>,
    /// Byte size including inherited fields.
    pub size: u32,
    /// Alignment in bytes.
    pub align: u32,
    /// Default object, for classes.
    pub default_object: Option<ObjectHandle>,
    /// Function table by name.
    pub(crate) function_map: FxHashMap<String, FunctionId>,
    /// Declared functions in registration order.
    pub(crate) children: Vec<FunctionId>,
}

impl ClassDef {
    fn new(name: impl Into<String>, kind: ClassKind) -> Self {
        let name = name.into();
        Self {
            hash: TypeHash::from_name(&name),
            name,
            kind,
            flags: ClassFlags::empty(),
            super_class: None,
            interfaces: Vec::new(),
            properties: Vec::new(),
            size: 0,
            align: 1,
            default_object: None,
            function_map: FxHashMap::default(),
            children: Vec::new(),
        }
    }

    /// Start a class definition.
    pub fn class(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Class)
    }

    /// Start a struct definition.
    pub fn structure(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Struct)
    }

    /// Start an interface definition.
    pub fn interface(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Interface)
    }

    /// Set the parent type.
    pub fn with_super(mut self, super_class: ClassId) -> Self {
        self.super_class = Some(super_class);
        self
    }

    /// Add an implemented interface.
    pub fn with_interface(mut self, interface: ClassId) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Add a property.
    pub fn with_property(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.properties.push(PropertyDef::new(name, ty));
        self
    }

    /// Set class flags.
    pub fn with_flags(mut self, flags: ClassFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Mark as declared by native host code.
    pub fn native(self) -> Self {
        self.with_flags(ClassFlags::NATIVE)
    }

    /// Whether this is a struct.
    pub fn is_struct(&self) -> bool {
        self.kind == ClassKind::Struct
    }

    /// Whether this is an interface.
    pub fn is_interface(&self) -> bool {
        self.kind == ClassKind::Interface
    }

    /// Whether this type was declared by native host code.
    pub fn is_native(&self) -> bool {
        self.flags.contains(ClassFlags::NATIVE)
    }

    /// Find a property declared directly on this type.
    pub fn find_property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a function declared directly on this type.
    pub fn find_local_function(&self, name: &str) -> Option<FunctionId> {
        self.function_map.get(name).copied()
    }

    /// Functions declared on this type, in registration order.
    pub fn functions(&self) -> &[FunctionId] {
        &self.children
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("super_class", &self.super_class)
            .field("size", &self.size)
            .field("properties", &self.properties.len())
            .field("functions", &self.children.len())
            .finish_non_exhaustive()
    }
}
