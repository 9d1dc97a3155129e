//! Property types and definitions.
//!
//! A [`PropertyType`] describes what lives at an address; a [`PropertyDef`]
//! places one inside a class layout or a function's parameter block.
//!
//! # Storage
//!
//! | Kind | Bytes | Representation |
//! |------|-------|----------------|
//! | integers, floats, bool, enum | natural width | little-endian |
//! | string, text | 8 | packed [`StrId`](crate::StrId), `0` = empty |
//! | name | 8 | [`NameId`](crate::NameId) |
//! | object, interface | 8 | packed [`ObjectHandle`](crate::ObjectHandle), `0` = null |
//! | class reference | 8 | packed [`ClassId`](crate::ClassId) |
//! | struct | class size | inline fields |
//! | array, set, map | 8 | packed [`ContainerId`](crate::ContainerId), `0` = empty |
//! | delegate | 16 | object handle, then function name |
//! | multicast delegate | 8 | packed [`MulticastId`](crate::MulticastId), `0` = empty |
//!
//! All-zero bytes are a valid empty value for every kind.

use bitflags::bitflags;

use crate::{ClassId, FunctionId};

/// Width and signedness of an integer property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl IntKind {
    /// Size in bytes.
    pub const fn size(self) -> u32 {
        match self {
            IntKind::I8 | IntKind::U8 => 1,
            IntKind::I16 | IntKind::U16 => 2,
            IntKind::I32 | IntKind::U32 => 4,
            IntKind::I64 | IntKind::U64 => 8,
        }
    }

    /// Whether the kind is signed.
    pub const fn is_signed(self) -> bool {
        matches!(self, IntKind::I8 | IntKind::I16 | IntKind::I32 | IntKind::I64)
    }
}

/// Width of a floating point property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F32,
    F64,
}

impl FloatKind {
    /// Size in bytes.
    pub const fn size(self) -> u32 {
        match self {
            FloatKind::F32 => 4,
            FloatKind::F64 => 8,
        }
    }
}

/// How an object property holds its referent.
///
/// All variants share the same storage; a destroyed referent reads as null
/// regardless of strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReferenceKind {
    #[default]
    Strong,
    Weak,
    Soft,
    Lazy,
}

/// The type of a value in host memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Int(IntKind),
    Float(FloatKind),
    Bool,
    /// Enumeration stored as its underlying integer.
    Enum {
        name: String,
        underlying: IntKind,
    },
    Str,
    Name,
    Text,
    /// Reference to an object of `class` or a subclass.
    Object {
        class: ClassId,
        reference: ReferenceKind,
    },
    /// Reference to a class deriving from `meta_class`.
    Class { meta_class: ClassId },
    /// Reference to an object implementing the interface `class`.
    Interface { class: ClassId },
    /// Struct stored inline.
    Struct { class: ClassId },
    Array(Box<PropertyType>),
    Set(Box<PropertyType>),
    Map(Box<PropertyType>, Box<PropertyType>),
    /// Single-cast delegate with the given signature function.
    Delegate { signature: FunctionId },
    /// Multicast delegate with the given signature function.
    MulticastDelegate { signature: FunctionId },
}

impl PropertyType {
    /// Shorthand for a 32-bit signed integer.
    pub const fn int32() -> Self {
        PropertyType::Int(IntKind::I32)
    }

    /// Shorthand for a strong object reference.
    pub const fn object(class: ClassId) -> Self {
        PropertyType::Object {
            class,
            reference: ReferenceKind::Strong,
        }
    }

    /// Shorthand for an array of `inner`.
    pub fn array(inner: PropertyType) -> Self {
        PropertyType::Array(Box::new(inner))
    }

    /// Shorthand for a set of `inner`.
    pub fn set(inner: PropertyType) -> Self {
        PropertyType::Set(Box::new(inner))
    }

    /// Shorthand for a map from `key` to `value`.
    pub fn map(key: PropertyType, value: PropertyType) -> Self {
        PropertyType::Map(Box::new(key), Box::new(value))
    }

    /// Short lowercase kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PropertyType::Int(_) => "integer",
            PropertyType::Float(_) => "float",
            PropertyType::Bool => "bool",
            PropertyType::Enum { .. } => "enum",
            PropertyType::Str => "string",
            PropertyType::Name => "name",
            PropertyType::Text => "text",
            PropertyType::Object { .. } => "object",
            PropertyType::Class { .. } => "class",
            PropertyType::Interface { .. } => "interface",
            PropertyType::Struct { .. } => "struct",
            PropertyType::Array(_) => "array",
            PropertyType::Set(_) => "set",
            PropertyType::Map(_, _) => "map",
            PropertyType::Delegate { .. } => "delegate",
            PropertyType::MulticastDelegate { .. } => "multicast delegate",
        }
    }

    /// Whether the kind owns resources beyond its inline bytes.
    ///
    /// Structs answer `false` here; whether a struct needs destruction
    /// depends on its fields, see [`Host::needs_destroy`](crate::Host::needs_destroy).
    pub fn owns_storage(&self) -> bool {
        matches!(
            self,
            PropertyType::Str
                | PropertyType::Text
                | PropertyType::Array(_)
                | PropertyType::Set(_)
                | PropertyType::Map(_, _)
                | PropertyType::MulticastDelegate { .. }
        )
    }
}

bitflags! {
    /// Flags describing how a property participates in a function signature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PropertyFlags: u32 {
        /// Function parameter.
        const PARAM = 1 << 0;
        /// Written by the callee.
        const OUT = 1 << 1;
        /// Passed by reference.
        const REFERENCE = 1 << 2;
        /// Read-only.
        const CONST = 1 << 3;
        /// Function return slot.
        const RETURN = 1 << 4;
    }
}

/// A property placed at an offset inside a class or parameter block.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Value type.
    pub ty: PropertyType,
    /// Byte offset from the start of the owning storage. Assigned at registration.
    pub offset: u32,
    /// Parameter flags.
    pub flags: PropertyFlags,
}

impl PropertyDef {
    /// Create a plain property. The offset is assigned at registration.
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            name: name.into(),
            ty,
            offset: 0,
            flags: PropertyFlags::empty(),
        }
    }

    /// Create a property carrying the given flags.
    pub fn with_flags(name: impl Into<String>, ty: PropertyType, flags: PropertyFlags) -> Self {
        Self {
            name: name.into(),
            ty,
            offset: 0,
            flags,
        }
    }

    /// Whether this is the return slot.
    pub fn is_return(&self) -> bool {
        self.flags.contains(PropertyFlags::RETURN)
    }

    /// Whether the callee writes this parameter.
    pub fn is_out(&self) -> bool {
        self.flags.contains(PropertyFlags::OUT)
    }

    /// Whether this is a const reference: passed by reference but never written back.
    pub fn is_const_ref(&self) -> bool {
        self.flags.contains(PropertyFlags::REFERENCE | PropertyFlags::CONST)
    }

    /// Whether the caller should see this parameter's value after the call.
    pub fn is_non_const_out(&self) -> bool {
        (self.is_out() || self.flags.contains(PropertyFlags::REFERENCE))
            && !self.flags.contains(PropertyFlags::CONST)
            && !self.is_return()
    }
}
