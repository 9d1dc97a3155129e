//! Host function definitions.
//!
//! A function's parameters, including the return slot, live in one
//! contiguous parameter block laid out by
//! [`Host::add_function`](crate::Host::add_function). Dispatch runs the
//! `native` entry when one is installed, otherwise the `body`, otherwise
//! nothing.

use std::fmt;

use bitflags::bitflags;

use crate::{ClassId, NativeFn, PropertyDef, PropertyFlags, PropertyType};

/// Name given to the return slot.
pub const RETURN_VALUE_NAME: &str = "ReturnValue";

bitflags! {
    /// Function-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FunctionFlags: u32 {
        /// Implemented by native host code.
        const NATIVE = 1 << 0;
        /// Called without an instance; dispatch uses the class default object.
        const STATIC = 1 << 1;
        /// Network-routed; the callspace decides between local and remote.
        const NET = 1 << 2;
        /// Host event.
        const EVENT = 1 << 3;
        /// Event whose body may be supplied by script content.
        const SCRIPT_EVENT = 1 << 4;
        /// Has at least one out or reference parameter.
        const HAS_OUT_PARAMS = 1 << 5;
        /// Completes asynchronously through a latent action info parameter.
        const LATENT = 1 << 6;
        /// Declared on an interface.
        const INTERFACE = 1 << 7;
        /// Delegate signature template.
        const DELEGATE = 1 << 8;
    }
}

/// A registered host function.
#[derive(Clone)]
pub struct FunctionDef {
    /// Function name.
    pub name: String,
    /// Declaring type.
    pub owner: ClassId,
    /// Function flags.
    pub flags: FunctionFlags,
    /// Parameters in declaration order, including the return slot.
    pub params: Vec<PropertyDef>,
    /// Byte size of the parameter block.
    pub params_size: u32,
    /// Alignment of the parameter block.
    pub params_align: u32,
    /// Native entry point.
    pub native: Option<NativeFn>,
    /// Content-defined body, run when no native entry is installed.
    pub body: Option<NativeFn>,
}

impl FunctionDef {
    /// Start a function definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: ClassId::NULL,
            flags: FunctionFlags::empty(),
            params: Vec::new(),
            params_size: 0,
            params_align: 1,
            native: None,
            body: None,
        }
    }

    /// Add an input parameter.
    pub fn with_param(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.params
            .push(PropertyDef::with_flags(name, ty, PropertyFlags::PARAM));
        self
    }

    /// Add an out parameter.
    pub fn with_out(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.params.push(PropertyDef::with_flags(
            name,
            ty,
            PropertyFlags::PARAM | PropertyFlags::OUT,
        ));
        self.flags |= FunctionFlags::HAS_OUT_PARAMS;
        self
    }

    /// Add a mutable reference parameter.
    pub fn with_ref(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.params.push(PropertyDef::with_flags(
            name,
            ty,
            PropertyFlags::PARAM | PropertyFlags::OUT | PropertyFlags::REFERENCE,
        ));
        self.flags |= FunctionFlags::HAS_OUT_PARAMS;
        self
    }

    /// Add a const reference parameter.
    pub fn with_const_ref(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.params.push(PropertyDef::with_flags(
            name,
            ty,
            PropertyFlags::PARAM | PropertyFlags::OUT | PropertyFlags::REFERENCE | PropertyFlags::CONST,
        ));
        self.flags |= FunctionFlags::HAS_OUT_PARAMS;
        self
    }

    /// Add the return slot.
    pub fn with_return(mut self, ty: PropertyType) -> Self {
        self.params.push(PropertyDef::with_flags(
            RETURN_VALUE_NAME,
            ty,
            PropertyFlags::PARAM | PropertyFlags::OUT | PropertyFlags::RETURN,
        ));
        self
    }

    /// Set function flags.
    pub fn with_flags(mut self, flags: FunctionFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Install a native entry point.
    pub fn with_native(mut self, native: NativeFn) -> Self {
        self.native = Some(native);
        self.flags |= FunctionFlags::NATIVE;
        self
    }

    /// Install a content-defined body.
    pub fn with_body(mut self, body: NativeFn) -> Self {
        self.body = Some(body);
        self
    }

    /// Index of the return slot.
    pub fn return_index(&self) -> Option<usize> {
        self.params.iter().position(|p| p.is_return())
    }

    /// Find a parameter by name.
    pub fn find_param(&self, name: &str) -> Option<(usize, &PropertyDef)> {
        self.params.iter().enumerate().find(|(_, p)| p.name == name)
    }

    /// Whether the function is static.
    pub fn is_static(&self) -> bool {
        self.flags.contains(FunctionFlags::STATIC)
    }

    /// Whether the function is network-routed.
    pub fn is_net(&self) -> bool {
        self.flags.contains(FunctionFlags::NET)
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .field("params", &self.params.len())
            .field("native", &self.native.is_some())
            .field("body", &self.body.is_some())
            .finish_non_exhaustive()
    }
}
