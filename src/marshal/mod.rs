//! Property marshaling between host memory and script values.
//!
//! A [`PropertyDescriptor`] knows one property's name, offset and kind, plus
//! descriptors for the element, key and value types of containers. It reads
//! host memory into a [`ScriptValue`] and writes script values back.
//!
//! ## Reading
//!
//! Scalars, strings, names and references read as plain script values.
//! Structs, containers and delegates read as userdata: an alias of the host
//! memory, or with `create_copy` an owned copy.
//!
//! ## Writing
//!
//! Writes always deep-copy into the destination. When type checking is on, a
//! value that does not match the declared kind is reported as a
//! [`BridgeError::TypeMismatch`](crate::BridgeError::TypeMismatch) and
//! converted on a best-effort basis.

mod read;
mod write;

use refbridge_core::{IntKind, PropertyDef, PropertyFlags, PropertyType};

/// Marshals one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    /// Offset from the start of the owning object, struct or parameter block.
    pub offset: u32,
    pub flags: PropertyFlags,
    pub ty: PropertyType,
    elements: Vec<PropertyDescriptor>,
}

impl PropertyDescriptor {
    /// Build a descriptor for a reflected property.
    pub fn new(def: &PropertyDef) -> Self {
        Self::from_parts(&def.name, def.offset, def.flags, def.ty.clone())
    }

    /// Build a descriptor for a value of `ty` at offset zero.
    pub fn for_type(name: impl Into<String>, ty: PropertyType) -> Self {
        Self::from_parts(&name.into(), 0, PropertyFlags::empty(), ty)
    }

    fn from_parts(name: &str, offset: u32, flags: PropertyFlags, ty: PropertyType) -> Self {
        let elements = match &ty {
            PropertyType::Array(inner) | PropertyType::Set(inner) => {
                vec![Self::for_type(format!("{name}.Element"), (**inner).clone())]
            }
            PropertyType::Map(key, value) => vec![
                Self::for_type(format!("{name}.Key"), (**key).clone()),
                Self::for_type(format!("{name}.Value"), (**value).clone()),
            ],
            _ => Vec::new(),
        };
        Self {
            name: name.to_string(),
            offset,
            flags,
            ty,
            elements,
        }
    }

    /// Element descriptor of an array or set, or the key of a map.
    pub fn element(&self) -> Option<&PropertyDescriptor> {
        self.elements.first()
    }

    /// Value descriptor of a map.
    pub fn value(&self) -> Option<&PropertyDescriptor> {
        self.elements.get(1)
    }

    /// Whether this kind is boxed as userdata when read.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self.ty,
            PropertyType::Struct { .. }
                | PropertyType::Array(_)
                | PropertyType::Set(_)
                | PropertyType::Map(_, _)
                | PropertyType::Delegate { .. }
                | PropertyType::MulticastDelegate { .. }
        )
    }

    pub fn is_return(&self) -> bool {
        self.flags.contains(PropertyFlags::RETURN)
    }

    pub fn is_out(&self) -> bool {
        self.flags.contains(PropertyFlags::OUT)
    }

    /// Written by the callee and copied back to the caller.
    pub fn is_non_const_out(&self) -> bool {
        (self.flags.contains(PropertyFlags::OUT) || self.flags.contains(PropertyFlags::REFERENCE))
            && !self.flags.contains(PropertyFlags::CONST)
            && !self.flags.contains(PropertyFlags::RETURN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_carry_element_descriptors() {
        let map = PropertyDescriptor::for_type(
            "Scores",
            PropertyType::map(PropertyType::Str, PropertyType::array(PropertyType::int32())),
        );
        assert_eq!(map.element().unwrap().ty, PropertyType::Str);
        let value = map.value().unwrap();
        assert_eq!(value.element().unwrap().ty, PropertyType::int32());
        assert!(map.is_aggregate());
        assert!(!value.element().unwrap().is_aggregate());
    }

    #[test]
    fn out_classification() {
        let def = PropertyDef::with_flags(
            "b",
            PropertyType::int32(),
            PropertyFlags::PARAM | PropertyFlags::OUT,
        );
        assert!(PropertyDescriptor::new(&def).is_non_const_out());

        let const_ref = PropertyDef::with_flags(
            "c",
            PropertyType::int32(),
            PropertyFlags::PARAM | PropertyFlags::OUT | PropertyFlags::REFERENCE | PropertyFlags::CONST,
        );
        assert!(!PropertyDescriptor::new(&const_ref).is_non_const_out());

        let ret = PropertyDef::with_flags(
            "ReturnValue",
            PropertyType::int32(),
            PropertyFlags::PARAM | PropertyFlags::OUT | PropertyFlags::RETURN,
        );
        assert!(!PropertyDescriptor::new(&ret).is_non_const_out());
    }
}
