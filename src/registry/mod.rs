//! Descriptor registry.
//!
//! [`Registry`] caches what the bridge knows about host types: one
//! [`TypeDescriptor`] per type name with its lazily resolved fields, plus a
//! side-table from host function to [`FunctionDescriptor`]. Descriptors hold
//! only generational handles into the host and are re-validated on access;
//! a descriptor whose host entity went away is evicted and rebuilt from the
//! name if the host has a replacement.
//!
//! Failed resolutions are never cached, so a type registered later resolves
//! on the next lookup.
//!
//! # Thread Safety
//!
//! `Registry` is owned by an [`Env`](crate::Env) and is not thread-safe.

mod defaults;
mod type_descriptor;

use std::rc::Rc;

use refbridge_core::{ClassId, FunctionId, Host};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::bridge::FunctionDescriptor;
use crate::marshal::PropertyDescriptor;
use crate::{BridgeError, BridgeResult};

pub use defaults::{DefaultParams, DefaultValue};
pub use type_descriptor::{
    FieldDescriptor, FieldKind, TypeDescriptor, USERDATA_HEADER, userdata_padding,
};

/// Type and function descriptor cache.
#[derive(Debug, Default)]
pub struct Registry {
    types: FxHashMap<String, TypeDescriptor>,
    functions: FxHashMap<FunctionId, Rc<FunctionDescriptor>>,
    defaults: DefaultParams,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Types
    // =========================================================================

    fn is_current(host: &Host, desc: &TypeDescriptor) -> bool {
        host.class(desc.class()).is_some_and(|def| def.name == desc.name())
    }

    fn ensure_type(&mut self, host: &Host, name: &str) -> BridgeResult<()> {
        if let Some(desc) = self.types.get(name) {
            if Self::is_current(host, desc) {
                return Ok(());
            }
            warn!(target: "refbridge::registry", type_name = name, "evicting stale type descriptor");
            self.types.remove(name);
        }
        let class = host
            .find_class(name)
            .ok_or_else(|| BridgeError::unresolved(name))?;
        let desc = TypeDescriptor::new(host.try_class(class)?, class);
        debug!(target: "refbridge::registry", type_name = name, ?class, "type descriptor created");
        self.types.insert(name.to_string(), desc);
        Ok(())
    }

    /// Find or create the descriptor for a type name.
    pub fn resolve(&mut self, host: &Host, name: &str) -> BridgeResult<&TypeDescriptor> {
        self.ensure_type(host, name)?;
        self.types
            .get(name)
            .ok_or_else(|| BridgeError::unresolved(name))
    }

    /// Find or create the descriptor for a host class.
    pub fn resolve_class(&mut self, host: &Host, class: ClassId) -> BridgeResult<&TypeDescriptor> {
        let name = host
            .class(class)
            .map(|def| def.name.clone())
            .ok_or_else(|| BridgeError::stale(format!("class {class:?}")))?;
        self.resolve(host, &name)
    }

    /// Cached descriptor, without resolving or validating.
    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    /// Take a reference on a type descriptor, returning the new count.
    pub fn acquire(&mut self, host: &Host, name: &str) -> BridgeResult<u32> {
        self.ensure_type(host, name)?;
        let desc = self
            .types
            .get_mut(name)
            .ok_or_else(|| BridgeError::unresolved(name))?;
        desc.ref_count += 1;
        Ok(desc.ref_count)
    }

    /// Drop a reference. Returns true if the descriptor was discarded, which
    /// happens when the count reaches zero for a non-native type.
    pub fn release(&mut self, name: &str) -> bool {
        let Some(desc) = self.types.get_mut(name) else {
            return false;
        };
        desc.ref_count = desc.ref_count.saturating_sub(1);
        if desc.ref_count == 0 && !desc.is_native() {
            self.types.remove(name);
            debug!(target: "refbridge::registry", type_name = name, "type descriptor released");
            return true;
        }
        false
    }

    /// Type names from `name` up to the root, most-derived first.
    pub fn inheritance_chain(&mut self, host: &Host, name: &str) -> BridgeResult<Vec<String>> {
        let class = self.resolve(host, name)?.class();
        let mut chain = Vec::new();
        for ancestor in host.super_chain(class) {
            chain.push(self.resolve_class(host, ancestor)?.name().to_string());
        }
        Ok(chain)
    }

    /// Number of cached type descriptors.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Resolve a property or function by name on a type.
    ///
    /// A field declared on an ancestor is resolved on, and cached by, that
    /// ancestor; the returned descriptor is marked as inherited.
    pub fn register_field(&mut self, host: &Host, type_name: &str, field: &str) -> BridgeResult<FieldDescriptor> {
        self.ensure_type(host, type_name)?;
        let desc = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| BridgeError::unresolved(type_name))?;
        let class = desc.class();

        if let Some(cached) = desc.fields.get(field) {
            let current = match cached.kind {
                FieldKind::Property => true,
                FieldKind::Function => desc.functions.get(cached.index).is_some_and(|f| {
                    host.is_function_live(*f) && host.find_function(class, field) == Some(*f)
                }),
            };
            if current {
                return Ok(cached.clone());
            }
            desc.fields.remove(field);
        }

        if let Some((owner, prop)) = host.find_property(class, field) {
            if owner != class {
                return self.register_inherited(host, owner, field);
            }
            desc.properties.push(Rc::new(PropertyDescriptor::new(prop)));
            let resolved = FieldDescriptor {
                owner: type_name.to_string(),
                kind: FieldKind::Property,
                index: desc.properties.len() - 1,
                inherited: false,
            };
            desc.fields.insert(field.to_string(), resolved.clone());
            return Ok(resolved);
        }

        if let Some(function) = host.find_function(class, field) {
            let owner = host.try_function(function)?.owner;
            if owner != class {
                return self.register_inherited(host, owner, field);
            }
            desc.functions.push(function);
            let resolved = FieldDescriptor {
                owner: type_name.to_string(),
                kind: FieldKind::Function,
                index: desc.functions.len() - 1,
                inherited: false,
            };
            desc.fields.insert(field.to_string(), resolved.clone());
            return Ok(resolved);
        }

        Err(BridgeError::unresolved(format!("{type_name}.{field}")))
    }

    fn register_inherited(&mut self, host: &Host, owner: ClassId, field: &str) -> BridgeResult<FieldDescriptor> {
        let owner_name = host.try_class(owner)?.name.clone();
        let mut resolved = self.register_field(host, &owner_name, field)?;
        resolved.inherited = true;
        Ok(resolved)
    }

    /// The property a field descriptor refers to.
    pub fn field_property(&self, field: &FieldDescriptor) -> Option<Rc<PropertyDescriptor>> {
        if field.kind != FieldKind::Property {
            return None;
        }
        self.types.get(&field.owner)?.properties.get(field.index).cloned()
    }

    /// The function a field descriptor refers to.
    pub fn field_function(&self, field: &FieldDescriptor) -> Option<FunctionId> {
        if field.kind != FieldKind::Function {
            return None;
        }
        self.types.get(&field.owner)?.functions.get(field.index).copied()
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Find or create the descriptor for a host function.
    pub fn register_function(&mut self, host: &mut Host, function: FunctionId) -> BridgeResult<Rc<FunctionDescriptor>> {
        if let Some(desc) = self.functions.get(&function) {
            if host.is_function_live(function) {
                return Ok(Rc::clone(desc));
            }
            self.unregister_function(host, function);
        }
        let desc = Rc::new(FunctionDescriptor::new(host, function, &self.defaults)?);
        debug!(target: "refbridge::registry", function = desc.name(), "function descriptor created");
        self.functions.insert(function, Rc::clone(&desc));
        Ok(desc)
    }

    /// The cached descriptor for a function, if one was registered.
    pub fn function_descriptor(&self, function: FunctionId) -> Option<Rc<FunctionDescriptor>> {
        self.functions.get(&function).cloned()
    }

    /// Drop a function descriptor and its persistent buffer.
    pub fn unregister_function(&mut self, host: &mut Host, function: FunctionId) -> bool {
        match self.functions.remove(&function) {
            Some(desc) => {
                desc.release_buffer(host);
                true
            }
            None => false,
        }
    }

    /// Number of cached function descriptors.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    // =========================================================================
    // Defaults and lifecycle
    // =========================================================================

    /// Registered default parameter values.
    pub fn defaults(&self) -> &DefaultParams {
        &self.defaults
    }

    /// Mutable default parameter values. Descriptors built before a change
    /// keep the defaults they were built with.
    pub fn defaults_mut(&mut self) -> &mut DefaultParams {
        &mut self.defaults
    }

    /// Evict every descriptor whose host entity is gone. Returns how many.
    pub fn evict_stale(&mut self, host: &mut Host) -> usize {
        let stale_types: Vec<String> = self
            .types
            .iter()
            .filter(|(_, desc)| !Self::is_current(host, desc))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale_types {
            self.types.remove(name);
        }
        let stale_functions: Vec<FunctionId> = self
            .functions
            .keys()
            .filter(|f| !host.is_function_live(**f))
            .copied()
            .collect();
        for function in &stale_functions {
            self.unregister_function(host, *function);
        }
        let evicted = stale_types.len() + stale_functions.len();
        if evicted > 0 {
            debug!(target: "refbridge::registry", evicted, "stale descriptors evicted");
        }
        evicted
    }

    /// Drop every descriptor and release persistent buffers.
    pub fn teardown(&mut self, host: &mut Host) {
        for (_, desc) in self.functions.drain() {
            desc.release_buffer(host);
        }
        self.types.clear();
    }
}
