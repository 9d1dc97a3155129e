//! The reflected host.
//!
//! [`Host`] owns every class, function, and object plus the memory they live
//! in. It is the single source of truth the bridge reflects over: descriptors
//! elsewhere hold only generational handles into it and re-validate them
//! before use.
//!
//! # Thread Safety
//!
//! `Host` is `Send` but not internally synchronized. The embedding context
//! owns it and drives it from one thread.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::arena::Arena;
use crate::builtin::{self, Builtins};
use crate::{
    ClassDef, ClassFlags, ClassId, ClassKind, FunctionDef, FunctionFlags, FunctionId, HostAddr,
    HostError, Memory, ObjectHandle, PropertyDef, RegionId, TypeHash,
};

/// Where a network-routed call should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Callspace {
    /// Run on this machine.
    #[default]
    Local,
    /// Forward to the remote peer.
    Remote,
    /// Run here and forward.
    Both,
    /// Drop the call.
    Absorbed,
}

impl Callspace {
    /// Whether the call should run locally.
    pub fn is_local(self) -> bool {
        matches!(self, Callspace::Local | Callspace::Both)
    }

    /// Whether the call should be forwarded.
    pub fn is_remote(self) -> bool {
        matches!(self, Callspace::Remote | Callspace::Both)
    }
}

/// A call forwarded to the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Target object.
    pub object: ObjectHandle,
    /// Function invoked.
    pub function: FunctionId,
    /// Snapshot of the parameter block.
    pub payload: Vec<u8>,
}

/// A live host object.
#[derive(Debug, Clone)]
pub struct ObjectData {
    /// Object class.
    pub class: ClassId,
    /// Instance storage.
    pub region: RegionId,
    /// Display name.
    pub name: String,
    /// Routing for network functions.
    pub callspace: Callspace,
}

/// The reflected host: classes, functions, objects, and memory.
#[derive(Debug)]
pub struct Host {
    classes: Arena<ClassId, ClassDef>,
    /// Class lookup by name hash.
    class_index: FxHashMap<TypeHash, ClassId>,
    functions: Arena<FunctionId, FunctionDef>,
    objects: Arena<ObjectHandle, ObjectData>,
    memory: Memory,
    remote_calls: Vec<RemoteCall>,
    builtins: Builtins,
}

impl Host {
    /// Create a host with the built-in `Object` and `LatentActionInfo` types.
    pub fn new() -> Self {
        let mut host = Self {
            classes: Arena::new(),
            class_index: FxHashMap::default(),
            functions: Arena::new(),
            objects: Arena::new(),
            memory: Memory::new(),
            remote_calls: Vec::new(),
            builtins: Builtins::default(),
        };
        host.builtins = builtin::install(&mut host);
        host
    }

    /// Raw memory.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Mutable raw memory.
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// The root `Object` class.
    pub fn object_class(&self) -> ClassId {
        self.builtins.object
    }

    /// The `LatentActionInfo` struct.
    pub fn latent_action_info(&self) -> ClassId {
        self.builtins.latent_action_info
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Register a class, struct, or interface, assigning its field layout.
    ///
    /// Classes get a default object unless they are abstract.
    pub fn register_class(&mut self, mut def: ClassDef) -> Result<ClassId, HostError> {
        if self.class_index.contains_key(&def.hash) {
            return Err(HostError::DuplicateClass(def.name));
        }

        let (mut cursor, mut align) = match def.super_class {
            Some(parent) => {
                let parent = self.classes.get(parent).ok_or(HostError::StaleClass(parent))?;
                (parent.size, parent.align)
            }
            None => (0, 1),
        };
        for prop in &mut def.properties {
            let field_align = self.align_of(&prop.ty)?;
            let field_size = self.size_of(&prop.ty)?;
            cursor = align_up(cursor, field_align);
            prop.offset = cursor;
            cursor += field_size;
            align = align.max(field_align);
        }
        def.size = align_up(cursor, align);
        def.align = align;

        let wants_default =
            def.kind == ClassKind::Class && !def.flags.contains(ClassFlags::ABSTRACT);
        let id = self.insert_class(def);
        if wants_default {
            let cdo = self.new_object_unchecked(id, "Default__")?;
            if let Some(class) = self.classes.get_mut(id) {
                class.default_object = Some(cdo);
            }
        }
        Ok(id)
    }

    /// Insert a class whose layout is already final.
    pub(crate) fn insert_class(&mut self, def: ClassDef) -> ClassId {
        let hash = def.hash;
        let id = self.classes.insert(def);
        self.class_index.insert(hash, id);
        id
    }

    /// Remove a class together with its functions and default object.
    ///
    /// Handles to the class and its functions become stale.
    pub fn unregister_class(&mut self, id: ClassId) -> bool {
        let Some(default_object) = self.classes.get(id).map(|c| c.default_object) else {
            return false;
        };
        if let Some(cdo) = default_object
            && let Err(err) = self.destroy_object(cdo)
        {
            warn!(target: "refbridge::host", %err, "failed to destroy default object");
        }
        let Some(def) = self.classes.remove(id) else {
            return false;
        };
        self.class_index.remove(&def.hash);
        for function in def.children {
            self.functions.remove(function);
        }
        debug!(target: "refbridge::host", class = %def.name, "class unregistered");
        true
    }

    /// Get a class.
    pub fn class(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get(id)
    }

    /// Get a class or fail with [`HostError::StaleClass`].
    pub fn try_class(&self, id: ClassId) -> Result<&ClassDef, HostError> {
        self.classes.get(id).ok_or(HostError::StaleClass(id))
    }

    /// Find a class by name.
    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.class_index.get(&TypeHash::from_name(name)).copied()
    }

    /// Whether a class handle is still registered.
    pub fn is_class_live(&self, id: ClassId) -> bool {
        self.classes.contains(id)
    }

    /// Number of registered classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// The class and its ancestors, most-derived first.
    pub fn super_chain(&self, class: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(id) = current {
            let Some(def) = self.classes.get(id) else {
                break;
            };
            chain.push(id);
            current = def.super_class;
        }
        chain
    }

    /// Whether `class` is `ancestor` or derives from it.
    pub fn is_child_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.super_chain(class).contains(&ancestor)
    }

    /// Whether `class` or an ancestor implements `interface`.
    pub fn implements(&self, class: ClassId, interface: ClassId) -> bool {
        self.super_chain(class).into_iter().any(|id| {
            self.classes.get(id).is_some_and(|def| {
                def.interfaces
                    .iter()
                    .any(|i| *i == interface || self.is_child_of(*i, interface))
            })
        })
    }

    /// Find a property on a class or its ancestors.
    ///
    /// Returns the declaring class alongside the property.
    pub fn find_property(&self, class: ClassId, name: &str) -> Option<(ClassId, &PropertyDef)> {
        self.super_chain(class).into_iter().find_map(|id| {
            self.classes
                .get(id)
                .and_then(|def| def.find_property(name))
                .map(|prop| (id, prop))
        })
    }

    /// Every property of a class including inherited ones, base first.
    pub fn all_properties(&self, class: ClassId) -> Vec<PropertyDef> {
        let mut chain = self.super_chain(class);
        chain.reverse();
        chain
            .into_iter()
            .filter_map(|id| self.classes.get(id))
            .flat_map(|def| def.properties.iter().cloned())
            .collect()
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Add a function to a class, laying out its parameter block.
    ///
    /// A function with the same name already declared on the class is
    /// shadowed in the name table but stays registered.
    pub fn add_function(&mut self, class: ClassId, mut def: FunctionDef) -> Result<FunctionId, HostError> {
        if !self.classes.contains(class) {
            return Err(HostError::StaleClass(class));
        }

        let mut cursor = 0;
        let mut align = 1;
        for param in &mut def.params {
            let param_align = self.align_of(&param.ty)?;
            cursor = align_up(cursor, param_align);
            param.offset = cursor;
            cursor += self.size_of(&param.ty)?;
            align = align.max(param_align);
        }
        def.params_size = align_up(cursor, align);
        def.params_align = align;
        def.owner = class;
        if self.classes.get(class).is_some_and(|c| c.is_interface()) {
            def.flags |= FunctionFlags::INTERFACE;
        }

        let name = def.name.clone();
        let id = self.functions.insert(def);
        if let Some(owner) = self.classes.get_mut(class) {
            owner.function_map.insert(name, id);
            owner.children.push(id);
        }
        Ok(id)
    }

    /// Get a function.
    pub fn function(&self, id: FunctionId) -> Option<&FunctionDef> {
        self.functions.get(id)
    }

    /// Get a function mutably.
    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut FunctionDef> {
        self.functions.get_mut(id)
    }

    /// Get a function or fail with [`HostError::StaleFunction`].
    pub fn try_function(&self, id: FunctionId) -> Result<&FunctionDef, HostError> {
        self.functions.get(id).ok_or(HostError::StaleFunction(id))
    }

    /// Whether a function handle is still registered.
    pub fn is_function_live(&self, id: FunctionId) -> bool {
        self.functions.contains(id)
    }

    /// Number of registered functions.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Find a function by name on a class or its ancestors, most-derived first.
    pub fn find_function(&self, class: ClassId, name: &str) -> Option<FunctionId> {
        self.super_chain(class).into_iter().find_map(|id| {
            self.classes
                .get(id)
                .and_then(|def| def.find_local_function(name))
        })
    }

    /// Rename a function, updating its owner's name table.
    pub fn rename_function(&mut self, id: FunctionId, new_name: &str) -> Result<(), HostError> {
        let def = self.functions.get_mut(id).ok_or(HostError::StaleFunction(id))?;
        let old_name = std::mem::replace(&mut def.name, new_name.to_string());
        let owner = def.owner;
        if let Some(class) = self.classes.get_mut(owner) {
            if class.function_map.get(&old_name) == Some(&id) {
                class.function_map.remove(&old_name);
            }
            class.function_map.insert(new_name.to_string(), id);
        }
        Ok(())
    }

    /// Remove a function from its owner and from the function table.
    pub fn remove_function(&mut self, id: FunctionId) -> Option<FunctionDef> {
        let def = self.functions.remove(id)?;
        if let Some(class) = self.classes.get_mut(def.owner) {
            if class.function_map.get(&def.name) == Some(&id) {
                class.function_map.remove(&def.name);
            }
            class.children.retain(|f| *f != id);
        }
        Some(def)
    }

    /// Allocate a zeroed parameter block for a function.
    pub fn alloc_params(&mut self, function: FunctionId) -> Result<HostAddr, HostError> {
        let size = self.try_function(function)?.params_size;
        Ok(HostAddr::base(self.memory.alloc(size.max(1))))
    }

    /// Destroy every parameter in a block and free it.
    pub fn free_params(&mut self, function: FunctionId, params: HostAddr) -> Result<(), HostError> {
        let defs = self.try_function(function)?.params.clone();
        for param in &defs {
            self.destroy_value(&param.ty, params.at(param.offset))?;
        }
        self.memory.free(params.region);
        Ok(())
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Create an object of a class.
    pub fn new_object(&mut self, class: ClassId, name: impl Into<String>) -> Result<ObjectHandle, HostError> {
        let def = self.try_class(class)?;
        if def.kind != ClassKind::Class || def.flags.contains(ClassFlags::ABSTRACT) {
            return Err(HostError::NotInstantiable(def.name.clone()));
        }
        self.new_object_unchecked(class, name)
    }

    fn new_object_unchecked(&mut self, class: ClassId, name: impl Into<String>) -> Result<ObjectHandle, HostError> {
        let size = self.try_class(class)?.size;
        let region = self.memory.alloc(size.max(1));
        Ok(self.objects.insert(ObjectData {
            class,
            region,
            name: name.into(),
            callspace: Callspace::Local,
        }))
    }

    /// Destroy an object, releasing its fields. Handles to it become stale.
    pub fn destroy_object(&mut self, handle: ObjectHandle) -> Result<bool, HostError> {
        let Some(data) = self.objects.get(handle) else {
            return Ok(false);
        };
        let (class, region) = (data.class, data.region);
        for prop in self.all_properties(class) {
            self.destroy_value(&prop.ty, HostAddr::new(region, prop.offset))?;
        }
        self.objects.remove(handle);
        self.memory.free(region);
        Ok(true)
    }

    /// Whether an object is alive.
    pub fn is_valid(&self, handle: ObjectHandle) -> bool {
        self.objects.contains(handle)
    }

    /// Get an object's data.
    pub fn object(&self, handle: ObjectHandle) -> Option<&ObjectData> {
        self.objects.get(handle)
    }

    /// The class of a live object.
    pub fn class_of(&self, handle: ObjectHandle) -> Option<ClassId> {
        self.objects.get(handle).map(|o| o.class)
    }

    /// Base address of a live object's storage.
    pub fn object_addr(&self, handle: ObjectHandle) -> Result<HostAddr, HostError> {
        self.objects
            .get(handle)
            .map(|o| HostAddr::base(o.region))
            .ok_or(HostError::StaleObject(handle))
    }

    /// The default object of a class.
    pub fn default_object(&self, class: ClassId) -> Option<ObjectHandle> {
        self.classes.get(class).and_then(|c| c.default_object)
    }

    /// Number of live objects, including default objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Set how network functions on an object are routed.
    pub fn set_callspace(&mut self, handle: ObjectHandle, callspace: Callspace) -> Result<(), HostError> {
        let data = self
            .objects
            .get_mut(handle)
            .ok_or(HostError::StaleObject(handle))?;
        data.callspace = callspace;
        Ok(())
    }

    /// Routing for a call of `function` on `object`.
    ///
    /// Functions that are not network-routed always run locally.
    pub fn function_callspace(&self, object: ObjectHandle, function: FunctionId) -> Callspace {
        let is_net = self.functions.get(function).is_some_and(|f| f.is_net());
        if !is_net {
            return Callspace::Local;
        }
        self.objects
            .get(object)
            .map(|o| o.callspace)
            .unwrap_or(Callspace::Absorbed)
    }

    /// Forward a call to the remote peer by snapshotting its parameter block.
    pub fn call_remote(&mut self, object: ObjectHandle, function: FunctionId, params: HostAddr) -> Result<(), HostError> {
        let size = self.try_function(function)?.params_size;
        let payload = self.memory.bytes(params, size)?.to_vec();
        debug!(target: "refbridge::host", ?object, ?function, "remote call queued");
        self.remote_calls.push(RemoteCall {
            object,
            function,
            payload,
        });
        Ok(())
    }

    /// Calls forwarded so far.
    pub fn remote_calls(&self) -> &[RemoteCall] {
        &self.remote_calls
    }

    /// Drain forwarded calls.
    pub fn take_remote_calls(&mut self) -> Vec<RemoteCall> {
        std::mem::take(&mut self.remote_calls)
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

/// Round `value` up to a multiple of `align`.
#[inline]
pub fn align_up(value: u32, align: u32) -> u32 {
    let align = align.max(1);
    value.div_ceil(align) * align
}
