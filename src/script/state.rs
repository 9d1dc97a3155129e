//! Script runtime state owned by the environment.
//!
//! ## Components
//!
//! - **Value stack**: arguments and results of protected calls
//! - **Modules**: script function tables bound to host classes or objects
//! - **Userdata**: boxed host values, owned copies or aliases
//! - **Threads**: continuations parked on latent host calls
//!
//! Calling into script needs the whole [`Env`](crate::Env), so the call
//! entry points live there; this type only holds state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use refbridge_core::arena::Arena;
use refbridge_core::{ClassId, Host, HostAddr, HostError, ObjectHandle, PropertyType, RegionId};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::script::{ModuleId, ScriptFunction, ScriptValue, UserdataId};

// ============================================================================
// Modules
// ============================================================================

/// A table of script functions, optionally chained to a parent module.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    pub name: String,
    pub parent: Option<ModuleId>,
    functions: FxHashMap<String, ScriptFunction>,
}

impl ScriptModule {
    /// Look up a function declared directly on this module.
    pub fn function(&self, name: &str) -> Option<&ScriptFunction> {
        self.functions.get(name)
    }

    /// Names of functions declared directly on this module.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

// ============================================================================
// Userdata
// ============================================================================

/// Where a userdata's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserdataStorage {
    /// A script-owned copy in its own region, after `padding` bytes.
    Owned { region: RegionId, padding: u32 },
    /// A view of host memory the script does not own.
    Alias(HostAddr),
    /// Invalidated; reads and writes through it fail.
    Released,
}

/// A boxed host value.
#[derive(Debug, Clone)]
pub struct Userdata {
    pub ty: PropertyType,
    pub storage: UserdataStorage,
}

// ============================================================================
// Threads
// ============================================================================

/// Identity of a script thread. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// Lifecycle of a script thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    /// Parked on a latent call with a continuation to resume.
    Suspended,
    Dead,
}

#[derive(Debug)]
struct ScriptThread {
    status: ThreadStatus,
    continuation: Option<ScriptFunction>,
}

// ============================================================================
// State
// ============================================================================

/// Script-side state.
#[derive(Debug, Default)]
pub struct ScriptState {
    stack: Vec<ScriptValue>,
    pub(crate) depth: u32,

    modules: Arena<ModuleId, ScriptModule>,
    class_modules: FxHashMap<ClassId, ModuleId>,
    object_modules: FxHashMap<ObjectHandle, ModuleId>,
    resolved: FxHashMap<(ModuleId, String), Option<ScriptFunction>>,

    userdata: Arena<UserdataId, Userdata>,
    alias_cache: FxHashMap<(HostAddr, PropertyType), UserdataId>,
    alias_scopes: Vec<Vec<UserdataId>>,

    threads: FxHashMap<ThreadId, ScriptThread>,
    current_thread: Option<ThreadId>,
    next_thread: u32,
    next_uuid: i32,

    interrupt: Option<Arc<AtomicBool>>,
}

impl ScriptState {
    pub fn new() -> Self {
        Self::default()
    }

    // === Stack ===

    /// Push a value.
    pub fn push(&mut self, value: ScriptValue) {
        self.stack.push(value);
    }

    /// Pop the top value. An empty stack pops nil.
    pub fn pop(&mut self) -> ScriptValue {
        self.stack.pop().unwrap_or_default()
    }

    /// Number of values on the stack.
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    /// Remove and return every value from `base` up.
    pub fn drain_from(&mut self, base: usize) -> Vec<ScriptValue> {
        let base = base.min(self.stack.len());
        self.stack.drain(base..).collect()
    }

    /// Drop values above `len`.
    pub fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    // === Interrupts ===

    pub(crate) fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    /// Whether the watchdog asked running script to stop.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    // === Modules ===

    /// Create an empty module.
    pub fn new_module(&mut self, name: impl Into<String>, parent: Option<ModuleId>) -> ModuleId {
        self.modules.insert(ScriptModule {
            name: name.into(),
            parent,
            functions: FxHashMap::default(),
        })
    }

    /// Define or replace a function on a module. Returns false for a stale module.
    pub fn define(&mut self, module: ModuleId, name: impl Into<String>, function: ScriptFunction) -> bool {
        let Some(entry) = self.modules.get_mut(module) else {
            return false;
        };
        entry.functions.insert(name.into(), function);
        self.resolved.clear();
        true
    }

    pub fn module(&self, id: ModuleId) -> Option<&ScriptModule> {
        self.modules.get(id)
    }

    /// Names of every function reachable from a module, children first.
    pub fn module_function_names(&self, module: ModuleId) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut cursor = Some(module);
        while let Some(id) = cursor {
            let Some(entry) = self.modules.get(id) else {
                break;
            };
            for name in entry.function_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            cursor = entry.parent;
        }
        names
    }

    /// Bind a module to every instance of a class and its subclasses.
    pub fn bind_class(&mut self, class: ClassId, module: ModuleId) {
        self.class_modules.insert(class, module);
    }

    /// Remove a class binding.
    pub fn unbind_class(&mut self, class: ClassId) -> Option<ModuleId> {
        self.class_modules.remove(&class)
    }

    /// Bind a module to one object. Takes precedence over class bindings.
    pub fn bind_object(&mut self, object: ObjectHandle, module: ModuleId) {
        self.object_modules.insert(object, module);
    }

    /// Remove an object binding.
    pub fn unbind_object(&mut self, object: ObjectHandle) -> Option<ModuleId> {
        self.object_modules.remove(&object)
    }

    /// The module an object dispatches to, if any.
    pub fn module_for(&self, host: &Host, object: ObjectHandle) -> Option<ModuleId> {
        if let Some(module) = self.object_modules.get(&object) {
            return Some(*module);
        }
        let class = host.class_of(object)?;
        host.super_chain(class)
            .into_iter()
            .find_map(|c| self.class_modules.get(&c).copied())
    }

    /// Find the script function named `name` bound to `object`.
    ///
    /// Walks the module's parent chain on first lookup and caches the result.
    pub fn resolve_function(&mut self, host: &Host, object: ObjectHandle, name: &str) -> Option<ScriptFunction> {
        let module = self.module_for(host, object)?;
        let key = (module, name.to_string());
        if let Some(cached) = self.resolved.get(&key) {
            return cached.clone();
        }
        let mut found = None;
        let mut cursor = Some(module);
        while let Some(id) = cursor {
            let Some(entry) = self.modules.get(id) else {
                break;
            };
            if let Some(function) = entry.function(name) {
                found = Some(function.clone());
                break;
            }
            cursor = entry.parent;
        }
        self.resolved.insert(key, found.clone());
        found
    }

    // === Userdata ===

    /// Box a zeroed value of `ty` in a new region.
    pub fn new_owned(&mut self, host: &mut Host, ty: PropertyType, padding: u32) -> Result<UserdataId, HostError> {
        let size = host.size_of(&ty)?;
        let region = host.memory_mut().alloc(padding + size.max(1));
        Ok(self.userdata.insert(Userdata {
            ty,
            storage: UserdataStorage::Owned { region, padding },
        }))
    }

    /// Wrap host memory at `addr` without copying.
    ///
    /// Repeated requests for the same address and type return the same
    /// userdata while it is still valid.
    pub fn alias(&mut self, ty: PropertyType, addr: HostAddr) -> UserdataId {
        let key = (addr, ty);
        if let Some(id) = self.alias_cache.get(&key)
            && self
                .userdata
                .get(*id)
                .is_some_and(|u| u.storage == UserdataStorage::Alias(addr))
        {
            return *id;
        }
        let id = self.userdata.insert(Userdata {
            ty: key.1.clone(),
            storage: UserdataStorage::Alias(addr),
        });
        self.alias_cache.insert(key, id);
        if let Some(scope) = self.alias_scopes.last_mut() {
            scope.push(id);
        }
        id
    }

    pub fn userdata(&self, id: UserdataId) -> Option<&Userdata> {
        self.userdata.get(id)
    }

    /// Number of live userdata, including invalidated ones.
    pub fn userdata_count(&self) -> usize {
        self.userdata.len()
    }

    /// Address of the boxed value, or None if invalidated or its memory is gone.
    pub fn userdata_addr(&self, host: &Host, id: UserdataId) -> Option<HostAddr> {
        match self.userdata.get(id)?.storage {
            UserdataStorage::Owned { region, padding } => {
                host.memory().is_live(region).then(|| HostAddr::new(region, padding))
            }
            UserdataStorage::Alias(addr) => host.memory().is_live(addr.region).then_some(addr),
            UserdataStorage::Released => None,
        }
    }

    /// Invalidate a userdata without freeing it.
    pub fn invalidate(&mut self, id: UserdataId) {
        let Some(entry) = self.userdata.get_mut(id) else {
            return;
        };
        if let UserdataStorage::Alias(addr) = entry.storage {
            self.alias_cache.remove(&(addr, entry.ty.clone()));
        }
        entry.storage = UserdataStorage::Released;
    }

    /// Free a userdata, destroying the value if it owns one.
    pub fn release(&mut self, host: &mut Host, id: UserdataId) -> Result<bool, HostError> {
        let Some(entry) = self.userdata.remove(id) else {
            return Ok(false);
        };
        match entry.storage {
            UserdataStorage::Owned { region, padding } => {
                if host.memory().is_live(region) {
                    host.destroy_value(&entry.ty, HostAddr::new(region, padding))?;
                    host.memory_mut().free(region);
                }
            }
            UserdataStorage::Alias(addr) => {
                self.alias_cache.remove(&(addr, entry.ty));
            }
            UserdataStorage::Released => {}
        }
        Ok(true)
    }

    /// Start tracking aliases handed to a script callback.
    pub(crate) fn begin_alias_scope(&mut self) {
        self.alias_scopes.push(Vec::new());
    }

    /// Drop every alias created since the matching `begin_alias_scope`.
    ///
    /// The slots are freed, so handles the script kept resolve to nothing.
    pub(crate) fn end_alias_scope(&mut self) {
        let Some(scope) = self.alias_scopes.pop() else {
            return;
        };
        if !scope.is_empty() {
            trace!(target: "refbridge::bridge", count = scope.len(), "dropping callback aliases");
        }
        for id in scope {
            if let Some(Userdata {
                ty,
                storage: UserdataStorage::Alias(addr),
            }) = self.userdata.remove(id)
            {
                self.alias_cache.remove(&(addr, ty));
            }
        }
    }

    pub(crate) fn release_all(&mut self, host: &mut Host) {
        let ids: Vec<UserdataId> = self.userdata.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Err(err) = self.release(host, id) {
                debug!(target: "refbridge::bridge", ?id, %err, "failed to release userdata");
            }
        }
        self.alias_cache.clear();
        self.alias_scopes.clear();
    }

    // === Threads ===

    /// Create a running thread.
    pub(crate) fn spawn_thread(&mut self) -> ThreadId {
        self.next_thread += 1;
        let id = ThreadId(self.next_thread);
        self.threads.insert(
            id,
            ScriptThread {
                status: ThreadStatus::Running,
                continuation: None,
            },
        );
        id
    }

    /// The thread script is currently running on, if any.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    /// Switch threads, returning the previous one.
    pub(crate) fn set_current_thread(&mut self, thread: Option<ThreadId>) -> Option<ThreadId> {
        std::mem::replace(&mut self.current_thread, thread)
    }

    /// Status of a thread. Unknown threads are dead.
    pub fn thread_status(&self, thread: ThreadId) -> ThreadStatus {
        self.threads
            .get(&thread)
            .map(|t| t.status)
            .unwrap_or(ThreadStatus::Dead)
    }

    /// Park the current thread until `continuation` is resumed.
    pub(crate) fn set_continuation(&mut self, thread: ThreadId, continuation: ScriptFunction) -> bool {
        match self.threads.get_mut(&thread) {
            Some(entry) => {
                entry.continuation = Some(continuation);
                true
            }
            None => false,
        }
    }

    /// Take a suspended thread's continuation and mark it running.
    pub(crate) fn take_continuation(&mut self, thread: ThreadId) -> Option<ScriptFunction> {
        let entry = self.threads.get_mut(&thread)?;
        if entry.status != ThreadStatus::Suspended {
            return None;
        }
        entry.status = ThreadStatus::Running;
        entry.continuation.take()
    }

    /// Settle a thread after its body returned: suspended if it parked, else dead.
    pub(crate) fn settle_thread(&mut self, thread: ThreadId, failed: bool) -> ThreadStatus {
        let Some(entry) = self.threads.get_mut(&thread) else {
            return ThreadStatus::Dead;
        };
        if !failed && entry.continuation.is_some() {
            entry.status = ThreadStatus::Suspended;
            return ThreadStatus::Suspended;
        }
        self.threads.remove(&thread);
        ThreadStatus::Dead
    }

    /// Next latent action UUID.
    pub(crate) fn next_uuid(&mut self) -> i32 {
        self.next_uuid = self.next_uuid.wrapping_add(1);
        self.next_uuid
    }
}
