//! The bridge environment.
//!
//! [`Env`] owns everything one script runtime needs to talk to one host:
//! the host itself, the descriptor [`Registry`], the [`ScriptState`], the
//! [`Interceptor`], the delegate bookkeeping and the optional [`Watchdog`].
//! There are no global caches; every entry point takes the environment.
//!
//! # Example
//!
//! ```
//! use refbridge::{ClassDef, Env, FunctionDef, NativeFn, PropertyType, ScriptValue};
//!
//! let mut env = Env::new();
//! let class = env.host_mut().register_class(ClassDef::class("Calculator")).unwrap();
//! let add = env
//!     .host_mut()
//!     .add_function(
//!         class,
//!         FunctionDef::new("Add")
//!             .with_param("A", PropertyType::int32())
//!             .with_param("B", PropertyType::int32())
//!             .with_return(PropertyType::int32())
//!             .with_native(NativeFn::new(|ctx| {
//!                 let sum = ctx.arg_i64(0)? + ctx.arg_i64(1)?;
//!                 ctx.set_return_i64(sum)?;
//!                 Ok(())
//!             })),
//!     )
//!     .unwrap();
//! let calc = env.host_mut().new_object(class, "calc").unwrap();
//!
//! let results = env.call_function(add, &[calc.into(), ScriptValue::Integer(2), ScriptValue::Integer(3)]);
//! assert_eq!(results, vec![ScriptValue::Integer(5)]);
//! ```

use std::mem;
use std::rc::Rc;

use refbridge_core::{
    ClassDef, ClassId, Frame, FunctionDef, FunctionId, Host, HostAddr, HostEnv, IntKind,
    NativeError, ObjectHandle, PropertyType, invoke, latent_fields,
};
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::bridge::FunctionDescriptor;
use crate::delegates::DelegateManager;
use crate::interceptor::Interceptor;
use crate::marshal::PropertyDescriptor;
use crate::registry::Registry;
use crate::script::{ModuleId, ScriptState, ThreadId, ThreadStatus, UserdataId};
use crate::watchdog::Watchdog;
use crate::{BridgeConfig, BridgeError, BridgeResult, ScriptError, ScriptFunction, ScriptValue};

/// Class of the object that carries callbacks bound without a target.
pub const DELEGATE_PROXY_CLASS: &str = "ScriptDelegateProxy";
/// Class of the object latent actions call back into.
pub const LATENT_MANAGER_CLASS: &str = "LatentActionManager";
/// Function latent actions call on completion.
pub const LATENT_CALLBACK: &str = "OnLatentActionCompleted";

/// Target of the latent action tokens this environment hands out.
#[derive(Debug, Default)]
pub(crate) struct LatentSupport {
    pub(crate) manager: ObjectHandle,
    pub(crate) callback: FunctionId,
    /// Outstanding tokens by UUID.
    pub(crate) pending: FxHashMap<i32, ThreadId>,
}

/// A script runtime bridged to a host.
#[derive(Debug)]
pub struct Env {
    pub(crate) host: Host,
    pub(crate) registry: Registry,
    pub(crate) script: ScriptState,
    pub(crate) interceptor: Interceptor,
    pub(crate) delegates: DelegateManager,
    pub(crate) config: BridgeConfig,
    pub(crate) delegate_proxy: ObjectHandle,
    pub(crate) latent: LatentSupport,
    diagnostics: Vec<BridgeError>,
    watchdog: Option<Watchdog>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// Environment over a fresh host with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Environment over a fresh host.
    pub fn with_config(config: BridgeConfig) -> Self {
        Self::with_host(Host::new(), config)
    }

    /// Environment over an existing host.
    ///
    /// Registers the delegate proxy and latent manager classes if the host
    /// does not have them yet, and starts the watchdog if configured.
    pub fn with_host(host: Host, config: BridgeConfig) -> Self {
        let mut env = Self {
            host,
            registry: Registry::new(),
            script: ScriptState::new(),
            interceptor: Interceptor::new(),
            delegates: DelegateManager::new(),
            config,
            delegate_proxy: ObjectHandle::NULL,
            latent: LatentSupport::default(),
            diagnostics: Vec::new(),
            watchdog: None,
        };

        match env.install_proxy() {
            Ok(proxy) => env.delegate_proxy = proxy,
            Err(err) => warn!(target: "refbridge::bridge", %err, "delegate proxy unavailable"),
        }
        if let Err(err) = env.install_latent_support() {
            warn!(target: "refbridge::bridge", %err, "latent calls unavailable");
        }

        if let Some(timeout) = env.config.watchdog_timeout {
            match Watchdog::spawn(timeout, env.config.watchdog_tick) {
                Ok(watchdog) => {
                    env.script.set_interrupt_flag(watchdog.interrupt_flag());
                    env.watchdog = Some(watchdog);
                }
                Err(err) => warn!(target: "refbridge::watchdog", %err, "failed to start watchdog"),
            }
        }
        env
    }

    fn find_or_register(&mut self, def: ClassDef) -> BridgeResult<ClassId> {
        match self.host.find_class(&def.name) {
            Some(class) => Ok(class),
            None => Ok(self.host.register_class(def)?),
        }
    }

    fn install_proxy(&mut self) -> BridgeResult<ObjectHandle> {
        let class = self.find_or_register(ClassDef::class(DELEGATE_PROXY_CLASS).native())?;
        Ok(self.host.new_object(class, "delegate_proxy")?)
    }

    fn install_latent_support(&mut self) -> BridgeResult<()> {
        let class = self.find_or_register(ClassDef::class(LATENT_MANAGER_CLASS).native())?;
        let callback = match self.host.find_function(class, LATENT_CALLBACK) {
            Some(callback) => callback,
            None => self.host.add_function(
                class,
                FunctionDef::new(LATENT_CALLBACK)
                    .with_param(latent_fields::LINKAGE, PropertyType::int32())
                    .with_native(self.interceptor.trampoline().clone()),
            )?,
        };
        let manager = self.host.new_object(class, "latent_manager")?;
        self.latent.manager = manager;
        self.latent.callback = callback;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut Host {
        &mut self.host
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn script(&self) -> &ScriptState {
        &self.script
    }

    pub fn script_mut(&mut self) -> &mut ScriptState {
        &mut self.script
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.watchdog.as_ref()
    }

    /// The object callbacks without a target are bound to.
    pub fn delegate_proxy(&self) -> ObjectHandle {
        self.delegate_proxy
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Failures reported so far, oldest first.
    pub fn diagnostics(&self) -> &[BridgeError] {
        &self.diagnostics
    }

    /// Take and clear the recorded failures.
    pub fn take_diagnostics(&mut self) -> Vec<BridgeError> {
        mem::take(&mut self.diagnostics)
    }

    fn record(&mut self, err: BridgeError) {
        if self.config.max_diagnostics == 0 {
            return;
        }
        if self.diagnostics.len() >= self.config.max_diagnostics {
            self.diagnostics.remove(0);
        }
        self.diagnostics.push(err);
    }

    /// Log and record a soft failure. Script errors log at error level.
    pub fn report(&mut self, err: BridgeError) {
        match &err {
            BridgeError::ScriptRuntime(script) => {
                error!(target: "refbridge::bridge", error = %script, "script callback failed");
            }
            other => warn!(target: "refbridge::bridge", error = %other, "bridge operation failed"),
        }
        self.record(err);
    }

    /// Log and record a failure that indicates a broken contract.
    pub fn report_error(&mut self, err: BridgeError) {
        error!(target: "refbridge::bridge", error = %err, "bridge contract violated");
        self.record(err);
    }

    // =========================================================================
    // Script calls
    // =========================================================================

    /// Run a script function.
    ///
    /// Fails without running it when the watchdog has interrupted script or
    /// the call nesting limit is reached. The error traceback gains this
    /// function's name.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call(&mut self, function: &ScriptFunction, args: Vec<ScriptValue>) -> Result<Vec<ScriptValue>, ScriptError> {
        if self.script.is_interrupted() {
            return Err(ScriptError::new("script exec timeout").with_frame(function.name()));
        }
        if self.script.depth >= self.config.max_call_depth {
            return Err(ScriptError::new("stack overflow").with_frame(function.name()));
        }

        let _guard = self.watchdog.as_ref().map(Watchdog::guard);
        self.script.depth += 1;
        let body = function.body();
        let result = body(self, args);
        self.script.depth -= 1;
        result.map_err(|err| err.with_frame(function.name()))
    }

    /// Protected call: pop a function and `nargs` arguments off the stack,
    /// run it, and push its results. Returns the number of results.
    ///
    /// On failure nothing is pushed.
    pub fn pcall(&mut self, nargs: usize) -> Result<usize, ScriptError> {
        let top = self.script.top();
        if nargs + 1 > top {
            return Err(ScriptError::new("attempt to call with missing values"));
        }
        let mut values = self.script.drain_from(top - nargs - 1);
        let callee = values.remove(0);
        let ScriptValue::Function(function) = callee else {
            return Err(ScriptError::new(format!("attempt to call a {} value", callee.type_name())));
        };
        let results = self.call(&function, values)?;
        let count = results.len();
        for value in results {
            self.script.push(value);
        }
        Ok(count)
    }

    // =========================================================================
    // Script modules
    // =========================================================================

    /// Create a script module, optionally chained to a parent.
    pub fn new_module(&mut self, name: impl Into<String>, parent: Option<ModuleId>) -> ModuleId {
        self.script.new_module(name, parent)
    }

    /// Define a function on a module.
    pub fn define(&mut self, module: ModuleId, name: impl Into<String>, function: ScriptFunction) -> bool {
        self.script.define(module, name, function)
    }

    /// Bind a module to a class and override every overridable host function
    /// the module implements. Returns how many functions were overridden.
    pub fn bind_module(&mut self, class: ClassId, module: ModuleId) -> BridgeResult<usize> {
        self.host.try_class(class)?;
        self.script.bind_class(class, module);
        self.override_module_functions(class, module)
    }

    /// Bind a module to a single object. Functions are overridden on the
    /// object's class; other instances keep their native behavior.
    pub fn bind_object_module(&mut self, object: ObjectHandle, module: ModuleId) -> BridgeResult<usize> {
        let class = self
            .host
            .class_of(object)
            .ok_or_else(|| BridgeError::stale(format!("object {object:?}")))?;
        self.script.bind_object(object, module);
        self.override_module_functions(class, module)
    }

    fn override_module_functions(&mut self, class: ClassId, module: ModuleId) -> BridgeResult<usize> {
        let mut overridden = 0;
        for name in self.script.module_function_names(module) {
            let Some(function) = self.host.find_function(class, &name) else {
                continue;
            };
            if !Interceptor::is_overridable(&self.host, function) {
                continue;
            }
            self.override_function(function, class)?;
            overridden += 1;
        }
        debug!(target: "refbridge::bridge", ?class, ?module, overridden, "module bound");
        Ok(overridden)
    }

    /// Remove a class's module binding and restore its overrides.
    pub fn unbind_module(&mut self, class: ClassId) -> bool {
        let bound = self.script.unbind_class(class).is_some();
        self.restore_class(class);
        bound
    }

    // =========================================================================
    // Overrides
    // =========================================================================

    /// Route `function` into script for instances of `class`. Returns the
    /// function carrying the trampoline.
    pub fn override_function(&mut self, function: FunctionId, class: ClassId) -> BridgeResult<FunctionId> {
        let installed = self.interceptor.override_function(&mut self.host, function, class)?;
        self.registry.register_function(&mut self.host, installed)?;
        Ok(installed)
    }

    /// Undo every override involving `function`.
    pub fn restore_original(&mut self, function: FunctionId) -> usize {
        let restored = self.interceptor.restore_original(&mut self.host, function);
        self.registry.evict_stale(&mut self.host);
        restored
    }

    /// Undo every override installed for `class`.
    pub fn restore_class(&mut self, class: ClassId) -> usize {
        let restored = self.interceptor.restore_class(&mut self.host, class);
        self.registry.evict_stale(&mut self.host);
        restored
    }

    // =========================================================================
    // Host calls and properties
    // =========================================================================

    /// The descriptor for a host function, built on first use.
    pub fn register_function(&mut self, function: FunctionId) -> BridgeResult<Rc<FunctionDescriptor>> {
        self.registry.register_function(&mut self.host, function)
    }

    /// Call a host function with script arguments. Instance functions take
    /// the target object first.
    pub fn call_function(&mut self, function: FunctionId, args: &[ScriptValue]) -> Vec<ScriptValue> {
        match self.register_function(function) {
            Ok(desc) => desc.call_host(self, args),
            Err(err) => {
                self.report(err);
                Vec::new()
            }
        }
    }

    /// Call a function by name on an object.
    pub fn call_method(&mut self, object: ObjectHandle, name: &str, args: &[ScriptValue]) -> Vec<ScriptValue> {
        let Some(function) = self
            .host
            .class_of(object)
            .and_then(|class| self.host.find_function(class, name))
        else {
            self.report(BridgeError::unresolved(name));
            return Vec::new();
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(ScriptValue::from(object));
        full.extend_from_slice(args);
        self.call_function(function, &full)
    }

    /// Call a static function by class and function name.
    pub fn call_static(&mut self, class_name: &str, name: &str, args: &[ScriptValue]) -> Vec<ScriptValue> {
        let function = self
            .registry
            .register_field(&self.host, class_name, name)
            .map(|field| self.registry.field_function(&field));
        match function {
            Ok(Some(function)) => self.call_function(function, args),
            Ok(None) => {
                self.report(BridgeError::invalid_call(name, "not a function"));
                Vec::new()
            }
            Err(err) => {
                self.report(err);
                Vec::new()
            }
        }
    }

    /// Descriptor and address of a property on an object.
    pub fn property_slot(&mut self, object: ObjectHandle, name: &str) -> BridgeResult<(Rc<PropertyDescriptor>, HostAddr)> {
        let class = self
            .host
            .class_of(object)
            .ok_or_else(|| BridgeError::stale(format!("object {object:?}")))?;
        let type_name = self.host.try_class(class)?.name.clone();
        let field = self.registry.register_field(&self.host, &type_name, name)?;
        let desc = self
            .registry
            .field_property(&field)
            .ok_or_else(|| BridgeError::unresolved(format!("{type_name}.{name}")))?;
        let addr = self.host.object_addr(object)?.at(desc.offset);
        Ok((desc, addr))
    }

    /// Read a property. Aggregates come back as aliases of the object's memory.
    pub fn get_property(&mut self, object: ObjectHandle, name: &str) -> ScriptValue {
        match self.property_slot(object, name) {
            Ok((desc, addr)) => desc.read(self, addr, false),
            Err(err) => {
                self.report(err);
                ScriptValue::Nil
            }
        }
    }

    /// Write a property. Returns false if the property did not resolve.
    pub fn set_property(&mut self, object: ObjectHandle, name: &str, value: &ScriptValue) -> bool {
        match self.property_slot(object, name) {
            Ok((desc, addr)) => {
                desc.write(self, value, addr, true);
                true
            }
            Err(err) => {
                self.report(err);
                false
            }
        }
    }

    // =========================================================================
    // Userdata
    // =========================================================================

    /// Box a zeroed value of `ty` owned by script.
    pub fn new_userdata(&mut self, ty: PropertyType) -> BridgeResult<(UserdataId, HostAddr)> {
        let padding = match &ty {
            PropertyType::Struct { class } => self.registry.resolve_class(&self.host, *class)?.userdata_padding(),
            _ => 0,
        };
        let id = self.script.new_owned(&mut self.host, ty, padding)?;
        let addr = self
            .script
            .userdata_addr(&self.host, id)
            .ok_or_else(|| BridgeError::stale(format!("userdata {id:?}")))?;
        Ok((id, addr))
    }

    /// Address of a userdata's value, if it is still valid.
    pub fn userdata_addr(&self, id: UserdataId) -> Option<HostAddr> {
        self.script.userdata_addr(&self.host, id)
    }

    /// Free a userdata. Owned values are destroyed.
    pub fn release_userdata(&mut self, id: UserdataId) -> bool {
        match self.script.release(&mut self.host, id) {
            Ok(released) => released,
            Err(err) => {
                self.report(err.into());
                false
            }
        }
    }

    // =========================================================================
    // Threads and latent calls
    // =========================================================================

    fn run_on(&mut self, thread: ThreadId, function: &ScriptFunction, args: Vec<ScriptValue>) -> Result<ThreadStatus, ScriptError> {
        let previous = self.script.set_current_thread(Some(thread));
        let result = self.call(function, args);
        self.script.set_current_thread(previous);
        let status = self.script.settle_thread(thread, result.is_err());
        if status == ThreadStatus::Dead {
            self.latent.pending.retain(|_, t| *t != thread);
        }
        result.map(|_| status)
    }

    /// Run a function on a new script thread. The thread may park on a
    /// latent call; check [`thread_status`](Self::thread_status).
    pub fn run_thread(&mut self, function: &ScriptFunction, args: Vec<ScriptValue>) -> Result<ThreadId, ScriptError> {
        let thread = self.script.spawn_thread();
        self.run_on(thread, function, args)?;
        Ok(thread)
    }

    /// Park the current thread; `continuation` runs when it is resumed.
    pub fn yield_thread(&mut self, continuation: ScriptFunction) -> Result<(), ScriptError> {
        let thread = self
            .script
            .current_thread()
            .ok_or_else(|| ScriptError::new("attempt to yield from outside a thread"))?;
        self.script.set_continuation(thread, continuation);
        Ok(())
    }

    /// Resume a suspended thread.
    pub fn resume_thread(&mut self, thread: ThreadId) -> Result<ThreadStatus, ScriptError> {
        let continuation = self
            .script
            .take_continuation(thread)
            .ok_or_else(|| ScriptError::new("cannot resume non-suspended thread"))?;
        self.latent.pending.retain(|_, t| *t != thread);
        self.run_on(thread, &continuation, Vec::new())
    }

    /// Resume the thread waiting on the latent action with this UUID.
    pub fn resume_latent(&mut self, uuid: i32) -> bool {
        let Some(thread) = self.latent.pending.remove(&uuid) else {
            debug!(target: "refbridge::bridge", uuid, "no thread waiting on latent action");
            return false;
        };
        match self.resume_thread(thread) {
            Ok(_) => true,
            Err(err) => {
                self.report(err.into());
                false
            }
        }
    }

    /// Call a latent host function from the current thread and park it until
    /// the host completes the action.
    pub fn call_latent(
        &mut self,
        function: FunctionId,
        args: &[ScriptValue],
        continuation: ScriptFunction,
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        if self.script.current_thread().is_none() {
            return Err(ScriptError::new("latent call outside a script thread"));
        }
        let results = self.call_function(function, args);
        self.yield_thread(continuation)?;
        Ok(results)
    }

    pub fn thread_status(&self, thread: ThreadId) -> ThreadStatus {
        self.script.thread_status(thread)
    }

    /// Write a latent action token for the current thread at `addr`.
    pub(crate) fn write_latent_token(&mut self, addr: HostAddr) -> BridgeResult<()> {
        let thread = self
            .script
            .current_thread()
            .ok_or_else(|| BridgeError::invalid_call(LATENT_CALLBACK, "latent call outside a script thread"))?;
        if self.latent.manager.is_null() {
            return Err(BridgeError::invalid_call(LATENT_CALLBACK, "latent calls unavailable"));
        }
        let uuid = self.script.next_uuid();
        let layout = self.host.try_class(self.host.latent_action_info())?;
        let offset = |name: &str| layout.find_property(name).map_or(0, |p| p.offset);
        let (linkage, uuid_at, function_at, target_at) = (
            offset(latent_fields::LINKAGE),
            offset(latent_fields::UUID),
            offset(latent_fields::EXECUTION_FUNCTION),
            offset(latent_fields::CALLBACK_TARGET),
        );

        let callback = self.host.memory_mut().intern(LATENT_CALLBACK);
        let memory = self.host.memory_mut();
        memory.write_int(addr.at(linkage), IntKind::I32, i64::from(thread.0))?;
        memory.write_int(addr.at(uuid_at), IntKind::I32, i64::from(uuid))?;
        self.host.write_name(addr.at(function_at), callback)?;
        self.host.write_object(addr.at(target_at), self.latent.manager)?;
        self.latent.pending.insert(uuid, thread);
        Ok(())
    }

    /// Completion callback of a latent action: resume the linked thread.
    fn complete_latent(&mut self, frame: &Frame) -> Result<(), NativeError> {
        let offset = self
            .host
            .try_function(frame.function)?
            .params
            .first()
            .map_or(0, |p| p.offset);
        let linkage = self.host.memory().read_int(frame.params.at(offset), IntKind::I32)?;
        let thread = ThreadId(linkage as u32);
        if let Err(err) = self.resume_thread(thread) {
            self.report(err.into());
        }
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Release everything the bridge installed into the host: delegate
    /// functions, overrides, descriptor buffers and userdata.
    pub fn teardown(&mut self) {
        let delegates = self.cleanup_delegates();
        let overrides = self.interceptor.restore_all(&mut self.host);
        self.registry.teardown(&mut self.host);
        self.script.release_all(&mut self.host);
        self.latent.pending.clear();
        self.watchdog = None;
        if delegates + overrides > 0 {
            debug!(target: "refbridge::bridge", delegates, overrides, "environment torn down");
        }
    }

    /// Tear down and hand the host back.
    pub fn into_host(mut self) -> Host {
        self.teardown();
        mem::take(&mut self.host)
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl HostEnv for Env {
    fn host(&self) -> &Host {
        &self.host
    }

    fn host_mut(&mut self) -> &mut Host {
        &mut self.host
    }

    /// Route a trampolined call: latent completion, delegate callback, or
    /// the script function overriding a host function.
    fn enter_script(&mut self, frame: &Frame) -> Result<(), NativeError> {
        if frame.function == self.latent.callback && !self.latent.callback.is_null() {
            return self.complete_latent(frame);
        }
        if self.delegates.contains(frame.function) {
            self.execute_signature(frame);
            return Ok(());
        }

        let name = self.host.try_function(frame.function)?.name.clone();
        let Some(shadow) = self
            .interceptor
            .record_for_installed(frame.function)
            .map(|record| record.shadow)
        else {
            return Err(NativeError::NoScriptBinding { function: name });
        };

        match self.script.resolve_function(&self.host, frame.object, &name) {
            Some(callback) => {
                let desc = self
                    .registry
                    .register_function(&mut self.host, frame.function)
                    .map_err(|err| NativeError::failed(err.to_string()))?;
                desc.call_script(self, frame, &callback, Some(ScriptValue::from(frame.object)));
                Ok(())
            }
            // Instances without a script binding keep the original behavior.
            None => {
                let mut original = frame.clone();
                original.function = shadow;
                invoke(self, original)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbridge_core::{FunctionFlags, NativeFn};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pcall_pops_and_pushes() {
        let mut env = Env::new();
        let add = ScriptFunction::new("add", |_, args| {
            let sum: i64 = args.iter().filter_map(ScriptValue::as_integer).sum();
            Ok(vec![ScriptValue::Integer(sum)])
        });
        env.script_mut().push(ScriptValue::from(add));
        env.script_mut().push(ScriptValue::Integer(2));
        env.script_mut().push(ScriptValue::Integer(5));
        assert_eq!(env.pcall(2).unwrap(), 1);
        assert_eq!(env.script_mut().pop(), ScriptValue::Integer(7));
        assert_eq!(env.script().top(), 0);

        env.script_mut().push(ScriptValue::Integer(1));
        assert!(env.pcall(0).is_err());
    }

    #[test]
    fn call_depth_is_limited() {
        let mut env = Env::with_config(BridgeConfig::default().with_max_call_depth(8));
        let recurse = Rc::new(std::cell::RefCell::new(None::<ScriptFunction>));
        let inner = Rc::clone(&recurse);
        let function = ScriptFunction::new("recurse", move |env, _| {
            let me = inner.borrow().clone().unwrap();
            env.call(&me, Vec::new())
        });
        *recurse.borrow_mut() = Some(function.clone());

        let err = env.call(&function, Vec::new()).unwrap_err();
        assert_eq!(err.message, "stack overflow");
        assert_eq!(err.traceback.len(), 9);
        *recurse.borrow_mut() = None;
    }

    #[test]
    fn diagnostics_are_capped() {
        let mut env = Env::new();
        env.config.max_diagnostics = 2;
        for name in ["a", "b", "c"] {
            env.report(BridgeError::unresolved(name));
        }
        assert_eq!(
            env.diagnostics(),
            &[BridgeError::unresolved("b"), BridgeError::unresolved("c")]
        );
        assert_eq!(env.take_diagnostics().len(), 2);
        assert!(env.diagnostics().is_empty());
    }

    #[test]
    fn unbound_instances_keep_native_behavior() {
        let mut env = Env::new();
        let native_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&native_calls);
        let class = env.host_mut().register_class(ClassDef::class("Door")).unwrap();
        let open = env
            .host_mut()
            .add_function(
                class,
                FunctionDef::new("Open")
                    .with_flags(FunctionFlags::EVENT)
                    .with_native(NativeFn::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })),
            )
            .unwrap();
        let scripted = env.host_mut().new_object(class, "scripted").unwrap();
        let plain = env.host_mut().new_object(class, "plain").unwrap();

        let script_calls = Rc::new(std::cell::Cell::new(0));
        let seen = Rc::clone(&script_calls);
        let module = env.new_module("DoorScript", None);
        env.define(
            module,
            "Open",
            ScriptFunction::new("Open", move |_, _| {
                seen.set(seen.get() + 1);
                Ok(Vec::new())
            }),
        );
        assert_eq!(env.bind_object_module(scripted, module).unwrap(), 1);

        let params = env.host_mut().alloc_params(open).unwrap();
        invoke(&mut env, Frame::new(open, scripted, params)).unwrap();
        invoke(&mut env, Frame::new(open, plain, params)).unwrap();
        assert_eq!(script_calls.get(), 1);
        assert_eq!(native_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn into_host_restores_overrides() {
        let mut env = Env::new();
        let class = env.host_mut().register_class(ClassDef::class("Lamp")).unwrap();
        let toggle = env
            .host_mut()
            .add_function(
                class,
                FunctionDef::new("Toggle").with_flags(FunctionFlags::SCRIPT_EVENT),
            )
            .unwrap();
        let functions = env.host().function_count();
        env.override_function(toggle, class).unwrap();
        assert_eq!(env.host().function_count(), functions + 1);

        let host = env.into_host();
        assert_eq!(host.function_count(), functions);
        assert!(host.function(toggle).unwrap().native.is_none());
    }
}
