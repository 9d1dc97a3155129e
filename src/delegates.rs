//! Script callbacks bound to host delegates.
//!
//! A host delegate slot holds a (target object, function name) pair. To bind
//! a script callback, the manager synthesizes a function named
//! `<property>_<id>` on the target's class, cloned from the delegate's
//! signature, and installs the trampoline on it. Invoking the delegate then
//! lands in [`Env::enter_script`](refbridge_core::HostEnv::enter_script),
//! which runs the callback.
//!
//! ## Callback forms
//!
//! - A plain function binds to the environment's delegate proxy object.
//! - A table `{ object, function }` (or `{ object = .., function = .. }`)
//!   binds to `object`, which is passed to the callback as `self`.
//!
//! ## Lifetime
//!
//! Synthesized functions are shared per (signature, callback, instance) and
//! reference counted. A signature whose count drops to zero while one of its
//! invocations is running is only marked; it is torn down when the last
//! invocation returns. This makes unbinding from inside the callback safe.

use refbridge_core::{
    ClassId, DelegateValue, Frame, FunctionId, HostAddr, ObjectHandle, PropertyType, broadcast,
    resolve_delegate,
};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::interceptor::Interceptor;
use crate::marshal::PropertyDescriptor;
use crate::{BridgeError, BridgeResult, Env, ScriptFunction, ScriptValue};

/// Identity of a synthesized signature function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    /// The delegate's signature function.
    pub signature: FunctionId,
    /// Identity of the script callback.
    pub callback: u64,
    /// Object the synthesized function is invoked on.
    pub instance: ObjectHandle,
}

/// One synthesized function bound to a script callback.
#[derive(Debug)]
pub struct SignatureDescriptor {
    pub function: FunctionId,
    pub key: CallbackKey,
    /// Class of the instance; the synthesized function lives on it.
    pub class: ClassId,
    callback: ScriptFunction,
    pass_self: bool,
    bindings: u32,
    in_flight: u32,
    pending_kill: bool,
}

impl SignatureDescriptor {
    /// Number of slots and explicit binds holding this signature.
    pub fn bindings(&self) -> u32 {
        self.bindings
    }

    /// Number of invocations currently running.
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Whether teardown waits for running invocations.
    pub fn is_pending_kill(&self) -> bool {
        self.pending_kill
    }

    pub fn callback(&self) -> &ScriptFunction {
        &self.callback
    }
}

/// Bookkeeping for every script callback bound to a host delegate.
#[derive(Debug, Default)]
pub struct DelegateManager {
    signatures: FxHashMap<FunctionId, SignatureDescriptor>,
    by_key: FxHashMap<CallbackKey, FunctionId>,
    /// Single-cast slots and the signature each one holds.
    slots: FxHashMap<HostAddr, FunctionId>,
    /// Multicast slots and the signatures added to each.
    multicast: FxHashMap<HostAddr, Vec<FunctionId>>,
    next_id: u64,
}

impl DelegateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(&self, function: FunctionId) -> Option<&SignatureDescriptor> {
        self.signatures.get(&function)
    }

    /// Whether `function` was synthesized for a callback.
    pub fn contains(&self, function: FunctionId) -> bool {
        self.signatures.contains_key(&function)
    }

    /// The synthesized function for a key, if bound.
    pub fn find(&self, key: &CallbackKey) -> Option<FunctionId> {
        self.by_key.get(key).copied()
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// Signatures added to a multicast slot through the bridge.
    pub fn multicast_bindings(&self, addr: HostAddr) -> &[FunctionId] {
        self.multicast.get(&addr).map(Vec::as_slice).unwrap_or_default()
    }
}

impl Env {
    // =========================================================================
    // Signatures
    // =========================================================================

    /// Split a script value into (callback, instance, pass_self).
    fn callback_target(&self, value: &ScriptValue) -> Option<(ScriptFunction, ObjectHandle, bool)> {
        match value {
            ScriptValue::Function(function) => Some((function.clone(), self.delegate_proxy, false)),
            ScriptValue::Table(table) => {
                let table = table.borrow();
                let (object, function) = match table.list() {
                    [object, function, ..] => (object.clone(), function.clone()),
                    _ => (table.get_field("object"), table.get_field("function")),
                };
                let object = object.as_object()?;
                let function = function.as_function()?.clone();
                Some((function, object, true))
            }
            _ => None,
        }
    }

    /// Find or synthesize the function bound to a callback and take a reference.
    fn acquire_signature(
        &mut self,
        property: &str,
        signature: FunctionId,
        callback: ScriptFunction,
        instance: ObjectHandle,
        pass_self: bool,
    ) -> BridgeResult<FunctionId> {
        let key = CallbackKey {
            signature,
            callback: callback.id(),
            instance,
        };
        if let Some(function) = self.delegates.by_key.get(&key).copied()
            && self.host.is_function_live(function)
            && let Some(desc) = self.delegates.signatures.get_mut(&function)
        {
            desc.bindings += 1;
            desc.pending_kill = false;
            return Ok(function);
        }

        let class = self
            .host
            .class_of(instance)
            .ok_or_else(|| BridgeError::InvalidDelegate {
                property: property.to_string(),
                reason: "callback target has been destroyed".to_string(),
            })?;
        self.delegates.next_id += 1;
        let name = format!("{property}_{:016X}", self.delegates.next_id);
        let function = Interceptor::duplicate(&mut self.host, signature, class, &name)?;
        self.interceptor.install_trampoline(&mut self.host, function)?;
        self.registry.register_function(&mut self.host, function)?;

        debug!(target: "refbridge::delegates", %name, ?instance, "signature function created");
        self.delegates.by_key.insert(key, function);
        self.delegates.signatures.insert(
            function,
            SignatureDescriptor {
                function,
                key,
                class,
                callback,
                pass_self,
                bindings: 1,
                in_flight: 0,
                pending_kill: false,
            },
        );
        Ok(function)
    }

    /// Drop a reference, tearing the signature down at zero.
    fn release_signature(&mut self, function: FunctionId) {
        let Some(desc) = self.delegates.signatures.get_mut(&function) else {
            return;
        };
        desc.bindings = desc.bindings.saturating_sub(1);
        if desc.bindings == 0 {
            self.mark_for_delete(function, false);
        }
    }

    /// Tear a signature down now, or once its running invocations return.
    fn mark_for_delete(&mut self, function: FunctionId, ignore_bindings: bool) {
        let Some(desc) = self.delegates.signatures.get_mut(&function) else {
            return;
        };
        if ignore_bindings {
            desc.bindings = 0;
        }
        if desc.bindings > 0 {
            return;
        }
        if desc.in_flight > 0 {
            trace!(target: "refbridge::delegates", ?function, "signature in flight, deferring teardown");
            desc.pending_kill = true;
            return;
        }
        self.destroy_signature(function);
    }

    fn destroy_signature(&mut self, function: FunctionId) {
        let Some(desc) = self.delegates.signatures.remove(&function) else {
            return;
        };
        self.delegates.by_key.remove(&desc.key);

        let slots: Vec<HostAddr> = self
            .delegates
            .slots
            .iter()
            .filter(|(_, f)| **f == function)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in slots {
            self.delegates.slots.remove(&addr);
            if self.host.memory().is_live(addr.region)
                && let Err(err) = self.host.write_delegate(addr, DelegateValue::default())
            {
                self.report(err.into());
            }
        }

        let name = self.host.function(function).map(|f| f.name.clone());
        let value = name.map(|name| DelegateValue::new(desc.key.instance, self.host.memory_mut().intern(&name)));
        let mut containers = Vec::new();
        for (addr, bound) in self.delegates.multicast.iter_mut() {
            if bound.contains(&function) {
                bound.retain(|f| *f != function);
                containers.push(*addr);
            }
        }
        if let Some(value) = value {
            for addr in containers {
                if self.host.memory().is_live(addr.region)
                    && let Err(err) = self.host.multicast_remove(addr, value)
                {
                    self.report(err.into());
                }
            }
        }
        self.delegates.multicast.retain(|_, bound| !bound.is_empty());

        self.registry.unregister_function(&mut self.host, function);
        self.host.remove_function(function);
        debug!(target: "refbridge::delegates", ?function, "signature function destroyed");
    }

    /// The delegate value pointing at a synthesized function.
    fn signature_value(&mut self, function: FunctionId) -> Option<DelegateValue> {
        let instance = self.delegates.signatures.get(&function)?.key.instance;
        let name = self.host.function(function)?.name.clone();
        let name = self.host.memory_mut().intern(&name);
        Some(DelegateValue::new(instance, name))
    }

    /// Run the callback bound to a synthesized function.
    pub(crate) fn execute_signature(&mut self, frame: &Frame) -> bool {
        let Some(desc) = self.delegates.signatures.get_mut(&frame.function) else {
            return false;
        };
        desc.in_flight += 1;
        let callback = desc.callback.clone();
        let this = desc.pass_self.then(|| ScriptValue::from(frame.object));

        let succeeded = match self.registry.register_function(&mut self.host, frame.function) {
            Ok(function) => function.call_script(self, frame, &callback, this),
            Err(err) => {
                self.report(err);
                false
            }
        };

        let Some(desc) = self.delegates.signatures.get_mut(&frame.function) else {
            return succeeded;
        };
        desc.in_flight -= 1;
        if desc.in_flight == 0 && desc.pending_kill {
            self.destroy_signature(frame.function);
        }
        succeeded
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// Write a script value into a single-cast delegate slot.
    pub(crate) fn write_delegate_slot(
        &mut self,
        property: &PropertyDescriptor,
        signature: FunctionId,
        value: &ScriptValue,
        addr: HostAddr,
    ) -> BridgeResult<()> {
        let previous = self.delegates.slots.get(&addr).copied();
        match value {
            ScriptValue::Nil => {
                self.host.write_delegate(addr, DelegateValue::default())?;
            }
            ScriptValue::Userdata(_) => {
                if !property.write_from_userdata(self, value, addr)? {
                    property.mismatch(self, "delegate", value);
                    return Ok(());
                }
            }
            other => {
                let Some((callback, instance, pass_self)) = self.callback_target(other) else {
                    property.mismatch(self, "function", other);
                    return Ok(());
                };
                let function = self.acquire_signature(&property.name, signature, callback, instance, pass_self)?;
                if let Some(value) = self.signature_value(function) {
                    self.host.write_delegate(addr, value)?;
                }
                self.delegates.slots.insert(addr, function);
                if let Some(previous) = previous {
                    self.release_signature(previous);
                }
                return Ok(());
            }
        }
        if let Some(previous) = previous {
            self.delegates.slots.remove(&addr);
            self.release_signature(previous);
        }
        Ok(())
    }

    /// Write a script value into a multicast delegate slot.
    ///
    /// A callback is added to the invocation list; nil leaves the list
    /// alone; a multicast userdata replaces the list with a copy.
    pub(crate) fn write_multicast_slot(
        &mut self,
        property: &PropertyDescriptor,
        signature: FunctionId,
        value: &ScriptValue,
        addr: HostAddr,
    ) -> BridgeResult<()> {
        match value {
            ScriptValue::Nil => Ok(()),
            ScriptValue::Userdata(_) => {
                self.clear_multicast_slot(addr)?;
                if !property.write_from_userdata(self, value, addr)? {
                    property.mismatch(self, "multicast delegate", value);
                }
                Ok(())
            }
            other => self.add_to_multicast(property, signature, other, addr).map(|_| ()),
        }
    }

    fn add_to_multicast(
        &mut self,
        property: &PropertyDescriptor,
        signature: FunctionId,
        value: &ScriptValue,
        addr: HostAddr,
    ) -> BridgeResult<bool> {
        let Some((callback, instance, pass_self)) = self.callback_target(value) else {
            property.mismatch(self, "function", value);
            return Ok(false);
        };
        let function = self.acquire_signature(&property.name, signature, callback, instance, pass_self)?;
        let Some(entry) = self.signature_value(function) else {
            return Ok(false);
        };
        if !self.host.multicast_add(addr, entry)? {
            self.release_signature(function);
            return Ok(false);
        }
        self.delegates.multicast.entry(addr).or_default().push(function);
        Ok(true)
    }

    fn remove_from_multicast(&mut self, signature: FunctionId, value: &ScriptValue, addr: HostAddr) -> BridgeResult<bool> {
        let Some((callback, instance, _)) = self.callback_target(value) else {
            return Ok(false);
        };
        let key = CallbackKey {
            signature,
            callback: callback.id(),
            instance,
        };
        let Some(function) = self.delegates.find(&key) else {
            return Ok(false);
        };
        let Some(entry) = self.signature_value(function) else {
            return Ok(false);
        };
        if !self.host.multicast_remove(addr, entry)? {
            return Ok(false);
        }
        if let Some(bound) = self.delegates.multicast.get_mut(&addr) {
            if let Some(pos) = bound.iter().position(|f| *f == function) {
                bound.remove(pos);
            }
            if bound.is_empty() {
                self.delegates.multicast.remove(&addr);
            }
        }
        self.release_signature(function);
        Ok(true)
    }

    fn clear_multicast_slot(&mut self, addr: HostAddr) -> BridgeResult<usize> {
        let cleared = self.host.multicast_clear(addr)?.len();
        for function in self.delegates.multicast.remove(&addr).unwrap_or_default() {
            self.release_signature(function);
        }
        Ok(cleared)
    }

    /// Slot of a delegate property, checking its kind.
    fn delegate_slot(&mut self, object: ObjectHandle, property: &str, multicast: bool) -> BridgeResult<(PropertyDescriptor, FunctionId, HostAddr)> {
        let (desc, addr) = self.property_slot(object, property)?;
        let signature = match desc.ty {
            PropertyType::Delegate { signature } if !multicast => signature,
            PropertyType::MulticastDelegate { signature } if multicast => signature,
            _ => {
                return Err(BridgeError::InvalidDelegate {
                    property: property.to_string(),
                    reason: format!("property is a {}", desc.ty.kind_name()),
                });
            }
        };
        Ok(((*desc).clone(), signature, addr))
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Bind a callback to a single-cast delegate property, replacing what was bound.
    pub fn bind_delegate(&mut self, object: ObjectHandle, property: &str, callback: &ScriptValue) -> BridgeResult<()> {
        let (desc, signature, addr) = self.delegate_slot(object, property, false)?;
        self.write_delegate_slot(&desc, signature, callback, addr)
    }

    /// Clear a single-cast delegate property.
    pub fn unbind_delegate(&mut self, object: ObjectHandle, property: &str) -> BridgeResult<()> {
        let (desc, signature, addr) = self.delegate_slot(object, property, false)?;
        self.write_delegate_slot(&desc, signature, &ScriptValue::Nil, addr)
    }

    /// Add a callback to a multicast delegate. Returns false if it was already bound.
    pub fn add_multicast(&mut self, object: ObjectHandle, property: &str, callback: &ScriptValue) -> BridgeResult<bool> {
        let (desc, signature, addr) = self.delegate_slot(object, property, true)?;
        self.add_to_multicast(&desc, signature, callback, addr)
    }

    /// Remove a callback from a multicast delegate. Returns false if it was not bound.
    pub fn remove_multicast(&mut self, object: ObjectHandle, property: &str, callback: &ScriptValue) -> BridgeResult<bool> {
        let (_, signature, addr) = self.delegate_slot(object, property, true)?;
        self.remove_from_multicast(signature, callback, addr)
    }

    /// Remove every entry of a multicast delegate, returning how many there were.
    pub fn clear_multicast(&mut self, object: ObjectHandle, property: &str) -> BridgeResult<usize> {
        let (_, _, addr) = self.delegate_slot(object, property, true)?;
        self.clear_multicast_slot(addr)
    }

    /// Invoke a single-cast delegate from script.
    ///
    /// Returns the return value followed by out-parameters, or nothing if the
    /// delegate is unbound.
    pub fn execute_delegate(&mut self, object: ObjectHandle, property: &str, args: &[ScriptValue]) -> Vec<ScriptValue> {
        let outcome = self.delegate_slot(object, property, false).and_then(|(_, signature, addr)| {
            let delegate = self.host.read_delegate(addr)?;
            if resolve_delegate(&self.host, delegate).is_none() {
                debug!(target: "refbridge::delegates", property, "delegate is unbound");
                return Ok(Vec::new());
            }
            let desc = self.registry.register_function(&mut self.host, signature)?;
            desc.call_with(self, args, |env, params| {
                refbridge_core::execute_delegate(env, delegate, params)?;
                Ok(())
            })
        });
        outcome.unwrap_or_else(|err| {
            self.report(err);
            Vec::new()
        })
    }

    /// Invoke every entry of a multicast delegate from script. Returns how many ran.
    pub fn broadcast_delegate(&mut self, object: ObjectHandle, property: &str, args: &[ScriptValue]) -> usize {
        let outcome = self.delegate_slot(object, property, true).and_then(|(_, signature, addr)| {
            let desc = self.registry.register_function(&mut self.host, signature)?;
            let mut fired = 0;
            desc.call_with(self, args, |env, params| {
                fired = broadcast(env, addr, params)?;
                Ok(())
            })?;
            Ok(fired)
        });
        outcome.unwrap_or_else(|err| {
            self.report(err);
            0
        })
    }

    /// Bind a callback to a delegate signature directly, without a slot.
    ///
    /// Returns the synthesized function, which the host can put in any
    /// delegate value with `instance` (or the delegate proxy) as target.
    /// Binding the same triple again shares the function.
    pub fn bind_callback(
        &mut self,
        signature: FunctionId,
        callback: &ScriptFunction,
        instance: Option<ObjectHandle>,
    ) -> BridgeResult<FunctionId> {
        let name = self.host.try_function(signature)?.name.clone();
        let (instance, pass_self) = match instance {
            Some(instance) => (instance, true),
            None => (self.delegate_proxy, false),
        };
        self.acquire_signature(&name, signature, callback.clone(), instance, pass_self)
    }

    /// Drop a reference taken by [`bind_callback`](Self::bind_callback).
    pub fn unbind_callback(&mut self, function: FunctionId) -> bool {
        if !self.delegates.contains(function) {
            return false;
        }
        self.release_signature(function);
        true
    }

    /// Reference count of a synthesized function, or zero if it is gone.
    pub fn callback_bindings(&self, function: FunctionId) -> u32 {
        self.delegates.signature(function).map_or(0, SignatureDescriptor::bindings)
    }

    /// Tear down every signature bound to instances of `class`. Returns how many.
    pub fn cleanup_by_class(&mut self, class: ClassId) -> usize {
        let functions: Vec<FunctionId> = self
            .delegates
            .signatures
            .values()
            .filter(|desc| desc.class == class)
            .map(|desc| desc.function)
            .collect();
        for function in &functions {
            self.mark_for_delete(*function, true);
        }
        functions.len()
    }

    /// Tear down every signature. Returns how many.
    pub fn cleanup_delegates(&mut self) -> usize {
        let functions: Vec<FunctionId> = self.delegates.signatures.keys().copied().collect();
        for function in &functions {
            self.mark_for_delete(*function, true);
        }
        self.delegates.slots.clear();
        self.delegates.multicast.clear();
        functions.len()
    }

    pub fn delegates(&self) -> &DelegateManager {
        &self.delegates
    }
}
