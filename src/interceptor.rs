//! Redirecting host dispatch into script.
//!
//! Overriding a host function swaps its entry point for a trampoline that
//! calls [`HostEnv::enter_script`](refbridge_core::HostEnv::enter_script).
//! The original behavior stays reachable through a shadow function that
//! script-calls-host dispatch uses instead of the trampolined one.
//!
//! - **Direct override**: the function is declared on the target class. It is
//!   patched in place and a `<name>__Overridden` duplicate keeps the original
//!   native entry and body.
//! - **Inherited override**: the function comes from an ancestor. It is
//!   duplicated onto the target class under the same name and the duplicate
//!   is patched; the ancestor's function is the shadow and stays untouched.
//!
//! Names ending in [`SHADOW_SUFFIX`] are reserved.

use refbridge_core::{ClassId, FunctionFlags, FunctionId, Host, HostError, NativeFn};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{BridgeError, BridgeResult};

/// Suffix of the duplicate that keeps a directly overridden function's original entry.
pub const SHADOW_SUFFIX: &str = "__Overridden";

/// One installed override.
#[derive(Debug, Clone)]
pub struct OverrideRecord {
    /// Class the override was installed for.
    pub class: ClassId,
    /// The function override was requested for.
    pub source: FunctionId,
    /// The function carrying the trampoline.
    pub function: FunctionId,
    /// Still-native function with the original behavior.
    pub shadow: FunctionId,
    /// Whether `function` is a duplicate of an ancestor's function.
    pub inherited: bool,
    native: Option<NativeFn>,
    body: Option<NativeFn>,
    flags: FunctionFlags,
}

/// Installs and restores trampolines.
#[derive(Debug)]
pub struct Interceptor {
    trampoline: NativeFn,
    records: FxHashMap<(ClassId, FunctionId), OverrideRecord>,
    installed: FxHashMap<FunctionId, (ClassId, FunctionId)>,
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor {
    pub fn new() -> Self {
        Self {
            trampoline: NativeFn::new(|ctx| ctx.enter_script()),
            records: FxHashMap::default(),
            installed: FxHashMap::default(),
        }
    }

    /// The entry point installed on overridden functions.
    pub fn trampoline(&self) -> &NativeFn {
        &self.trampoline
    }

    /// Whether script may supply a body for a function: script-implementable
    /// events, and native events that are not network-routed.
    pub fn is_overridable(host: &Host, function: FunctionId) -> bool {
        let Some(def) = host.function(function) else {
            return false;
        };
        def.flags.contains(FunctionFlags::SCRIPT_EVENT)
            || (def.flags.contains(FunctionFlags::NATIVE | FunctionFlags::EVENT)
                && !def.flags.contains(FunctionFlags::NET))
    }

    /// Clone a function onto `class` under `name`, with its own parameter layout.
    pub fn duplicate(host: &mut Host, source: FunctionId, class: ClassId, name: &str) -> BridgeResult<FunctionId> {
        let mut def = host.try_function(source)?.clone();
        def.name = name.to_string();
        Ok(host.add_function(class, def)?)
    }

    /// Replace a function's entry with the trampoline and drop its body.
    pub fn install_trampoline(&self, host: &mut Host, function: FunctionId) -> BridgeResult<()> {
        let def = host
            .function_mut(function)
            .ok_or(HostError::StaleFunction(function))?;
        def.native = Some(self.trampoline.clone());
        def.body = None;
        def.flags |= FunctionFlags::NATIVE;
        Ok(())
    }

    /// Whether a function currently carries the trampoline.
    pub fn is_trampolined(&self, host: &Host, function: FunctionId) -> bool {
        host.function(function)
            .and_then(|def| def.native.as_ref())
            .is_some_and(|native| native.ptr_eq(&self.trampoline))
    }

    /// Redirect `function` into script for instances of `class`.
    ///
    /// Returns the function that carries the trampoline. Overriding the same
    /// (class, function) pair again returns the existing one.
    pub fn override_function(&mut self, host: &mut Host, function: FunctionId, class: ClassId) -> BridgeResult<FunctionId> {
        if let Some(record) = self.records.get(&(class, function)) {
            if host.is_function_live(record.function) {
                return Ok(record.function);
            }
            self.forget(class, function);
        }
        if let Some(key) = self.installed.get(&function)
            && key.0 == class
        {
            return Ok(function);
        }

        let def = host.try_function(function)?.clone();
        if !host.is_child_of(class, def.owner) {
            return Err(BridgeError::invalid_call(
                &def.name,
                "function is not declared on the class or its ancestors",
            ));
        }

        let record = if def.owner == class {
            let shadow = Self::duplicate(host, function, class, &format!("{}{SHADOW_SUFFIX}", def.name))?;
            self.install_trampoline(host, function)?;
            OverrideRecord {
                class,
                source: function,
                function,
                shadow,
                inherited: false,
                native: def.native,
                body: def.body,
                flags: def.flags,
            }
        } else {
            let duplicate = Self::duplicate(host, function, class, &def.name)?;
            self.install_trampoline(host, duplicate)?;
            OverrideRecord {
                class,
                source: function,
                function: duplicate,
                shadow: function,
                inherited: true,
                native: None,
                body: None,
                flags: def.flags,
            }
        };
        debug!(
            target: "refbridge::interceptor",
            function = %def.name,
            ?class,
            inherited = record.inherited,
            "override installed"
        );
        let installed = record.function;
        self.installed.insert(installed, (class, function));
        self.records.insert((class, function), record);
        Ok(installed)
    }

    fn forget(&mut self, class: ClassId, function: FunctionId) -> Option<OverrideRecord> {
        let record = self.records.remove(&(class, function))?;
        self.installed.remove(&record.function);
        Some(record)
    }

    fn restore_record(host: &mut Host, record: &OverrideRecord) {
        if record.inherited {
            host.remove_function(record.function);
        } else {
            if let Some(def) = host.function_mut(record.function) {
                def.native = record.native.clone();
                def.body = record.body.clone();
                def.flags = record.flags;
            }
            host.remove_function(record.shadow);
        }
        debug!(
            target: "refbridge::interceptor",
            function = ?record.source,
            class = ?record.class,
            "override restored"
        );
    }

    /// Undo every override involving `function`, whether it is the
    /// trampolined function or the one override was requested for.
    ///
    /// Safe to call repeatedly and after the function is gone. Returns how
    /// many overrides were undone.
    pub fn restore_original(&mut self, host: &mut Host, function: FunctionId) -> usize {
        let keys: Vec<(ClassId, FunctionId)> = self
            .records
            .iter()
            .filter(|(_, r)| r.function == function || r.source == function)
            .map(|(key, _)| *key)
            .collect();
        self.restore_keys(host, keys)
    }

    /// Undo every override installed for a class.
    pub fn restore_class(&mut self, host: &mut Host, class: ClassId) -> usize {
        let keys: Vec<(ClassId, FunctionId)> = self.records.keys().filter(|k| k.0 == class).copied().collect();
        self.restore_keys(host, keys)
    }

    /// Undo every override.
    pub fn restore_all(&mut self, host: &mut Host) -> usize {
        let keys: Vec<(ClassId, FunctionId)> = self.records.keys().copied().collect();
        self.restore_keys(host, keys)
    }

    fn restore_keys(&mut self, host: &mut Host, keys: Vec<(ClassId, FunctionId)>) -> usize {
        let mut restored = 0;
        for (class, function) in keys {
            if let Some(record) = self.forget(class, function) {
                Self::restore_record(host, &record);
                restored += 1;
            }
        }
        restored
    }

    /// The function to dispatch instead of a trampolined one.
    pub fn shadow_of(&self, function: FunctionId) -> Option<FunctionId> {
        let key = self.installed.get(&function)?;
        self.records.get(key).map(|r| r.shadow)
    }

    /// The still-native function behind `function`, following shadows
    /// through every override level. `None` if `function` is not trampolined.
    ///
    /// An inherited override's shadow is the ancestor's function, which may
    /// itself be overridden.
    pub fn original_of(&self, function: FunctionId) -> Option<FunctionId> {
        let mut current = self.shadow_of(function)?;
        for _ in 0..self.records.len() {
            match self.shadow_of(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }

    /// The override whose trampoline is on `function`.
    pub fn record_for_installed(&self, function: FunctionId) -> Option<&OverrideRecord> {
        let key = self.installed.get(&function)?;
        self.records.get(key)
    }

    /// The override for a (class, function) pair.
    pub fn record(&self, class: ClassId, function: FunctionId) -> Option<&OverrideRecord> {
        self.records.get(&(class, function))
    }

    /// Number of installed overrides.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
