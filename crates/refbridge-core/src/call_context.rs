//! Dispatch and the context native entry points run in.
//!
//! ## Key Types
//!
//! - [`Frame`]: one invocation; function, target object, parameter block
//! - [`HostEnv`]: whatever owns the [`Host`]; the seam trampolines use to
//!   leave native code
//! - [`CallContext`]: what a [`NativeFn`](crate::NativeFn) receives
//!
//! Parameters normally live in the frame's parameter block. A caller that
//! wants out-parameters or the return value written elsewhere passes
//! [`OutParamRecord`]s or a return address; the typed accessors on
//! [`CallContext`] resolve through those first.

use crate::{
    DelegateValue, FunctionId, Host, HostAddr, HostError, IntKind, NameId, NativeError,
    ObjectHandle, PropertyDef, PropertyType,
};

/// Redirects an out-parameter to storage outside the parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutParamRecord {
    /// Parameter index.
    pub param: usize,
    /// Where the caller wants the value.
    pub addr: HostAddr,
}

/// One invocation of a host function.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Function being executed.
    pub function: FunctionId,
    /// Target object; the class default object for static functions.
    pub object: ObjectHandle,
    /// Base of the parameter block.
    pub params: HostAddr,
    /// Out-parameter redirections.
    pub out_params: Vec<OutParamRecord>,
    /// Where the return value goes instead of the parameter block.
    pub return_addr: Option<HostAddr>,
}

impl Frame {
    /// Create a frame writing everything into its parameter block.
    pub fn new(function: FunctionId, object: ObjectHandle, params: HostAddr) -> Self {
        Self {
            function,
            object,
            params,
            out_params: Vec::new(),
            return_addr: None,
        }
    }

    /// Redirect an out-parameter.
    pub fn with_out_param(mut self, param: usize, addr: HostAddr) -> Self {
        self.out_params.push(OutParamRecord { param, addr });
        self
    }

    /// Redirect the return value.
    pub fn with_return_addr(mut self, addr: HostAddr) -> Self {
        self.return_addr = Some(addr);
        self
    }

    /// Find the redirection for a parameter, if any.
    pub fn out_record(&self, param: usize) -> Option<&OutParamRecord> {
        self.out_params.iter().find(|r| r.param == param)
    }
}

/// The owner of a [`Host`], as seen from native code.
pub trait HostEnv {
    /// The host.
    fn host(&self) -> &Host;

    /// The host, mutably.
    fn host_mut(&mut self) -> &mut Host;

    /// Called by installed trampolines to hand the frame to script.
    ///
    /// The default has no script side and fails.
    fn enter_script(&mut self, frame: &Frame) -> Result<(), NativeError> {
        let function = self
            .host()
            .function(frame.function)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        Err(NativeError::NoScriptBinding { function })
    }
}

impl HostEnv for Host {
    fn host(&self) -> &Host {
        self
    }

    fn host_mut(&mut self) -> &mut Host {
        self
    }
}

/// Context passed to native entry points.
pub struct CallContext<'a> {
    env: &'a mut dyn HostEnv,
    frame: Frame,
}

impl<'a> CallContext<'a> {
    /// Create a context for a frame.
    pub fn new(env: &'a mut dyn HostEnv, frame: Frame) -> Self {
        Self { env, frame }
    }

    /// The host.
    pub fn host(&self) -> &Host {
        self.env.host()
    }

    /// The host, mutably.
    pub fn host_mut(&mut self) -> &mut Host {
        self.env.host_mut()
    }

    /// The environment, for nested dispatch.
    pub fn env(&mut self) -> &mut dyn HostEnv {
        &mut *self.env
    }

    /// The current frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// The target object.
    pub fn this(&self) -> ObjectHandle {
        self.frame.object
    }

    /// Hand the current frame to script. Used by trampolines.
    pub fn enter_script(&mut self) -> Result<(), NativeError> {
        self.env.enter_script(&self.frame)
    }

    fn param(&self, index: usize) -> Result<PropertyDef, HostError> {
        let function = self.host().try_function(self.frame.function)?;
        function
            .params
            .get(index)
            .cloned()
            .ok_or(HostError::ParamOutOfRange {
                index,
                count: function.params.len(),
            })
    }

    /// Address of a parameter inside the parameter block.
    pub fn param_addr(&self, index: usize) -> Result<HostAddr, HostError> {
        Ok(self.frame.params.at(self.param(index)?.offset))
    }

    /// Where an out-parameter should be read from or written to.
    pub fn out_addr(&self, index: usize) -> Result<HostAddr, HostError> {
        match self.frame.out_record(index) {
            Some(record) => Ok(record.addr),
            None => self.param_addr(index),
        }
    }

    /// Where the return value should be written.
    pub fn return_addr(&self) -> Result<HostAddr, HostError> {
        if let Some(addr) = self.frame.return_addr {
            return Ok(addr);
        }
        let function = self.host().try_function(self.frame.function)?;
        let param = function
            .params
            .iter()
            .find(|p| p.is_return())
            .ok_or_else(|| HostError::NoReturnValue(function.name.clone()))?;
        Ok(self.frame.params.at(param.offset))
    }

    fn int_kind(ty: &PropertyType) -> IntKind {
        match ty {
            PropertyType::Int(kind) => *kind,
            PropertyType::Enum { underlying, .. } => *underlying,
            _ => IntKind::I64,
        }
    }

    // === Typed argument access ===

    /// Read an integer parameter.
    pub fn arg_i64(&self, index: usize) -> Result<i64, HostError> {
        let param = self.param(index)?;
        self.host()
            .memory()
            .read_int(self.out_addr(index)?, Self::int_kind(&param.ty))
    }

    /// Read a float parameter.
    pub fn arg_f64(&self, index: usize) -> Result<f64, HostError> {
        let param = self.param(index)?;
        let PropertyType::Float(kind) = param.ty else {
            return Err(HostError::StorageMismatch {
                expected: "float",
                found: param.ty.kind_name().to_string(),
            });
        };
        self.host().memory().read_float(self.out_addr(index)?, kind)
    }

    /// Read a bool parameter.
    pub fn arg_bool(&self, index: usize) -> Result<bool, HostError> {
        self.host().memory().read_bool(self.out_addr(index)?)
    }

    /// Read a string parameter.
    pub fn arg_string(&self, index: usize) -> Result<String, HostError> {
        self.host().read_string(self.out_addr(index)?)
    }

    /// Read a name parameter.
    pub fn arg_name(&self, index: usize) -> Result<NameId, HostError> {
        self.host().read_name(self.out_addr(index)?)
    }

    /// Read an object parameter.
    pub fn arg_object(&self, index: usize) -> Result<ObjectHandle, HostError> {
        self.host().read_object(self.out_addr(index)?)
    }

    // === Typed result access ===

    /// Write an integer out-parameter.
    pub fn set_out_i64(&mut self, index: usize, value: i64) -> Result<(), HostError> {
        let param = self.param(index)?;
        let addr = self.out_addr(index)?;
        self.host_mut()
            .memory_mut()
            .write_int(addr, Self::int_kind(&param.ty), value)
    }

    /// Write a string out-parameter.
    pub fn set_out_string(&mut self, index: usize, value: &str) -> Result<(), HostError> {
        let addr = self.out_addr(index)?;
        self.host_mut().write_string(addr, value)
    }

    /// Write an integer return value.
    pub fn set_return_i64(&mut self, value: i64) -> Result<(), HostError> {
        let index = self.return_index()?;
        let kind = Self::int_kind(&self.param(index)?.ty);
        let addr = self.return_addr()?;
        self.host_mut().memory_mut().write_int(addr, kind, value)
    }

    /// Write a float return value.
    pub fn set_return_f64(&mut self, value: f64) -> Result<(), HostError> {
        let index = self.return_index()?;
        let PropertyType::Float(kind) = self.param(index)?.ty else {
            return Err(HostError::StorageMismatch {
                expected: "float",
                found: self.param(index)?.ty.kind_name().to_string(),
            });
        };
        let addr = self.return_addr()?;
        self.host_mut().memory_mut().write_float(addr, kind, value)
    }

    /// Write a bool return value.
    pub fn set_return_bool(&mut self, value: bool) -> Result<(), HostError> {
        let addr = self.return_addr()?;
        self.host_mut().memory_mut().write_bool(addr, value)
    }

    /// Write a string return value.
    pub fn set_return_string(&mut self, value: &str) -> Result<(), HostError> {
        let addr = self.return_addr()?;
        self.host_mut().write_string(addr, value)
    }

    /// Write an object return value.
    pub fn set_return_object(&mut self, value: ObjectHandle) -> Result<(), HostError> {
        let addr = self.return_addr()?;
        self.host_mut().write_object(addr, value)
    }

    fn return_index(&self) -> Result<usize, HostError> {
        let function = self.host().try_function(self.frame.function)?;
        function
            .return_index()
            .ok_or_else(|| HostError::NoReturnValue(function.name.clone()))
    }
}

/// Dispatch a frame: the native entry if installed, else the body, else nothing.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn invoke(env: &mut dyn HostEnv, frame: Frame) -> Result<(), HostError> {
    let function = env.host().try_function(frame.function)?;
    let is_static = function.is_static();
    let entry = function.native.clone().or_else(|| function.body.clone());
    if !is_static && !env.host().is_valid(frame.object) {
        return Err(HostError::StaleObject(frame.object));
    }
    match entry {
        Some(entry) => {
            let mut ctx = CallContext::new(env, frame);
            entry.call(&mut ctx)?;
            Ok(())
        }
        None => Ok(()),
    }
}

/// Invoke a single-cast delegate with a parameter block laid out for its signature.
///
/// Returns false without dispatching when the delegate is unbound or its
/// target is gone.
pub fn execute_delegate(env: &mut dyn HostEnv, delegate: DelegateValue, params: HostAddr) -> Result<bool, HostError> {
    let Some(function) = resolve_delegate(env.host(), delegate) else {
        return Ok(false);
    };
    invoke(env, Frame::new(function, delegate.object, params))?;
    Ok(true)
}

/// Invoke every entry of a multicast delegate, returning how many ran.
///
/// The invocation list is snapshotted first, so entries may unbind
/// themselves while running.
pub fn broadcast(env: &mut dyn HostEnv, addr: HostAddr, params: HostAddr) -> Result<usize, HostError> {
    let entries = env.host().multicast_list(addr)?;
    let mut fired = 0;
    for entry in entries {
        if execute_delegate(env, entry, params)? {
            fired += 1;
        }
    }
    Ok(fired)
}

/// Find the function a delegate value points at.
pub fn resolve_delegate(host: &Host, delegate: DelegateValue) -> Option<FunctionId> {
    if !delegate.is_bound() {
        return None;
    }
    let class = host.class_of(delegate.object)?;
    host.find_function(class, host.memory().name(delegate.function))
}
