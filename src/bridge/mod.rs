//! Function descriptors and the two call directions.
//!
//! A [`FunctionDescriptor`] is built once per host function and cached in
//! the [`Registry`](crate::Registry) side-table. It owns the marshaling
//! descriptor for every parameter, the indices of the return slot, the
//! latent marker and the out-parameters, and a persistent parameter buffer.
//!
//! ## Script calls host
//!
//! [`FunctionDescriptor::call_host`] takes script arguments, fills a
//! parameter block, dispatches through the host and returns the results:
//! the return value first, then non-const out-parameters in declaration
//! order.
//!
//! ## Host calls script
//!
//! [`FunctionDescriptor::call_script`] is used by trampolines. It marshals
//! the host frame onto the script stack, runs the bound script function under
//! a protected call, and writes the results back into the frame.
//!
//! ## Parameter buffers
//!
//! The outermost call of a descriptor reuses its persistent buffer.
//! Reentrant calls fall back to a heap buffer freed when the call returns.

mod call_host;
mod call_script;

use std::cell::Cell;

use refbridge_core::{FunctionFlags, FunctionId, Host, HostAddr, PropertyType, RegionId};
use tracing::trace;

use crate::marshal::PropertyDescriptor;
use crate::registry::DefaultParams;
use crate::{BridgeResult, Env, ScriptValue};

/// Marshaling plan and call state for one host function.
#[derive(Debug)]
pub struct FunctionDescriptor {
    function: FunctionId,
    name: String,
    flags: FunctionFlags,
    params: Vec<PropertyDescriptor>,
    defaults: Vec<Option<ScriptValue>>,
    return_index: Option<usize>,
    latent_index: Option<usize>,
    out_indices: Vec<usize>,
    /// Script argument position for each parameter. The return slot has none.
    arg_slots: Vec<Option<usize>>,
    params_size: u32,
    persistent: Cell<Option<RegionId>>,
    depth: Cell<u32>,
}

/// Where a call's parameter block lives.
#[derive(Debug, Clone, Copy)]
enum ParamBuffer {
    Persistent(HostAddr),
    Heap(HostAddr),
}

impl ParamBuffer {
    fn addr(self) -> HostAddr {
        match self {
            ParamBuffer::Persistent(addr) | ParamBuffer::Heap(addr) => addr,
        }
    }
}

impl FunctionDescriptor {
    /// Build the descriptor for a host function.
    ///
    /// Defaults are looked up by parameter name on the declaring class and
    /// its ancestors, so a function duplicated onto a subclass keeps the
    /// defaults of the original.
    pub fn new(host: &Host, function: FunctionId, defaults: &DefaultParams) -> BridgeResult<Self> {
        let def = host.try_function(function)?;
        let params: Vec<PropertyDescriptor> = def.params.iter().map(PropertyDescriptor::new).collect();

        let return_index = params.iter().position(PropertyDescriptor::is_return);
        let latent_class = host.latent_action_info();
        let latent_index = if def.flags.contains(FunctionFlags::LATENT) {
            params.iter().position(
                |p| matches!(p.ty, PropertyType::Struct { class } if class == latent_class),
            )
        } else {
            None
        };
        let out_indices = params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_non_const_out())
            .map(|(i, _)| i)
            .collect();

        let mut next_slot = 0;
        let arg_slots = params
            .iter()
            .map(|p| {
                if p.is_return() {
                    return None;
                }
                next_slot += 1;
                Some(next_slot - 1)
            })
            .collect();

        let class_names: Vec<&str> = host
            .super_chain(def.owner)
            .into_iter()
            .filter_map(|c| host.class(c).map(|d| d.name.as_str()))
            .collect();
        let defaults_for = params
            .iter()
            .map(|p| {
                class_names
                    .iter()
                    .find_map(|class| defaults.get(class, &def.name, &p.name))
                    .map(|d| d.to_script())
            })
            .collect();

        Ok(Self {
            function,
            name: def.name.clone(),
            flags: def.flags,
            params,
            defaults: defaults_for,
            return_index,
            latent_index,
            out_indices,
            arg_slots,
            params_size: def.params_size,
            persistent: Cell::new(None),
            depth: Cell::new(0),
        })
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> FunctionFlags {
        self.flags
    }

    /// Parameter descriptors in declaration order, including the return slot.
    pub fn params(&self) -> &[PropertyDescriptor] {
        &self.params
    }

    pub fn return_index(&self) -> Option<usize> {
        self.return_index
    }

    /// Index of the `LatentActionInfo` parameter of a latent function.
    pub fn latent_index(&self) -> Option<usize> {
        self.latent_index
    }

    /// Indices of the parameters copied back to the caller, in order.
    pub fn out_indices(&self) -> &[usize] {
        &self.out_indices
    }

    /// Default value of a parameter, if one was registered.
    pub fn default_value(&self, index: usize) -> Option<&ScriptValue> {
        self.defaults.get(index)?.as_ref()
    }

    /// Number of calls of this function currently on the stack.
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Whether the persistent buffer has been allocated.
    pub fn has_persistent_buffer(&self) -> bool {
        self.persistent.get().is_some()
    }

    fn acquire_buffer(&self, env: &mut Env) -> BridgeResult<ParamBuffer> {
        let size = self.params_size.max(1);
        if env.config().persistent_param_buffer {
            if self.depth.get() == 0 {
                let region = match self.persistent.get() {
                    Some(region) if env.host().memory().is_live(region) => region,
                    _ => {
                        let region = env.host_mut().memory_mut().alloc(size);
                        self.persistent.set(Some(region));
                        region
                    }
                };
                let addr = HostAddr::base(region);
                env.host_mut().memory_mut().zero(addr, size)?;
                return Ok(ParamBuffer::Persistent(addr));
            }
            trace!(
                target: "refbridge::bridge",
                function = %self.name,
                depth = self.depth.get(),
                "reentrant call, using a heap parameter buffer"
            );
        }
        let region = env.host_mut().memory_mut().alloc(size);
        Ok(ParamBuffer::Heap(HostAddr::base(region)))
    }

    fn free_buffer(&self, env: &mut Env, buffer: ParamBuffer) {
        if let ParamBuffer::Heap(addr) = buffer {
            env.host_mut().memory_mut().free(addr.region);
        }
    }

    /// Destroy what a call left in its parameter block.
    fn cleanup_params(&self, env: &mut Env, params: HostAddr, owned: &[bool]) {
        for (index, param) in self.params.iter().enumerate() {
            let owned = owned.get(index).copied().unwrap_or(false)
                || (param.is_out() && env.host().needs_destroy(&param.ty));
            if !owned {
                continue;
            }
            if let Err(err) = env.host_mut().destroy_value(&param.ty, params.at(param.offset)) {
                env.report(err.into());
            }
        }
    }

    /// Free the persistent buffer.
    pub(crate) fn release_buffer(&self, host: &mut Host) {
        if let Some(region) = self.persistent.take() {
            host.memory_mut().free(region);
        }
    }
}
