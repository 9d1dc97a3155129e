use refbridge_core::{
    Callspace, Frame, FunctionFlags, FunctionId, HostAddr, ObjectHandle, PropertyFlags, invoke,
};
use tracing::debug;

use crate::bridge::FunctionDescriptor;
use crate::script::UserdataId;
use crate::{BridgeError, BridgeResult, Env, ScriptValue};

impl FunctionDescriptor {
    /// Call the host function from script.
    ///
    /// Instance functions take the target object as the first argument;
    /// static functions run on the class default object and take no target.
    /// Missing trailing arguments take their registered defaults; an explicit
    /// nil is passed as the zero value. Returns the return value followed by non-const out-parameters. Any
    /// failure is reported on the environment and yields no results.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_host(&self, env: &mut Env, args: &[ScriptValue]) -> Vec<ScriptValue> {
        let outcome = self
            .resolve_target(env, args)
            .and_then(|(object, function, rest)| {
                self.call_with(env, rest, |env, params| {
                    Self::dispatch(env, object, function, params)
                })
            });
        match outcome {
            Ok(results) => results,
            Err(err) => {
                env.report(err);
                Vec::new()
            }
        }
    }

    /// Fill a parameter block from `args`, run `dispatch` on it and collect
    /// the results.
    pub(crate) fn call_with<F>(&self, env: &mut Env, args: &[ScriptValue], dispatch: F) -> BridgeResult<Vec<ScriptValue>>
    where
        F: FnOnce(&mut Env, HostAddr) -> BridgeResult<()>,
    {
        let buffer = self.acquire_buffer(env)?;
        let params = buffer.addr();
        self.depth.set(self.depth.get() + 1);

        let result = match self.fill_params(env, args, params) {
            Ok(owned) => {
                let results = dispatch(env, params).map(|()| self.collect_results(env, args, params));
                self.cleanup_params(env, params, &owned);
                results
            }
            Err(err) => {
                self.cleanup_params(env, params, &vec![true; self.params.len()]);
                Err(err)
            }
        };

        self.depth.set(self.depth.get() - 1);
        self.free_buffer(env, buffer);
        result
    }

    fn resolve_target<'a>(
        &self,
        env: &Env,
        args: &'a [ScriptValue],
    ) -> BridgeResult<(ObjectHandle, FunctionId, &'a [ScriptValue])> {
        let host = env.host();
        let def = host
            .function(self.function)
            .ok_or_else(|| BridgeError::stale(format!("function '{}'", self.name)))?;

        let (object, rest) = if def.is_static() {
            let object = host
                .default_object(def.owner)
                .ok_or_else(|| BridgeError::invalid_call(&self.name, "class has no default object"))?;
            (object, args)
        } else {
            let Some((first, rest)) = args.split_first() else {
                return Err(BridgeError::invalid_call(&self.name, "missing target object"));
            };
            let Some(object) = first.as_object() else {
                return Err(BridgeError::invalid_call(
                    &self.name,
                    format!("expected an object as target, got {}", first.type_name()),
                ));
            };
            (object, rest)
        };
        if !host.is_valid(object) {
            return Err(BridgeError::stale(format!("target of '{}'", self.name)));
        }

        let mut function = self.function;
        if self.flags.contains(FunctionFlags::INTERFACE) {
            function = host
                .class_of(object)
                .and_then(|class| host.find_function(class, &self.name))
                .ok_or_else(|| BridgeError::invalid_call(&self.name, "target does not implement the interface"))?;
        }
        // Overridden functions run their original behavior, not the script.
        if let Some(original) = env.interceptor().original_of(function) {
            function = original;
        }
        Ok((object, function, rest))
    }

    fn dispatch(env: &mut Env, object: ObjectHandle, function: FunctionId, params: HostAddr) -> BridgeResult<()> {
        let callspace = env.host().function_callspace(object, function);
        if callspace.is_remote() {
            env.host_mut().call_remote(object, function, params)?;
        }
        if callspace.is_local() {
            invoke(env, Frame::new(function, object, params))?;
        }
        if callspace == Callspace::Absorbed {
            debug!(target: "refbridge::bridge", ?object, ?function, "call absorbed");
        }
        Ok(())
    }

    /// Write arguments into the block. Returns which slots the caller owns.
    fn fill_params(&self, env: &mut Env, args: &[ScriptValue], params: HostAddr) -> BridgeResult<Vec<bool>> {
        let mut owned = vec![false; self.params.len()];
        for (index, param) in self.params.iter().enumerate() {
            if Some(index) == self.return_index {
                continue;
            }
            let addr = params.at(param.offset);
            let provided = self.arg_slots[index].and_then(|slot| args.get(slot));
            let arg = provided.filter(|value| !value.is_nil());

            if Some(index) == self.latent_index {
                if let Some(value) = arg
                    && param.write_from_userdata(env, value, addr)?
                {
                    continue;
                }
                env.write_latent_token(addr)?;
                continue;
            }

            let pure_out = param.is_non_const_out() && !param.flags.contains(PropertyFlags::REFERENCE);
            let value = match arg {
                Some(_) if pure_out => continue,
                Some(value) => value,
                None if param.is_non_const_out() => continue,
                // Defaults only fill arguments past the end of `args`.
                None if provided.is_some() => continue,
                None => match &self.defaults[index] {
                    Some(default) => default,
                    None => continue,
                },
            };
            owned[index] = param.write(env, value, addr, false);
        }
        Ok(owned)
    }

    fn collect_results(&self, env: &mut Env, args: &[ScriptValue], params: HostAddr) -> Vec<ScriptValue> {
        let mut results = Vec::with_capacity(self.out_indices.len() + 1);
        if let Some(index) = self.return_index {
            let param = &self.params[index];
            results.push(param.read(env, params.at(param.offset), true));
        }
        for &index in &self.out_indices {
            let param = &self.params[index];
            let addr = params.at(param.offset);
            let arg = self.arg_slots[index].and_then(|slot| args.get(slot));
            if let Some(ScriptValue::Userdata(id)) = arg
                && self.move_into_userdata(env, *id, index, addr)
            {
                results.push(ScriptValue::Userdata(*id));
                continue;
            }
            results.push(param.read(env, addr, true));
        }
        results
    }

    /// Move an out-parameter into the userdata the caller passed for it.
    fn move_into_userdata(&self, env: &mut Env, id: UserdataId, index: usize, src: HostAddr) -> bool {
        let param = &self.params[index];
        let same_type = env.script().userdata(id).is_some_and(|u| u.ty == param.ty);
        let Some(dst) = env.userdata_addr(id) else {
            return false;
        };
        if !same_type {
            return false;
        }
        let moved = env
            .host_mut()
            .destroy_value(&param.ty, dst)
            .and_then(|()| env.host_mut().move_value(&param.ty, src, dst));
        match moved {
            Ok(()) => true,
            Err(err) => {
                env.report(err.into());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbridge_core::{ClassDef, FunctionDef, IntKind, NativeFn, PropertyType};

    fn split(env: &mut Env) -> (ObjectHandle, FunctionId) {
        let class = env.host_mut().register_class(ClassDef::class("Math")).unwrap();
        let function = env
            .host_mut()
            .add_function(
                class,
                FunctionDef::new("Split")
                    .with_param("A", PropertyType::int32())
                    .with_out("B", PropertyType::int32())
                    .with_return(PropertyType::int32())
                    .with_native(NativeFn::new(|ctx| {
                        let a = ctx.arg_i64(0)?;
                        ctx.set_out_i64(1, a + 1)?;
                        ctx.set_return_i64(a * 2)?;
                        Ok(())
                    })),
            )
            .unwrap();
        let object = env.host_mut().new_object(class, "math").unwrap();
        (object, function)
    }

    #[test]
    fn return_value_then_outs() {
        let mut env = Env::new();
        let (object, function) = split(&mut env);
        let desc = env.register_function(function).unwrap();
        let results = desc.call_host(&mut env, &[ScriptValue::from(object), ScriptValue::Integer(5)]);
        assert_eq!(results, vec![ScriptValue::Integer(10), ScriptValue::Integer(6)]);
        assert!(desc.has_persistent_buffer());
        assert_eq!(desc.depth(), 0);
    }

    #[test]
    fn missing_target_is_soft() {
        let mut env = Env::new();
        let (_, function) = split(&mut env);
        let desc = env.register_function(function).unwrap();
        assert!(desc.call_host(&mut env, &[ScriptValue::Integer(5)]).is_empty());
        assert!(matches!(
            env.diagnostics().last(),
            Some(BridgeError::InvalidCall { .. })
        ));

        let object_class = env.host().object_class();
        let object = env.host_mut().new_object(object_class, "gone").unwrap();
        env.host_mut().destroy_object(object).unwrap();
        assert!(desc.call_host(&mut env, &[ScriptValue::from(object)]).is_empty());
    }

    #[test]
    fn outs_move_into_matching_userdata() {
        let mut env = Env::new();
        let class = env.host_mut().register_class(ClassDef::class("Lists")).unwrap();
        let function = env
            .host_mut()
            .add_function(
                class,
                FunctionDef::new("Fill")
                    .with_ref("Items", PropertyType::array(PropertyType::int32()))
                    .with_native(NativeFn::new(|ctx| {
                        let addr = ctx.out_addr(0)?;
                        let ty = PropertyType::array(PropertyType::int32());
                        let host = ctx.host_mut();
                        let id = host.container_ensure(addr, &ty)?;
                        let slot = host.container_push(id)?;
                        host.memory_mut().write_int(slot, IntKind::I32, 7)?;
                        Ok(())
                    })),
            )
            .unwrap();
        let object = env.host_mut().new_object(class, "lists").unwrap();
        let (items, _) = env.new_userdata(PropertyType::array(PropertyType::int32())).unwrap();

        let desc = env.register_function(function).unwrap();
        let results = desc.call_host(&mut env, &[ScriptValue::from(object), ScriptValue::Userdata(items)]);
        assert_eq!(results, vec![ScriptValue::Userdata(items)]);

        let addr = env.userdata_addr(items).unwrap();
        let container = env.host().container_at(addr).unwrap();
        assert_eq!(env.host().container_len(container).unwrap(), 1);
    }
}
