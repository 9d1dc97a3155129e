use refbridge_core::{Frame, HostAddr};

use crate::bridge::FunctionDescriptor;
use crate::{BridgeError, Env, ScriptFunction, ScriptValue};

impl FunctionDescriptor {
    /// Run a script function for a host frame.
    ///
    /// `this` is pushed ahead of the parameters when present. Script errors
    /// are reported, never propagated; on failure the frame's outputs are
    /// left as they were. Returns whether the script call succeeded.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_script(&self, env: &mut Env, frame: &Frame, callback: &ScriptFunction, this: Option<ScriptValue>) -> bool {
        let dangling_check = env.config().dangling_check;
        if dangling_check {
            env.script_mut().begin_alias_scope();
        }

        let base = env.script().top();
        env.script_mut().push(ScriptValue::Function(callback.clone()));
        let mut nargs = 0;
        if let Some(this) = this {
            env.script_mut().push(this);
            nargs += 1;
        }
        for (index, param) in self.params.iter().enumerate() {
            if Some(index) == self.return_index {
                continue;
            }
            // Aliases are only handed out when they are invalidated on return,
            // except for references the script is expected to write through.
            let create_copy = !dangling_check && !param.is_non_const_out();
            let value = param.read(env, self.frame_addr(frame, index), create_copy);
            env.script_mut().push(value);
            nargs += 1;
        }

        let succeeded = match env.pcall(nargs) {
            Ok(nresults) => {
                let top = env.script().top();
                let results = env.script_mut().drain_from(top - nresults);
                self.write_results(env, frame, &results);
                true
            }
            Err(err) => {
                env.script_mut().truncate(base);
                env.report(BridgeError::ScriptRuntime(err));
                false
            }
        };

        if dangling_check {
            env.script_mut().end_alias_scope();
        }
        succeeded
    }

    /// Where a parameter lives for this frame: an out-parameter record if
    /// the caller supplied one, else the parameter block.
    fn frame_addr(&self, frame: &Frame, index: usize) -> HostAddr {
        match frame.out_record(index) {
            Some(record) => record.addr,
            None => frame.params.at(self.params[index].offset),
        }
    }

    fn write_results(&self, env: &mut Env, frame: &Frame, results: &[ScriptValue]) {
        let mut next = 0;
        if let Some(index) = self.return_index {
            let param = &self.params[index];
            let addr = frame.return_addr.unwrap_or_else(|| frame.params.at(param.offset));
            match results.first() {
                Some(value) => {
                    param.write(env, value, addr, true);
                }
                None => env.report_error(BridgeError::invalid_call(&self.name, "script returned no value")),
            }
            next = 1;
        }
        for &index in &self.out_indices {
            let result = results.get(next);
            next += 1;
            // Nil leaves the input in place, which passes it through.
            let Some(value) = result.filter(|v| !v.is_nil()) else {
                continue;
            };
            let addr = self.frame_addr(frame, index);
            self.params[index].write(env, value, addr, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbridge_core::{ClassDef, FunctionDef, IntKind, PropertyType};

    fn setup(env: &mut Env) -> (refbridge_core::ObjectHandle, refbridge_core::FunctionId) {
        let class = env.host_mut().register_class(ClassDef::class("Scorer")).unwrap();
        let function = env
            .host_mut()
            .add_function(
                class,
                FunctionDef::new("Score")
                    .with_param("Base", PropertyType::int32())
                    .with_ref("Bonus", PropertyType::int32())
                    .with_return(PropertyType::int32()),
            )
            .unwrap();
        let object = env.host_mut().new_object(class, "scorer").unwrap();
        (object, function)
    }

    #[test]
    fn results_are_written_back() {
        let mut env = Env::new();
        let (object, function) = setup(&mut env);
        let desc = env.register_function(function).unwrap();
        let params = env.host_mut().alloc_params(function).unwrap();
        env.host_mut().memory_mut().write_int(params, IntKind::I32, 4).unwrap();
        env.host_mut().memory_mut().write_int(params.at(4), IntKind::I32, 1).unwrap();

        let callback = ScriptFunction::new("Score", |_, args| {
            let base = args[1].as_integer().unwrap_or_default();
            Ok(vec![ScriptValue::Integer(base * 10), ScriptValue::Integer(2)])
        });
        let frame = Frame::new(function, object, params);
        assert!(desc.call_script(&mut env, &frame, &callback, Some(ScriptValue::from(object))));

        let memory = env.host().memory();
        assert_eq!(memory.read_int(params.at(8), IntKind::I32).unwrap(), 40);
        assert_eq!(memory.read_int(params.at(4), IntKind::I32).unwrap(), 2);
    }

    #[test]
    fn nil_out_passes_input_through() {
        let mut env = Env::new();
        let (object, function) = setup(&mut env);
        let desc = env.register_function(function).unwrap();
        let params = env.host_mut().alloc_params(function).unwrap();
        env.host_mut().memory_mut().write_int(params.at(4), IntKind::I32, 3).unwrap();

        let callback = ScriptFunction::new("Score", |_, _| Ok(vec![ScriptValue::Integer(1)]));
        let frame = Frame::new(function, object, params);
        assert!(desc.call_script(&mut env, &frame, &callback, None));
        assert_eq!(env.host().memory().read_int(params.at(4), IntKind::I32).unwrap(), 3);
    }

    #[test]
    fn script_errors_are_contained() {
        let mut env = Env::new();
        let (object, function) = setup(&mut env);
        let desc = env.register_function(function).unwrap();
        let params = env.host_mut().alloc_params(function).unwrap();

        let callback = ScriptFunction::new("Score", |_, _| Err(crate::ScriptError::new("boom")));
        let frame = Frame::new(function, object, params);
        assert!(!desc.call_script(&mut env, &frame, &callback, None));
        assert_eq!(env.script().top(), 0);
        assert!(matches!(
            env.diagnostics().last(),
            Some(BridgeError::ScriptRuntime(err)) if err.message == "boom"
        ));
        assert_eq!(env.host().memory().read_int(params.at(8), IntKind::I32).unwrap(), 0);
    }

    #[test]
    fn missing_return_is_reported() {
        let mut env = Env::new();
        let (object, function) = setup(&mut env);
        let desc = env.register_function(function).unwrap();
        let params = env.host_mut().alloc_params(function).unwrap();

        let callback = ScriptFunction::new("Score", |_, _| Ok(Vec::new()));
        assert!(desc.call_script(&mut env, &Frame::new(function, object, params), &callback, None));
        assert!(matches!(env.diagnostics().last(), Some(BridgeError::InvalidCall { .. })));
    }
}
