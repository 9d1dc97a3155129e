use refbridge_core::{HostAddr, PropertyType};

use crate::marshal::PropertyDescriptor;
use crate::{BridgeResult, Env, ScriptValue};

impl PropertyDescriptor {
    /// Read the value at `addr` into a script value.
    ///
    /// Aggregates are returned as an alias of `addr` unless `create_copy` is
    /// set, in which case script gets an owned copy. Failures are reported on
    /// the environment and read as nil.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn read(&self, env: &mut Env, addr: HostAddr, create_copy: bool) -> ScriptValue {
        match self.try_read(env, addr, create_copy) {
            Ok(value) => value,
            Err(err) => {
                env.report(err);
                ScriptValue::Nil
            }
        }
    }

    fn try_read(&self, env: &mut Env, addr: HostAddr, create_copy: bool) -> BridgeResult<ScriptValue> {
        let host = env.host();
        let value = match &self.ty {
            PropertyType::Int(kind) | PropertyType::Enum { underlying: kind, .. } => {
                ScriptValue::Integer(host.memory().read_int(addr, *kind)?)
            }
            PropertyType::Float(kind) => ScriptValue::Number(host.memory().read_float(addr, *kind)?),
            PropertyType::Bool => ScriptValue::Bool(host.memory().read_bool(addr)?),
            PropertyType::Str | PropertyType::Text => ScriptValue::String(host.read_string(addr)?),
            PropertyType::Name => {
                let name = host.read_name(addr)?;
                ScriptValue::String(host.memory().name(name).to_string())
            }
            PropertyType::Object { .. } | PropertyType::Interface { .. } => {
                ScriptValue::from(host.read_object(addr)?)
            }
            PropertyType::Class { .. } => {
                let class = host.read_class_ref(addr)?;
                if class.is_null() {
                    ScriptValue::Nil
                } else {
                    ScriptValue::Class(class)
                }
            }
            PropertyType::Struct { .. }
            | PropertyType::Array(_)
            | PropertyType::Set(_)
            | PropertyType::Map(_, _)
            | PropertyType::Delegate { .. }
            | PropertyType::MulticastDelegate { .. } => {
                return self.read_boxed(env, addr, create_copy);
            }
        };
        Ok(value)
    }

    fn read_boxed(&self, env: &mut Env, addr: HostAddr, create_copy: bool) -> BridgeResult<ScriptValue> {
        // Bounds check before handing out anything that points at addr.
        let size = env.host().size_of(&self.ty)?;
        env.host().memory().bytes(addr, size)?;

        if !create_copy {
            let id = env.script_mut().alias(self.ty.clone(), addr);
            return Ok(ScriptValue::Userdata(id));
        }
        let (id, dst) = env.new_userdata(self.ty.clone())?;
        env.host_mut().copy_value(&self.ty, addr, dst)?;
        Ok(ScriptValue::Userdata(id))
    }
}
