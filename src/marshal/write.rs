use refbridge_core::{ClassId, Host, HostAddr, ObjectHandle, PropertyType};

use crate::marshal::PropertyDescriptor;
use crate::{BridgeError, BridgeResult, Env, ScriptValue};

impl PropertyDescriptor {
    /// Write a script value into host memory at `addr`.
    ///
    /// The destination always ends up owning an independent copy. Pass
    /// `copy_value = false` when `addr` is a scratch slot such as a parameter
    /// block; the return value then tells the caller whether the slot holds
    /// storage it must destroy afterwards. With `copy_value = true` the
    /// destination keeps the value and the result is always false.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn write(&self, env: &mut Env, value: &ScriptValue, addr: HostAddr, copy_value: bool) -> bool {
        let owned = match self.try_write(env, value, addr) {
            Ok(()) => env.host().needs_destroy(&self.ty),
            Err(err) => {
                env.report(err);
                env.host().needs_destroy(&self.ty)
            }
        };
        !copy_value && owned
    }

    pub(crate) fn mismatch(&self, env: &mut Env, expected: &'static str, found: &ScriptValue) {
        if env.config().type_check {
            env.report(BridgeError::TypeMismatch {
                property: self.name.clone(),
                expected,
                found: found.type_name(),
            });
        }
    }

    fn try_write(&self, env: &mut Env, value: &ScriptValue, addr: HostAddr) -> BridgeResult<()> {
        match &self.ty {
            PropertyType::Int(kind) | PropertyType::Enum { underlying: kind, .. } => {
                let v = self.coerce_integer(env, value);
                env.host_mut().memory_mut().write_int(addr, *kind, v)?;
            }
            PropertyType::Float(kind) => {
                let v = self.coerce_number(env, value);
                env.host_mut().memory_mut().write_float(addr, *kind, v)?;
            }
            PropertyType::Bool => {
                if !matches!(value, ScriptValue::Bool(_)) {
                    self.mismatch(env, "boolean", value);
                }
                env.host_mut().memory_mut().write_bool(addr, value.truthy())?;
            }
            PropertyType::Str | PropertyType::Text => {
                let text = self.coerce_string(env, value);
                env.host_mut().write_string(addr, &text)?;
            }
            PropertyType::Name => {
                let text = self.coerce_string(env, value);
                let name = env.host_mut().memory_mut().intern(&text);
                env.host_mut().write_name(addr, name)?;
            }
            PropertyType::Object { class, .. } => {
                let class = *class;
                let handle = self.coerce_object(env, value, |host, c| host.is_child_of(c, class));
                env.host_mut().write_object(addr, handle)?;
            }
            PropertyType::Interface { class } => {
                let interface = *class;
                let handle = self.coerce_object(env, value, |host, c| host.implements(c, interface));
                env.host_mut().write_object(addr, handle)?;
            }
            PropertyType::Class { meta_class } => {
                let class = match value {
                    ScriptValue::Class(c) if env.host().is_child_of(*c, *meta_class) => *c,
                    ScriptValue::Nil => ClassId::NULL,
                    other => {
                        self.mismatch(env, "class", other);
                        ClassId::NULL
                    }
                };
                env.host_mut().write_class_ref(addr, class)?;
            }
            PropertyType::Struct { class } => self.write_struct(env, value, addr, *class)?,
            PropertyType::Array(_) | PropertyType::Set(_) | PropertyType::Map(_, _) => {
                self.write_container(env, value, addr)?
            }
            PropertyType::Delegate { signature } => {
                env.write_delegate_slot(self, *signature, value, addr)?
            }
            PropertyType::MulticastDelegate { signature } => {
                env.write_multicast_slot(self, *signature, value, addr)?
            }
        }
        Ok(())
    }

    fn coerce_integer(&self, env: &mut Env, value: &ScriptValue) -> i64 {
        match value {
            ScriptValue::Integer(i) => *i,
            ScriptValue::Number(n) => *n as i64,
            ScriptValue::String(s) => match (s.trim().parse::<i64>(), s.trim().parse::<f64>()) {
                (Ok(i), _) => i,
                (_, Ok(n)) => n as i64,
                _ => {
                    self.mismatch(env, "integer", value);
                    0
                }
            },
            other => {
                self.mismatch(env, "integer", other);
                match other {
                    ScriptValue::Bool(b) => *b as i64,
                    _ => 0,
                }
            }
        }
    }

    fn coerce_number(&self, env: &mut Env, value: &ScriptValue) -> f64 {
        match value {
            ScriptValue::Integer(i) => *i as f64,
            ScriptValue::Number(n) => *n,
            ScriptValue::String(s) => s.trim().parse::<f64>().unwrap_or_else(|_| {
                self.mismatch(env, "number", value);
                0.0
            }),
            other => {
                self.mismatch(env, "number", other);
                0.0
            }
        }
    }

    fn coerce_string(&self, env: &mut Env, value: &ScriptValue) -> String {
        match value {
            ScriptValue::String(s) => s.clone(),
            ScriptValue::Integer(i) => i.to_string(),
            ScriptValue::Number(n) => n.to_string(),
            other => {
                self.mismatch(env, "string", other);
                String::new()
            }
        }
    }

    fn coerce_object(
        &self,
        env: &mut Env,
        value: &ScriptValue,
        accepts: impl Fn(&Host, ClassId) -> bool,
    ) -> ObjectHandle {
        match value {
            ScriptValue::Nil => ObjectHandle::NULL,
            ScriptValue::Object(handle) => {
                let Some(class) = env.host().class_of(*handle) else {
                    env.report(BridgeError::stale(format!("object assigned to '{}'", self.name)));
                    return ObjectHandle::NULL;
                };
                if accepts(env.host(), class) {
                    *handle
                } else {
                    self.mismatch(env, self.ty.kind_name(), value);
                    ObjectHandle::NULL
                }
            }
            other => {
                self.mismatch(env, self.ty.kind_name(), other);
                ObjectHandle::NULL
            }
        }
    }

    /// Copy from a userdata of a compatible type. Returns false if the
    /// userdata does not fit.
    pub(crate) fn write_from_userdata(&self, env: &mut Env, value: &ScriptValue, addr: HostAddr) -> BridgeResult<bool> {
        let ScriptValue::Userdata(id) = value else {
            return Ok(false);
        };
        let Some(ty) = env.script().userdata(*id).map(|u| u.ty.clone()) else {
            return Err(BridgeError::stale(format!("userdata assigned to '{}'", self.name)));
        };
        let compatible = match (&ty, &self.ty) {
            (PropertyType::Struct { class: from }, PropertyType::Struct { class: to }) => {
                env.host().is_child_of(*from, *to)
            }
            (from, to) => from == to,
        };
        if !compatible {
            return Ok(false);
        }
        let Some(src) = env.userdata_addr(*id) else {
            return Err(BridgeError::stale(format!("userdata assigned to '{}'", self.name)));
        };
        env.host_mut().copy_value(&self.ty, src, addr)?;
        Ok(true)
    }

    fn write_struct(&self, env: &mut Env, value: &ScriptValue, addr: HostAddr, class: ClassId) -> BridgeResult<()> {
        if self.write_from_userdata(env, value, addr)? {
            return Ok(());
        }
        let ScriptValue::Table(table) = value else {
            self.mismatch(env, "struct", value);
            return Ok(());
        };
        let entries = table.borrow().clone();
        let props = env.host().all_properties(class);
        for prop in props {
            let field = entries.get_field(&prop.name);
            if field.is_nil() {
                continue;
            }
            PropertyDescriptor::new(&prop).write(env, &field, addr.at(prop.offset), true);
        }
        Ok(())
    }

    fn write_container(&self, env: &mut Env, value: &ScriptValue, addr: HostAddr) -> BridgeResult<()> {
        if self.write_from_userdata(env, value, addr)? {
            return Ok(());
        }
        let ScriptValue::Table(table) = value else {
            self.mismatch(env, self.ty.kind_name(), value);
            return Ok(());
        };
        let entries = table.borrow().clone();
        let Some(element) = self.element() else {
            return Ok(());
        };
        let id = env.host_mut().container_ensure(addr, &self.ty)?;
        env.host_mut().container_clear(id)?;

        match &self.ty {
            PropertyType::Array(_) => {
                for item in entries.list() {
                    let slot = env.host_mut().container_push(id)?;
                    element.write(env, item, slot, true);
                }
            }
            PropertyType::Set(_) => {
                let mut seen: Vec<&ScriptValue> = Vec::new();
                for item in entries.list() {
                    if item.is_nil() || seen.contains(&item) {
                        continue;
                    }
                    seen.push(item);
                    let slot = env.host_mut().container_push(id)?;
                    element.write(env, item, slot, true);
                }
            }
            PropertyType::Map(_, _) => {
                let Some(value_desc) = self.value() else {
                    return Ok(());
                };
                let value_offset = env.host().container_layout_of(id)?.value_offset;
                for (key, item) in entries.pairs() {
                    let slot = env.host_mut().container_push(id)?;
                    element.write(env, &key, slot, true);
                    value_desc.write(env, &item, slot.at(value_offset), true);
                }
            }
            _ => {}
        }
        Ok(())
    }
}
