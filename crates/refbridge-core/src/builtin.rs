//! Types every host starts with.

use crate::{
    ClassDef, ClassId, Frame, Host, HostAddr, HostEnv, HostError, IntKind, PropertyDef,
    PropertyType, ReferenceKind, invoke,
};

/// Field names of the `LatentActionInfo` struct.
pub mod latent_fields {
    pub const LINKAGE: &str = "Linkage";
    pub const UUID: &str = "UUID";
    pub const EXECUTION_FUNCTION: &str = "ExecutionFunction";
    pub const CALLBACK_TARGET: &str = "CallbackTarget";
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Builtins {
    pub(crate) object: ClassId,
    pub(crate) latent_action_info: ClassId,
}

pub(crate) fn install(host: &mut Host) -> Builtins {
    let object = host.insert_class(ClassDef::class("Object").native());

    let mut latent = ClassDef::structure("LatentActionInfo").native();
    let fields = [
        (latent_fields::LINKAGE, PropertyType::int32(), 0),
        (latent_fields::UUID, PropertyType::int32(), 4),
        (latent_fields::EXECUTION_FUNCTION, PropertyType::Name, 8),
        (
            latent_fields::CALLBACK_TARGET,
            PropertyType::Object {
                class: object,
                reference: ReferenceKind::Strong,
            },
            16,
        ),
    ];
    for (name, ty, offset) in fields {
        let mut prop = PropertyDef::new(name, ty);
        prop.offset = offset;
        latent.properties.push(prop);
    }
    latent.size = 24;
    latent.align = 8;
    let latent_action_info = host.insert_class(latent);

    Builtins {
        object,
        latent_action_info,
    }
}

/// Report a latent action as finished.
///
/// Invokes the token's `ExecutionFunction` on its `CallbackTarget`, passing
/// `Linkage` as the first parameter. Returns false when the target is gone or
/// does not have the function.
pub fn complete_latent_action(env: &mut dyn HostEnv, info: HostAddr) -> Result<bool, HostError> {
    let (linkage, target, function) = {
        let host = env.host();
        let layout = host.try_class(host.latent_action_info())?;
        let offset = |name: &str| layout.find_property(name).map(|p| p.offset).unwrap_or(0);
        let linkage = host
            .memory()
            .read_int(info.at(offset(latent_fields::LINKAGE)), IntKind::I32)?;
        let target = host.read_object(info.at(offset(latent_fields::CALLBACK_TARGET)))?;
        let name = host.read_name(info.at(offset(latent_fields::EXECUTION_FUNCTION)))?;
        let function = host
            .class_of(target)
            .and_then(|class| host.find_function(class, host.memory().name(name)));
        (linkage, target, function)
    };
    let Some(function) = function else {
        return Ok(false);
    };

    let params = env.host_mut().alloc_params(function)?;
    let first = env.host().try_function(function)?.params.first().cloned();
    if let Some(PropertyDef {
        ty: PropertyType::Int(kind),
        offset,
        ..
    }) = first
    {
        env.host_mut()
            .memory_mut()
            .write_int(params.at(offset), kind, linkage)?;
    }
    let result = invoke(env, Frame::new(function, target, params));
    env.host_mut().free_params(function, params)?;
    result.map(|()| true)
}
