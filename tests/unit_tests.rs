//! Integration tests for the bridge using `Env` as the entry point.
//!
//! These exercise whole round trips: script calling host functions, host
//! dispatch landing in script, delegates, latent calls and the watchdog.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use refbridge::{
    BridgeConfig, BridgeError, Callspace, ClassDef, Env, Frame, FunctionDef, FunctionFlags,
    FunctionId, HostAddr, NativeFn, ObjectHandle, PropertyDescriptor, PropertyType, ScriptFunction,
    ScriptValue, ThreadStatus,
};
use refbridge_core::{FloatKind, IntKind, RegionId, complete_latent_action, invoke, latent_fields};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scratch(env: &mut Env, size: u32) -> HostAddr {
    HostAddr::base(env.host_mut().memory_mut().alloc(size))
}

fn noop(name: &str) -> ScriptFunction {
    ScriptFunction::new(name, |_, _| Ok(Vec::new()))
}

// =============================================================================
// Marshaling
// =============================================================================

#[test]
fn test_scalar_round_trip() {
    init_tracing();
    let mut env = Env::new();
    let object_class = env.host().object_class();
    let target = env.host_mut().new_object(object_class, "target").unwrap();

    let cases: Vec<(PropertyType, ScriptValue)> = vec![
        (PropertyType::Int(IntKind::I8), ScriptValue::Integer(-12)),
        (PropertyType::Int(IntKind::U16), ScriptValue::Integer(65_000)),
        (PropertyType::int32(), ScriptValue::Integer(-123_456)),
        (PropertyType::Int(IntKind::I64), ScriptValue::Integer(1 << 40)),
        (PropertyType::Float(FloatKind::F32), ScriptValue::Number(0.5)),
        (PropertyType::Float(FloatKind::F64), ScriptValue::Number(-2.25)),
        (PropertyType::Bool, ScriptValue::Bool(true)),
        (PropertyType::Str, ScriptValue::from("hello")),
        (PropertyType::Text, ScriptValue::from("localized")),
        (PropertyType::Name, ScriptValue::from("Alpha")),
        (
            PropertyType::Enum {
                name: "Mode".to_string(),
                underlying: IntKind::U8,
            },
            ScriptValue::Integer(5),
        ),
        (PropertyType::object(object_class), ScriptValue::Object(target)),
        (
            PropertyType::Class {
                meta_class: object_class,
            },
            ScriptValue::Class(object_class),
        ),
    ];

    for (ty, value) in cases {
        let addr = scratch(&mut env, 16);
        let desc = PropertyDescriptor::for_type("Value", ty.clone());
        desc.write(&mut env, &value, addr, true);
        assert_eq!(desc.read(&mut env, addr, true), value, "round trip of {ty:?}");
    }
    assert!(env.diagnostics().is_empty());
}

#[test]
fn test_aggregate_round_trip_through_userdata() {
    let mut env = Env::new();
    let point = env
        .host_mut()
        .register_class(
            ClassDef::structure("Point")
                .with_property("X", PropertyType::int32())
                .with_property("Tag", PropertyType::Str),
        )
        .unwrap();
    let desc = PropertyDescriptor::for_type("P", PropertyType::Struct { class: point });
    let src = scratch(&mut env, 16);
    let dst = scratch(&mut env, 16);

    let table = ScriptValue::pairs([
        (ScriptValue::from("X"), ScriptValue::Integer(9)),
        (ScriptValue::from("Tag"), ScriptValue::from("nine")),
    ]);
    desc.write(&mut env, &table, src, true);

    let copy = desc.read(&mut env, src, true);
    let ScriptValue::Userdata(id) = copy else {
        panic!("expected userdata, got {copy:?}");
    };
    desc.write(&mut env, &copy, dst, true);
    assert_eq!(env.host().memory().read_int(dst, IntKind::I32).unwrap(), 9);
    let tag = env.host().find_property(point, "Tag").unwrap().1.offset;
    assert_eq!(env.host().read_string(dst.at(tag)).unwrap(), "nine");

    // The copy is independent of the source.
    env.host_mut().write_string(src.at(tag), "changed").unwrap();
    let boxed = env.userdata_addr(id).unwrap();
    assert_eq!(env.host().read_string(boxed.at(tag)).unwrap(), "nine");

    let list = PropertyDescriptor::for_type("L", PropertyType::array(PropertyType::int32()));
    let items = ScriptValue::list([ScriptValue::Integer(1), ScriptValue::Integer(2)]);
    let array_src = scratch(&mut env, 8);
    let array_dst = scratch(&mut env, 8);
    list.write(&mut env, &items, array_src, true);
    let alias = list.read(&mut env, array_src, false);
    list.write(&mut env, &alias, array_dst, true);
    let copied = env.host().container_at(array_dst).unwrap();
    assert_eq!(env.host().container_len(copied).unwrap(), 2);
    assert_ne!(copied, env.host().container_at(array_src).unwrap());
}

// =============================================================================
// Script calls host
// =============================================================================

fn split_function(env: &mut Env) -> (ObjectHandle, FunctionId) {
    let class = env.host_mut().register_class(ClassDef::class("Splitter")).unwrap();
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
    let object = env.host_mut().new_object(class, "splitter").unwrap();
    (object, function)
}

#[test]
fn test_return_value_comes_before_outs() {
    let mut env = Env::new();
    let (object, function) = split_function(&mut env);
    let results = env.call_function(function, &[object.into(), ScriptValue::Integer(5)]);
    assert_eq!(results, vec![ScriptValue::Integer(10), ScriptValue::Integer(6)]);

    let by_name = env.call_method(object, "Split", &[ScriptValue::Integer(1)]);
    assert_eq!(by_name, vec![ScriptValue::Integer(2), ScriptValue::Integer(2)]);
}

#[test]
fn test_defaults_fill_omitted_arguments() {
    let mut env = Env::new();
    let class = env.host_mut().register_class(ClassDef::class("Scaler")).unwrap();
    let scale = env
        .host_mut()
        .add_function(
            class,
            FunctionDef::new("Scale")
                .with_param("Value", PropertyType::int32())
                .with_param("Factor", PropertyType::int32())
                .with_return(PropertyType::int32())
                .with_flags(FunctionFlags::STATIC)
                .with_native(NativeFn::new(|ctx| {
                    let product = ctx.arg_i64(0)? * ctx.arg_i64(1)?;
                    ctx.set_return_i64(product)?;
                    Ok(())
                })),
        )
        .unwrap();
    env.registry_mut()
        .defaults_mut()
        .insert("Scaler", "Scale", "Factor", 3_i64);

    assert_eq!(env.call_function(scale, &[ScriptValue::Integer(5)]), vec![ScriptValue::Integer(15)]);
    assert_eq!(
        env.call_static("Scaler", "Scale", &[ScriptValue::Integer(5), ScriptValue::Integer(2)]),
        vec![ScriptValue::Integer(10)]
    );
    assert_eq!(
        env.call_function(scale, &[ScriptValue::Integer(5), ScriptValue::Nil]),
        vec![ScriptValue::Integer(0)]
    );
    assert!(env.diagnostics().is_empty());
}

#[test]
fn test_net_functions_follow_callspace() {
    let mut env = Env::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let class = env.host_mut().register_class(ClassDef::class("Replicated")).unwrap();
    let fire = env
        .host_mut()
        .add_function(
            class,
            FunctionDef::new("Fire")
                .with_param("Power", PropertyType::int32())
                .with_flags(FunctionFlags::NET)
                .with_native(NativeFn::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
        )
        .unwrap();
    let object = env.host_mut().new_object(class, "replicated").unwrap();
    let args = [ScriptValue::from(object), ScriptValue::Integer(4)];

    env.host_mut().set_callspace(object, Callspace::Remote).unwrap();
    env.call_function(fire, &args);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let calls = env.host_mut().take_remote_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload[..4], 4_i32.to_le_bytes());

    env.host_mut().set_callspace(object, Callspace::Both).unwrap();
    env.call_function(fire, &args);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(env.host().remote_calls().len(), 1);

    env.host_mut().take_remote_calls();
    env.host_mut().set_callspace(object, Callspace::Absorbed).unwrap();
    env.call_function(fire, &args);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(env.host().remote_calls().is_empty());
}

#[test]
fn test_interface_calls_dispatch_to_implementation() {
    let mut env = Env::new();
    let interface = env.host_mut().register_class(ClassDef::interface("Damageable")).unwrap();
    let declared = env
        .host_mut()
        .add_function(interface, FunctionDef::new("Health").with_return(PropertyType::int32()))
        .unwrap();
    let class = env
        .host_mut()
        .register_class(ClassDef::class("Crate").with_interface(interface))
        .unwrap();
    env.host_mut()
        .add_function(
            class,
            FunctionDef::new("Health")
                .with_return(PropertyType::int32())
                .with_native(NativeFn::new(|ctx| {
                    ctx.set_return_i64(75)?;
                    Ok(())
                })),
        )
        .unwrap();
    let object = env.host_mut().new_object(class, "crate").unwrap();

    assert_eq!(env.call_function(declared, &[object.into()]), vec![ScriptValue::Integer(75)]);
}

#[test]
fn test_destroyed_target_is_a_soft_failure() {
    let mut env = Env::new();
    let (object, function) = split_function(&mut env);
    env.host_mut().destroy_object(object).unwrap();
    assert!(env.call_function(function, &[object.into(), ScriptValue::Integer(1)]).is_empty());
    assert!(matches!(
        env.diagnostics().last(),
        Some(BridgeError::StaleDescriptor { .. })
    ));
}

// =============================================================================
// Overrides
// =============================================================================

#[test]
fn test_override_is_idempotent() {
    let mut env = Env::new();
    let class = env.host_mut().register_class(ClassDef::class("Switch")).unwrap();
    let flip = env
        .host_mut()
        .add_function(class, FunctionDef::new("Flip").with_flags(FunctionFlags::SCRIPT_EVENT))
        .unwrap();

    let first = env.override_function(flip, class).unwrap();
    let functions = env.host().function_count();
    let second = env.override_function(flip, class).unwrap();
    assert_eq!(first, second);
    assert_eq!(env.host().function_count(), functions);
    assert_eq!(env.interceptor().record_count(), 1);

    assert_eq!(env.restore_original(flip), 1);
    assert_eq!(env.restore_original(flip), 0);
}

#[test]
fn test_inherited_override_leaves_base_unchanged() {
    let mut env = Env::new();
    let base = env.host_mut().register_class(ClassDef::class("Animal")).unwrap();
    let speak = env
        .host_mut()
        .add_function(
            base,
            FunctionDef::new("Speak")
                .with_return(PropertyType::int32())
                .with_flags(FunctionFlags::EVENT)
                .with_native(NativeFn::new(|ctx| {
                    ctx.set_return_i64(1)?;
                    Ok(())
                })),
        )
        .unwrap();
    let derived = env
        .host_mut()
        .register_class(ClassDef::class("Parrot").with_super(base))
        .unwrap();
    let animal = env.host_mut().new_object(base, "animal").unwrap();
    let parrot = env.host_mut().new_object(derived, "parrot").unwrap();

    let module = env.new_module("ParrotScript", None);
    env.define(
        module,
        "Speak",
        ScriptFunction::new("Speak", |_, _| Ok(vec![ScriptValue::Integer(2)])),
    );
    assert_eq!(env.bind_module(derived, module).unwrap(), 1);

    let installed = env.host().find_function(derived, "Speak").unwrap();
    assert_ne!(installed, speak);
    assert_eq!(env.host().find_function(base, "Speak"), Some(speak));

    let dispatch = |env: &mut Env, function: FunctionId, object: ObjectHandle| {
        let params = env.host_mut().alloc_params(function).unwrap();
        invoke(env, Frame::new(function, object, params)).unwrap();
        env.host().memory().read_int(params, IntKind::I32).unwrap()
    };
    assert_eq!(dispatch(&mut env, installed, parrot), 2);
    assert_eq!(dispatch(&mut env, speak, animal), 1);

    // Script calling the host gets the original behavior.
    assert_eq!(env.call_method(parrot, "Speak", &[]), vec![ScriptValue::Integer(1)]);

    assert!(env.unbind_module(derived));
    assert_eq!(env.host().find_function(derived, "Speak"), Some(speak));
}

#[test]
fn test_overrides_on_base_and_derived_keep_original_reachable() {
    for base_first in [true, false] {
        let mut env = Env::new();
        let base = env.host_mut().register_class(ClassDef::class("Animal")).unwrap();
        let speak = env
            .host_mut()
            .add_function(
                base,
                FunctionDef::new("Speak")
                    .with_return(PropertyType::int32())
                    .with_flags(FunctionFlags::EVENT)
                    .with_native(NativeFn::new(|ctx| {
                        ctx.set_return_i64(1)?;
                        Ok(())
                    })),
            )
            .unwrap();
        let derived = env
            .host_mut()
            .register_class(ClassDef::class("Parrot").with_super(base))
            .unwrap();
        let animal = env.host_mut().new_object(base, "animal").unwrap();
        let parrot = env.host_mut().new_object(derived, "parrot").unwrap();

        let returning = |env: &mut Env, name: &str, value: i64| {
            let module = env.new_module(name, None);
            env.define(
                module,
                "Speak",
                ScriptFunction::new("Speak", move |_, _| Ok(vec![ScriptValue::Integer(value)])),
            );
            module
        };
        let animal_module = returning(&mut env, "AnimalScript", 3);
        let parrot_module = returning(&mut env, "ParrotScript", 2);
        if base_first {
            env.bind_module(base, animal_module).unwrap();
            env.bind_module(derived, parrot_module).unwrap();
        } else {
            env.bind_module(derived, parrot_module).unwrap();
            env.bind_module(base, animal_module).unwrap();
        }

        // Script calling the host reaches the native body at both levels.
        assert_eq!(env.call_method(parrot, "Speak", &[]), vec![ScriptValue::Integer(1)]);
        assert_eq!(env.call_method(animal, "Speak", &[]), vec![ScriptValue::Integer(1)]);

        // Host dispatch lands in the script bound to each level.
        let installed = env.host().find_function(derived, "Speak").unwrap();
        let dispatch = |env: &mut Env, function: FunctionId, object: ObjectHandle| {
            let params = env.host_mut().alloc_params(function).unwrap();
            invoke(env, Frame::new(function, object, params)).unwrap();
            env.host().memory().read_int(params, IntKind::I32).unwrap()
        };
        assert_eq!(dispatch(&mut env, installed, parrot), 2);
        assert_eq!(dispatch(&mut env, speak, animal), 3);
        assert!(env.diagnostics().is_empty());

        assert!(env.unbind_module(derived));
        assert!(env.unbind_module(base));
        assert_eq!(env.call_method(parrot, "Speak", &[]), vec![ScriptValue::Integer(1)]);
        assert_eq!(dispatch(&mut env, speak, animal), 1);
        assert_eq!(env.interceptor().record_count(), 0);
    }
}

#[test]
fn test_callback_aliases_are_invalidated() {
    for dangling_check in [true, false] {
        let mut env = Env::with_config(BridgeConfig::default().with_dangling_check(dangling_check));
        let point = env
            .host_mut()
            .register_class(ClassDef::structure("Hit").with_property("Damage", PropertyType::int32()))
            .unwrap();
        let class = env.host_mut().register_class(ClassDef::class("Target")).unwrap();
        let on_hit = env
            .host_mut()
            .add_function(
                class,
                FunctionDef::new("OnHit")
                    .with_param("Hit", PropertyType::Struct { class: point })
                    .with_flags(FunctionFlags::SCRIPT_EVENT),
            )
            .unwrap();
        let target = env.host_mut().new_object(class, "target").unwrap();

        let stashed = Rc::new(Cell::new(None));
        let sink = Rc::clone(&stashed);
        let module = env.new_module("TargetScript", None);
        env.define(
            module,
            "OnHit",
            ScriptFunction::new("OnHit", move |env, args| {
                let id = args[1].as_userdata().unwrap();
                assert!(env.userdata_addr(id).is_some());
                sink.set(Some(id));
                Ok(Vec::new())
            }),
        );
        env.bind_module(class, module).unwrap();

        let params = env.host_mut().alloc_params(on_hit).unwrap();
        invoke(&mut env, Frame::new(on_hit, target, params)).unwrap();
        let id = stashed.get().unwrap();
        assert_eq!(env.userdata_addr(id).is_none(), dangling_check);
    }
}

#[test]
fn test_repeated_callbacks_do_not_grow_userdata() {
    let mut env = Env::new();
    let point = env
        .host_mut()
        .register_class(ClassDef::structure("Impact").with_property("Force", PropertyType::int32()))
        .unwrap();
    let class = env.host_mut().register_class(ClassDef::class("Wall")).unwrap();
    let on_impact = env
        .host_mut()
        .add_function(
            class,
            FunctionDef::new("OnImpact")
                .with_param("Impact", PropertyType::Struct { class: point })
                .with_flags(FunctionFlags::SCRIPT_EVENT),
        )
        .unwrap();
    let wall = env.host_mut().new_object(class, "wall").unwrap();

    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let module = env.new_module("WallScript", None);
    env.define(
        module,
        "OnImpact",
        ScriptFunction::new("OnImpact", move |env, args| {
            let id = args[1].as_userdata().unwrap();
            assert!(env.userdata_addr(id).is_some());
            counter.set(counter.get() + 1);
            Ok(Vec::new())
        }),
    );
    env.bind_module(class, module).unwrap();

    let baseline = env.script().userdata_count();
    for _ in 0..16 {
        // A fresh parameter block per call so each one aliases a new address.
        let params = env.host_mut().alloc_params(on_impact).unwrap();
        invoke(&mut env, Frame::new(on_impact, wall, params)).unwrap();
        assert_eq!(env.script().userdata_count(), baseline);
    }
    assert_eq!(calls.get(), 16);
}

// =============================================================================
// Delegates
// =============================================================================

struct Button {
    env: Env,
    button: ObjectHandle,
    signature: FunctionId,
}

fn button() -> Button {
    let mut env = Env::new();
    let holder = env.host_mut().register_class(ClassDef::class("ButtonSignatures")).unwrap();
    let signature = env
        .host_mut()
        .add_function(
            holder,
            FunctionDef::new("OnCount__Signature")
                .with_param("N", PropertyType::int32())
                .with_out("Total", PropertyType::int32())
                .with_flags(FunctionFlags::DELEGATE),
        )
        .unwrap();
    let class = env
        .host_mut()
        .register_class(ClassDef::class("Button").with_property("OnCount", PropertyType::Delegate { signature }))
        .unwrap();
    let button = env.host_mut().new_object(class, "button").unwrap();
    Button { env, button, signature }
}

fn bound_function(env: &mut Env, object: ObjectHandle, property: &str) -> Option<FunctionId> {
    let (_, addr) = env.property_slot(object, property).unwrap();
    let value = env.host().read_delegate(addr).unwrap();
    refbridge_core::resolve_delegate(env.host(), value)
}

#[test]
fn test_bind_counts_references() {
    let Button { mut env, signature, .. } = button();
    let callback = noop("cb");

    let first = env.bind_callback(signature, &callback, None).unwrap();
    let second = env.bind_callback(signature, &callback, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(env.callback_bindings(first), 2);

    assert!(env.unbind_callback(first));
    assert!(env.host().is_function_live(first));
    assert_eq!(env.callback_bindings(first), 1);

    assert!(env.unbind_callback(first));
    assert!(!env.host().is_function_live(first));
    assert!(!env.unbind_callback(first));
}

#[test]
fn test_self_unbind_is_deferred() {
    let Button { mut env, button, .. } = button();
    let bound = Rc::new(Cell::new(None::<FunctionId>));
    let observed = Rc::new(Cell::new(false));

    let (inner_bound, inner_observed) = (Rc::clone(&bound), Rc::clone(&observed));
    let callback = ScriptFunction::new("once", move |env, _| {
        let function = inner_bound.get().unwrap();
        env.unbind_delegate(button, "OnCount").unwrap();
        assert!(env.host().is_function_live(function));
        assert!(env.delegates().signature(function).unwrap().is_pending_kill());
        inner_observed.set(true);
        Ok(vec![ScriptValue::Integer(0)])
    });
    env.bind_delegate(button, "OnCount", &callback.into()).unwrap();
    let function = bound_function(&mut env, button, "OnCount").unwrap();
    bound.set(Some(function));

    env.execute_delegate(button, "OnCount", &[ScriptValue::Integer(1)]);
    assert!(observed.get());
    assert!(!env.host().is_function_live(function));
    assert_eq!(env.delegates().signature_count(), 0);
    assert!(bound_function(&mut env, button, "OnCount").is_none());
}

#[test]
fn test_reentrant_delegate_calls_use_separate_buffers() {
    let Button {
        mut env,
        button,
        signature,
    } = button();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let callback = ScriptFunction::new("count", move |env, args| {
        let n = args[0].as_integer().unwrap_or_default();
        sink.borrow_mut().push(n);
        let below = if n > 0 {
            let inner = env.execute_delegate(button, "OnCount", &[ScriptValue::Integer(n - 1)]);
            inner[0].as_integer().unwrap_or_default()
        } else {
            0
        };
        Ok(vec![ScriptValue::Integer(n + below)])
    });
    env.bind_delegate(button, "OnCount", &callback.into()).unwrap();

    assert_eq!(
        env.execute_delegate(button, "OnCount", &[ScriptValue::Integer(3)]),
        vec![ScriptValue::Integer(6)]
    );
    let regions = env.host().memory().region_count();
    env.execute_delegate(button, "OnCount", &[ScriptValue::Integer(3)]);
    assert_eq!(env.host().memory().region_count(), regions);
    assert_eq!(*seen.borrow(), vec![3, 2, 1, 0, 3, 2, 1, 0]);

    let desc = env.registry().function_descriptor(signature).unwrap();
    assert!(desc.has_persistent_buffer());
    assert_eq!(desc.depth(), 0);
}

#[test]
fn test_script_errors_in_callbacks_are_contained() {
    let Button { mut env, button, .. } = button();
    let callback = ScriptFunction::new("broken", |_, _| Err(refbridge::ScriptError::new("kaboom")));
    env.bind_delegate(button, "OnCount", &callback.into()).unwrap();

    let results = env.execute_delegate(button, "OnCount", &[ScriptValue::Integer(1)]);
    assert_eq!(results, vec![ScriptValue::Integer(0)]);
    assert!(env.diagnostics().iter().any(|err| matches!(
        err,
        BridgeError::ScriptRuntime(script) if script.message == "kaboom"
    )));
    assert_eq!(env.script().top(), 0);
}

// =============================================================================
// Latent calls
// =============================================================================

struct Timer {
    env: Env,
    timer: ObjectHandle,
    delay: FunctionId,
    uuid: Arc<AtomicI32>,
    stash: Arc<AtomicU64>,
}

fn timer() -> Timer {
    let mut env = Env::new();
    let uuid = Arc::new(AtomicI32::new(0));
    let stash = Arc::new(AtomicU64::new(0));
    let (uuid_sink, stash_sink) = (Arc::clone(&uuid), Arc::clone(&stash));
    let latent = env.host().latent_action_info();
    let class = env.host_mut().register_class(ClassDef::class("Timer")).unwrap();
    let delay = env
        .host_mut()
        .add_function(
            class,
            FunctionDef::new("Delay")
                .with_param("Info", PropertyType::Struct { class: latent })
                .with_flags(FunctionFlags::LATENT)
                .with_native(NativeFn::new(move |ctx| {
                    let info = ctx.param_addr(0)?;
                    let host = ctx.host_mut();
                    let uuid_offset = host
                        .try_class(host.latent_action_info())?
                        .find_property(latent_fields::UUID)
                        .map_or(0, |p| p.offset);
                    let uuid = host.memory().read_int(info.at(uuid_offset), IntKind::I32)?;
                    uuid_sink.store(uuid as i32, Ordering::SeqCst);

                    let saved = HostAddr::base(host.memory_mut().alloc(24));
                    let ty = PropertyType::Struct {
                        class: host.latent_action_info(),
                    };
                    host.copy_value(&ty, info, saved)?;
                    stash_sink.store(saved.region.to_bits(), Ordering::SeqCst);
                    Ok(())
                })),
        )
        .unwrap();
    let timer = env.host_mut().new_object(class, "timer").unwrap();
    Timer {
        env,
        timer,
        delay,
        uuid,
        stash,
    }
}

fn waiting_thread(env: &mut Env, timer: ObjectHandle, delay: FunctionId, resumed: &Rc<Cell<bool>>) -> refbridge::ThreadId {
    let flag = Rc::clone(resumed);
    let continuation = ScriptFunction::new("after_delay", move |_, _| {
        flag.set(true);
        Ok(Vec::new())
    });
    let main = ScriptFunction::new("main", move |env, _| {
        env.call_latent(delay, &[ScriptValue::from(timer)], continuation.clone())?;
        Ok(Vec::new())
    });
    env.run_thread(&main, Vec::new()).unwrap()
}

#[test]
fn test_latent_call_resumes_by_uuid() {
    let Timer { mut env, timer, delay, uuid, .. } = timer();
    let resumed = Rc::new(Cell::new(false));
    let thread = waiting_thread(&mut env, timer, delay, &resumed);

    assert_eq!(env.thread_status(thread), ThreadStatus::Suspended);
    assert!(!resumed.get());

    let uuid = uuid.load(Ordering::SeqCst);
    assert!(env.resume_latent(uuid));
    assert!(resumed.get());
    assert_eq!(env.thread_status(thread), ThreadStatus::Dead);
    assert!(!env.resume_latent(uuid));
}

#[test]
fn test_latent_completion_calls_back_into_script() {
    let Timer { mut env, timer, delay, stash, .. } = timer();
    let resumed = Rc::new(Cell::new(false));
    let thread = waiting_thread(&mut env, timer, delay, &resumed);

    let info = HostAddr::base(RegionId::from_bits(stash.load(Ordering::SeqCst)));
    assert!(complete_latent_action(&mut env, info).unwrap());
    assert!(resumed.get());
    assert_eq!(env.thread_status(thread), ThreadStatus::Dead);
}

#[test]
fn test_latent_call_outside_thread_is_rejected() {
    let Timer { mut env, timer, delay, .. } = timer();
    assert!(env.call_function(delay, &[ScriptValue::from(timer)]).is_empty());
    assert!(matches!(
        env.diagnostics().last(),
        Some(BridgeError::InvalidCall { .. })
    ));
}

// =============================================================================
// Watchdog
// =============================================================================

#[test]
fn test_watchdog_interrupts_runaway_script() {
    init_tracing();
    let mut env = Env::with_config(
        BridgeConfig::default()
            .with_watchdog(Duration::from_millis(50))
            .with_watchdog_tick(Duration::from_millis(5)),
    );
    let step = noop("step");
    let runaway = ScriptFunction::new("runaway", move |env, _| {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            env.call(&step, Vec::new())?;
        }
        Ok(Vec::new())
    });

    let err = env.call(&runaway, Vec::new()).unwrap_err();
    assert_eq!(err.message, "script exec timeout");
    assert_eq!(err.traceback, vec!["step".to_string(), "runaway".to_string()]);

    assert!(!env.script().is_interrupted());
    assert!(env.call(&noop("after"), Vec::new()).is_ok());
}
