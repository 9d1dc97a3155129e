//! Performance benchmarks for crossing the bridge.
//!
//! - Script calling host: argument marshaling, dispatch and result collection
//! - Property access: scalar and struct reads and writes
//! - Host calling script: delegate execution through the trampoline
//!
//! ## Profiling with Puffin
//!
//! ```bash
//! cargo bench --features profile-with-puffin
//! ```

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use refbridge::{
    ClassDef, Env, FunctionDef, FunctionFlags, FunctionId, NativeFn, ObjectHandle, PropertyType,
    ScriptFunction, ScriptValue,
};

#[cfg(feature = "profile-with-puffin")]
fn setup_profiler() {
    puffin::set_scopes_on(true);
}

#[cfg(not(feature = "profile-with-puffin"))]
fn setup_profiler() {}

#[cfg(feature = "profile-with-puffin")]
fn end_profiling_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}

#[cfg(not(feature = "profile-with-puffin"))]
fn end_profiling_frame() {}

struct Fixture {
    env: Env,
    object: ObjectHandle,
    add: FunctionId,
    describe: FunctionId,
}

fn fixture() -> Fixture {
    let mut env = Env::new();
    let point = env
        .host_mut()
        .register_class(
            ClassDef::structure("Vector")
                .with_property("X", PropertyType::int32())
                .with_property("Y", PropertyType::int32())
                .with_property("Z", PropertyType::int32()),
        )
        .unwrap();
    let holder = env.host_mut().register_class(ClassDef::class("BenchSignatures")).unwrap();
    let signature = env
        .host_mut()
        .add_function(
            holder,
            FunctionDef::new("OnTick__Signature")
                .with_param("Delta", PropertyType::int32())
                .with_flags(FunctionFlags::DELEGATE),
        )
        .unwrap();
    let class = env
        .host_mut()
        .register_class(
            ClassDef::class("Actor")
                .with_property("Health", PropertyType::int32())
                .with_property("Position", PropertyType::Struct { class: point })
                .with_property("Label", PropertyType::Str)
                .with_property("OnTick", PropertyType::Delegate { signature }),
        )
        .unwrap();
    let add = env
        .host_mut()
        .add_function(
            class,
            FunctionDef::new("Add")
                .with_param("A", PropertyType::int32())
                .with_param("B", PropertyType::int32())
                .with_return(PropertyType::int32())
                .with_native(NativeFn::new(|ctx| {
                    let sum = ctx.arg_i64(0)? + ctx.arg_i64(1)?;
                    ctx.set_return_i64(sum)?;
                    Ok(())
                })),
        )
        .unwrap();
    let describe = env
        .host_mut()
        .add_function(
            class,
            FunctionDef::new("Describe")
                .with_param("Prefix", PropertyType::Str)
                .with_out("Length", PropertyType::int32())
                .with_return(PropertyType::Str)
                .with_native(NativeFn::new(|ctx| {
                    let text = format!("{}: actor", ctx.arg_string(0)?);
                    ctx.set_out_i64(1, text.len() as i64)?;
                    ctx.set_return_string(&text)?;
                    Ok(())
                })),
        )
        .unwrap();
    let object = env.host_mut().new_object(class, "actor").unwrap();
    Fixture {
        env,
        object,
        add,
        describe,
    }
}

fn host_call_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let Fixture {
        mut env,
        object,
        add,
        describe,
    } = fixture();
    let mut group = c.benchmark_group("bridge/call_host");

    let args = [ScriptValue::from(object), ScriptValue::Integer(2), ScriptValue::Integer(3)];
    group.bench_function("int_add", |b| {
        b.iter(|| {
            let results = env.call_function(add, black_box(&args));
            end_profiling_frame();
            black_box(results)
        });
    });

    let args = [ScriptValue::from(object), ScriptValue::from("hello")];
    group.bench_function("string_with_out", |b| {
        b.iter(|| {
            let results = env.call_function(describe, black_box(&args));
            end_profiling_frame();
            black_box(results)
        });
    });

    group.bench_function("method_by_name", |b| {
        b.iter(|| {
            let results = env.call_method(object, black_box("Add"), &[ScriptValue::Integer(1), ScriptValue::Integer(1)]);
            end_profiling_frame();
            black_box(results)
        });
    });

    group.finish();
}

fn property_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let Fixture { mut env, object, .. } = fixture();
    let mut group = c.benchmark_group("bridge/properties");

    group.bench_function("int_read_write", |b| {
        b.iter(|| {
            env.set_property(object, "Health", &ScriptValue::Integer(black_box(50)));
            black_box(env.get_property(object, "Health"))
        });
    });

    let position = ScriptValue::pairs([
        (ScriptValue::from("X"), ScriptValue::Integer(1)),
        (ScriptValue::from("Y"), ScriptValue::Integer(2)),
        (ScriptValue::from("Z"), ScriptValue::Integer(3)),
    ]);
    group.bench_function("struct_from_table", |b| {
        b.iter(|| black_box(env.set_property(object, "Position", black_box(&position))));
    });

    group.bench_function("string_write", |b| {
        b.iter(|| black_box(env.set_property(object, "Label", &ScriptValue::from("label"))));
    });

    group.finish();
}

fn delegate_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let Fixture { mut env, object, .. } = fixture();
    let callback = ScriptFunction::new("tick", |_, args| Ok(vec![args.into_iter().next().unwrap_or_default()]));
    env.bind_delegate(object, "OnTick", &callback.into()).unwrap();
    let mut group = c.benchmark_group("bridge/delegates");

    group.bench_function("execute", |b| {
        b.iter(|| {
            let results = env.execute_delegate(object, "OnTick", black_box(&[ScriptValue::Integer(16)]));
            end_profiling_frame();
            black_box(results)
        });
    });

    group.finish();
}

criterion_group!(benches, host_call_benchmarks, property_benchmarks, delegate_benchmarks);

criterion_main!(benches);
