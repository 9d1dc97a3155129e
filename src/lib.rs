//! Bidirectional call and value bridge between a reflected host object model
//! and a dynamic script runtime.
//!
//! ## Architecture
//!
//! ```text
//! Env
//! ├── Host          - classes, functions, objects and memory (refbridge-core)
//! ├── Registry      - type, field and function descriptors
//! ├── ScriptState   - stack, modules, userdata, threads
//! ├── Interceptor   - trampolines routing host dispatch into script
//! ├── Delegates     - script callbacks bound to host delegates
//! └── Watchdog      - interrupts runaway script from another thread
//! ```
//!
//! Values cross the boundary through [`PropertyDescriptor`], which reads
//! host memory into [`ScriptValue`]s and writes them back. Calls cross it
//! through [`FunctionDescriptor`]: [`call_host`](FunctionDescriptor::call_host)
//! for script calling host, [`call_script`](FunctionDescriptor::call_script)
//! for trampolined host functions calling script.
//!
//! Every failure is soft: it is logged through `tracing`, recorded on the
//! environment and the call degrades to a no-op.

pub mod bridge;
pub mod config;
pub mod delegates;
pub mod env;
pub mod error;
pub mod interceptor;
pub mod marshal;
pub mod registry;
pub mod script;
pub mod watchdog;

pub use bridge::FunctionDescriptor;
pub use config::BridgeConfig;
pub use delegates::{CallbackKey, DelegateManager, SignatureDescriptor};
pub use env::{DELEGATE_PROXY_CLASS, Env, LATENT_CALLBACK, LATENT_MANAGER_CLASS};
pub use error::{BridgeError, BridgeResult, ScriptError};
pub use interceptor::{Interceptor, OverrideRecord, SHADOW_SUFFIX};
pub use marshal::PropertyDescriptor;
pub use registry::{
    DefaultParams, DefaultValue, FieldDescriptor, FieldKind, Registry, TypeDescriptor,
};
pub use script::{
    ModuleId, ScriptFunction, ScriptState, ScriptValue, Table, TableRef, ThreadId, ThreadStatus,
    UserdataId,
};
pub use watchdog::{CallGuard, Watchdog};

pub use refbridge_core::{
    Callspace, ClassDef, ClassId, DelegateValue, Frame, FunctionDef, FunctionFlags, FunctionId,
    Host, HostAddr, HostEnv, HostError, NativeError, NativeFn, ObjectHandle, PropertyFlags,
    PropertyType,
};
