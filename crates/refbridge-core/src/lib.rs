//! Reflected host object model.
//!
//! This crate models the statically typed side of the bridge: classes,
//! structs, interfaces, functions, objects, and the memory they occupy. It
//! knows nothing about script; native entry points that need to leave the
//! host do so through [`HostEnv::enter_script`].
//!
//! ## Key Types
//!
//! - [`Host`]: owns every table and all memory
//! - [`ClassDef`], [`FunctionDef`], [`PropertyDef`]: reflected definitions
//! - [`HostAddr`]: (region, offset) address into host memory
//! - [`NativeFn`]: a dispatchable entry point
//! - [`Frame`], [`CallContext`], [`invoke`]: dispatch
//!
//! # Example
//!
//! ```
//! use refbridge_core::{ClassDef, Frame, FunctionDef, Host, IntKind, NativeFn, PropertyType, invoke};
//!
//! let mut host = Host::new();
//! let class = host.register_class(ClassDef::class("Counter")).unwrap();
//! let double = host
//!     .add_function(
//!         class,
//!         FunctionDef::new("Double")
//!             .with_param("x", PropertyType::int32())
//!             .with_return(PropertyType::int32())
//!             .with_native(NativeFn::new(|ctx| {
//!                 let x = ctx.arg_i64(0)?;
//!                 ctx.set_return_i64(x * 2)?;
//!                 Ok(())
//!             })),
//!     )
//!     .unwrap();
//!
//! let obj = host.new_object(class, "counter").unwrap();
//! let params = host.alloc_params(double).unwrap();
//! host.memory_mut().write_int(params, IntKind::I32, 21).unwrap();
//! invoke(&mut host, Frame::new(double, obj, params)).unwrap();
//! assert_eq!(host.memory().read_int(params.at(4), IntKind::I32).unwrap(), 42);
//! ```

pub mod arena;
mod builtin;
mod call_context;
mod class;
mod error;
mod function;
mod host;
mod ids;
mod memory;
mod native;
mod property;
mod type_hash;
mod value;

pub use builtin::{complete_latent_action, latent_fields};
pub use call_context::{
    CallContext, Frame, HostEnv, OutParamRecord, broadcast, execute_delegate, invoke,
    resolve_delegate,
};
pub use class::{ClassDef, ClassFlags, ClassKind};
pub use error::{HostError, NativeError};
pub use function::{FunctionDef, FunctionFlags, RETURN_VALUE_NAME};
pub use host::{Callspace, Host, ObjectData, RemoteCall, align_up};
pub use ids::{ClassId, ContainerId, FunctionId, MulticastId, NameId, ObjectHandle, RegionId, StrId};
pub use memory::{ContainerLayout, DelegateValue, HostAddr, Memory};
pub use native::{NativeCallable, NativeFn};
pub use property::{FloatKind, IntKind, PropertyDef, PropertyFlags, PropertyType, ReferenceKind};
pub use type_hash::{TypeHash, hash_constants};
