//! The script runtime the bridge talks to.
//!
//! A small dynamic runtime: values, tables, closures standing in for script
//! functions, modules that bind those functions to host classes, and threads
//! that can park on latent host calls. Protected calls, interrupts and
//! thread resumption are on [`Env`](crate::Env).

mod state;
mod value;

pub use state::{ScriptModule, ScriptState, ThreadId, ThreadStatus, Userdata, UserdataStorage};
pub use value::{ScriptFnBody, ScriptFunction, ScriptValue, Table, TableRef};

refbridge_core::arena_id!(
    /// Handle to a boxed host value owned by the script side.
    UserdataId
);

refbridge_core::arena_id!(
    /// Handle to a script module.
    ModuleId
);
