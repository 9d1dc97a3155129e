//! Error types for the host object model.
//!
//! ## Error Hierarchy
//!
//! ```text
//! HostError    - registration, memory, and dispatch failures
//! └── NativeError - failures raised from inside a native entry point
//! ```
//!
//! Native entry points return [`NativeError`]; `?` on a [`HostError`] inside
//! one boxes it into [`NativeError::Host`].

use thiserror::Error;

use crate::{ClassId, FunctionId, ObjectHandle, RegionId};

// ============================================================================
// Host Errors
// ============================================================================

/// Errors raised by the host tables, memory, and dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    /// A class with this name is already registered.
    #[error("class '{0}' is already registered")]
    DuplicateClass(String),

    /// No class is registered under this name.
    #[error("unknown class '{0}'")]
    UnknownClass(String),

    /// The class handle is stale.
    #[error("class {0:?} is no longer registered")]
    StaleClass(ClassId),

    /// The function handle is stale.
    #[error("function {0:?} is no longer registered")]
    StaleFunction(FunctionId),

    /// The object was destroyed.
    #[error("object {0:?} has been destroyed")]
    StaleObject(ObjectHandle),

    /// The memory region was freed.
    #[error("memory region {0:?} has been freed")]
    StaleRegion(RegionId),

    /// An access ran past the end of its region.
    #[error("access of {len} bytes at offset {offset} exceeds region {region:?} of {size} bytes")]
    OutOfBounds {
        region: RegionId,
        offset: u32,
        len: u32,
        size: u32,
    },

    /// A parameter index is past the function's parameter list.
    #[error("parameter index {index} out of range ({count} parameters)")]
    ParamOutOfRange { index: usize, count: usize },

    /// The function has no return parameter.
    #[error("function '{0}' has no return value")]
    NoReturnValue(String),

    /// The value stored in host memory does not have the expected shape.
    #[error("expected {expected} storage, found {found}")]
    StorageMismatch {
        expected: &'static str,
        found: String,
    },

    /// Interfaces and structs cannot be instantiated as objects.
    #[error("class '{0}' cannot be instantiated")]
    NotInstantiable(String),

    /// A native entry point failed.
    #[error("native call failed: {0}")]
    Native(#[from] NativeError),
}

// ============================================================================
// Native Errors
// ============================================================================

/// Errors raised from inside a native entry point.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    /// A trampoline fired but nothing on the script side claimed the call.
    #[error("no script binding for '{function}'")]
    NoScriptBinding { function: String },

    /// The native body reported a failure of its own.
    #[error("{0}")]
    Failed(String),

    /// A host operation failed inside the native body.
    #[error(transparent)]
    Host(Box<HostError>),
}

impl NativeError {
    /// Create a custom failure.
    pub fn failed(message: impl Into<String>) -> Self {
        NativeError::Failed(message.into())
    }
}

impl From<HostError> for NativeError {
    fn from(error: HostError) -> Self {
        NativeError::Host(Box::new(error))
    }
}
