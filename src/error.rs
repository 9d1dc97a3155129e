//! Error types for the bridge.
//!
//! ## Error Hierarchy
//!
//! ```text
//! BridgeError           - soft failures reported while crossing the boundary
//! ├── ResolutionFailure - name did not resolve to a type or field
//! ├── TypeMismatch      - script value does not match the declared kind
//! ├── ScriptRuntime     - a script callback raised (wraps ScriptError)
//! ├── StaleDescriptor   - cached descriptor's host entity is gone
//! ├── InvalidCall       - call could not be set up (bad target, no thread)
//! ├── InvalidDelegate   - delegate operation rejected
//! └── Host              - host memory or dispatch failure (wraps HostError)
//! ```
//!
//! None of these abort the host. Crossing points log them and keep going;
//! the [`Env`](crate::Env) also records them so callers can inspect what went
//! wrong.

use std::fmt;

use refbridge_core::HostError;
use thiserror::Error;

/// Soft failures reported while crossing the script/host boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A type or field name did not resolve.
    #[error("cannot resolve '{name}'")]
    ResolutionFailure { name: String },

    /// A script value does not match the property's declared kind.
    #[error("type mismatch for '{property}': expected {expected}, got {found}")]
    TypeMismatch {
        property: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A script callback raised an error.
    #[error("script error: {0}")]
    ScriptRuntime(ScriptError),

    /// A cached descriptor refers to a host entity that no longer exists.
    #[error("stale descriptor: {what}")]
    StaleDescriptor { what: String },

    /// A call could not be set up.
    #[error("invalid call to '{function}': {reason}")]
    InvalidCall { function: String, reason: String },

    /// A delegate operation was rejected.
    #[error("invalid delegate operation on '{property}': {reason}")]
    InvalidDelegate { property: String, reason: String },

    /// Host memory or dispatch failure.
    #[error(transparent)]
    Host(#[from] HostError),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::ResolutionFailure`].
    pub fn unresolved(name: impl Into<String>) -> Self {
        BridgeError::ResolutionFailure { name: name.into() }
    }

    /// Shorthand for [`BridgeError::StaleDescriptor`].
    pub fn stale(what: impl Into<String>) -> Self {
        BridgeError::StaleDescriptor { what: what.into() }
    }

    /// Shorthand for [`BridgeError::InvalidCall`].
    pub fn invalid_call(function: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::InvalidCall {
            function: function.into(),
            reason: reason.into(),
        }
    }
}

impl From<ScriptError> for BridgeError {
    fn from(err: ScriptError) -> Self {
        BridgeError::ScriptRuntime(err)
    }
}

/// An error raised by script code, with the call stack it unwound through.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptError {
    /// Error message.
    pub message: String,
    /// Function names from the innermost frame outwards.
    pub traceback: Vec<String>,
}

impl ScriptError {
    /// Create an error with an empty traceback.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Record a frame the error unwound through.
    pub fn with_frame(mut self, function: impl Into<String>) -> Self {
        self.traceback.push(function.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.traceback.is_empty() {
            write!(f, "\nstack traceback:")?;
            for frame in &self.traceback {
                write!(f, "\n\tin function '{frame}'")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_is_rendered_innermost_first() {
        let err = ScriptError::new("boom").with_frame("inner").with_frame("outer");
        let text = err.to_string();
        assert!(text.starts_with("boom"));
        let inner = text.find("inner").unwrap();
        let outer = text.find("outer").unwrap();
        assert!(inner < outer);
    }

    #[test]
    fn host_errors_convert() {
        let err: BridgeError = HostError::UnknownClass("Missing".into()).into();
        assert_eq!(err.to_string(), "unknown class 'Missing'");
    }
}
