//! Default parameter values.
//!
//! Host metadata may declare defaults for trailing parameters that script is
//! allowed to omit. Defaults are keyed by the declaring class name, the
//! function name and the parameter name; duplicated functions find the
//! defaults of the class they were copied from through the class chain.

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;

use crate::ScriptValue;

/// A registered default value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DefaultValue {
    Int(i64),
    Float(OrderedFloat<f64>),
    Bool(bool),
    Str(String),
    Name(String),
    /// A null object, class or delegate.
    Null,
}

impl DefaultValue {
    /// The script value written when the parameter is omitted.
    pub fn to_script(&self) -> ScriptValue {
        match self {
            DefaultValue::Int(i) => ScriptValue::Integer(*i),
            DefaultValue::Float(f) => ScriptValue::Number(f.into_inner()),
            DefaultValue::Bool(b) => ScriptValue::Bool(*b),
            DefaultValue::Str(s) | DefaultValue::Name(s) => ScriptValue::String(s.clone()),
            DefaultValue::Null => ScriptValue::Nil,
        }
    }
}

impl From<f64> for DefaultValue {
    fn from(value: f64) -> Self {
        DefaultValue::Float(OrderedFloat(value))
    }
}

impl From<i64> for DefaultValue {
    fn from(value: i64) -> Self {
        DefaultValue::Int(value)
    }
}

impl From<bool> for DefaultValue {
    fn from(value: bool) -> Self {
        DefaultValue::Bool(value)
    }
}

impl From<&str> for DefaultValue {
    fn from(value: &str) -> Self {
        DefaultValue::Str(value.to_string())
    }
}

/// Default values keyed by (class name, function name), then parameter name.
#[derive(Debug, Clone, Default)]
pub struct DefaultParams {
    entries: FxHashMap<(String, String), FxHashMap<String, DefaultValue>>,
}

impl DefaultParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a default, replacing any previous one.
    pub fn insert(
        &mut self,
        class: impl Into<String>,
        function: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<DefaultValue>,
    ) {
        self.entries
            .entry((class.into(), function.into()))
            .or_default()
            .insert(param.into(), value.into());
    }

    /// Look up one default.
    pub fn get(&self, class: &str, function: &str, param: &str) -> Option<&DefaultValue> {
        self.entries
            .get(&(class.to_string(), function.to_string()))?
            .get(param)
    }

    /// Whether any default is registered for a function.
    pub fn has_function(&self, class: &str, function: &str) -> bool {
        self.entries
            .contains_key(&(class.to_string(), function.to_string()))
    }

    /// Number of functions with defaults.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_class_function_param() {
        let mut defaults = DefaultParams::new();
        defaults.insert("Actor", "SetSpeed", "Scale", 1.5);
        defaults.insert("Actor", "SetSpeed", "Reason", "idle");

        assert_eq!(
            defaults.get("Actor", "SetSpeed", "Scale").map(DefaultValue::to_script),
            Some(ScriptValue::Number(1.5))
        );
        assert!(defaults.get("Actor", "SetSpeed", "Missing").is_none());
        assert!(defaults.get("Pawn", "SetSpeed", "Scale").is_none());
        assert_eq!(defaults.len(), 1);
    }
}
