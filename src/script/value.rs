//! Script values.
//!
//! [`ScriptValue`] is what crosses the boundary from the script side: plain
//! data (nil, booleans, numbers, strings), handles to host entities (objects,
//! classes, boxed userdata), tables and callable functions.
//!
//! Tables and functions have reference identity, so cloning a value never
//! copies one.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use refbridge_core::{ClassId, ObjectHandle};

use crate::script::UserdataId;
use crate::{Env, ScriptError};

/// A value on the script side.
#[derive(Clone, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// A host object.
    Object(ObjectHandle),
    /// A host class.
    Class(ClassId),
    /// A boxed host value: an owned copy or an alias into host memory.
    Userdata(UserdataId),
    Table(TableRef),
    Function(ScriptFunction),
}

impl ScriptValue {
    /// Build a table value from a list.
    pub fn list(values: impl IntoIterator<Item = ScriptValue>) -> Self {
        ScriptValue::Table(TableRef::new(Table::from_list(values)))
    }

    /// Build a table value from key/value pairs.
    pub fn pairs(entries: impl IntoIterator<Item = (ScriptValue, ScriptValue)>) -> Self {
        let mut table = Table::new();
        for (key, value) in entries {
            table.set(key, value);
        }
        ScriptValue::Table(TableRef::new(table))
    }

    /// Script-facing type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Integer(_) | ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Object(_) => "object",
            ScriptValue::Class(_) => "class",
            ScriptValue::Userdata(_) => "userdata",
            ScriptValue::Table(_) => "table",
            ScriptValue::Function(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// Truthiness: everything except nil and false.
    pub fn truthy(&self) -> bool {
        !matches!(self, ScriptValue::Nil | ScriptValue::Bool(false))
    }

    /// Integer value, accepting integral numbers.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ScriptValue::Integer(i) => Some(*i),
            ScriptValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    /// Numeric value of either number representation.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Integer(i) => Some(*i as f64),
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            ScriptValue::Object(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<UserdataId> {
        match self {
            ScriptValue::Userdata(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            ScriptValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ScriptFunction> {
        match self {
            ScriptValue::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        use ScriptValue::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Integer(a), Number(b)) | (Number(b), Integer(a)) => (*a as f64) == *b,
            (String(a), String(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Class(a), Class(b)) => a == b,
            (Userdata(a), Userdata(b)) => a == b,
            (Table(a), Table(b)) => a == b,
            (Function(a), Function(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Integer(i) => write!(f, "{i}"),
            ScriptValue::Number(n) => write!(f, "{n:?}"),
            ScriptValue::String(s) => write!(f, "{s:?}"),
            ScriptValue::Object(h) => write!(f, "{h:?}"),
            ScriptValue::Class(c) => write!(f, "{c:?}"),
            ScriptValue::Userdata(u) => write!(f, "{u:?}"),
            ScriptValue::Table(t) => write!(f, "{t:?}"),
            ScriptValue::Function(func) => write!(f, "{func:?}"),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Integer(value)
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        ScriptValue::Integer(value as i64)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::String(value)
    }
}

impl From<ObjectHandle> for ScriptValue {
    fn from(value: ObjectHandle) -> Self {
        if value.is_null() {
            ScriptValue::Nil
        } else {
            ScriptValue::Object(value)
        }
    }
}

impl From<ScriptFunction> for ScriptValue {
    fn from(value: ScriptFunction) -> Self {
        ScriptValue::Function(value)
    }
}

// ============================================================================
// Tables
// ============================================================================

/// A script table: a 1-based array part plus an insertion-ordered hash part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    array: Vec<ScriptValue>,
    hash: Vec<(ScriptValue, ScriptValue)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table whose array part holds `values`.
    pub fn from_list(values: impl IntoIterator<Item = ScriptValue>) -> Self {
        Self {
            array: values.into_iter().collect(),
            hash: Vec::new(),
        }
    }

    /// Length of the array part.
    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// The array part.
    pub fn list(&self) -> &[ScriptValue] {
        &self.array
    }

    fn array_index(&self, key: &ScriptValue) -> Option<usize> {
        let index = key.as_integer()?;
        (index >= 1).then(|| index as usize - 1)
    }

    /// Look up a key. Missing keys read as nil.
    pub fn get(&self, key: &ScriptValue) -> ScriptValue {
        if let Some(index) = self.array_index(key)
            && let Some(value) = self.array.get(index)
        {
            return value.clone();
        }
        self.hash
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Look up a string key.
    pub fn get_field(&self, name: &str) -> ScriptValue {
        self.hash
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Set a key. Assigning nil removes it.
    pub fn set(&mut self, key: ScriptValue, value: ScriptValue) {
        if key.is_nil() {
            return;
        }
        if let Some(index) = self.array_index(&key) {
            if index < self.array.len() {
                if value.is_nil() {
                    // Only the tail can shrink without leaving a hole.
                    if index + 1 == self.array.len() {
                        self.array.pop();
                    } else {
                        self.array[index] = value;
                    }
                } else {
                    self.array[index] = value;
                }
                return;
            }
            if index == self.array.len() && !value.is_nil() {
                self.array.push(value);
                return;
            }
        }
        match self.hash.iter().position(|(k, _)| *k == key) {
            Some(pos) if value.is_nil() => {
                self.hash.remove(pos);
            }
            Some(pos) => self.hash[pos].1 = value,
            None if value.is_nil() => {}
            None => self.hash.push((key, value)),
        }
    }

    /// Every entry, array part first.
    pub fn pairs(&self) -> Vec<(ScriptValue, ScriptValue)> {
        self.array
            .iter()
            .enumerate()
            .map(|(i, v)| (ScriptValue::Integer(i as i64 + 1), v.clone()))
            .chain(self.hash.iter().cloned())
            .collect()
    }
}

/// Shared handle to a [`Table`]. Compares by identity.
#[derive(Clone, Default)]
pub struct TableRef(Rc<RefCell<Table>>);

impl TableRef {
    pub fn new(table: Table) -> Self {
        Self(Rc::new(RefCell::new(table)))
    }

    pub fn borrow(&self) -> Ref<'_, Table> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Table> {
        self.0.borrow_mut()
    }
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: {:p}", Rc::as_ptr(&self.0))
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Signature of a script function body.
pub type ScriptFnBody = dyn Fn(&mut Env, Vec<ScriptValue>) -> Result<Vec<ScriptValue>, ScriptError>;

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// A callable script function. Compares by identity.
#[derive(Clone)]
pub struct ScriptFunction {
    id: u64,
    name: Rc<str>,
    body: Rc<ScriptFnBody>,
}

impl ScriptFunction {
    /// Wrap a closure as a script function.
    pub fn new<F>(name: impl AsRef<str>, body: F) -> Self
    where
        F: Fn(&mut Env, Vec<ScriptValue>) -> Result<Vec<ScriptValue>, ScriptError> + 'static,
    {
        Self {
            id: NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed),
            name: Rc::from(name.as_ref()),
            body: Rc::new(body),
        }
    }

    /// Identity of this function; clones share it.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn body(&self) -> Rc<ScriptFnBody> {
        Rc::clone(&self.body)
    }
}

impl PartialEq for ScriptFunction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function: {}#{}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(ScriptValue::Integer(3), ScriptValue::Number(3.0));
        assert_ne!(ScriptValue::Integer(3), ScriptValue::Number(3.5));
        assert_eq!(ScriptValue::Number(2.0).as_integer(), Some(2));
        assert_eq!(ScriptValue::Number(2.5).as_integer(), None);
    }

    #[test]
    fn tables_compare_by_identity() {
        let a = ScriptValue::list([ScriptValue::Integer(1), ScriptValue::Integer(2)]);
        let b = ScriptValue::list([ScriptValue::Integer(1), ScriptValue::Integer(2)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn table_array_and_hash_parts() {
        let mut table = Table::new();
        table.set(ScriptValue::Integer(1), "a".into());
        table.set(ScriptValue::Integer(2), "b".into());
        table.set("key".into(), ScriptValue::Integer(7));
        table.set(ScriptValue::Integer(10), "sparse".into());

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&ScriptValue::Integer(2)), "b".into());
        assert_eq!(table.get_field("key"), ScriptValue::Integer(7));
        assert_eq!(table.get(&ScriptValue::Integer(10)), "sparse".into());
        assert!(table.get(&ScriptValue::Integer(3)).is_nil());

        table.set("key".into(), ScriptValue::Nil);
        assert!(table.get_field("key").is_nil());
        assert_eq!(table.pairs().len(), 3);
    }

    #[test]
    fn truthiness() {
        assert!(!ScriptValue::Nil.truthy());
        assert!(!ScriptValue::Bool(false).truthy());
        assert!(ScriptValue::Integer(0).truthy());
        assert!(ScriptValue::String(String::new()).truthy());
    }

    #[test]
    fn function_identity_survives_clone() {
        let f = ScriptFunction::new("f", |_, _| Ok(Vec::new()));
        let g = ScriptFunction::new("f", |_, _| Ok(Vec::new()));
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
    }
}
