//! Runtime values for the logic sandbox.
//!
//! Objects and arrays are shared by reference (`Rc`) and mutated in place,
//! matching the aliasing user code expects from component state.

use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use crate::ast::FunctionDef;
use crate::interpreter::{Interpreter, Scope};

pub type NativeFn = dyn Fn(&mut Interpreter, Value, Vec<Value>) -> Result<Value, RuntimeError>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<Object>),
    Function(Rc<Function>),
}

#[derive(Debug, Clone)]
pub enum ObjectKind {
    Plain,
    /// Cell created by `ref()`; the payload lives under `value`.
    Ref,
    /// Lazily evaluated cell created by `computed()`.
    Computed { getter: Value, setter: Option<Value> },
    /// Component state. Refs and computed cells stored on it unwrap on read.
    Instance,
}

pub struct Object {
    pub kind: ObjectKind,
    properties: RefCell<IndexMap<String, Value>>,
    frozen: Cell<bool>,
}

impl Object {
    pub fn new(kind: ObjectKind, properties: IndexMap<String, Value>) -> Rc<Self> {
        Rc::new(Self {
            kind,
            properties: RefCell::new(properties),
            frozen: Cell::new(false),
        })
    }

    pub fn plain() -> Rc<Self> {
        Self::new(ObjectKind::Plain, IndexMap::new())
    }

    pub fn get_own(&self, key: &str) -> Option<Value> {
        self.properties.borrow().get(key).cloned()
    }

    pub fn has_own(&self, key: &str) -> bool {
        self.properties.borrow().contains_key(key)
    }

    /// Raw write, bypassing freezing and ref unwrapping.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.properties.borrow_mut().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.properties.borrow_mut().shift_remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.properties.borrow().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.properties
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.properties.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn freeze(&self) {
        self.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.kind, ObjectKind::Ref | ObjectKind::Computed { .. })
    }
}

pub enum Function {
    Closure {
        def: Rc<FunctionDef>,
        scope: Rc<Scope>,
    },
    Native {
        name: String,
        call: Rc<NativeFn>,
    },
    /// Result of `fn.bind(obj)`, also used for methods bound onto an instance.
    Bound { target: Rc<Function>, this: Value },
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Closure { def, .. } => def.name.as_deref().unwrap_or(""),
            Function::Native { name, .. } => name,
            Function::Bound { target, .. } => target.name(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Uncaught {message}")]
    Thrown { message: String, value: Value },
    #[error("ReferenceError: {0} is not defined")]
    Reference(String),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("RangeError: maximum call depth of {0} exceeded")]
    CallDepth(usize),
    #[error("execution budget of {0} steps exhausted")]
    StepBudget(u64),
    #[error("RangeError: maximum call stack size exceeded")]
    StackExhausted,
}

impl RuntimeError {
    pub fn type_error(message: impl Into<String>) -> Self {
        RuntimeError::Type(message.into())
    }

    pub fn thrown(value: Value) -> Self {
        let message = match &value {
            Value::Object(obj) => match (obj.get_own("name"), obj.get_own("message")) {
                (Some(name), Some(message)) => {
                    format!("{}: {}", name.to_js_string(), message.to_js_string())
                }
                (None, Some(message)) => message.to_js_string(),
                _ => value.to_js_string(),
            },
            other => other.to_js_string(),
        };
        RuntimeError::Thrown { message, value }
    }

    /// Budget exhaustion must escape `try`/`catch` so runaway logic always stops.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Thrown { .. } | RuntimeError::Reference(_) | RuntimeError::Type(_)
        )
    }

    /// Value bound to the `catch` parameter.
    pub fn to_value(&self) -> Value {
        let (name, message) = match self {
            RuntimeError::Thrown { value, .. } => return value.clone(),
            RuntimeError::Reference(name) => ("ReferenceError", format!("{} is not defined", name)),
            RuntimeError::Type(message) => ("TypeError", message.clone()),
            RuntimeError::CallDepth(_) => ("RangeError", self.to_string()),
            RuntimeError::StepBudget(_) => ("Error", self.to_string()),
            RuntimeError::StackExhausted => ("RangeError", self.to_string()),
        };
        let mut props = IndexMap::new();
        props.insert("name".to_string(), Value::String(name.to_string()));
        props.insert("message".to_string(), Value::String(message));
        Value::Object(Object::new(ObjectKind::Plain, props))
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(properties: IndexMap<String, Value>) -> Value {
        Value::Object(Object::new(ObjectKind::Plain, properties))
    }

    pub fn native<F>(name: &str, call: F) -> Value
    where
        F: Fn(&mut Interpreter, Value, Vec<Value>) -> Result<Value, RuntimeError> + 'static,
    {
        Value::Function(Rc::new(Function::Native {
            name: name.to_string(),
            call: Rc::new(call),
        }))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn as_object(&self) -> Option<&Rc<Object>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                    i64::from_str_radix(hex, 16).map(|n| n as f64).unwrap_or(f64::NAN)
                } else {
                    match trimmed {
                        "Infinity" | "+Infinity" => f64::INFINITY,
                        "-Infinity" => f64::NEG_INFINITY,
                        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
                    }
                }
            }
            Value::Array(_) => Value::String(self.to_js_string()).to_number(),
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// `String(value)`. An array that contains itself stringifies the inner
    /// occurrence as `""`, like `Array.prototype.join`.
    pub fn to_js_string(&self) -> String {
        self.js_string_guarded(&mut Vec::new())
    }

    fn js_string_guarded(&self, seen: &mut Vec<*const ()>) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => {
                let ptr = Rc::as_ptr(items) as *const ();
                if seen.contains(&ptr) || seen.len() >= MAX_VALUE_DEPTH {
                    return String::new();
                }
                seen.push(ptr);
                let joined = join_guarded(&items.borrow(), ",", seen);
                seen.pop();
                joined
            }
            Value::Object(obj) => match &obj.kind {
                ObjectKind::Ref => {
                    let ptr = Rc::as_ptr(obj) as *const ();
                    if seen.contains(&ptr) || seen.len() >= MAX_VALUE_DEPTH {
                        return String::new();
                    }
                    seen.push(ptr);
                    let text = obj.get_own("value").unwrap_or_default().js_string_guarded(seen);
                    seen.pop();
                    text
                }
                _ => "[object Object]".to_string(),
            },
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
        }
    }

    /// `array.join(separator)` with the same cycle handling as
    /// [`Value::to_js_string`].
    pub fn join_array(items: &Rc<RefCell<Vec<Value>>>, separator: &str) -> String {
        let mut seen = vec![Rc::as_ptr(items) as *const ()];
        join_guarded(&items.borrow(), separator, &mut seen)
    }

    /// Follows `ref` cells to their payload. `None` when the chain loops.
    fn unwrap_refs(&self) -> Option<Value> {
        let mut current = self.clone();
        for _ in 0..MAX_VALUE_DEPTH {
            let inner = match &current {
                Value::Object(obj) if obj.is_ref() => obj.get_own("value").unwrap_or_default(),
                _ => return Some(current),
            };
            current = inner;
        }
        None
    }

    /// Text shown for an interpolation: nullish renders empty, arrays and
    /// plain objects render as indented JSON.
    pub fn to_display_string(&self) -> String {
        match self.unwrap_refs() {
            None | Some(Value::Undefined | Value::Null) => String::new(),
            Some(value @ (Value::Array(_) | Value::Object(_))) => pretty_json(&value),
            Some(other) => other.to_js_string(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => {
                if matches!(
                    (self, other),
                    (Value::Bool(_), Value::Object(_) | Value::Array(_) | Value::Function(_))
                        | (Value::Object(_) | Value::Array(_) | Value::Function(_), Value::Bool(_))
                ) {
                    return false;
                }
                self.to_number() == other.to_number()
            }
            (Value::Array(_) | Value::Object(_), Value::String(s))
            | (Value::String(s), Value::Array(_) | Value::Object(_)) => {
                let object = if matches!(self, Value::String(_)) { other } else { self };
                object.to_js_string() == *s
            }
            _ => self.strict_equals(other),
        }
    }

    /// Fresh sandbox value from a host JSON value. Never aliases the input.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn from_json_map(map: &serde_json::Map<String, serde_json::Value>) -> Value {
        Value::object(
            map.iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        )
    }

    /// Snapshot as JSON. Functions and `undefined` are dropped from objects
    /// (and become `null` in arrays), refs are unwrapped, non-finite numbers
    /// become `null`. Computed cells are skipped since reading them needs the
    /// interpreter.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_guarded(&mut Vec::new())
    }

    fn to_json_guarded(&self, seen: &mut Vec<*const ()>) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null | Value::Function(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                let ptr = Rc::as_ptr(items) as *const ();
                if seen.contains(&ptr) || seen.len() >= MAX_VALUE_DEPTH {
                    return serde_json::Value::Null;
                }
                seen.push(ptr);
                let out = items
                    .borrow()
                    .iter()
                    .map(|item| item.to_json_guarded(seen))
                    .collect();
                seen.pop();
                serde_json::Value::Array(out)
            }
            Value::Object(obj) => {
                let ptr = Rc::as_ptr(obj) as *const ();
                if seen.contains(&ptr) || seen.len() >= MAX_VALUE_DEPTH {
                    return serde_json::Value::Null;
                }
                if let ObjectKind::Ref = obj.kind {
                    seen.push(ptr);
                    let inner = obj.get_own("value").unwrap_or_default().to_json_guarded(seen);
                    seen.pop();
                    return inner;
                }
                seen.push(ptr);
                let mut map = serde_json::Map::new();
                for (key, value) in obj.entries() {
                    let skip = match &value {
                        Value::Undefined | Value::Function(_) => true,
                        Value::Object(inner) => matches!(inner.kind, ObjectKind::Computed { .. }),
                        _ => false,
                    };
                    if !skip {
                        map.insert(key, value.to_json_guarded(seen));
                    }
                }
                seen.pop();
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Nesting at which stringifying and serializing stop descending, as if the
/// value were cyclic.
const MAX_VALUE_DEPTH: usize = 512;

fn join_guarded(items: &[Value], separator: &str, seen: &mut Vec<*const ()>) -> String {
    items
        .iter()
        .map(|item| {
            if item.is_nullish() {
                String::new()
            } else {
                item.js_string_guarded(seen)
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(&value.to_json()).unwrap_or_default()
}

fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Number formatting as `String(n)` produces it.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        return format!("{}", n as i128);
    }
    if n.abs() >= 1e21 || n.abs() < 1e-6 {
        let formatted = format!("{:e}", n);
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => formatted,
        };
    }
    format!("{}", n)
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", number_to_string(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            // Snapshots are cycle-safe; functions inside show as null.
            Value::Array(_) => write!(f, "{}", self.to_json()),
            Value::Object(obj) => match &obj.kind {
                ObjectKind::Ref => write!(f, "Ref({})", self.to_json()),
                ObjectKind::Computed { .. } => write!(f, "Computed"),
                _ => write!(f, "{}", self.to_json()),
            },
            Value::Function(func) => write!(f, "[Function {}]", func.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(1e21), "1e+21");
    }

    #[test]
    fn test_json_numbers_stay_integral() {
        let value = Value::from_json(&json!({ "count": 1, "ratio": 0.25 }));
        assert_eq!(value.to_json(), json!({ "count": 1, "ratio": 0.25 }));
    }

    #[test]
    fn test_to_json_drops_functions_and_unwraps_refs() {
        let cell = Object::new(ObjectKind::Ref, IndexMap::new());
        cell.insert("value", Value::Number(3.0));
        let mut props = IndexMap::new();
        props.insert("count".to_string(), Value::Object(cell));
        props.insert("missing".to_string(), Value::Undefined);
        props.insert(
            "inc".to_string(),
            Value::native("inc", |_, _, _| Ok(Value::Undefined)),
        );
        assert_eq!(Value::object(props).to_json(), json!({ "count": 3 }));
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(Value::Number(1.0).loose_equals(&Value::string("1")));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
        assert!(!Value::Number(f64::NAN).loose_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_display_string() {
        assert_eq!(Value::Undefined.to_display_string(), "");
        assert_eq!(Value::Number(2.5).to_display_string(), "2.5");
        let list = Value::array(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(list.to_display_string(), "[\n  1,\n  2\n]");
        assert_eq!(list.to_js_string(), "1,2");
    }

    #[test]
    fn test_self_referencing_array_stringifies_inner_as_empty() {
        let list = Value::array(vec![Value::Number(1.0)]);
        if let Value::Array(items) = &list {
            items.borrow_mut().push(list.clone());
            assert_eq!(Value::join_array(items, "-"), "1-");
        }
        assert_eq!(list.to_js_string(), "1,");
        assert!(list.to_number().is_nan());
        assert_eq!(list.to_json(), json!([1, null]));
        assert_eq!(format!("{:?}", list), "[1,null]");
    }
}
