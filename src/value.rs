//! Runtime values for template expressions
//!
//! A JS-shaped dynamic value. Arrays and objects are reference counted so that
//! identity survives across renders (loop keys, strict equality).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

use crate::controller::ControllerHandle;
use crate::dom::{ElementRef, Event};

pub type NativeFn = dyn Fn(&[Value]) -> std::result::Result<Value, String>;

/// A callable value: built-in functions, bound methods and arrow closures.
#[derive(Clone)]
pub struct Function {
    name: Rc<str>,
    call: Rc<NativeFn>,
}

impl Function {
    pub fn new(
        name: &str,
        call: impl Fn(&[Value]) -> std::result::Result<Value, String> + 'static,
    ) -> Self {
        Self {
            name: Rc::from(name),
            call: Rc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> std::result::Result<Value, String> {
        (self.call)(args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        std::ptr::eq(
            Rc::as_ptr(&self.call) as *const (),
            Rc::as_ptr(&other.call) as *const (),
        )
    }
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Rc<Vec<Value>>),
    Object(Rc<IndexMap<String, Value>>),
    Function(Function),
    Event(Rc<Event>),
    Element(ElementRef),
    Controller(ControllerHandle),
}

impl Default for Value {
    fn default() -> Self {
        Value::Undefined
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONVERSIONS
// ═══════════════════════════════════════════════════════════════════════════════

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(map))
    }
}

impl From<Option<&str>> for Value {
    fn from(s: Option<&str>) -> Self {
        match s {
            Some(s) => Value::String(s.to_string()),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(Rc::new(items.into_iter().map(Value::from).collect()))
            }
            serde_json::Value::Object(map) => Value::Object(Rc::new(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JS SEMANTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Formats a number the way `String(n)` does for the common cases.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Rc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            _ => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
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
                } else if let Some(hex) = trimmed.strip_prefix("0x") {
                    i64::from_str_radix(hex, 16)
                        .map(|n| n as f64)
                        .unwrap_or(f64::NAN)
                } else {
                    match trimmed {
                        "Infinity" | "+Infinity" => f64::INFINITY,
                        "-Infinity" => f64::NEG_INFINITY,
                        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
                    }
                }
            }
            Value::Array(items) => match items.len() {
                0 => 0.0,
                1 => items[0].to_number(),
                _ => f64::NAN,
            },
            _ => f64::NAN,
        }
    }

    /// `String(value)`
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    if v.is_nullish() {
                        String::new()
                    } else {
                        v.to_js_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
            Value::Event(e) => format!("[object {}]", e.class_name()),
            Value::Element(el) => format!("[object HTML{}Element]", el.local_name()),
            Value::Controller(_) => "[object Object]".to_string(),
        }
    }

    /// Text rendering of an interpolation: nullish values render as nothing.
    pub fn to_display(&self) -> String {
        if self.is_nullish() {
            String::new()
        } else {
            self.to_js_string()
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Event(a), Value::Event(b)) => Rc::ptr_eq(a, b),
            (Value::Element(a), Value::Element(b)) => a == b,
            (Value::Controller(a), Value::Controller(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// `==`
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => {
                let (a, b) = (self.to_number(), other.to_number());
                a == b
            }
            (Value::Array(_) | Value::Object(_), Value::String(s))
            | (Value::String(s), Value::Array(_) | Value::Object(_)) => {
                let compound = if matches!(self, Value::String(_)) {
                    other
                } else {
                    self
                };
                compound.to_js_string() == *s
            }
            _ => self.strict_equals(other),
        }
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Undefined | Value::Function(_) => None,
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => Some(
                serde_json::Number::from_f64(*n)
                    .map(|num| {
                        if n.fract() == 0.0 && n.abs() < 9.0e15 {
                            serde_json::Value::Number((*n as i64).into())
                        } else {
                            serde_json::Value::Number(num)
                        }
                    })
                    .unwrap_or(serde_json::Value::Null),
            ),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Array(items) => Some(serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.to_json().unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
            Value::Object(map) => Some(serde_json::Value::Object(
                map.iter()
                    .filter_map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect(),
            )),
            Value::Event(e) => Some(serde_json::json!({ "isTrusted": false, "type": e.event_type() })),
            Value::Element(_) | Value::Controller(_) => Some(serde_json::json!({})),
        }
    }

    /// Reads `self[key]` for plain data values. Host objects resolve their
    /// members in the evaluator.
    pub fn get_member(&self, key: &str) -> Value {
        match self {
            Value::String(s) => {
                if key == "length" {
                    return Value::Number(s.encode_utf16().count() as f64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Undefined)
            }
            Value::Array(items) => {
                if key == "length" {
                    return Value::Number(items.len() as f64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Undefined)
            }
            Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Identity used to key `*for` expansions: primitives by value,
    /// reference values by pointer.
    pub fn identity_key(&self) -> String {
        match self {
            Value::Undefined => "u".to_string(),
            Value::Null => "n".to_string(),
            Value::Bool(b) => format!("b:{}", b),
            Value::Number(n) => format!("d:{}", format_number(*n)),
            Value::String(s) => format!("s:{}", s),
            Value::Array(a) => format!("a:{:p}", Rc::as_ptr(a)),
            Value::Object(o) => format!("o:{:p}", Rc::as_ptr(o)),
            Value::Function(f) => format!("f:{:p}", Rc::as_ptr(&f.call) as *const ()),
            Value::Event(e) => format!("e:{:p}", Rc::as_ptr(e)),
            Value::Element(el) => format!("el:{}", el.node().index()),
            Value::Controller(c) => format!("c:{}", c.address()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Function(func) => write!(f, "[Function {}]", func.name()),
            Value::Event(e) => write!(f, "[Event {}]", e.event_type()),
            Value::Element(el) => write!(f, "[Element {}]", el.local_name()),
            Value::Controller(_) => write!(f, "[Controller]"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_js_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTRIBUTE CODEC
// ═══════════════════════════════════════════════════════════════════════════════

/// Declared type of an attribute-bound controller property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
}

pub fn parse_string(value: &Value) -> Value {
    match value {
        Value::Undefined | Value::Null => Value::Null,
        Value::String(_) => value.clone(),
        other => Value::String(other.to_js_string()),
    }
}

pub fn parse_number(value: &Value) -> Value {
    match value {
        Value::Undefined | Value::Null => Value::Null,
        Value::Number(_) => value.clone(),
        other => Value::Number(other.to_number()),
    }
}

/// Attribute presence means true unless the text is literally `false`.
pub fn parse_boolean(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.trim().eq_ignore_ascii_case("false"),
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        _ => true,
    }
}

pub fn parse_object(value: &Value) -> Value {
    match value {
        Value::Undefined | Value::Null => Value::Null,
        Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(json) => Value::from(json),
            Err(e) => {
                tracing::warn!(error = %e, "attribute value is not valid JSON");
                Value::Null
            }
        },
        other => other.clone(),
    }
}

pub fn parse_by_type(data_type: DataType, value: &Value) -> Value {
    match data_type {
        DataType::String => parse_string(value),
        DataType::Number => parse_number(value),
        DataType::Boolean => Value::Bool(parse_boolean(value)),
        DataType::Object => parse_object(value),
    }
}

/// Serializes a value for an attribute. `None` means the attribute should be
/// removed.
pub fn serialize_attribute(value: &Value) -> Option<String> {
    match value {
        Value::Bool(false) | Value::Undefined | Value::Null => None,
        Value::Bool(true) => Some(String::new()),
        Value::Array(_) | Value::Object(_) => value
            .to_json()
            .and_then(|json| serde_json::to_string(&json).ok()),
        other => Some(other.to_js_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(9.0), "9");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(f64::NAN), "NaN");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::array(vec![]).is_truthy());
        assert!(!Value::Null.is_truthy());
    }

    #[test]
    fn test_strict_equality_uses_identity_for_arrays() {
        let a = Value::array(vec![Value::from(1)]);
        let b = Value::array(vec![Value::from(1)]);
        assert!(a.strict_equals(&a.clone()));
        assert!(!a.strict_equals(&b));
        assert!(!Value::Number(f64::NAN).strict_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_loose_equality_coerces() {
        assert!(Value::from("7").loose_equals(&Value::from(7)));
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.loose_equals(&Value::from(0)));
    }

    #[test]
    fn test_attribute_parsers() {
        assert_eq!(parse_number(&Value::from("7")), Value::Number(7.0));
        assert!(parse_boolean(&Value::from("")));
        assert!(!parse_boolean(&Value::from("false")));
        assert!(!parse_boolean(&Value::Null));
        let obj = parse_object(&Value::from(r#"{"a": [1, 2]}"#));
        assert_eq!(obj.get_member("a").get_member("length"), Value::Number(2.0));
    }

    #[test]
    fn test_serialize_attribute() {
        assert_eq!(serialize_attribute(&Value::Bool(false)), None);
        assert_eq!(serialize_attribute(&Value::Number(9.0)).as_deref(), Some("9"));
        assert_eq!(
            serialize_attribute(&Value::object([("a", Value::from(1))])).as_deref(),
            Some(r#"{"a":1}"#)
        );
    }
}
