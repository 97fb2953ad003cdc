// Dynamic value model carried by message envelopes.
use bytes::Bytes;
use std::collections::BTreeMap;

/// An application-level message value.
///
/// Supports the full nesting the envelope allows: primitives, binary-safe
/// byte strings, lists, string-keyed maps, and tagged values produced by a
/// [`crate::TypeRegistry`].
///
/// ```
/// use trestle_codec::Value;
///
/// let value = Value::List(vec![Value::Int(1), Value::Null]);
/// assert_eq!(value, value.clone());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Tagged { tag: String, value: Box<Value> },
}

impl Value {
    pub fn tagged(tag: impl Into<String>, value: Value) -> Self {
        Self::Tagged {
            tag: tag.into(),
            value: Box::new(value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}
