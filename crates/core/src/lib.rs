//! Keel core: host values, deferred values, conversion and resource handles.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;

pub mod convert;
pub mod deferred;
pub mod error;
pub mod resource;

pub use convert::{from_external, from_json, to_external, External};
pub use deferred::{bind, join, stringify, Bindings, DeferredValue, Outcome, Part, Resolved, Resolver};
pub use error::{KeelError, KeelResult, ResolutionFailure};
pub use resource::{ResourceHandle, ResourceOptions, ResourceParts, ResourceSummary};

pub mod prelude {
    pub use super::{
        bind, join, stringify, DeferredValue, External, Key, KeelError, KeelResult, Map, ResourceHandle,
        ResourceOptions, Value,
    };
}

/// Symbolic map key: a name with an optional namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub namespace: Option<String>,
    pub name: String,
}

impl Key {
    pub fn bare(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    /// External string form: `"namespace/name"` or `"name"`.
    pub fn external(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.external())
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::bare(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::bare(name)
    }
}

pub type Map = BTreeMap<Key, Value>;

/// Host object model used by declaration code.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Keyword(Key),
    List(Vec<Value>),
    Map(Map),
    Deferred(DeferredValue<Value>),
    Resource(ResourceHandle),
}

/// Closed classification of a value, decided once at a walker's entry.
#[derive(Debug, Clone, Copy)]
pub enum Shape<'a> {
    Scalar(Scalar<'a>),
    Composite(Composite<'a>),
    DeferredRef(&'a DeferredValue<Value>),
    ResourceRef(&'a ResourceHandle),
}

#[derive(Debug, Clone, Copy)]
pub enum Scalar<'a> {
    Null,
    Bool(bool),
    Number(&'a Number),
    String(&'a str),
    Keyword(&'a Key),
}

#[derive(Debug, Clone, Copy)]
pub enum Composite<'a> {
    List(&'a [Value]),
    Map(&'a Map),
}

impl Value {
    pub fn shape(&self) -> Shape<'_> {
        match self {
            Value::Null => Shape::Scalar(Scalar::Null),
            Value::Bool(b) => Shape::Scalar(Scalar::Bool(*b)),
            Value::Number(n) => Shape::Scalar(Scalar::Number(n)),
            Value::String(s) => Shape::Scalar(Scalar::String(s)),
            Value::Keyword(k) => Shape::Scalar(Scalar::Keyword(k)),
            Value::List(items) => Shape::Composite(Composite::List(items)),
            Value::Map(map) => Shape::Composite(Composite::Map(map)),
            Value::Deferred(d) => Shape::DeferredRef(d),
            Value::Resource(r) => Shape::ResourceRef(r),
        }
    }

    /// Short type name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Keyword(_) => "keyword",
            Value::List(_) => "list",
            Value::Map(_) => "mapping",
            Value::Deferred(_) => "deferred value",
            Value::Resource(_) => "resource",
        }
    }

    /// Build a mapping from `(key, value)` pairs.
    pub fn map<K: Into<Key>, V: Into<Value>>(pairs: impl IntoIterator<Item = (K, V)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_deferred(&self) -> Option<&DeferredValue<Value>> {
        match self {
            Value::Deferred(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<&ResourceHandle> {
        match self {
            Value::Resource(r) => Some(r),
            _ => None,
        }
    }

    /// Lookup by key in a mapping; `None` for other values.
    pub fn get(&self, key: impl Into<Key>) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(&key.into()))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

/// Non-finite floats have no external form and become `Null`.
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        Value::Keyword(k)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::Map(m)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<ResourceHandle> for Value {
    fn from(r: ResourceHandle) -> Self {
        Value::Resource(r)
    }
}

impl From<&ResourceHandle> for Value {
    fn from(r: &ResourceHandle) -> Self {
        Value::Resource(r.clone())
    }
}

impl<T: Into<Value> + Clone + 'static> From<DeferredValue<T>> for Value {
    fn from(d: DeferredValue<T>) -> Self {
        Value::Deferred(d.map(Into::into))
    }
}

impl<T: Into<Value> + Clone + 'static> From<&DeferredValue<T>> for Value {
    fn from(d: &DeferredValue<T>) -> Self {
        Value::Deferred(d.map(Into::into))
    }
}
