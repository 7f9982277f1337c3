//! Conversion between host values and the external (orchestrator) model.
//!
//! Keys serialize as `"namespace/name"` or `"name"`. The reverse direction
//! always produces bare keys, so a namespaced key does not survive a round
//! trip: `Key::namespaced("n", "k")` comes back as `Key::bare("n/k")`.
//! Callers depend on that asymmetry.
//!
//! Deferred values and resources cross in both directions as opaque
//! references; their contents are converted only once they resolve
//! (see [`External::resolve`]).

use std::collections::BTreeMap;

use serde_json::{Number, Value as Json};

use crate::deferred::join;
use crate::{Composite, DeferredValue, Key, ResourceHandle, Scalar, Shape, Value};

/// The plain dynamic-object model the orchestrator consumes, plus opaque
/// references that are still unresolved.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum External {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<External>),
    Object(BTreeMap<String, External>),
    Deferred(DeferredValue<Value>),
    Resource(ResourceHandle),
}

pub fn to_external(value: &Value) -> External {
    match value.shape() {
        Shape::Scalar(scalar) => match scalar {
            Scalar::Null => External::Null,
            Scalar::Bool(b) => External::Bool(b),
            Scalar::Number(n) => External::Number(n.clone()),
            Scalar::String(s) => External::String(s.to_owned()),
            Scalar::Keyword(k) => External::String(k.external()),
        },
        Shape::Composite(Composite::List(items)) => External::Array(items.iter().map(to_external).collect()),
        Shape::Composite(Composite::Map(map)) => {
            External::Object(map.iter().map(|(k, v)| (k.external(), to_external(v))).collect())
        }
        Shape::DeferredRef(d) => External::Deferred(d.clone()),
        Shape::ResourceRef(r) => External::Resource(r.clone()),
    }
}

pub fn from_external(ext: &External) -> Value {
    match ext {
        External::Null => Value::Null,
        External::Bool(b) => Value::Bool(*b),
        External::Number(n) => Value::Number(n.clone()),
        External::String(s) => Value::String(s.clone()),
        External::Array(items) => Value::List(items.iter().map(from_external).collect()),
        External::Object(fields) => {
            Value::Map(fields.iter().map(|(k, v)| (Key::bare(k.clone()), from_external(v))).collect())
        }
        External::Deferred(d) => Value::Deferred(d.clone()),
        External::Resource(r) => Value::Resource(r.clone()),
    }
}

/// Plain JSON into host shape, keys becoming bare symbolic keys.
pub fn from_json(json: &Json) -> Value {
    from_external(&External::from_json(json))
}

impl External {
    pub fn from_json(json: &Json) -> External {
        match json {
            Json::Null => External::Null,
            Json::Bool(b) => External::Bool(*b),
            Json::Number(n) => External::Number(n.clone()),
            Json::String(s) => External::String(s.clone()),
            Json::Array(items) => External::Array(items.iter().map(External::from_json).collect()),
            Json::Object(fields) => {
                External::Object(fields.iter().map(|(k, v)| (k.clone(), External::from_json(v))).collect())
            }
        }
    }

    /// JSON form when no opaque references remain.
    pub fn to_json(&self) -> Option<Json> {
        match self {
            External::Null => Some(Json::Null),
            External::Bool(b) => Some(Json::Bool(*b)),
            External::Number(n) => Some(Json::Number(n.clone())),
            External::String(s) => Some(Json::String(s.clone())),
            External::Array(items) => items.iter().map(External::to_json).collect::<Option<Vec<_>>>().map(Json::Array),
            External::Object(fields) => fields
                .iter()
                .map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Json::Object),
            External::Deferred(_) | External::Resource(_) => None,
        }
    }

    pub fn is_plain(&self) -> bool {
        match self {
            External::Array(items) => items.iter().all(External::is_plain),
            External::Object(fields) => fields.values().all(External::is_plain),
            External::Deferred(_) | External::Resource(_) => false,
            _ => true,
        }
    }

    /// Resolve every embedded reference into plain JSON. Secret if any part is
    /// secret, failed if any part fails, pending while any part is pending.
    /// Resources render as `{"urn", "id"}`.
    pub fn resolve(&self) -> DeferredValue<Json> {
        if let Some(json) = self.to_json() {
            return DeferredValue::known(json);
        }
        match self {
            External::Array(items) => join(items.iter().map(External::resolve)).map(Json::Array),
            External::Object(fields) => {
                let keys: Vec<String> = fields.keys().cloned().collect();
                join(fields.values().map(External::resolve))
                    .map(move |values| Json::Object(keys.into_iter().zip(values).collect()))
            }
            External::Deferred(d) => d.flat_map(|v| to_external(&v).resolve()),
            External::Resource(r) => r.urn().zip(&r.id()).map(|(urn, id)| serde_json::json!({ "urn": urn, "id": id })),
            scalar => DeferredValue::known(scalar.to_json().unwrap_or(Json::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composite_and_bare_keys_serialize_to_strings() {
        let v = Value::Map(
            [
                (Key::namespaced("n", "k"), Value::from(1)),
                (Key::bare("k"), Value::from(2)),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(to_external(&v).to_json(), Some(json!({ "n/k": 1, "k": 2 })));
        assert_eq!(to_external(&Value::Keyword(Key::namespaced("size", "large"))), External::String("size/large".into()));
    }

    #[test]
    fn namespaced_keys_collapse_on_round_trip() {
        let original = Value::Map([(Key::namespaced("n", "k"), Value::from("v"))].into_iter().collect());
        let back = from_external(&to_external(&original));
        assert_ne!(back, original);
        assert_eq!(back.get(Key::bare("n/k")).and_then(Value::as_str), Some("v"));
        assert_eq!(back.get(Key::namespaced("n", "k")), None);
    }

    #[test]
    fn sequences_keep_order() {
        let v = Value::from(vec![Value::from(3), Value::from("b"), Value::from(true)]);
        assert_eq!(to_external(&v).to_json(), Some(json!([3, "b", true])));
        assert_eq!(from_json(&json!([3, "b", true])), v);
    }

    #[test]
    fn deferred_values_stay_opaque_until_resolved() {
        let (d, r) = DeferredValue::<Value>::pending();
        let v = Value::map([("bucket", Value::Deferred(d.clone())), ("acl", Value::from("private"))]);
        let ext = to_external(&v);
        assert!(!ext.is_plain());
        assert_eq!(ext.to_json(), None);
        match &ext {
            External::Object(fields) => assert_eq!(fields.get("bucket"), Some(&External::Deferred(d))),
            other => panic!("expected object, got {:?}", other),
        }
        assert_eq!(from_external(&ext), v);

        let resolved = ext.resolve();
        assert_eq!(resolved.peek(), None);
        r.resolve(Value::map([("name", "logs")]));
        assert_eq!(resolved.peek(), Some(Ok(json!({ "bucket": { "name": "logs" }, "acl": "private" }))));
    }

    #[test]
    fn resolve_is_secret_when_any_part_is_secret() {
        let v = Value::from(vec![Value::from("user"), Value::from(DeferredValue::secret("pw".to_string()))]);
        let resolved = to_external(&v).resolve();
        assert!(resolved.is_secret());
        assert_eq!(resolved.peek(), Some(Ok(json!(["user", "pw"]))));
    }
}
