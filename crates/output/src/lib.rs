//! Keel output: prepares program results for export.
//!
//! Resources are not serializable as-is; before a result tree leaves the
//! program every resource handle is replaced by its identity mapping
//! (`urn`, `id`, plus any requested output fields). Non-resource data passes
//! through untouched. Deferred values are rewritten lazily: the sanitizer is
//! applied to whatever they eventually resolve to.

#![forbid(unsafe_code)]

use std::rc::Rc;

use keel_core::{to_external, Composite, DeferredValue, External, Shape, Value};
use serde_json::Value as Json;
use tracing::trace;

pub const UNKNOWN: &str = "<unknown>";
pub const SECRET: &str = "[secret]";

/// Replace every resource in `value` with `{urn, id}`.
pub fn sanitize(value: &Value) -> External {
    sanitize_with(value, &[])
}

/// Like [`sanitize`], also exposing the named output fields of each resource.
pub fn sanitize_with(value: &Value, extra: &[&str]) -> External {
    trace!(extra = ?extra, "sanitizing program outputs");
    let extra: Rc<[String]> = extra.iter().map(|s| s.to_string()).collect();
    to_external(&summarize(value, &extra))
}

/// The sanitized tree in host shape. Pre-order: a resource is replaced first
/// and the replacement is then walked like any other mapping.
pub fn summarize(value: &Value, extra: &Rc<[String]>) -> Value {
    match value.shape() {
        Shape::Scalar(_) => value.clone(),
        Shape::Composite(Composite::List(items)) => Value::List(items.iter().map(|v| summarize(v, extra)).collect()),
        Shape::Composite(Composite::Map(map)) => {
            Value::Map(map.iter().map(|(k, v)| (k.clone(), summarize(v, extra))).collect())
        }
        Shape::ResourceRef(r) => summarize(&Value::Map(r.identity(&extra[..])), extra),
        Shape::DeferredRef(d) => {
            let extra = Rc::clone(extra);
            Value::Deferred(d.map(move |inner| summarize(&inner, &extra)))
        }
    }
}

/// Fully resolved JSON of the sanitized tree.
pub fn render(value: &Value) -> DeferredValue<Json> {
    sanitize(value).resolve()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretDisplay {
    #[default]
    Mask,
    Show,
}

/// Point-in-time JSON view of an external tree without waiting on anything.
/// Pending parts print as `<unknown>`, secret parts as `[secret]` unless
/// shown, failed parts as `<failed: reason>`.
pub fn snapshot(ext: &External, secrets: SecretDisplay) -> Json {
    match ext {
        External::Array(items) => Json::Array(items.iter().map(|i| snapshot(i, secrets)).collect()),
        External::Object(fields) => {
            Json::Object(fields.iter().map(|(k, v)| (k.clone(), snapshot(v, secrets))).collect())
        }
        External::Deferred(d) => {
            if d.is_secret() && secrets == SecretDisplay::Mask {
                return Json::String(SECRET.into());
            }
            match d.peek() {
                None => Json::String(UNKNOWN.into()),
                Some(Err(failure)) => Json::String(format!("<failed: {}>", failure.message)),
                Some(Ok(inner)) => snapshot(&to_external(&inner), secrets),
            }
        }
        External::Resource(r) => snapshot(&to_external(&Value::Map(r.identity::<&str>(&[]))), secrets),
        plain => plain.to_json().unwrap_or(Json::Null),
    }
}
