//! Resource handles and lifecycle options.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{DeferredValue, Key, KeelError, KeelResult, Map, Value};

/// Everything a handle owns. Built by the construction facade.
pub struct ResourceParts {
    pub type_token: String,
    pub name: String,
    pub inputs: Map,
    pub options: ResourceOptions,
    pub urn: DeferredValue<String>,
    pub id: DeferredValue<String>,
    pub outputs: DeferredValue<Map>,
}

/// Owned adapter over a declared resource. Output fields are exposed as
/// deferred values; `urn` and `id` settle at most once, after the
/// orchestrator confirms the resource.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Rc<ResourceParts>,
}

impl ResourceHandle {
    pub fn from_parts(parts: ResourceParts) -> Self {
        Self { inner: Rc::new(parts) }
    }

    pub fn type_token(&self) -> &str {
        &self.inner.type_token
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn inputs(&self) -> &Map {
        &self.inner.inputs
    }

    pub fn options(&self) -> &ResourceOptions {
        &self.inner.options
    }

    pub fn urn(&self) -> DeferredValue<String> {
        self.inner.urn.clone()
    }

    /// Provider-assigned id. Never resolves during preview.
    pub fn id(&self) -> DeferredValue<String> {
        self.inner.id.clone()
    }

    pub fn outputs(&self) -> DeferredValue<Map> {
        self.inner.outputs.clone()
    }

    /// A single output field; absent fields resolve to `Null`. Fields listed in
    /// `additional_secret_outputs` are tagged secret.
    pub fn output(&self, field: &str) -> DeferredValue<Value> {
        let key = Key::bare(field);
        let out = self.inner.outputs.map(move |outputs| outputs.get(&key).cloned().unwrap_or_default());
        if self.inner.options.additional_secret_outputs.iter().any(|f| f == field) {
            out.as_secret()
        } else {
            out
        }
    }

    /// Identity mapping `{urn, id, extra...}` with deferred values, used when
    /// a resource is externalized.
    pub fn identity<S: AsRef<str>>(&self, extra: &[S]) -> Map {
        let mut map = Map::new();
        map.insert(Key::bare("urn"), Value::from(self.urn()));
        map.insert(Key::bare("id"), Value::from(self.id()));
        for field in extra {
            let field = field.as_ref();
            map.insert(Key::bare(field), Value::Deferred(self.output(field)));
        }
        map
    }

    /// Currently known identity, for logs and plan listings.
    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            type_token: self.inner.type_token.clone(),
            name: self.inner.name.clone(),
            urn: self.inner.urn.peek().and_then(Result::ok),
            id: self.inner.id.peek().and_then(Result::ok),
        }
    }

    pub fn ptr_eq(&self, other: &ResourceHandle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("type", &self.inner.type_token)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    #[serde(rename = "type")]
    pub type_token: String,
    pub name: String,
    pub urn: Option<String>,
    pub id: Option<String>,
}

/// Lifecycle directives for a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceOptions {
    pub parent: Option<ResourceHandle>,
    pub depends_on: Vec<ResourceHandle>,
    pub provider: Option<ResourceHandle>,
    pub protect: bool,
    pub ignore_changes: Vec<String>,
    pub delete_before_replace: bool,
    pub retain_on_delete: bool,
    pub additional_secret_outputs: Vec<String>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent(mut self, parent: &ResourceHandle) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn depends_on(mut self, dep: &ResourceHandle) -> Self {
        self.depends_on.push(dep.clone());
        self
    }

    pub fn provider(mut self, provider: &ResourceHandle) -> Self {
        self.provider = Some(provider.clone());
        self
    }

    pub fn protect(mut self, on: bool) -> Self {
        self.protect = on;
        self
    }

    pub fn ignore_changes<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.ignore_changes.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn delete_before_replace(mut self, on: bool) -> Self {
        self.delete_before_replace = on;
        self
    }

    pub fn retain_on_delete(mut self, on: bool) -> Self {
        self.retain_on_delete = on;
        self
    }

    pub fn additional_secret_outputs<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.additional_secret_outputs.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Resources this declaration must wait for: parent, provider and explicit
    /// dependencies, deduplicated.
    pub fn prerequisites(&self) -> Vec<ResourceHandle> {
        let mut out: Vec<ResourceHandle> = Vec::new();
        let all = self.parent.iter().chain(self.provider.iter()).chain(self.depends_on.iter());
        for r in all {
            if !out.iter().any(|o| o.ptr_eq(r)) {
                out.push(r.clone());
            }
        }
        out
    }

    /// Parse the dynamic mapping form. Keys may be camelCase (`dependsOn`) or
    /// kebab-case (`depends-on`). `Null` means no options.
    pub fn from_value(value: &Value) -> KeelResult<Self> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Map(m) => m,
            other => {
                return Err(KeelError::ConfigValidation {
                    what: "resource options".into(),
                    found: other.kind_name().into(),
                })
            }
        };
        let mut opts = Self::default();
        for (key, v) in map {
            let name = option_name(key);
            match name.as_str() {
                "parent" => opts.parent = Some(expect_resource(&name, v)?),
                "provider" => opts.provider = Some(expect_resource(&name, v)?),
                "dependsOn" => {
                    opts.depends_on = match v {
                        Value::List(items) => items.iter().map(|i| expect_resource(&name, i)).collect::<KeelResult<_>>()?,
                        single => vec![expect_resource(&name, single)?],
                    }
                }
                "protect" => opts.protect = expect_bool(&name, v)?,
                "deleteBeforeReplace" => opts.delete_before_replace = expect_bool(&name, v)?,
                "retainOnDelete" => opts.retain_on_delete = expect_bool(&name, v)?,
                "ignoreChanges" => opts.ignore_changes = expect_names(&name, v)?,
                "additionalSecretOutputs" => opts.additional_secret_outputs = expect_names(&name, v)?,
                _ => return Err(KeelError::InvalidResource(format!("unknown resource option '{}'", key))),
            }
        }
        Ok(opts)
    }
}

fn option_name(key: &Key) -> String {
    let raw = key.external();
    let mut out = String::with_capacity(raw.len());
    let mut upper = false;
    for ch in raw.chars() {
        if ch == '-' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn expect_resource(option: &str, v: &Value) -> KeelResult<ResourceHandle> {
    v.as_resource()
        .cloned()
        .ok_or_else(|| KeelError::InvalidResource(format!("option '{}' expects a resource, got {}", option, v.kind_name())))
}

fn expect_bool(option: &str, v: &Value) -> KeelResult<bool> {
    v.as_bool()
        .ok_or_else(|| KeelError::InvalidResource(format!("option '{}' expects a boolean, got {}", option, v.kind_name())))
}

fn expect_names(option: &str, v: &Value) -> KeelResult<Vec<String>> {
    let items = v
        .as_list()
        .ok_or_else(|| KeelError::InvalidResource(format!("option '{}' expects a list, got {}", option, v.kind_name())))?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let name = match item {
            Value::String(s) => s.clone(),
            Value::Keyword(k) => k.external(),
            other => {
                return Err(KeelError::InvalidResource(format!(
                    "option '{}' expects field names, got {}",
                    option,
                    other.kind_name()
                )))
            }
        };
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    Ok(out)
}
