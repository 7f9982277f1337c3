//! Keel config: namespaced, typed reads of externally supplied configuration.
//!
//! Keys are `namespace:key`; a bare key reads from the project namespace.
//! Sources are constructed once per namespace and cached in an owned
//! [`ConfigRegistry`] for the life of the stack.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use keel_core::{from_json, DeferredValue, KeelError, KeelResult, Value};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value as Json};
use tracing::{debug, warn};

/// Fully qualified configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    pub namespace: String,
    pub key: String,
}

impl ConfigKey {
    /// Split `raw` on the first `:`; without one (or with an empty namespace)
    /// the key belongs to `project`.
    pub fn parse(raw: &str, project: &str) -> Self {
        match raw.split_once(':') {
            Some((ns, key)) if !ns.is_empty() => Self { namespace: ns.to_string(), key: key.to_string() },
            Some((_, key)) => Self { namespace: project.to_string(), key: key.to_string() },
            None => Self { namespace: project.to_string(), key: raw.to_string() },
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Number,
    Boolean,
    Object,
    Secret,
}

impl ConfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigType::String => "string",
            ConfigType::Number => "number",
            ConfigType::Boolean => "boolean",
            ConfigType::Object => "object",
            ConfigType::Secret => "secret",
        }
    }
}

impl std::str::FromStr for ConfigType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(ConfigType::String),
            "number" => Ok(ConfigType::Number),
            "boolean" | "bool" => Ok(ConfigType::Boolean),
            "object" => Ok(ConfigType::Object),
            "secret" => Ok(ConfigType::Secret),
            other => Err(anyhow!("unknown config type '{}' (expect string|number|boolean|object|secret)", other)),
        }
    }
}

/// What to do when a key is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    Required,
    Value(Value),
}

impl Fallback {
    pub fn value(v: impl Into<Value>) -> Self {
        Fallback::Value(v.into())
    }
}

impl From<Value> for Fallback {
    fn from(v: Value) -> Self {
        Fallback::Value(v)
    }
}

/// A configuration source bound to one namespace.
pub trait ConfigSource {
    fn namespace(&self) -> &str;

    /// Raw string value, if present.
    fn raw(&self, key: &str) -> Option<String>;

    fn is_secret(&self, key: &str) -> bool;

    fn qualified(&self, key: &str) -> String {
        format!("{}:{}", self.namespace(), key)
    }

    fn get_string(&self, key: &str) -> KeelResult<Option<String>> {
        warn_plaintext_read(self, key);
        Ok(self.raw(key))
    }

    fn get_number(&self, key: &str) -> KeelResult<Option<Number>> {
        warn_plaintext_read(self, key);
        match self.raw(key) {
            None => Ok(None),
            Some(raw) => parse_number(&raw).map(Some).ok_or_else(|| self.type_error(key, ConfigType::Number)),
        }
    }

    fn get_bool(&self, key: &str) -> KeelResult<Option<bool>> {
        warn_plaintext_read(self, key);
        match self.raw(key).as_deref().map(str::trim) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(_) => Err(self.type_error(key, ConfigType::Boolean)),
        }
    }

    /// Structured value: the raw text is JSON, restored to host shape.
    fn get_object(&self, key: &str) -> KeelResult<Option<Value>> {
        warn_plaintext_read(self, key);
        match self.raw(key) {
            None => Ok(None),
            Some(raw) => match serde_json::from_str::<Json>(&raw) {
                Ok(json @ (Json::Object(_) | Json::Array(_))) => Ok(Some(from_json(&json))),
                _ => Err(self.type_error(key, ConfigType::Object)),
            },
        }
    }

    fn get_secret(&self, key: &str) -> KeelResult<Option<DeferredValue<String>>> {
        Ok(self.raw(key).map(DeferredValue::secret))
    }

    fn require_string(&self, key: &str) -> KeelResult<String> {
        self.get_string(key)?.ok_or_else(|| self.missing(key))
    }

    fn require_number(&self, key: &str) -> KeelResult<Number> {
        self.get_number(key)?.ok_or_else(|| self.missing(key))
    }

    fn require_bool(&self, key: &str) -> KeelResult<bool> {
        self.get_bool(key)?.ok_or_else(|| self.missing(key))
    }

    fn require_object(&self, key: &str) -> KeelResult<Value> {
        self.get_object(key)?.ok_or_else(|| self.missing(key))
    }

    fn require_secret(&self, key: &str) -> KeelResult<DeferredValue<String>> {
        self.get_secret(key)?.ok_or_else(|| self.missing(key))
    }

    fn missing(&self, key: &str) -> KeelError {
        KeelError::MissingConfig { key: self.qualified(key) }
    }

    fn type_error(&self, key: &str, expected: ConfigType) -> KeelError {
        KeelError::ConfigType { key: self.qualified(key), expected: expected.as_str().to_string() }
    }
}

fn warn_plaintext_read<S: ConfigSource + ?Sized>(source: &S, key: &str) {
    if source.is_secret(key) {
        warn!(key = %source.qualified(key), "secret configuration value read as plaintext; use a secret read");
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    let s = raw.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(i.into());
    }
    if let Ok(u) = s.parse::<u64>() {
        return Some(u.into());
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Builds the source for a namespace.
pub trait ConfigFactory {
    fn open(&self, namespace: &str) -> Rc<dyn ConfigSource>;
}

/// Configuration values keyed by `namespace:key`, with a set of secret keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigData {
    values: BTreeMap<String, String>,
    secret_keys: BTreeSet<String>,
}

impl ConfigData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &ConfigKey, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn set_secret(&mut self, key: &ConfigKey, value: impl Into<String>) {
        self.set(key, value);
        self.secret_keys.insert(key.to_string());
    }

    /// Builder form over already qualified `ns:key` strings.
    pub fn with(mut self, qualified: &str, value: impl Into<String>) -> Self {
        self.values.insert(qualified.to_string(), value.into());
        self
    }

    pub fn with_secret(mut self, qualified: &str, value: impl Into<String>) -> Self {
        self.values.insert(qualified.to_string(), value.into());
        self.secret_keys.insert(qualified.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a JSON object of `"ns:key"` → value and an optional JSON array of
    /// secret keys. Non-string values are kept as their JSON text.
    pub fn from_json(values: &str, secret_keys: Option<&str>) -> Result<Self> {
        let parsed: serde_json::Map<String, Json> = serde_json::from_str(values).context("parsing config JSON object")?;
        let mut data = Self::new();
        for (key, v) in parsed {
            if !key.contains(':') {
                return Err(anyhow!("config key '{}' is not namespaced (expect ns:key)", key));
            }
            let raw = match v {
                Json::String(s) => s,
                other => other.to_string(),
            };
            data.values.insert(key, raw);
        }
        if let Some(secret_keys) = secret_keys {
            let keys: Vec<String> = serde_json::from_str(secret_keys).context("parsing secret keys JSON array")?;
            data.secret_keys.extend(keys);
        }
        Ok(data)
    }

    /// Read `KEEL_CONFIG` and `KEEL_CONFIG_SECRET_KEYS`; both optional.
    pub fn from_env() -> Result<Self> {
        let values = std::env::var("KEEL_CONFIG").ok().filter(|s| !s.trim().is_empty());
        let secrets = std::env::var("KEEL_CONFIG_SECRET_KEYS").ok().filter(|s| !s.trim().is_empty());
        match values {
            Some(v) => Self::from_json(&v, secrets.as_deref()).context("reading KEEL_CONFIG"),
            None => Ok(Self::new()),
        }
    }
}

impl ConfigFactory for ConfigData {
    fn open(&self, namespace: &str) -> Rc<dyn ConfigSource> {
        let prefix = format!("{}:", namespace);
        let values = self
            .values
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|key| (key.to_string(), v.clone())))
            .collect();
        let secret_keys = self.secret_keys.iter().filter_map(|k| k.strip_prefix(&prefix)).map(str::to_string).collect();
        Rc::new(MapConfigSource { namespace: namespace.to_string(), values, secret_keys })
    }
}

/// In-memory source for one namespace.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    namespace: String,
    values: BTreeMap<String, String>,
    secret_keys: BTreeSet<String>,
}

impl ConfigSource for MapConfigSource {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn raw(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn is_secret(&self, key: &str) -> bool {
        self.secret_keys.contains(key)
    }
}

/// Owned per-namespace source cache. A factory is asked at most once per
/// namespace; entries are never invalidated.
pub struct ConfigRegistry {
    project: String,
    factory: Rc<dyn ConfigFactory>,
    sources: RefCell<HashMap<String, Rc<dyn ConfigSource>>>,
}

impl ConfigRegistry {
    pub fn new(project: impl Into<String>, factory: Rc<dyn ConfigFactory>) -> Self {
        Self { project: project.into(), factory, sources: RefCell::new(HashMap::new()) }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Source for `namespace`, or the project namespace when `None`.
    pub fn source(&self, namespace: Option<&str>) -> Rc<dyn ConfigSource> {
        let ns = namespace.unwrap_or(&self.project).to_string();
        if let Some(existing) = self.sources.borrow().get(&ns) {
            return Rc::clone(existing);
        }
        debug!(namespace = %ns, "opening config source");
        let opened = self.factory.open(&ns);
        Rc::clone(self.sources.borrow_mut().entry(ns).or_insert(opened))
    }

    /// Typed read. A deferred default is returned as-is without reading;
    /// `Fallback::Required` fails with `MissingConfig` naming `ns:key`. A plain
    /// default for a secret read is tagged secret.
    pub fn get(&self, key: &str, ty: ConfigType, fallback: Fallback) -> KeelResult<Value> {
        if let Fallback::Value(Value::Deferred(d)) = &fallback {
            return Ok(Value::Deferred(d.clone()));
        }
        let key = ConfigKey::parse(key, &self.project);
        let source = self.source(Some(&key.namespace));
        match fallback {
            Fallback::Required => require(source.as_ref(), &key.key, ty),
            Fallback::Value(default) => match read(source.as_ref(), &key.key, ty)? {
                Some(v) => Ok(v),
                None if ty == ConfigType::Secret => Ok(Value::Deferred(DeferredValue::secret(default))),
                None => Ok(default),
            },
        }
    }
}

pub fn get_config(registry: &ConfigRegistry, key: &str, ty: ConfigType, fallback: Fallback) -> KeelResult<Value> {
    registry.get(key, ty, fallback)
}

fn read(source: &dyn ConfigSource, key: &str, ty: ConfigType) -> KeelResult<Option<Value>> {
    Ok(match ty {
        ConfigType::String => source.get_string(key)?.map(Value::String),
        ConfigType::Number => source.get_number(key)?.map(Value::Number),
        ConfigType::Boolean => source.get_bool(key)?.map(Value::Bool),
        ConfigType::Object => source.get_object(key)?,
        ConfigType::Secret => source.get_secret(key)?.map(Value::from),
    })
}

fn require(source: &dyn ConfigSource, key: &str, ty: ConfigType) -> KeelResult<Value> {
    match ty {
        ConfigType::String => source.require_string(key).map(Value::String),
        ConfigType::Number => source.require_number(key).map(Value::Number),
        ConfigType::Boolean => source.require_bool(key).map(Value::Bool),
        ConfigType::Object => source.require_object(key),
        ConfigType::Secret => source.require_secret(key).map(Value::from),
    }
}
