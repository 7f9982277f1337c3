//! Keel public API façade.
//!
//! A [`Stack`] ties one orchestrator engine to one config registry and keeps
//! track of the resources a program declares. Frontends (the CLI, tests)
//! depend on this crate only.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use keel_config::{
    get_config, ConfigData, ConfigFactory, ConfigKey, ConfigRegistry, ConfigSource, ConfigType, Fallback,
};
pub use keel_core::{
    bind, from_external, from_json, join, prelude, stringify, to_external, Bindings, DeferredValue, External, Key,
    KeelError, KeelResult, Map, Part, ResolutionFailure, Resolver, ResourceHandle, ResourceOptions, ResourceSummary,
    Value,
};
pub use keel_output::{render, sanitize, sanitize_with, snapshot, SecretDisplay};
pub use keel_resource::{CompletionMode, Engine, MockEngine, OutputResolvers, RegisterRequest, ResourceDecl};

/// Identity of the stack a program runs against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackSettings {
    pub project: String,
    pub stack: String,
    pub dry_run: bool,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self { project: "keel".into(), stack: "dev".into(), dry_run: false }
    }
}

impl StackSettings {
    /// `KEEL_PROJECT`, `KEEL_STACK` and `KEEL_DRY_RUN`, each optional.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let project = std::env::var("KEEL_PROJECT").ok().filter(|s| !s.is_empty()).unwrap_or(defaults.project);
        let stack = std::env::var("KEEL_STACK").ok().filter(|s| !s.is_empty()).unwrap_or(defaults.stack);
        let dry_run = std::env::var("KEEL_DRY_RUN")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.dry_run);
        Self { project, stack, dry_run }
    }
}

pub struct Stack {
    engine: Rc<dyn Engine>,
    config: ConfigRegistry,
    resources: RefCell<Vec<ResourceHandle>>,
}

impl Stack {
    /// The config registry's default namespace is the engine's project.
    pub fn new(engine: Rc<dyn Engine>, config: Rc<dyn ConfigFactory>) -> Self {
        let config = ConfigRegistry::new(engine.project(), config);
        Self { engine, config, resources: RefCell::new(Vec::new()) }
    }

    pub fn project(&self) -> &str {
        self.engine.project()
    }

    pub fn name(&self) -> &str {
        self.engine.stack()
    }

    pub fn is_dry_run(&self) -> bool {
        self.engine.is_dry_run()
    }

    pub fn engine(&self) -> &Rc<dyn Engine> {
        &self.engine
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.config
    }

    /// Dynamic declaration; see [`keel_resource::create_resource`].
    pub fn create_resource(
        &self,
        type_token: &str,
        name: &str,
        inputs: &Value,
        options: &Value,
    ) -> KeelResult<ResourceHandle> {
        let handle = keel_resource::create_resource(&self.engine, type_token, name, inputs, options)?;
        Ok(self.track(handle))
    }

    /// Typed declaration.
    pub fn resource(&self, decl: ResourceDecl) -> KeelResult<ResourceHandle> {
        let handle = keel_resource::register(&self.engine, decl)?;
        Ok(self.track(handle))
    }

    pub fn get_config(&self, key: &str, ty: ConfigType, fallback: Fallback) -> KeelResult<Value> {
        get_config(&self.config, key, ty, fallback)
    }

    /// Config source for `namespace`, the project's when `None`.
    pub fn config(&self, namespace: Option<&str>) -> Rc<dyn ConfigSource> {
        self.config.source(namespace)
    }

    /// Declared resources, in declaration order.
    pub fn resources(&self) -> Vec<ResourceHandle> {
        self.resources.borrow().clone()
    }

    pub fn summaries(&self) -> Vec<ResourceSummary> {
        self.resources.borrow().iter().map(ResourceHandle::summary).collect()
    }

    fn track(&self, handle: ResourceHandle) -> ResourceHandle {
        self.resources.borrow_mut().push(handle.clone());
        handle
    }
}

/// A user program: declares resources on the stack and returns its outputs.
pub trait Program {
    fn run(&self, stack: &Stack) -> Result<Value>;
}

impl<F> Program for F
where
    F: Fn(&Stack) -> Result<Value>,
{
    fn run(&self, stack: &Stack) -> Result<Value> {
        self(stack)
    }
}

/// Run `program` and return its sanitized outputs. Declarations are
/// registered as their inputs resolve; the returned tree may still hold
/// unresolved references.
pub fn run(stack: &Stack, program: &dyn Program) -> Result<External> {
    info!(project = %stack.project(), stack = %stack.name(), dry_run = stack.is_dry_run(), "running program");
    counter!("program_runs_total", 1u64);
    let outputs = program.run(stack).context("program failed")?;
    let declared = stack.resources.borrow().len();
    debug!(declared, "program returned");
    Ok(sanitize(&outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(data: ConfigData) -> (Rc<MockEngine>, Stack) {
        let mock = Rc::new(MockEngine::new("shop", "dev"));
        let engine: Rc<dyn Engine> = mock.clone();
        (mock, Stack::new(engine, Rc::new(data)))
    }

    #[test]
    fn settings_default_to_dev_stack() {
        let s = StackSettings::default();
        assert_eq!(s.project, "keel");
        assert_eq!(s.stack, "dev");
        assert!(!s.dry_run);
    }

    #[test]
    fn config_defaults_to_project_namespace() {
        let (_mock, stack) = stack(ConfigData::new().with("shop:region", "eu-west-1"));
        assert_eq!(stack.config(None).namespace(), "shop");
        let region = stack.get_config("region", ConfigType::String, Fallback::Required).unwrap();
        assert_eq!(region, Value::from("eu-west-1"));
    }

    #[test]
    fn declared_resources_are_tracked_in_order() {
        let (mock, stack) = stack(ConfigData::new());
        stack.resource(ResourceDecl::new("aws:s3:Bucket", "logs")).unwrap();
        stack.create_resource("aws:s3:Bucket", "assets", &Value::Null, &Value::Null).unwrap();
        let names: Vec<String> = stack.resources().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["logs", "assets"]);
        assert_eq!(mock.registered_names(), names);
    }

    #[test]
    fn failed_declarations_are_not_tracked() {
        let (_mock, stack) = stack(ConfigData::new());
        assert!(stack.create_resource("aws:s3:Bucket", "x", &Value::from(3), &Value::Null).is_err());
        assert!(stack.resources().is_empty());
    }

    #[test]
    fn program_errors_carry_context() {
        let (_mock, stack) = stack(ConfigData::new());
        let program = |stack: &Stack| -> Result<Value> {
            let port = stack.get_config("port", ConfigType::Number, Fallback::Required)?;
            Ok(Value::map([("port", port)]))
        };
        let err = run(&stack, &program).unwrap_err();
        assert_eq!(err.to_string(), "program failed");
        assert!(format!("{:#}", err).contains("shop:port"), "err={:#}", err);
    }
}
