//! Keel resource: construction facade over an orchestrator [`Engine`].
//!
//! `register` returns a handle immediately. The engine only sees the
//! registration once every deferred input and every prerequisite (parent,
//! provider, `dependsOn`) has resolved, so resources derived from another
//! resource's outputs are always created after it.

#![forbid(unsafe_code)]

use std::rc::Rc;

use keel_core::{
    bind, from_json, join, stringify, to_external, Composite, DeferredValue, Key, KeelError, KeelResult, Map, Part,
    ResourceHandle, ResourceOptions, ResourceParts, Shape, Value,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

pub mod engine;
pub mod mock;

pub use engine::{Engine, OutputResolvers, RegisterRequest};
pub use mock::{CompletionMode, MockEngine};

/// Typed resource declaration. The logical name defaults to the short
/// identifier's external form; inputs and options default to empty.
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    type_token: String,
    short_id: Key,
    name: Option<String>,
    inputs: Map,
    options: ResourceOptions,
}

impl ResourceDecl {
    pub fn new(type_token: impl Into<String>, short_id: impl Into<Key>) -> Self {
        Self {
            type_token: type_token.into(),
            short_id: short_id.into(),
            name: None,
            inputs: Map::new(),
            options: ResourceOptions::default(),
        }
    }

    /// Override the derived logical name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn inputs(mut self, inputs: Map) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn type_token(&self) -> &str {
        &self.type_token
    }

    pub fn logical_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.short_id.external())
    }
}

/// Dynamic form: `inputs` and `options` must be mappings (`Null` means
/// omitted). Non-mappings fail before anything reaches the engine.
pub fn create_resource(
    engine: &Rc<dyn Engine>,
    type_token: &str,
    name: &str,
    inputs: &Value,
    options: &Value,
) -> KeelResult<ResourceHandle> {
    let inputs = expect_mapping("resource inputs", inputs)?;
    let options = ResourceOptions::from_value(options)?;
    register(engine, ResourceDecl::new(type_token, name).inputs(inputs).options(options))
}

pub fn register(engine: &Rc<dyn Engine>, decl: ResourceDecl) -> KeelResult<ResourceHandle> {
    let name = decl.logical_name();
    let ResourceDecl { type_token, inputs, options, .. } = decl;
    if type_token.trim().is_empty() {
        return Err(KeelError::InvalidResource("type token must not be empty".into()));
    }
    if name.trim().is_empty() {
        return Err(KeelError::InvalidResource(format!("logical name for {} must not be empty", type_token)));
    }
    if !type_token.contains(':') {
        warn!(type_token = %type_token, "type token is not provider-qualified");
    }
    engine.declare(&type_token, &name)?;
    counter!("resource_declared_total", 1u64);

    let (urn, urn_resolver) = DeferredValue::pending();
    let (id, id_resolver) = DeferredValue::pending();
    let (raw_outputs, outputs_resolver) = DeferredValue::<Json>::pending();
    let outputs = raw_outputs.map(|json| match from_json(&json) {
        Value::Map(m) => m,
        _ => Map::new(),
    });
    let resolvers = OutputResolvers { urn: urn_resolver, id: id_resolver, outputs: outputs_resolver };

    let request = prepare(&type_token, &name, &inputs, &options);
    let handle = ResourceHandle::from_parts(ResourceParts { type_token, name, inputs, options, urn, id, outputs });
    debug!(type_token = %handle.type_token(), name = %handle.name(), "resource declared");

    let engine = Rc::clone(engine);
    request.subscribe(move |outcome| match outcome {
        Ok(resolved) => {
            counter!("resource_registered_total", 1u64);
            engine.register(resolved.value.clone(), resolvers);
        }
        Err(failure) => {
            counter!("resource_rejected_total", 1u64);
            warn!(error = %failure, "upstream failure; resource will not be registered");
            resolvers.reject(failure.clone());
        }
    });
    Ok(handle)
}

/// A request that resolves once inputs and prerequisites do.
fn prepare(type_token: &str, name: &str, inputs: &Map, options: &ResourceOptions) -> DeferredValue<RegisterRequest> {
    // carry the secret tag into the request explicitly
    let inputs_json = to_external(&Value::Map(inputs.clone())).resolve().redact_with(|json, secret| (json, secret));

    let parent = match &options.parent {
        Some(p) => p.urn().map(Some),
        None => DeferredValue::known(None),
    };
    let provider = match &options.provider {
        Some(p) => stringify([Part::from(p.urn()), Part::from("::"), Part::from(p.id())]).map(Some),
        None => DeferredValue::known(None),
    };

    let mut deps = options.depends_on.clone();
    for r in referenced_resources(inputs) {
        if !deps.iter().any(|d| d.ptr_eq(&r)) {
            deps.push(r);
        }
    }
    let deps = join(deps.iter().map(ResourceHandle::urn));

    let type_token = type_token.to_string();
    let name = name.to_string();
    let opts = options.clone();
    bind!(inputs = inputs_json, parent = parent, provider = provider, deps = deps => RegisterRequest {
        type_token,
        name,
        inputs: inputs.0,
        secret_inputs: inputs.1,
        parent,
        provider,
        dependencies: deps,
        protect: opts.protect,
        ignore_changes: opts.ignore_changes,
        delete_before_replace: opts.delete_before_replace,
        retain_on_delete: opts.retain_on_delete,
        additional_secret_outputs: opts.additional_secret_outputs,
    })
}

/// Resources referenced directly in an input tree. Deferred values are not
/// entered; their dependencies are carried by the deferred value itself.
fn referenced_resources(inputs: &Map) -> Vec<ResourceHandle> {
    fn walk(v: &Value, out: &mut Vec<ResourceHandle>) {
        match v.shape() {
            Shape::ResourceRef(r) => {
                if !out.iter().any(|o| o.ptr_eq(r)) {
                    out.push(r.clone());
                }
            }
            Shape::Composite(Composite::List(items)) => items.iter().for_each(|i| walk(i, out)),
            Shape::Composite(Composite::Map(map)) => map.values().for_each(|i| walk(i, out)),
            Shape::Scalar(_) | Shape::DeferredRef(_) => {}
        }
    }
    let mut out = Vec::new();
    inputs.values().for_each(|v| walk(v, &mut out));
    out
}

fn expect_mapping(what: &str, v: &Value) -> KeelResult<Map> {
    match v {
        Value::Null => Ok(Map::new()),
        Value::Map(m) => Ok(m.clone()),
        other => Err(KeelError::ConfigValidation { what: what.into(), found: other.kind_name().into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResolutionFailure;
    use serde_json::json;

    fn engine(mode: CompletionMode) -> (Rc<MockEngine>, Rc<dyn Engine>) {
        let mock = Rc::new(MockEngine::new("shop", "dev").with_mode(mode));
        let dyn_engine: Rc<dyn Engine> = mock.clone();
        (mock, dyn_engine)
    }

    #[test]
    fn non_mapping_inputs_fail_before_the_engine_is_called() {
        let (mock, eng) = engine(CompletionMode::Immediate);
        let err = create_resource(&eng, "aws:s3.Bucket", "logs", &Value::from("acl=private"), &Value::Null).unwrap_err();
        assert_eq!(
            err,
            KeelError::ConfigValidation { what: "resource inputs".into(), found: "string".into() }
        );
        assert_eq!(mock.declared_count(), 0);
        assert!(mock.registered().is_empty());
    }

    #[test]
    fn empty_type_or_name_is_rejected() {
        let (_mock, eng) = engine(CompletionMode::Immediate);
        assert!(matches!(register(&eng, ResourceDecl::new("", "x")), Err(KeelError::InvalidResource(_))));
        assert!(matches!(register(&eng, ResourceDecl::new("aws:s3.Bucket", "")), Err(KeelError::InvalidResource(_))));
    }

    #[test]
    fn duplicate_declarations_fail() {
        let (_mock, eng) = engine(CompletionMode::Immediate);
        register(&eng, ResourceDecl::new("aws:s3.Bucket", "logs")).unwrap();
        let err = register(&eng, ResourceDecl::new("aws:s3.Bucket", "logs")).unwrap_err();
        assert!(matches!(err, KeelError::DuplicateResource { .. }), "err={:?}", err);
    }

    #[test]
    fn logical_name_defaults_to_short_identifier() {
        let decl = ResourceDecl::new("aws:s3.Bucket", Key::namespaced("site", "assets"));
        assert_eq!(decl.logical_name(), "site/assets");
        assert_eq!(decl.named("assets-bucket").logical_name(), "assets-bucket");
    }

    #[test]
    fn handle_returns_before_registration_completes() {
        let (mock, eng) = engine(CompletionMode::Manual);
        let bucket = register(&eng, ResourceDecl::new("aws:s3.Bucket", "logs").input("acl", "private")).unwrap();
        assert_eq!(bucket.urn().peek(), None);
        assert_eq!(mock.pending(), 1);
        mock.complete_all();
        assert_eq!(bucket.urn().peek(), Some(Ok("urn:keel:dev::shop::aws:s3.Bucket::logs".to_string())));
        assert!(bucket.id().is_resolved());
        assert_eq!(bucket.output("acl").peek(), Some(Ok(Value::from("private"))));
    }

    #[test]
    fn dependents_register_only_after_upstream_completes() {
        let (mock, eng) = engine(CompletionMode::Manual);
        let network = register(&eng, ResourceDecl::new("cloud:net.Network", "vpc")).unwrap();
        let subnet = register(
            &eng,
            ResourceDecl::new("cloud:net.Subnet", "subnet-a").input("networkId", network.id()),
        )
        .unwrap();
        let firewall = register(
            &eng,
            ResourceDecl::new("cloud:net.Firewall", "fw").options(ResourceOptions::new().depends_on(&subnet)),
        )
        .unwrap();

        assert_eq!(mock.registered_names(), vec!["vpc"]);
        assert!(mock.complete_next());
        assert_eq!(mock.registered_names(), vec!["vpc", "subnet-a"]);
        assert!(mock.complete_next());
        assert_eq!(mock.registered_names(), vec!["vpc", "subnet-a", "fw"]);
        mock.complete_all();

        let reqs = mock.registered();
        let network_id = network.id().peek().unwrap().unwrap();
        assert_eq!(reqs[1].inputs, json!({ "networkId": network_id }));
        assert_eq!(reqs[2].dependencies, vec![subnet.urn().peek().unwrap().unwrap()]);
        assert!(firewall.id().is_resolved());
    }

    #[test]
    fn resource_references_in_inputs_become_dependencies() {
        let (mock, eng) = engine(CompletionMode::Immediate);
        let role = register(&eng, ResourceDecl::new("aws:iam.Role", "role")).unwrap();
        register(&eng, ResourceDecl::new("aws:lambda.Function", "fn").input("role", &role)).unwrap();
        let req = &mock.registered()[1];
        let urn = role.urn().peek().unwrap().unwrap();
        assert_eq!(req.dependencies, vec![urn.clone()]);
        assert_eq!(req.inputs["role"]["urn"], json!(urn));
    }

    #[test]
    fn parent_and_provider_are_rendered_into_the_request() {
        let (mock, eng) = engine(CompletionMode::Immediate);
        let provider = register(&eng, ResourceDecl::new("keel:providers:aws", "east")).unwrap();
        let group = register(&eng, ResourceDecl::new("app:index:Group", "web")).unwrap();
        let child = register(
            &eng,
            ResourceDecl::new("aws:ec2.Instance", "web-1")
                .options(ResourceOptions::new().parent(&group).provider(&provider).protect(true)),
        )
        .unwrap();

        let req = &mock.registered()[2];
        let provider_ref = format!("{}::{}", provider.urn().peek().unwrap().unwrap(), provider.id().peek().unwrap().unwrap());
        assert_eq!(req.provider.as_deref(), Some(provider_ref.as_str()));
        assert_eq!(req.parent, group.urn().peek().unwrap().ok());
        assert!(req.protect);
        assert_eq!(
            child.urn().peek(),
            Some(Ok("urn:keel:dev::shop::app:index:Group$aws:ec2.Instance::web-1".to_string()))
        );
    }

    #[test]
    fn upstream_failure_rejects_dependents_without_registering_them() {
        let mock = Rc::new(MockEngine::new("shop", "dev").fail_on("db", "quota exceeded"));
        let eng: Rc<dyn Engine> = mock.clone();
        let db = register(&eng, ResourceDecl::new("aws:rds.Instance", "db")).unwrap();
        let app = register(&eng, ResourceDecl::new("aws:ecs.Service", "app").input("dbHost", db.output("address")))
            .unwrap();
        assert_eq!(db.urn().peek(), Some(Err(ResolutionFailure::new("quota exceeded"))));
        assert_eq!(app.id().peek(), Some(Err(ResolutionFailure::new("quota exceeded"))));
        assert_eq!(mock.registered_names(), vec!["db"]);
    }

    #[test]
    fn preview_resolves_urn_but_never_id() {
        let mock = Rc::new(MockEngine::new("shop", "dev").preview(true));
        let eng: Rc<dyn Engine> = mock.clone();
        let bucket = register(&eng, ResourceDecl::new("aws:s3.Bucket", "logs")).unwrap();
        let consumer = register(&eng, ResourceDecl::new("aws:s3.Policy", "policy").input("bucket", bucket.id())).unwrap();
        assert!(bucket.urn().is_resolved());
        assert!(!bucket.id().is_resolved() && !bucket.id().is_failed());
        assert!(!consumer.urn().is_resolved());
        assert_eq!(mock.registered_names(), vec!["logs"]);
    }

    #[test]
    fn secret_inputs_are_flagged_and_echoed_as_secret_outputs() {
        let (mock, eng) = engine(CompletionMode::Immediate);
        let db = register(
            &eng,
            ResourceDecl::new("aws:rds.Instance", "db").input("password", DeferredValue::secret("pw".to_string())),
        )
        .unwrap();
        assert!(mock.registered()[0].secret_inputs);
        assert!(db.output("password").is_secret());
    }

    #[tokio::test]
    async fn delayed_completion_runs_on_the_local_set() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mock = Rc::new(
                    MockEngine::new("shop", "dev")
                        .with_mode(CompletionMode::Delayed(std::time::Duration::from_millis(5)))
                        .with_id("logs", "bucket-1234"),
                );
                let eng: Rc<dyn Engine> = mock.clone();
                let bucket = register(&eng, ResourceDecl::new("aws:s3.Bucket", "logs")).unwrap();
                assert_eq!(bucket.id().peek(), None);
                assert_eq!(mock.in_flight(), 1);
                assert_eq!(bucket.id().wait().await, Ok("bucket-1234".to_string()));
                assert_eq!(mock.in_flight(), 0);
            })
            .await;
    }
}
