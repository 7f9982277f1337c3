use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use keel_api::{
    bind, run, snapshot, stringify, ConfigData, ConfigType, CompletionMode, Engine, Fallback, MockEngine,
    ResourceDecl, ResourceOptions, SecretDisplay, Stack, Value,
};
use serde_json::json;

fn web_app(stack: &Stack) -> Result<Value> {
    let port = stack.get_config("port", ConfigType::Number, Fallback::value(8080))?;
    let password = stack.get_config("dbPassword", ConfigType::Secret, Fallback::Required)?;

    let network = stack.resource(ResourceDecl::new("cloud:net:Network", "vpc").input("cidr", "10.0.0.0/16"))?;
    let subnet = stack.resource(
        ResourceDecl::new("cloud:net:Subnet", "subnet-a")
            .input("networkId", network.id())
            .input("cidr", "10.0.1.0/24"),
    )?;
    let db = stack.resource(
        ResourceDecl::new("cloud:db:Instance", "db")
            .input("subnetId", subnet.id())
            .input("password", password)
            .options(ResourceOptions::new().additional_secret_outputs(["password"])),
    )?;
    let host = db.output("subnetId").map(|v| v.as_str().unwrap_or_default().to_string());
    let endpoint = stringify([host.into(), keel_api::Part::from(":5432")]);
    let label = bind!(name = network.urn(), cidr = subnet.output("cidr") => {
        format!("{} ({})", name, cidr.as_str().unwrap_or("?"))
    });

    Ok(Value::map([
        ("network", Value::from(&network)),
        ("db", Value::from(&db)),
        ("endpoint", Value::from(endpoint)),
        ("label", Value::from(label)),
        ("port", port),
    ]))
}

fn config() -> Rc<ConfigData> {
    Rc::new(ConfigData::new().with_secret("shop:dbPassword", "s3cr3t"))
}

#[test]
fn up_resolves_every_output_and_reduces_resources_to_identity() {
    let mock = Rc::new(
        MockEngine::new("shop", "prod").with_id("vpc", "vpc-1").with_id("subnet-a", "subnet-1").with_id("db", "db-1"),
    );
    let engine: Rc<dyn Engine> = mock.clone();
    let stack = Stack::new(engine, config());

    let outputs = run(&stack, &web_app).unwrap();
    assert_eq!(mock.registered_names(), vec!["vpc", "subnet-a", "db"]);

    let resolved = outputs.resolve();
    assert!(resolved.is_secret(), "endpoint derives from secret db outputs");
    let json = resolved.peek().unwrap().unwrap();
    assert_eq!(json["network"], json!({ "urn": "urn:keel:prod::shop::cloud:net:Network::vpc", "id": "vpc-1" }));
    assert_eq!(json["db"]["id"], "db-1");
    assert_eq!(json["endpoint"], "subnet-1:5432");
    assert_eq!(json["label"], "urn:keel:prod::shop::cloud:net:Network::vpc (10.0.1.0/24)");
    assert_eq!(json["port"], 8080);

    let db_request = &mock.registered()[2];
    assert!(db_request.secret_inputs);
    assert_eq!(db_request.inputs["subnetId"], "subnet-1");
    assert_eq!(stack.summaries().len(), 3);
}

#[test]
fn preview_leaves_ids_unknown_and_stops_at_the_first_id_dependency() {
    let mock = Rc::new(MockEngine::new("shop", "dev").preview(true));
    let engine: Rc<dyn Engine> = mock.clone();
    let stack = Stack::new(engine, config());

    let outputs = run(&stack, &web_app).unwrap();
    assert!(stack.is_dry_run());
    assert_eq!(mock.registered_names(), vec!["vpc"]);
    assert_eq!(mock.declared_count(), 3);

    let view = snapshot(&outputs, SecretDisplay::Mask);
    assert_eq!(view["network"]["urn"], "urn:keel:dev::shop::cloud:net:Network::vpc");
    assert_eq!(view["network"]["id"], "<unknown>");
    assert_eq!(view["db"]["urn"], "<unknown>");
    assert_eq!(view["port"], 8080);
    assert!(!outputs.resolve().is_resolved());
}

#[test]
fn missing_required_secret_aborts_before_any_declaration() {
    let mock = Rc::new(MockEngine::new("shop", "dev"));
    let engine: Rc<dyn Engine> = mock.clone();
    let stack = Stack::new(engine, Rc::new(ConfigData::new()));

    let err = run(&stack, &web_app).unwrap_err();
    assert!(format!("{:#}", err).contains("'shop:dbPassword'"), "err={:#}", err);
    assert_eq!(mock.declared_count(), 0);
}

#[test]
fn upstream_failure_surfaces_in_the_output_snapshot() {
    let mock = Rc::new(MockEngine::new("shop", "dev").fail_on("subnet-a", "no capacity"));
    let engine: Rc<dyn Engine> = mock.clone();
    let stack = Stack::new(engine, config());

    let outputs = run(&stack, &web_app).unwrap();
    assert_eq!(mock.registered_names(), vec!["vpc", "subnet-a"]);
    let view = snapshot(&outputs, SecretDisplay::Show);
    assert_eq!(view["db"]["id"], "<failed: no capacity>");
    assert!(outputs.resolve().is_failed());
}

#[tokio::test]
async fn delayed_engine_outputs_arrive_on_the_local_set() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mock = Rc::new(
                MockEngine::new("shop", "dev")
                    .with_mode(CompletionMode::Delayed(Duration::from_millis(2)))
                    .with_id("vpc", "vpc-9"),
            );
            let engine: Rc<dyn Engine> = mock.clone();
            let stack = Stack::new(engine, config());
            let outputs = run(&stack, &web_app).unwrap();
            // only the root resource is ready before the event loop runs
            assert_eq!(mock.registered_names(), vec!["vpc"]);

            let json = tokio::time::timeout(Duration::from_secs(5), outputs.resolve().wait())
                .await
                .expect("outputs resolve in time")
                .unwrap();
            assert_eq!(json["network"]["id"], "vpc-9");
            assert_eq!(mock.registered_names(), vec!["vpc", "subnet-a", "db"]);
        })
        .await;
}
