//! Built-in demo program: a network, a subnet inside it and a database
//! reachable through a derived endpoint.

use anyhow::{Context, Result};
use keel_api::{
    bind, stringify, ConfigType, DeferredValue, Fallback, Part, ResourceDecl, ResourceOptions, Stack, Value,
};

pub fn web_stack(stack: &Stack) -> Result<Value> {
    let port = stack.get_config("port", ConfigType::Number, Fallback::value(8080))?;
    let cidr = stack.get_config("cidr", ConfigType::String, Fallback::value("10.0.0.0/16"))?;
    let password = stack
        .get_config("dbPassword", ConfigType::Secret, Fallback::value("change-me"))
        .context("reading database password")?;

    let network = stack.resource(ResourceDecl::new("cloud:net:Network", "vpc").input("cidrBlock", cidr))?;
    let subnet = stack.resource(
        ResourceDecl::new("cloud:net:Subnet", "subnet-a")
            .input("networkId", network.id())
            .input("cidrBlock", "10.0.1.0/24"),
    )?;
    let db = stack.resource(
        ResourceDecl::new("cloud:db:Instance", "db")
            .input("subnetId", subnet.id())
            .input("engine", "postgres")
            .input("password", password)
            .options(ResourceOptions::new().additional_secret_outputs(["password"]).protect(true)),
    )?;

    let address = db.output("address").map(|v| v.as_str().unwrap_or("localhost").to_string());
    let db_port = db.output("port").map(|v| v.as_i64().unwrap_or(5432).to_string());
    let endpoint = stringify([Part::from(address), Part::from(":"), Part::from(db_port)]);
    let url = bind!(endpoint = endpoint.clone(), port = DeferredValue::known(port.clone()) => {
        format!("http://{}/?app_port={}", endpoint, port.as_i64().unwrap_or(8080))
    });

    Ok(Value::map([
        ("network", Value::from(&network)),
        ("subnetId", Value::from(subnet.id())),
        ("database", Value::from(&db)),
        ("endpoint", Value::from(endpoint)),
        ("url", Value::from(url)),
        ("appPort", port),
    ]))
}
