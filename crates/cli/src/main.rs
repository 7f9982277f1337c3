use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{
    run, snapshot, to_external, CompletionMode, ConfigData, ConfigKey, ConfigType, Engine, External, Fallback,
    MockEngine, RegisterRequest, SecretDisplay, Stack, StackSettings,
};
use serde_json::json;
use tracing::{error, info, warn};

mod demo;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel CLI: preview and apply the demo stack")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project name (default namespace for config keys)
    #[arg(long = "project", global = true, env = "KEEL_PROJECT")]
    project: Option<String>,

    /// Stack name
    #[arg(long = "stack", global = true, env = "KEEL_STACK")]
    stack: Option<String>,

    /// Config value, `ns:key=value` or `key=value` for the project namespace
    #[arg(long = "config", global = true, value_name = "KEY=VALUE")]
    config: Vec<String>,

    /// Secret config value, same form as --config
    #[arg(long = "secret", global = true, value_name = "KEY=VALUE")]
    secret: Vec<String>,

    /// Print secret values instead of masking them
    #[arg(long = "show-secrets", global = true, action = ArgAction::SetTrue)]
    show_secrets: bool,

    /// Upper bound on waiting for the orchestrator
    #[arg(long = "timeout-ms", global = true, default_value_t = 5000)]
    timeout_ms: u64,

    /// Simulated per-resource provisioning latency
    #[arg(long = "latency-ms", global = true, default_value_t = 20)]
    latency_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Declare the demo stack without creating anything; ids stay unknown
    Preview,
    /// Declare and create the demo stack, then print its outputs
    Up,
    /// Inspect stack configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Read one key through the typed accessor
    Get {
        /// `ns:key`, or a bare key in the project namespace
        key: String,
        /// string | number | boolean | object | secret
        #[arg(long = "type", default_value = "string")]
        ty: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Split `ns:key=value`; a bare key lands in `project`.
fn parse_assignment(raw: &str, project: &str) -> Result<(ConfigKey, String)> {
    let (key, value) = raw.split_once('=').ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(anyhow!("empty config key in '{}'", raw));
    }
    Ok((ConfigKey::parse(key.trim(), project), value.to_string()))
}

fn load_config(cli: &Cli, project: &str) -> Result<ConfigData> {
    let mut data = ConfigData::from_env()?;
    for raw in &cli.config {
        let (key, value) = parse_assignment(raw, project).context("parsing --config")?;
        data.set(&key, value);
    }
    for raw in &cli.secret {
        let (key, value) = parse_assignment(raw, project).context("parsing --secret")?;
        data.set_secret(&key, value);
    }
    Ok(data)
}

fn settings(cli: &Cli) -> StackSettings {
    let env = StackSettings::from_env();
    StackSettings {
        project: cli.project.clone().filter(|s| !s.is_empty()).unwrap_or(env.project),
        stack: cli.stack.clone().filter(|s| !s.is_empty()).unwrap_or(env.stack),
        dry_run: env.dry_run,
    }
}

/// Wait until the mock has no delayed completions left, or `timeout`.
async fn drain(mock: &MockEngine, latency: Duration, timeout: Duration) -> bool {
    let started = Instant::now();
    let tick = (latency / 2).max(Duration::from_millis(1));
    while mock.in_flight() > 0 {
        if started.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(tick).await;
    }
    true
}

fn masked_request(req: &RegisterRequest, secrets: SecretDisplay) -> serde_json::Value {
    let mut out = serde_json::to_value(req).unwrap_or_default();
    if req.secret_inputs && secrets == SecretDisplay::Mask {
        out["inputs"] = json!("[secret]");
    }
    out
}

async fn deploy(cli: &Cli, preview: bool) -> Result<()> {
    let mut settings = settings(cli);
    settings.dry_run |= preview;
    let config = load_config(cli, &settings.project)?;
    let latency = Duration::from_millis(cli.latency_ms);
    let timeout = Duration::from_millis(cli.timeout_ms);
    let secrets = if cli.show_secrets { SecretDisplay::Show } else { SecretDisplay::Mask };

    let mock = Rc::new(
        MockEngine::new(settings.project.clone(), settings.stack.clone())
            .preview(settings.dry_run)
            .with_mode(CompletionMode::Delayed(latency)),
    );
    let engine: Rc<dyn Engine> = mock.clone();
    let stack = Stack::new(engine, Rc::new(config));
    info!(project = %settings.project, stack = %settings.stack, preview = settings.dry_run, "deploy invoked");

    let outputs = run(&stack, &demo::web_stack)?;
    let mut failure = None;
    if settings.dry_run {
        if !drain(&mock, latency, timeout).await {
            warn!(timeout_ms = cli.timeout_ms, "preview did not settle in time");
        }
    } else {
        match tokio::time::timeout(timeout, outputs.resolve().wait()).await {
            Ok(Ok(_)) => info!(resources = stack.resources().len(), "stack outputs resolved"),
            Ok(Err(e)) => {
                error!(error = %e, "deployment failed");
                failure = Some(e);
            }
            Err(_) => warn!(timeout_ms = cli.timeout_ms, "outputs not resolved in time"),
        }
    }

    let registered = mock.registered();
    match cli.output {
        Output::Human => print_human(&stack, &settings, &registered, &outputs, secrets)?,
        Output::Json => {
            let body = json!({
                "stack": settings,
                "resources": stack.summaries(),
                "requests": registered.iter().map(|r| masked_request(r, secrets)).collect::<Vec<_>>(),
                "outputs": snapshot(&outputs, secrets),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    match failure {
        Some(e) => Err(anyhow!(e).context("stack update failed")),
        None => Ok(()),
    }
}

fn print_human(
    stack: &Stack,
    settings: &StackSettings,
    registered: &[RegisterRequest],
    outputs: &External,
    secrets: SecretDisplay,
) -> Result<()> {
    let verb = if settings.dry_run { "Previewing" } else { "Updating" };
    println!("{} stack {}/{}", verb, settings.project, settings.stack);
    for summary in stack.summaries() {
        let req = registered.iter().find(|r| r.name == summary.name && r.type_token == summary.type_token);
        let status = match (req, summary.id.as_deref()) {
            (Some(_), Some(id)) => format!("created {}", id),
            (Some(_), None) if settings.dry_run => "would create".to_string(),
            (Some(_), None) => "creating".to_string(),
            (None, _) => "waiting on unknown inputs".to_string(),
        };
        println!("  + {} • {} • {}", summary.type_token, summary.name, status);
        if let Some(req) = req {
            if !req.dependencies.is_empty() {
                println!("      depends on {}", req.dependencies.join(", "));
            }
        }
    }
    println!("Outputs:");
    println!("{}", serde_json::to_string_pretty(&snapshot(outputs, secrets))?);
    Ok(())
}

fn config_get(cli: &Cli, key: &str, ty: &str) -> Result<()> {
    let settings = settings(cli);
    let ty = ConfigType::from_str(ty)?;
    let config = load_config(cli, &settings.project)?;
    let engine: Rc<dyn Engine> = Rc::new(MockEngine::new(settings.project.clone(), settings.stack.clone()));
    let stack = Stack::new(engine, Rc::new(config));
    let value = stack.get_config(key, ty, Fallback::Required)?;
    let qualified = ConfigKey::parse(key, &settings.project);
    let secrets = if cli.show_secrets { SecretDisplay::Show } else { SecretDisplay::Mask };
    let shown = snapshot(&to_external(&value), secrets);
    match cli.output {
        Output::Human => println!("{} = {}", qualified, shown),
        Output::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "key": qualified.to_string(), "type": ty.as_str(), "value": shown }))?
        ),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            match &cli.command {
                Commands::Preview => deploy(&cli, true).await,
                Commands::Up => deploy(&cli, false).await,
                Commands::Config { command: ConfigCommands::Get { key, ty } } => config_get(&cli, key, ty),
            }
        })
        .await
}
