use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};
use zrc_broker::{
    audit::{AuditLogger, FileAuditSink},
    config::LoggingConfig,
    harness::{run_demo_flow, LoopbackPlatform},
    pin::PinAuthority,
    store::{InMemoryDirectory, InMemorySessionStore},
    BrokerConfig, ProviderRegistry, SessionBroker, SessionHandleRegistry,
};

const DEMO_DEVICE: &str = "demo-device";
const DEMO_USER: &str = "demo-user";

#[derive(Parser)]
#[command(name = "zrc-brokerd")]
#[command(version, about = "ZRC Session Broker - session lifecycle and PIN gate")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report which backend provider would be selected
    Providers {
        /// Attach the loopback capture platform so the native provider can be built
        #[arg(long)]
        loopback: bool,
    },
    /// Run a PIN-gated session end to end against a loopback device
    Demo {
        /// Width of the synthetic screen
        #[arg(long, default_value_t = 64)]
        width: u32,
        /// Height of the synthetic screen
        #[arg(long, default_value_t = 48)]
        height: u32,
    },
    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let _log_guard = init_tracing(&config.logging, &level, args.json || config.logging.json)?;

    info!(provider = %config.provider.name, pin_length = config.pin.length, "starting zrc-brokerd");

    match args.command {
        Command::Providers { loopback } => report_providers(&config, loopback),
        Command::Demo { width, height } => run_demo(&config, width, height).await,
        Command::CheckConfig => print_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BrokerConfig> {
    let config = match path {
        Some(path) => {
            let mut config = BrokerConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env();
            config
        }
        None => BrokerConfig::load_from_env(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Console layer plus an optional daily-rolled file. The returned guard
/// flushes the file writer on drop.
fn init_tracing(
    logging: &LoggingConfig,
    level: &str,
    json: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let directives = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("zrc_broker={},zrc_brokerd={}", level, level)
    };
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter `{}`", directives))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    });

    let mut guard = None;
    if let Some(path) = &logging.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "zrc-brokerd.log".to_string());
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;

        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();
    Ok(guard)
}

fn provider_registry(config: &BrokerConfig, platform: Option<Arc<LoopbackPlatform>>) -> ProviderRegistry {
    let registry = ProviderRegistry::new(config.provider.clone());
    match platform {
        Some(platform) => registry.with_platform(platform),
        None => registry,
    }
}

fn report_providers(config: &BrokerConfig, loopback: bool) -> anyhow::Result<()> {
    let platform = loopback.then(|| Arc::new(LoopbackPlatform::new(64, 48)));
    let registry = provider_registry(config, platform);
    let provider = registry.create_provider();

    println!("requested: {}", registry.requested_kind());
    println!("active:    {} {}", provider.name(), provider.version());
    println!("preferred: {}", registry.is_preferred_provider_active());
    if !registry.is_preferred_provider_active() {
        warn!(active = registry.current_provider_name(), "preferred provider is not active");
    }
    Ok(())
}

async fn run_demo(config: &BrokerConfig, width: u32, height: u32) -> anyhow::Result<()> {
    let platform = Arc::new(LoopbackPlatform::new(width, height));
    let registry = provider_registry(config, Some(platform));
    let handles = Arc::new(SessionHandleRegistry::from_registry(&registry));

    let mut audit = AuditLogger::new(config.audit.emit_timeout());
    if let Some(path) = &config.audit.file {
        audit.add_sink(Arc::new(FileAuditSink::new(path)));
    }

    let pins = Arc::new(PinAuthority::in_memory(config.pin.clone()));
    let sweeper = pins.spawn_sweeper(config.pin.sweep_interval());

    let directory = InMemoryDirectory::new()
        .with_device(DEMO_DEVICE)
        .with_user(DEMO_USER);
    let broker = SessionBroker::new(
        Arc::new(InMemorySessionStore::new()),
        Arc::new(directory),
        pins,
        handles,
        Arc::new(audit),
    );

    let report = run_demo_flow(&broker, DEMO_USER, DEMO_DEVICE).await;
    broker.flush_audit().await;
    sweeper.abort();
    let report = report.context("demo flow failed")?;

    info!(session_id = %report.session_id, final_status = %report.final_status, "demo finished");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_config(config: &BrokerConfig) -> anyhow::Result<()> {
    let mut shown = config.clone();
    if !shown.provider.relay.api_key.is_empty() {
        shown.provider.relay.api_key = "<redacted>".to_string();
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}
