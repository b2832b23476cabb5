use anyhow::Context;
use clap::{Parser, Subcommand};
use reliable_messaging::{
    messaging::{envelope_handler_fn, init_messaging_metrics, resolve_transport_mode, validate_transport_config},
    retry::RetryPolicy,
    AppConfig, MessagingService,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "reliable-messaging")]
#[command(about = "Messaging reliability layer: transport resolution, retries and dead letters", long_about = None)]
struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, env = "RELIABLE_MESSAGING_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the transport and validate configuration without connecting
    Check,

    /// Connect, provision infrastructure and log messages from the default topic until Ctrl+C
    Run {
        /// Subscription name for the logging consumer
        #[arg(short, long)]
        subscription: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config);
    init_messaging_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting reliable-messaging"
    );

    match cli.command {
        Commands::Check => check(&config),
        Commands::Run { subscription } => run(config, subscription).await,
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let json = config.observability.json_logs;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn check(config: &AppConfig) -> anyhow::Result<()> {
    let resolution = resolve_transport_mode(config.messaging.enabled, &config.environment);
    let warnings = validate_transport_config(&config.messaging, &config.environment)
        .context("messaging configuration rejected")?;
    let self_check = RetryPolicy::new(config.dead_letter.clone()).self_check();

    let report = serde_json::json!({
        "environment": config.environment.to_string(),
        "enabled": config.messaging.enabled,
        "transport": resolution.mode.as_str(),
        "gap": resolution.gap,
        "warnings": warnings,
        "retry_policy": self_check,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(config: AppConfig, subscription: Option<String>) -> anyhow::Result<()> {
    let service = MessagingService::new(config).await.context("failed to start messaging")?;
    service.ensure_infrastructure().await?;
    service.validate_configuration();

    let handler = envelope_handler_fn(|envelope| async move {
        tracing::info!(
            message_id = %envelope.message_id,
            payload_type = %envelope.payload_type,
            source = %envelope.source,
            "Message received"
        );
        Ok(())
    });
    let handle = service.subscribe(handler, subscription.as_deref()).await?;

    tracing::info!(
        transport = %service.transport_mode(),
        subscription = %handle.name(),
        "Consuming, press Ctrl+C to stop"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    handle.shutdown().await?;
    service.close().await?;
    Ok(())
}
