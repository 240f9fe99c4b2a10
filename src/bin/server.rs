use barter_exchange::{
    api::{self, AppState},
    config::{AppConfig, LoggingConfig},
    Database, ExchangeEngine, SubscriberHub,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "exchange-server")]
#[command(about = "Barter marketplace exchange service")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        AppConfig::default()
    };
    if let Some(database_url) = args.database_url {
        config.database.url = database_url;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    init_tracing(&config.logging);

    info!(database = config.get_database_url(), "Connecting to database");
    let database = Database::connect(&config.database).await?;
    let hub = Arc::new(SubscriberHub::new(config.notifications.channel_capacity));
    let engine = Arc::new(ExchangeEngine::new(database.clone(), hub.clone()));

    let app = api::router(AppState { engine, hub });

    let listener = TcpListener::bind(config.get_server_address()).await?;
    info!("Exchange service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    database.close().await;
    info!("Exchange service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_deref() {
        Some("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        Some("compact") => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
