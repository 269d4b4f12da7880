//! Service entry point. Each subcommand runs one service; `all` runs
//! the whole platform in a single process for development.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use dalston::bus::{Bus, RedisBus};
use dalston::config::{
    BlobConfig, BusConfig, DatabaseConfig, GatewayConfig, RealtimeConfig, WebhookConfig,
};
use dalston::db::{Database, PgStore};
use dalston::gateway::{self, AppState, RateLimiter};
use dalston::objectstore::FsObjectStore;
use dalston::orchestrator::Orchestrator;
use dalston::realtime::SessionRouter;
use dalston::webhook::DeliveryWorker;

#[derive(Parser)]
#[command(name = "dalston", version, about = "Distributed speech-to-text platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Client-facing HTTP/WS gateway (plus the realtime health probe).
    Gateway,
    /// Pipeline orchestrator consuming bus events.
    Orchestrator,
    /// Webhook delivery worker.
    WebhookWorker,
    /// Everything in one process, for development.
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = shutdown_signal();

    match cli.command {
        Command::Gateway => run_gateway(shutdown).await,
        Command::Orchestrator => run_orchestrator(shutdown).await,
        Command::WebhookWorker => run_webhook_worker(shutdown).await,
        Command::All => run_all(shutdown).await,
    }
}

async fn connect() -> anyhow::Result<(Arc<dyn Database>, Arc<dyn Bus>)> {
    let db_config = DatabaseConfig::from_env();
    let bus_config = BusConfig::from_env();

    let store = PgStore::new(&db_config)
        .await
        .context("connecting to the durable store")?;
    store.run_migrations().await?;
    let bus = RedisBus::connect(&bus_config.url)
        .await
        .context("connecting to the bus")?;

    let db: Arc<dyn Database> = Arc::new(store);
    let bus: Arc<dyn Bus> = Arc::new(bus);
    Ok((db, bus))
}

fn gateway_state(db: Arc<dyn Database>, bus: Arc<dyn Bus>) -> AppState {
    let config = Arc::new(GatewayConfig::from_env());
    let router = Arc::new(SessionRouter::new(
        bus.clone(),
        db.clone(),
        RealtimeConfig::from_env(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
    AppState {
        db,
        bus,
        blobs: Arc::new(FsObjectStore::new(&BlobConfig::from_env())),
        router,
        config,
        rate_limiter,
    }
}

async fn run_gateway(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let (db, bus) = connect().await?;
    let state = gateway_state(db, bus);

    let probe_router = state.router.clone();
    let probe_shutdown = shutdown.clone();
    tokio::spawn(async move { probe_router.run_health_probe(probe_shutdown).await });

    gateway::serve(state, shutdown).await?;
    Ok(())
}

async fn run_orchestrator(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let (db, bus) = connect().await?;
    Orchestrator::new(db, bus).run(shutdown).await?;
    Ok(())
}

async fn run_webhook_worker(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let (db, _bus) = connect().await?;
    DeliveryWorker::new(db, WebhookConfig::from_env())
        .run(shutdown)
        .await;
    Ok(())
}

async fn run_all(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let (db, bus) = connect().await?;

    let orchestrator = Orchestrator::new(db.clone(), bus.clone());
    let orchestrator_shutdown = shutdown.clone();
    let orchestrator_handle = tokio::spawn(async move {
        if let Err(e) = orchestrator.run(orchestrator_shutdown).await {
            tracing::error!("Orchestrator exited: {}", e);
        }
    });

    let deliveries = DeliveryWorker::new(db.clone(), WebhookConfig::from_env());
    let delivery_shutdown = shutdown.clone();
    let delivery_handle =
        tokio::spawn(async move { deliveries.run(delivery_shutdown).await });

    let state = gateway_state(db, bus);
    let probe_router = state.router.clone();
    let probe_shutdown = shutdown.clone();
    let probe_handle =
        tokio::spawn(async move { probe_router.run_health_probe(probe_shutdown).await });

    gateway::serve(state, shutdown).await?;

    let _ = tokio::join!(orchestrator_handle, delivery_handle, probe_handle);
    Ok(())
}

/// Flip a watch channel on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });
    rx
}
