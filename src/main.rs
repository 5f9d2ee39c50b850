//! uptrail - distributed uptime and latency checker agent.
//!
//! Probes the services assigned to this checker once per minute, keeps an
//! edge-triggered online/offline log with daily rollups, samples raw hosts
//! for smokeping-style latency history and sends alerts on state changes.

mod alert;
mod config;
mod db;
mod probe;
mod resolver;
mod scheduler;
mod smokeping;

use alert::{AlertTransport, LogTransport, WebhookTransport};
use config::CheckerConfig;
use db::{OverflowBuffer, Store};
use probe::{IcmpPinger, NetworkProber, Pinger, SessionPool, SESSION_POOL_SIZE};
use resolver::{ResolverManager, SystemDns, Targets};
use scheduler::{validate_checker, Scheduler};
use smokeping::{validate_ladder, Smokeping, DEFAULT_TIERS};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = CheckerConfig::load();
    tracing::info!("Starting uptrail as checker {}...", cfg.checker_id);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize databases
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let overflow = Arc::new(OverflowBuffer::new(&cfg.buffer_path)?);
    tracing::info!("Database initialized successfully");

    let checker = store.get_checker(cfg.checker_id).map_err(|e| {
        tracing::error!("Checker {} does not exist: {}", cfg.checker_id, e);
        e
    })?;
    validate_checker(&checker)?;
    validate_ladder(&DEFAULT_TIERS)?;

    let transport: Arc<dyn AlertTransport> = match &cfg.alert_webhook_url {
        Some(url) => Arc::new(WebhookTransport::new(url.clone())),
        None => {
            tracing::info!("No alert webhook configured, alerts are logged only");
            Arc::new(LogTransport)
        }
    };

    // One session pool for every echo this process sends
    let pinger: Arc<dyn Pinger> = Arc::new(IcmpPinger::new(SessionPool::new(SESSION_POOL_SIZE)));

    // Resolve once before the first round
    let targets = Arc::new(Targets::new());
    let resolver = Arc::new(ResolverManager::new(
        store.clone(),
        Arc::new(SystemDns::new()),
        targets.clone(),
        checker.id,
    ));
    match resolver.refresh().await {
        Ok(count) => tracing::info!("Resolved {} services", count),
        Err(e) => tracing::error!("Initial service resolution failed: {}", e),
    }
    resolver.start();

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        checker.clone(),
        targets.clone(),
        Arc::new(NetworkProber::new(pinger.clone())),
        transport,
    ));
    scheduler.start();

    let smokeping = Arc::new(Smokeping::new(
        checker.id,
        store,
        overflow.clone(),
        targets,
        pinger,
        DEFAULT_TIERS.to_vec(),
    ));
    smokeping.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    scheduler.stop();
    smokeping.stop();
    resolver.stop();

    // Last chance for buffered buckets
    if let Some(drained) = smokeping.drain() {
        tracing::info!("Drained {} buffered buckets on shutdown", drained);
    }
    match overflow.len() {
        Ok(0) => {}
        Ok(left) => tracing::warn!("{} buckets remain in the overflow buffer", left),
        Err(e) => tracing::error!("Cannot read overflow buffer: {}", e),
    }

    Ok(())
}
