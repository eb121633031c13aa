//! KratOs Reputation Daemon
//!
//! Runs the reputation engine as a standalone service: restores peer records
//! from RocksDB, serves the operator API and runs maintenance, snapshot and
//! health-check loops until Ctrl+C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use kratos_reputation::api::{self, ApiState};
use kratos_reputation::storage::{PeerStore, RocksStore, StorageHandle, StorageWriter};
use kratos_reputation::types::current_timestamp;
use kratos_reputation::{Metrics, RateLimiter, ReputationConfig, ReputationManager, ReputationMonitor};

/// KratOs peer reputation and DoS protection engine
#[derive(Parser, Debug)]
#[command(name = "kratos-reputation")]
#[command(author = "KratOs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Peer reputation scoring and DoS protection for KratOs nodes", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "reputation.toml")]
    config: PathBuf,

    /// Data directory for the peer store and snapshots
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// HTTP API port (overrides the config file)
    #[arg(long)]
    api_port: Option<u16>,

    /// Peer ids to whitelist in addition to the config file
    #[arg(long, value_delimiter = ',')]
    whitelist: Vec<String>,

    /// Disable automatic bans (scores and penalties are still tracked)
    #[arg(long)]
    no_auto_ban: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into())
        )
        .init();

    info!("🌐 KratOs Reputation Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if args.config.exists() {
        ReputationConfig::load(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        ReputationConfig::default()
    };

    // Override config with CLI args
    if let Some(port) = args.api_port {
        config = config.with_api_port(port);
    }
    if !args.whitelist.is_empty() {
        config = config.with_whitelist(args.whitelist.clone());
    }
    if args.no_auto_ban {
        config = config.with_auto_ban(false);
    }

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   API port: {}", config.api_port);
    info!("   Auto ban: {}", config.bans.auto_ban);
    info!("   Whitelisted peers: {}", config.whitelist.len());
    info!("   Maintenance interval: {}s", config.maintenance.interval_secs);
    info!("   Retention: {}s", config.maintenance.retention_secs);

    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());

    // Open peer store
    tokio::fs::create_dir_all(&args.data_dir).await?;
    let store_path = args.data_dir.join("reputation");
    let store: Arc<dyn PeerStore> = Arc::new(RocksStore::open(&store_path, config.storage.max_snapshots)?);
    info!("📦 Peer store opened at {:?}", store_path);

    let records = store.load_all()?;
    let (storage, writer_handle) = StorageWriter::spawn(store.clone(), &config.storage, metrics.clone());

    // Reputation manager
    let manager = Arc::new(
        ReputationManager::new(config.clone(), metrics.clone()).with_storage(storage.clone()),
    );
    manager.load_records(records);

    let monitor = Arc::new(ReputationMonitor::new(manager.clone(), config.monitor.clone(), metrics.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), manager.clone(), metrics.clone()));

    // Start all services concurrently
    let api_handle = tokio::spawn(api::run_api_server(
        config.api_port,
        Arc::new(ApiState {
            manager: manager.clone(),
            monitor: monitor.clone(),
            metrics: metrics.clone(),
        }),
    ));

    let maintenance_handle = tokio::spawn(run_maintenance(config.clone(), manager.clone(), storage.clone()));
    let snapshot_handle = tokio::spawn(run_snapshots(config.storage.snapshot_interval_secs, storage.clone()));
    let monitor_handle = tokio::spawn(monitor.clone().run());
    let limiter_handle = tokio::spawn(rate_limiter.clone().run_cleanup());

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
        result = maintenance_handle => {
            error!("Maintenance task exited: {:?}", result);
        }
        result = snapshot_handle => {
            error!("Snapshot task exited: {:?}", result);
        }
        result = monitor_handle => {
            error!("Health monitor exited: {:?}", result);
        }
        result = limiter_handle => {
            error!("Rate limiter cleanup exited: {:?}", result);
        }
        result = writer_handle => {
            error!("Storage writer exited: {:?}", result);
        }
    }

    // Graceful shutdown: drain the writer, then flush the store
    let timeout = Duration::from_secs(config.storage.shutdown_timeout_secs);
    if storage.shutdown(timeout).await {
        info!("📦 Pending peer records written");
    }
    store.flush()?;
    info!("📦 Peer store flushed to disk");

    info!("👋 KratOs Reputation Engine shutting down");
    Ok(())
}

/// Periodic decay, ban expiry and eviction
async fn run_maintenance(
    config: Arc<ReputationConfig>,
    manager: Arc<ReputationManager>,
    storage: StorageHandle,
) -> anyhow::Result<()> {
    let period = Duration::from_secs(config.maintenance.interval_secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        interval.tick().await;

        let now = current_timestamp();
        let report = manager.run_maintenance(now);
        storage.request_prune(config.maintenance.retention_secs, now);

        let stats = manager.stats_at(now);
        info!(
            "📊 Status: {} peers ({} connected, {} banned), avg score {:.1}, {} decayed",
            stats.total_peers,
            stats.connected_peers,
            stats.banned_peers,
            stats.average_score,
            report.decayed
        );
    }
}

/// Periodic store snapshots
async fn run_snapshots(interval_secs: u64, storage: StorageHandle) -> anyhow::Result<()> {
    let period = Duration::from_secs(interval_secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        interval.tick().await;
        if !storage.request_snapshot(current_timestamp()) {
            warn!("Snapshot request dropped, storage queue full");
        }
    }
}
