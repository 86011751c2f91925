use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use homelab_monitoring::{
    actors::CollectorContext,
    config::{Config, read_config_file},
    discovery::DiscoverySync,
    executor::{RemoteExecutor, SshExecutor},
    scheduler::SchedulerCoordinator,
    storage::{self, StorageBackend},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Long enough for an SSH call to reach its own timeout
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log at trace level instead of debug
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    dotenv::dotenv().ok();

    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::DEBUG
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("homelab_monitoring", level),
        ("homelab_hub", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let storage_config = config.storage.clone().unwrap_or_default();

    let storage = storage::open(&storage_config)
        .await
        .context("failed to open storage")?;
    match storage.health_check().await {
        Ok(health) if health.healthy => debug!("storage ready: {}", health.message),
        Ok(health) => warn!("storage unhealthy: {}", health.message),
        Err(e) => warn!("storage health check failed: {e}"),
    }

    seed_nodes(&config, storage.as_ref()).await?;

    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(config.ssh.clone()));
    let ctx = CollectorContext::new(Arc::clone(&storage), Arc::clone(&executor), config.scheduler.clone());
    let discovery = DiscoverySync::new(Arc::clone(&storage), executor, config.discovery.clone());
    let coordinator = SchedulerCoordinator::new(ctx, discovery, storage_config.retention());

    coordinator.start_all().await?;
    info!("hub running, press ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    info!("shutting down");
    coordinator.stop_all().await;
    if !coordinator.wait_for_jobs(SHUTDOWN_GRACE).await {
        warn!("jobs still running after {SHUTDOWN_GRACE:?}, exiting anyway");
    }
    storage.close().await?;

    Ok(())
}

/// Create or update the nodes listed in the config file
async fn seed_nodes(config: &Config, storage: &dyn StorageBackend) -> anyhow::Result<()> {
    for node in &config.nodes {
        let stored = storage
            .upsert_node(node.to_new_node())
            .await
            .with_context(|| format!("failed to store node {}", node.name))?;
        debug!("seeded node {} ({})", stored.name, stored.id);
    }
    Ok(())
}
