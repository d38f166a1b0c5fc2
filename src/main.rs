use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{error, info};

use dispatch::agent::{AgentInterval, UniformIntervals, UniversalShard};
use dispatch::classify::FailureClassifier;
use dispatch::engine::AcquisitionEngine;
use dispatch::scheduler::Scheduler;
use dispatch::settings::AppConfig;
use dispatch::store::MemoryAgentStore;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Application CLI arguments
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.verbose {
        println!("DEBUG {args:?}");
    }

    // Load configuration
    let cfg = AppConfig::load(args.config.as_deref())?;
    dispatch::trace::init(cfg.log.format)?;

    let (metrics_shutdown_tx, _) = broadcast::channel(1);
    let metrics = if cfg.metrics.enabled {
        let handle = dispatch::metrics::init()?;
        let addr: std::net::SocketAddr = cfg.metrics.addr.parse()?;
        let server_metrics = handle.clone();
        let server_shutdown = metrics_shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) =
                dispatch::metrics::run_metrics_server(addr, server_metrics, server_shutdown).await
            {
                error!(error = %err, "metrics server failed");
            }
        });
        Some(handle)
    } else {
        None
    };

    let cycle_interval = Duration::from_millis(cfg.scheduler.cycle_interval_ms);
    let intervals = UniformIntervals::new(AgentInterval::new(
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));
    let engine = AcquisitionEngine::new(
        Arc::new(MemoryAgentStore::new()),
        Arc::new(intervals),
        Arc::new(UniversalShard),
        FailureClassifier::default(),
        cfg.engine(),
        metrics,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = tokio::spawn(Scheduler::new(Arc::clone(&engine), cycle_interval).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(true);
    let _ = driver.await;
    let _ = metrics_shutdown_tx.send(());

    Ok(())
}
