use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use gpuwatch::*;
use tracing::{info, warn};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Samples local GPUs and writes straight to the local store, without a receiver.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Host name; selects gpu_info_<name>.db and gpu_history_<name>.db.
    #[arg(long, default_value = "virgo")]
    name: String,
    /// Store fixed readings instead of polling NVML.
    #[arg(long, action = ArgAction::SetTrue)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    let args = Args::parse();
    let app_config = config::AppConfig::load()?;

    let source: Box<dyn sampler::GpuSource> = if args.mock {
        Box::new(sampler::StaticSource::mock())
    } else {
        sampler::default_source()?
    };
    let sampler = sampler::Sampler::new(source);
    let store = bootstrap::open_store(&app_config, &args.name).await?;
    let (mut ingestor, mut vacuum_rx) = bootstrap::ingestor(store, &app_config.rollup);

    let mut ticker = tokio::time::interval(Duration::from_millis(app_config.sampler.interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(host = %args.name, "logging local GPUs");

    let shutdown = bootstrap::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sampler.poll().await {
                    Ok(gpus) => {
                        ingestor.ingest(&gpus, chrono::Utc::now()).await;
                    }
                    Err(e) => warn!(error = %e, "sampler poll failed"),
                }
            }
            Some(()) = async {
                match vacuum_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                retention::run_scheduled_vacuum(ingestor.store()).await;
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}
