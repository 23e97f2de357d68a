use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use gpuwatch::*;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Samples local GPUs once per interval and ships each poll to a receiver.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Receiver address.
    #[arg(long)]
    server_ip: String,
    /// Receiver port.
    #[arg(long)]
    server_port: u16,
    /// Send fixed readings instead of polling NVML.
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

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(sender::run(
        sampler,
        sender::SenderConfig {
            server: format!("{}:{}", args.server_ip, args.server_port),
            magic: app_config.transport.magic,
            interval: Duration::from_millis(app_config.sampler.interval_ms),
            reconnect_delay: Duration::from_millis(app_config.transport.reconnect_delay_ms),
        },
        shutdown_rx,
    ));

    bootstrap::shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}
