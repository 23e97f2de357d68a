use anyhow::Result;
use clap::Parser;
use gpuwatch::*;
use tracing::info;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Receives GPU telemetry frames from one sender and stores, rolls up and prunes them.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long)]
    ip: String,
    /// Port to listen on.
    #[arg(long)]
    port: u16,
    /// Host name; selects gpu_info_<name>.db and gpu_history_<name>.db.
    #[arg(long, default_value = "virgo")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    let args = Args::parse();

    let app_config = config::AppConfig::load()?;
    let store = bootstrap::open_store(&app_config, &args.name).await?;
    let (ingestor, vacuum_rx) = bootstrap::ingestor(store, &app_config.rollup);
    let receiver_config = receiver::ReceiverConfig::from_transport(&app_config.transport)?;

    let addr = format!("{}:{}", args.ip, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(host = %args.name, "Listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = receiver::Receiver::new(ingestor, receiver_config, vacuum_rx, shutdown_rx);
    let handle = tokio::spawn(server.run(listener));

    bootstrap::shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    handle.await??;
    Ok(())
}
