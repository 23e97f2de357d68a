// Process setup shared by the binaries: tracing, signals, store and ingestion wiring.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::{AppConfig, DatabaseConfig, RollupConfig};
use crate::ingest::{Ingestor, RollupSchedule};
use crate::retention::{self, Retention, VacuumPolicy};
use crate::store::{Store, StoreOptions};

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Received shutdown signal");
}

pub fn store_options(db: &DatabaseConfig) -> StoreOptions {
    StoreOptions {
        busy_timeout: Duration::from_secs(db.busy_timeout_secs),
        max_connections: db.max_pool_size,
    }
}

/// Open and initialize both database files of host `name`.
pub async fn open_store(config: &AppConfig, name: &str) -> anyhow::Result<Arc<Store>> {
    let store = Store::open(
        Path::new(&config.database.data_dir),
        name,
        &store_options(&config.database),
    )
    .await?;
    store.init().await?;
    Ok(Arc::new(store))
}

/// Open the existing database files of host `name` for queries only. Nothing is created or migrated.
pub async fn open_store_read_only(config: &AppConfig, name: &str) -> anyhow::Result<Arc<Store>> {
    let store = Store::open_read_only(
        Path::new(&config.database.data_dir),
        name,
        &store_options(&config.database),
    )
    .await?;
    Ok(Arc::new(store))
}

/// Build the ingestion state machine for `store`. With a VACUUM schedule configured, the
/// scheduler task is spawned and its channel is returned for the ingestion loop to drain.
pub fn ingestor(store: Arc<Store>, rollup: &RollupConfig) -> (Ingestor, Option<mpsc::Receiver<()>>) {
    let (policy, vacuum_rx) = match &rollup.vacuum_schedule {
        Some(schedule) => {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(retention::vacuum_scheduler(schedule.clone(), tx));
            (VacuumPolicy::Scheduled, Some(rx))
        }
        None => (VacuumPolicy::AfterPrune, None),
    };
    let ingestor = Ingestor::new(
        store,
        RollupSchedule::new(rollup.period_secs),
        Retention::new(rollup.raw_retention_secs, policy),
        rollup.period_secs,
    );
    (ingestor, vacuum_rx)
}
