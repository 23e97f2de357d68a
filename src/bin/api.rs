use std::time::Duration;

use anyhow::Result;
use gpuwatch::*;
use tracing::info;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    let app_config = config::AppConfig::load()?;
    anyhow::ensure!(!app_config.hosts.is_empty(), "no [[hosts]] configured");

    let timeout = Duration::from_secs(app_config.api.query_timeout_secs);
    let mut hosts = Vec::with_capacity(app_config.hosts.len());
    for host in &app_config.hosts {
        let store = bootstrap::open_store_read_only(&app_config, &host.name).await?;
        hosts.push(routes::HostEntry {
            config: host.clone(),
            queries: query::QueryService::new(store, timeout, app_config.rollup.period_secs),
        });
    }

    let app = routes::app(hosts);
    let addr = format!("{}:{}", app_config.api.host, app_config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(bootstrap::shutdown_signal())
        .await?;
    Ok(())
}
