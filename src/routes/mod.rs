// HTTP routes for the dashboard: one query service per configured host

mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};

use crate::config::HostConfig;
use crate::query::QueryService;

/// A configured host and the query service over its store.
#[derive(Clone)]
pub struct HostEntry {
    pub config: HostConfig,
    pub queries: QueryService,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) hosts: Arc<BTreeMap<String, HostEntry>>,
}

pub fn app(hosts: Vec<HostEntry>) -> Router {
    let hosts: BTreeMap<String, HostEntry> = hosts
        .into_iter()
        .map(|h| (h.config.name.clone(), h))
        .collect();
    let state = AppState {
        hosts: Arc::new(hosts),
    };
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/hosts", get(http::hosts_handler)) // GET /api/hosts
        .route("/api/{host}/bounds", get(http::bounds_handler))
        .route("/api/{host}/latest", get(http::latest_handler))
        .route("/api/{host}/realtime/devices", get(http::realtime_devices_handler))
        .route("/api/{host}/realtime/users", get(http::realtime_users_handler))
        .route("/api/{host}/history/devices", get(http::history_devices_handler))
        .route("/api/{host}/history/users", get(http::history_users_handler))
        .route("/api/{host}/history/averages", get(http::history_averages_handler))
        .route("/api/{host}/history/totals", get(http::history_totals_handler))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
