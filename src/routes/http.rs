// GET handlers: version, hosts, and per-host query endpoints

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;

use super::AppState;
use crate::config::HostConfig;
use crate::query::{QueryError, QueryService};
use crate::version::{NAME, VERSION};

/// Query range in Unix seconds (UTC).
#[derive(Debug, Deserialize)]
pub(super) struct Range {
    start: i64,
    end: i64,
}

pub(super) enum ApiError {
    UnknownHost(String),
    Query(QueryError),
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        ApiError::Query(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnknownHost(host) => (StatusCode::NOT_FOUND, format!("unknown host: {host}")),
            ApiError::Query(e @ QueryError::InvalidRange { .. }) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ApiError::Query(e @ QueryError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, e.to_string())
            }
            ApiError::Query(e) => {
                warn!(error = %e, "query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn queries<'a>(state: &'a AppState, host: &str) -> Result<&'a QueryService, ApiError> {
    state
        .hosts
        .get(host)
        .map(|h| &h.queries)
        .ok_or_else(|| ApiError::UnknownHost(host.to_string()))
}

/// GET /version — service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// GET /api/hosts — configured hosts with device count and memory capacity.
pub(super) async fn hosts_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hosts: Vec<&HostConfig> = state.hosts.values().map(|h| &h.config).collect();
    Json(hosts).into_response()
}

/// GET /api/{host}/bounds — `null` when the host has no history yet.
pub(super) async fn bounds_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(queries(&state, &host)?.bounds().await?))
}

pub(super) async fn latest_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(queries(&state, &host)?.latest_devices().await?))
}

pub(super) async fn realtime_devices_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(r): Query<Range>,
) -> Result<impl IntoResponse, ApiError> {
    let q = queries(&state, &host)?;
    Ok(Json(q.realtime_devices(r.start, r.end).await?))
}

pub(super) async fn realtime_users_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(r): Query<Range>,
) -> Result<impl IntoResponse, ApiError> {
    let q = queries(&state, &host)?;
    Ok(Json(q.realtime_users(r.start, r.end).await?))
}

pub(super) async fn history_devices_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(r): Query<Range>,
) -> Result<impl IntoResponse, ApiError> {
    let q = queries(&state, &host)?;
    Ok(Json(q.device_history(r.start, r.end).await?))
}

pub(super) async fn history_users_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(r): Query<Range>,
) -> Result<impl IntoResponse, ApiError> {
    let q = queries(&state, &host)?;
    Ok(Json(q.user_history(r.start, r.end).await?))
}

pub(super) async fn history_averages_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(r): Query<Range>,
) -> Result<impl IntoResponse, ApiError> {
    let q = queries(&state, &host)?;
    Ok(Json(q.device_averages(r.start, r.end).await?))
}

pub(super) async fn history_totals_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(r): Query<Range>,
) -> Result<impl IntoResponse, ApiError> {
    let q = queries(&state, &host)?;
    Ok(Json(q.user_totals(r.start, r.end).await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn query_errors_map_to_status_codes() {
        let status = |e: ApiError| e.into_response().status();
        assert_eq!(
            status(QueryError::Timeout(Duration::from_secs(1)).into()),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(QueryError::InvalidRange { start: 2, end: 1 }.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(QueryError::Store(anyhow::anyhow!("locked")).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(ApiError::UnknownHost("nope".into())),
            StatusCode::NOT_FOUND
        );
    }
}
