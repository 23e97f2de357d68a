// HTTP surface tests

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::*;
use gpuwatch::config::{AppConfig, HostConfig};
use gpuwatch::query::QueryService;
use gpuwatch::routes::{self, HostEntry};
use tempfile::TempDir;

const TEST_CONFIG: &str = r#"
[api]
host = "127.0.0.1"
port = 8091

[[hosts]]
name = "test"
gpu_count = 2
memory_gib = 80
"#;

async fn test_server() -> (TempDir, TestServer) {
    let config = AppConfig::load_from_str(TEST_CONFIG).unwrap();
    let (dir, store) = temp_store().await;
    for k in 1..=4 {
        let ts = MAY_2024 + k * 30;
        store
            .save_rollup(
                &[device_history(0, ts, 50.0, 4.0 * GIB as f64)],
                &[user_history(0, "alice", ts, 50.0, 4.0 * GIB as f64)],
            )
            .await
            .unwrap();
    }
    store
        .insert_samples(&[device_sample(0, 42, GIB, MAY_2024)], &[])
        .await
        .unwrap();

    let host: HostConfig = config.host("test").unwrap().clone();
    let app = routes::app(vec![HostEntry {
        config: host,
        queries: QueryService::new(store, Duration::from_secs(5), config.rollup.period_secs),
    }]);
    (dir, TestServer::new(app))
}

#[tokio::test]
async fn test_version_endpoint() {
    let (_dir, server) = test_server().await;
    let response = server.get("/version").await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(json.get("name").and_then(|v| v.as_str()), Some("gpuwatch"));
    assert!(json.get("version").and_then(|v| v.as_str()).is_some());
}

#[tokio::test]
async fn test_hosts_lists_configured_capacity() {
    let (_dir, server) = test_server().await;
    let json: serde_json::Value = server.get("/api/hosts").await.json();
    assert_eq!(json[0]["name"], "test");
    assert_eq!(json[0]["gpu_count"], 2);
    assert_eq!(json[0]["memory_gib"], 80);
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let (_dir, server) = test_server().await;
    let response = server.get("/api/nope/bounds").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let json: serde_json::Value = response.json();
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_history_devices_in_gib() {
    let (_dir, server) = test_server().await;
    let url = format!(
        "/api/test/history/devices?start={}&end={}",
        MAY_2024,
        MAY_2024 + 3600
    );
    let response = server.get(&url).await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(json["intervalSecs"], 30);
    let points = json["points"].as_array().unwrap();
    assert_eq!(points.len(), 4);
    assert_eq!(points[0]["usedMemoryGib"], 4.0);
    assert_eq!(points[0]["gpuUtilization"], 50.0);
}

#[tokio::test]
async fn test_history_users_has_axis_and_series() {
    let (_dir, server) = test_server().await;
    let url = format!(
        "/api/test/history/users?start={}&end={}",
        MAY_2024,
        MAY_2024 + 3600
    );
    let json: serde_json::Value = server.get(&url).await.json();
    assert_eq!(json["axis"].as_array().unwrap().len(), 4);
    assert_eq!(json["series"][0]["user"], "alice");
    assert_eq!(json["series"][0]["points"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_empty_range_is_200_with_empty_arrays() {
    let (_dir, server) = test_server().await;
    let response = server
        .get("/api/test/history/totals?start=946684800&end=946771200")
        .await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(json, serde_json::json!([]));
}

#[tokio::test]
async fn test_reversed_range_is_400() {
    let (_dir, server) = test_server().await;
    let response = server
        .get("/api/test/history/devices?start=200&end=100")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bounds_and_latest() {
    let (_dir, server) = test_server().await;
    let bounds: serde_json::Value = server.get("/api/test/bounds").await.json();
    assert_eq!(bounds["start"], MAY_2024 + 30);
    assert_eq!(bounds["end"], MAY_2024 + 120);

    let latest: serde_json::Value = server.get("/api/test/latest").await.json();
    assert_eq!(latest[0]["gpuUtilization"], 42);
    assert_eq!(latest[0]["usedMemory"], GIB);
}

#[tokio::test]
async fn test_range_overflowing_i64_is_400() {
    let (_dir, server) = test_server().await;
    let response = server
        .get("/api/test/realtime/devices?start=-9223372036854775808&end=0")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}
