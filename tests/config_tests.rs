// Config loading and validation tests

use gpuwatch::config::{AppConfig, is_valid_host_name};

const VALID_CONFIG: &str = r#"
[database]
data_dir = "/var/lib/gpuwatch"
busy_timeout_secs = 5
max_pool_size = 4

[rollup]
period_secs = 30
raw_retention_secs = 3600
vacuum_schedule = "0 0 4 * * *"

[transport]
magic = 23333
client_utc_offset_hours = 8
read_buffer_bytes = 4096
max_frame_bytes = 4194304
reconnect_delay_ms = 1000

[sampler]
interval_ms = 1000

[api]
host = "0.0.0.0"
port = 8090
query_timeout_secs = 10

[[hosts]]
name = "virgo"
gpu_count = 8
memory_gib = 80

[[hosts]]
name = "leo"
gpu_count = 4
memory_gib = 48
"#;

#[test]
fn test_config_loads_from_str() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("load_from_str");
    assert_eq!(config.database.data_dir, "/var/lib/gpuwatch");
    assert_eq!(config.rollup.period_secs, 30);
    assert_eq!(config.rollup.vacuum_schedule.as_deref(), Some("0 0 4 * * *"));
    assert_eq!(config.transport.magic, 23333);
    assert_eq!(config.api.port, 8090);
    assert_eq!(config.hosts.len(), 2);
    assert_eq!(config.host("leo").map(|h| h.gpu_count), Some(4));
    assert!(config.host("orion").is_none());
}

#[test]
fn test_config_defaults_when_empty() {
    let config = AppConfig::load_from_str("").unwrap();
    assert_eq!(config.database.data_dir, "data");
    assert_eq!(config.rollup.period_secs, 30);
    assert_eq!(config.rollup.raw_retention_secs, 3600);
    assert!(config.rollup.vacuum_schedule.is_none());
    assert_eq!(config.transport.magic, 23333);
    assert_eq!(config.transport.client_utc_offset_hours, 8);
    assert_eq!(config.sampler.interval_ms, 1000);
    assert!(config.hosts.is_empty());
}

#[test]
fn test_config_validation_rejects_short_period() {
    let bad = VALID_CONFIG.replace("period_secs = 30", "period_secs = 1");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("rollup.period_secs"));
}

#[test]
fn test_config_validation_rejects_retention_below_period() {
    let bad = VALID_CONFIG.replace("raw_retention_secs = 3600", "raw_retention_secs = 10");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("rollup.raw_retention_secs"));
}

#[test]
fn test_config_validation_rejects_bad_cron() {
    let bad = VALID_CONFIG.replace("0 0 4 * * *", "every night");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("rollup.vacuum_schedule"));
}

#[test]
fn test_config_validation_rejects_small_frame_limit() {
    let bad = VALID_CONFIG.replace("max_frame_bytes = 4194304", "max_frame_bytes = 16");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("transport.max_frame_bytes"));
}

#[test]
fn test_config_validation_rejects_invalid_port() {
    let bad = VALID_CONFIG.replace("port = 8090", "port = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("api.port"));
}

#[test]
fn test_config_validation_rejects_path_like_host_name() {
    let bad = VALID_CONFIG.replace("name = \"leo\"", "name = \"../leo\"");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("hosts.name"));
}

#[test]
fn test_config_validation_rejects_zero_gpus() {
    let bad = VALID_CONFIG.replace("gpu_count = 4", "gpu_count = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("hosts.gpu_count"));
}

#[test]
fn test_host_names() {
    assert!(is_valid_host_name("virgo"));
    assert!(is_valid_host_name("node-01_a"));
    assert!(!is_valid_host_name(""));
    assert!(!is_valid_host_name("a.b"));
    assert!(!is_valid_host_name("a/b"));
}
