use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub rollup: RollupConfig,
    pub transport: TransportConfig,
    pub sampler: SamplerConfig,
    pub api: ApiConfig,
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding `gpu_info_<name>.db` and `gpu_history_<name>.db`.
    pub data_dir: String,
    pub busy_timeout_secs: u64,
    pub max_pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            busy_timeout_secs: 5,
            max_pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub period_secs: i64,
    pub raw_retention_secs: i64,
    /// Optional cron expression for VACUUM (e.g. "0 0 4 * * *"). Uses local time.
    /// When unset, VACUUM runs after every retention pass.
    pub vacuum_schedule: Option<String>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            period_secs: 30,
            raw_retention_secs: 3600,
            vacuum_schedule: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub magic: i64,
    /// Offset of naive client timestamps (hours east of UTC).
    pub client_utc_offset_hours: i32,
    pub read_buffer_bytes: usize,
    pub max_frame_bytes: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            magic: 23333,
            client_utc_offset_hours: 8,
            read_buffer_bytes: 4096,
            max_frame_bytes: 4 * 1024 * 1024,
            reconnect_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub query_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
            query_timeout_secs: 10,
        }
    }
}

/// A monitored host. Device count and memory capacity come from here, not from data.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub name: String,
    pub gpu_count: u32,
    pub memory_gib: u32,
}

impl AppConfig {
    /// Reads `CONFIG_FILE` (or `config.toml`). A missing default file yields built-in defaults;
    /// a missing file named explicitly is an error.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var("CONFIG_FILE") {
            Ok(path) => {
                let s = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("config file {}: {}", path, e))?;
                Self::load_from_str(&s)
            }
            Err(_) => match std::fs::read_to_string(DEFAULT_CONFIG_PATH) {
                Ok(s) => Self::load_from_str(&s),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let config = Self::default();
                    config.validate()?;
                    Ok(config)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.database.data_dir.is_empty(),
            "database.data_dir must be non-empty"
        );
        anyhow::ensure!(
            self.database.max_pool_size > 0,
            "database.max_pool_size must be > 0, got {}",
            self.database.max_pool_size
        );
        anyhow::ensure!(
            self.rollup.period_secs > 1,
            "rollup.period_secs must be > 1, got {}",
            self.rollup.period_secs
        );
        anyhow::ensure!(
            self.rollup.raw_retention_secs >= self.rollup.period_secs,
            "rollup.raw_retention_secs must be >= rollup.period_secs, got {}",
            self.rollup.raw_retention_secs
        );
        if let Some(ref schedule) = self.rollup.vacuum_schedule {
            anyhow::ensure!(
                <cron::Schedule as std::str::FromStr>::from_str(schedule).is_ok(),
                "rollup.vacuum_schedule is not a valid cron expression: {}",
                schedule
            );
        }
        anyhow::ensure!(
            (-23..=23).contains(&self.transport.client_utc_offset_hours),
            "transport.client_utc_offset_hours must be within -23..=23, got {}",
            self.transport.client_utc_offset_hours
        );
        anyhow::ensure!(
            self.transport.read_buffer_bytes > 0,
            "transport.read_buffer_bytes must be > 0, got {}",
            self.transport.read_buffer_bytes
        );
        anyhow::ensure!(
            self.transport.max_frame_bytes >= self.transport.read_buffer_bytes,
            "transport.max_frame_bytes must be >= transport.read_buffer_bytes, got {}",
            self.transport.max_frame_bytes
        );
        anyhow::ensure!(
            self.sampler.interval_ms > 0,
            "sampler.interval_ms must be > 0, got {}",
            self.sampler.interval_ms
        );
        anyhow::ensure!(
            self.api.port > 0,
            "api.port must be between 1 and 65535, got {}",
            self.api.port
        );
        anyhow::ensure!(
            self.api.query_timeout_secs > 0,
            "api.query_timeout_secs must be > 0, got {}",
            self.api.query_timeout_secs
        );
        for host in &self.hosts {
            anyhow::ensure!(
                is_valid_host_name(&host.name),
                "hosts.name must be non-empty [A-Za-z0-9_-], got {:?}",
                host.name
            );
            anyhow::ensure!(
                host.gpu_count > 0,
                "hosts.gpu_count must be > 0 for host {}",
                host.name
            );
            anyhow::ensure!(
                host.memory_gib > 0,
                "hosts.memory_gib must be > 0 for host {}",
                host.name
            );
        }
        Ok(())
    }
}

/// Host names become part of database file names.
pub fn is_valid_host_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
