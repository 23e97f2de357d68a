// Sender -> receiver frame. One JSON object per frame.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Naive client timestamps, e.g. `2024-01-01T12:00:00.000000`.
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub magic: i64,
    pub timestamp: String,
    pub gpu_info: Vec<GpuInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuInfo {
    pub gpu_index: u32,
    pub name: String,
    pub gpu_utilization: u32,
    pub memory_utilization: u32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    #[serde(default)]
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub user: String,
    /// `null` when the driver cannot attribute memory to the process.
    #[serde(default)]
    pub used_memory: Option<u64>,
    pub cpu_usage: CpuUsage,
    pub name: String,
}

/// Per-process CPU usage: a percentage, or `"N/A"` when the process could not be inspected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CpuUsage {
    Percent(f64),
    Unavailable(String),
}

impl CpuUsage {
    pub fn unavailable() -> Self {
        CpuUsage::Unavailable("N/A".into())
    }
}

impl WireMessage {
    /// Client wall clock converted to UTC. Timestamps carrying an explicit offset
    /// (RFC 3339) use it; naive timestamps are read at `naive_offset`.
    pub fn timestamp_utc(&self, naive_offset: FixedOffset) -> Result<DateTime<Utc>, String> {
        parse_client_timestamp(&self.timestamp, naive_offset)
    }
}

pub fn parse_client_timestamp(
    s: &str,
    naive_offset: FixedOffset,
) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, NAIVE_TIMESTAMP_FORMAT)
        .map_err(|e| format!("timestamp {:?}: {}", s, e))?;
    naive_offset
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("timestamp {:?}: ambiguous local time", s))
}
