// Raw per-tick rows (retained up to the raw horizon). Memory in bytes, timestamps in UTC Unix seconds.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDeviceSample {
    pub gpu_index: u32,
    pub name: String,
    pub gpu_utilization: u32,
    pub memory_utilization: u32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub timestamp: i64,
}

/// One row per distinct user observed on a device at a tick.
/// `gpu_utilization` is the user's share of the device utilization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUserSample {
    pub gpu_index: u32,
    pub user: String,
    pub used_memory: u64,
    pub gpu_utilization: f64,
    pub timestamp: i64,
}
