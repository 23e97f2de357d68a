// Rollup rows: one per device (and per device+user) per rollup period, stamped with the period end.
// min/max hold the 25th/75th percentile of the raw window, not true extrema.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHistory {
    pub gpu_index: u32,
    pub timestamp: i64,
    pub gpu_utilization_avg: f64,
    pub gpu_utilization_min: f64,
    pub gpu_utilization_max: f64,
    pub used_memory_avg: f64,
    pub used_memory_min: f64,
    pub used_memory_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserHistory {
    pub gpu_index: u32,
    pub user: String,
    pub timestamp: i64,
    pub used_memory_avg: f64,
    pub used_memory_min: f64,
    pub used_memory_max: f64,
    pub gpu_utilization_avg: f64,
    pub gpu_utilization_min: f64,
    pub gpu_utilization_max: f64,
}
