// Query Service output. Memory fields are GiB.

use serde::Serialize;

/// One re-aggregated bucket for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePoint {
    pub gpu_index: u32,
    pub timestamp: i64,
    pub gpu_utilization: f64,
    pub gpu_utilization_min: f64,
    pub gpu_utilization_max: f64,
    pub used_memory_gib: f64,
    pub used_memory_gib_min: f64,
    pub used_memory_gib_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHistoryView {
    pub interval_secs: i64,
    pub points: Vec<DevicePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPoint {
    pub timestamp: i64,
    pub gpu_utilization: f64,
    pub gpu_utilization_min: f64,
    pub gpu_utilization_max: f64,
    pub used_memory_gib: f64,
    pub used_memory_gib_min: f64,
    pub used_memory_gib_max: f64,
}

impl UserPoint {
    pub fn zero(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

/// Series identity. Ordered so that series iteration never depends on row order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub user: String,
    pub gpu_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSeries {
    pub user: String,
    pub gpu_index: u32,
    /// First and last bucket where the user had rows.
    pub first_active: i64,
    pub last_active: i64,
    /// One point per entry of the view's axis; zero where the user was inactive.
    pub points: Vec<UserPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserHistoryView {
    pub interval_secs: i64,
    /// Shared time axis (bucket starts) for every series.
    pub axis: Vec<i64>,
    pub series: Vec<UserSeries>,
}

impl UserHistoryView {
    pub fn empty(interval_secs: i64) -> Self {
        Self {
            interval_secs,
            axis: vec![],
            series: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAverage {
    pub gpu_index: u32,
    pub avg_gpu_utilization: f64,
    pub avg_used_memory_gib: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTotal {
    pub user: String,
    pub avg_gpu_utilization: f64,
    pub avg_used_memory_gib: f64,
    pub gpu_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBounds {
    pub start: i64,
    pub end: i64,
}
