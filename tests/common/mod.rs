// Shared test helpers
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use gpuwatch::models::*;
use gpuwatch::store::{Store, StoreOptions};
use tempfile::TempDir;

pub const GIB: u64 = 1 << 30;

/// 2024-05-01T00:00:00Z
pub const MAY_2024: i64 = 1_714_521_600;

/// A fresh, initialized store in a temp dir. Keep the TempDir alive for the test's duration.
pub async fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), "test", &StoreOptions::default())
        .await
        .unwrap();
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

pub fn at(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).unwrap()
}

pub fn process(pid: u32, user: &str, used_memory: u64) -> ProcessInfo {
    ProcessInfo {
        pid,
        user: user.into(),
        used_memory: Some(used_memory),
        cpu_usage: CpuUsage::Percent(5.0),
        name: "python".into(),
    }
}

pub fn gpu(gpu_index: u32, util: u32, used_memory: u64, processes: Vec<ProcessInfo>) -> GpuInfo {
    GpuInfo {
        gpu_index,
        name: "NVIDIA A100-SXM4-80GB".into(),
        gpu_utilization: util,
        memory_utilization: util / 2,
        total_memory: 80 * GIB,
        used_memory,
        free_memory: 80 * GIB - used_memory,
        processes,
    }
}

pub fn device_sample(gpu_index: u32, util: u32, used_memory: u64, ts: i64) -> RawDeviceSample {
    RawDeviceSample {
        gpu_index,
        name: "NVIDIA A100-SXM4-80GB".into(),
        gpu_utilization: util,
        memory_utilization: 0,
        total_memory: 80 * GIB,
        used_memory,
        free_memory: 80 * GIB - used_memory,
        timestamp: ts,
    }
}

pub fn user_sample(gpu_index: u32, user: &str, util: f64, used_memory: u64, ts: i64) -> RawUserSample {
    RawUserSample {
        gpu_index,
        user: user.into(),
        used_memory,
        gpu_utilization: util,
        timestamp: ts,
    }
}

/// A flat history row: avg, min and max all equal.
pub fn device_history(gpu_index: u32, ts: i64, util: f64, used_memory: f64) -> DeviceHistory {
    DeviceHistory {
        gpu_index,
        timestamp: ts,
        gpu_utilization_avg: util,
        gpu_utilization_min: util,
        gpu_utilization_max: util,
        used_memory_avg: used_memory,
        used_memory_min: used_memory,
        used_memory_max: used_memory,
    }
}

pub fn user_history(gpu_index: u32, user: &str, ts: i64, util: f64, used_memory: f64) -> UserHistory {
    UserHistory {
        gpu_index,
        user: user.into(),
        timestamp: ts,
        used_memory_avg: used_memory,
        used_memory_min: used_memory,
        used_memory_max: used_memory,
        gpu_utilization_avg: util,
        gpu_utilization_min: util,
        gpu_utilization_max: util,
    }
}
