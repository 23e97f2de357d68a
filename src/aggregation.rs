// Rollup: compress the raw window (T-P, T] into one history row per device and per
// (device, user). avg is the arithmetic mean; "min"/"max" are the 25th/75th percentiles of
// the window, a smoothing choice kept on purpose. Percentiles interpolate linearly between
// closest ranks placed at (k - 0.5) / n (Hazen), so [10, 20, 30, 40] gives 15 / 35.

use std::collections::BTreeMap;

use crate::models::{DeviceHistory, RawDeviceSample, RawUserSample, UserHistory};
use crate::store::Store;
use tracing::{debug, instrument};

pub const LOWER_QUANTILE: f64 = 0.25;
pub const UPPER_QUANTILE: f64 = 0.75;

#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    #[error("rollup failed for period {period_end}")]
    Failed {
        period_end: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl RollupError {
    fn failed(period_end: i64, e: anyhow::Error) -> Self {
        RollupError::Failed {
            period_end,
            source: e.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollupOutcome {
    pub device_rows: usize,
    pub user_rows: usize,
}

/// mean, 25th and 75th percentile of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub avg: f64,
    pub lower: f64,
    pub upper: f64,
}

impl WindowStats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            avg: mean(&sorted),
            lower: percentile(&sorted, LOWER_QUANTILE),
            upper: percentile(&sorted, UPPER_QUANTILE),
        })
    }
}

/// Quantile `q` in [0, 1] of an ascending slice. Returns 0.0 for an empty slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        1 => sorted[0],
        _ => {
            let h = (n as f64 * q + 0.5).clamp(1.0, n as f64);
            let lo = h.floor() as usize;
            let frac = h - h.floor();
            if lo >= n {
                sorted[n - 1]
            } else {
                sorted[lo - 1] + frac * (sorted[lo] - sorted[lo - 1])
            }
        }
    }
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().sum::<f64>() / (v.len() as f64)
}

/// One DeviceHistory row per device present in `samples`, stamped with `period_end`.
pub fn rollup_devices(samples: &[RawDeviceSample], period_end: i64) -> Vec<DeviceHistory> {
    let mut by_device: BTreeMap<u32, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for s in samples {
        let (util, mem) = by_device.entry(s.gpu_index).or_default();
        util.push(s.gpu_utilization as f64);
        mem.push(s.used_memory as f64);
    }

    by_device
        .into_iter()
        .filter_map(|(gpu_index, (util, mem))| {
            let util = WindowStats::of(&util)?;
            let mem = WindowStats::of(&mem)?;
            Some(DeviceHistory {
                gpu_index,
                timestamp: period_end,
                gpu_utilization_avg: util.avg,
                gpu_utilization_min: util.lower,
                gpu_utilization_max: util.upper,
                used_memory_avg: mem.avg,
                used_memory_min: mem.lower,
                used_memory_max: mem.upper,
            })
        })
        .collect()
}

/// One UserHistory row per (device, user) pair present in `samples`, stamped with `period_end`.
pub fn rollup_users(samples: &[RawUserSample], period_end: i64) -> Vec<UserHistory> {
    let mut by_pair: BTreeMap<(u32, &str), (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for s in samples {
        let (util, mem) = by_pair.entry((s.gpu_index, s.user.as_str())).or_default();
        util.push(s.gpu_utilization);
        mem.push(s.used_memory as f64);
    }

    by_pair
        .into_iter()
        .filter_map(|((gpu_index, user), (util, mem))| {
            let util = WindowStats::of(&util)?;
            let mem = WindowStats::of(&mem)?;
            Some(UserHistory {
                gpu_index,
                user: user.to_string(),
                timestamp: period_end,
                used_memory_avg: mem.avg,
                used_memory_min: mem.lower,
                used_memory_max: mem.upper,
                gpu_utilization_avg: util.avg,
                gpu_utilization_min: util.lower,
                gpu_utilization_max: util.upper,
            })
        })
        .collect()
}

/// Reads the raw window (period_end - period_secs, period_end], computes the rollup and
/// writes it in one transaction. Nothing is written when the transaction fails.
#[instrument(skip(store), fields(operation = "rollup"))]
pub async fn run_rollup(
    store: &Store,
    period_end: i64,
    period_secs: i64,
) -> Result<RollupOutcome, RollupError> {
    let window_start = period_end - period_secs;
    let devices = store
        .device_samples_in_window(window_start, period_end)
        .await
        .map_err(|e| RollupError::failed(period_end, e))?;
    let users = store
        .user_samples_in_window(window_start, period_end)
        .await
        .map_err(|e| RollupError::failed(period_end, e))?;

    let device_rows = rollup_devices(&devices, period_end);
    let user_rows = rollup_users(&users, period_end);
    if device_rows.is_empty() && user_rows.is_empty() {
        debug!(period_end, "empty raw window, nothing to roll up");
        return Ok(RollupOutcome::default());
    }

    store
        .save_rollup(&device_rows, &user_rows)
        .await
        .map_err(|e| RollupError::failed(period_end, e))?;

    Ok(RollupOutcome {
        device_rows: device_rows.len(),
        user_rows: user_rows.len(),
    })
}
