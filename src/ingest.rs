// Ingestion: one poll -> raw rows (one transaction) -> rollup when due -> retention.
// Rollups are triggered by sample arrival, not a timer: when the sender stalls, rollups stall.
// The "last rollup" time is owned here and passed nowhere else.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::aggregation;
use crate::models::{GpuInfo, RawDeviceSample, RawUserSample};
use crate::retention::Retention;
use crate::store::Store;

/// Device rows for one tick.
pub fn device_samples(gpus: &[GpuInfo], timestamp: i64) -> Vec<RawDeviceSample> {
    gpus.iter()
        .map(|g| RawDeviceSample {
            gpu_index: g.gpu_index,
            name: g.name.clone(),
            gpu_utilization: g.gpu_utilization,
            memory_utilization: g.memory_utilization,
            total_memory: g.total_memory,
            used_memory: g.used_memory,
            free_memory: g.free_memory,
            timestamp,
        })
        .collect()
}

/// User rows for one tick. A device's utilization is split equally between the distinct users
/// with processes on it; a user's memory is the sum over their processes on that device.
pub fn user_samples(gpus: &[GpuInfo], timestamp: i64) -> Vec<RawUserSample> {
    let mut out = Vec::new();
    for g in gpus {
        let mut by_user: BTreeMap<&str, u64> = BTreeMap::new();
        for p in &g.processes {
            *by_user.entry(p.user.as_str()).or_default() += p.used_memory.unwrap_or(0);
        }
        if by_user.is_empty() {
            continue;
        }
        let share = g.gpu_utilization as f64 / by_user.len() as f64;
        out.extend(by_user.into_iter().map(|(user, used_memory)| RawUserSample {
            gpu_index: g.gpu_index,
            user: user.to_string(),
            used_memory,
            gpu_utilization: share,
            timestamp,
        }));
    }
    out
}

/// Decides when a rollup is due, from sample timestamps alone.
#[derive(Debug, Clone)]
pub struct RollupSchedule {
    period_secs: i64,
    last_rollup: Option<i64>,
}

impl RollupSchedule {
    pub fn new(period_secs: i64) -> Self {
        Self {
            period_secs,
            last_rollup: None,
        }
    }

    /// Start counting from `at` instead of from the first sample.
    pub fn starting_at(period_secs: i64, at: i64) -> Self {
        Self {
            period_secs,
            last_rollup: Some(at),
        }
    }

    pub fn last_rollup(&self) -> Option<i64> {
        self.last_rollup
    }

    /// True when `now` is at least `period - 1` seconds past the last rollup, or the clock
    /// went backwards. A due check records `now` as the new last rollup time.
    pub fn due(&mut self, now: i64) -> bool {
        let Some(last) = self.last_rollup else {
            self.last_rollup = Some(now);
            return false;
        };
        let elapsed = now - last;
        if elapsed >= self.period_secs - 1 || elapsed < 0 {
            self.last_rollup = Some(now);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    StoredAndRolledUp { period_end: i64 },
}

pub struct Ingestor {
    store: Arc<Store>,
    schedule: RollupSchedule,
    retention: Retention,
    period_secs: i64,
}

impl Ingestor {
    pub fn new(
        store: Arc<Store>,
        schedule: RollupSchedule,
        retention: Retention,
        period_secs: i64,
    ) -> Self {
        Self {
            store,
            schedule,
            retention,
            period_secs,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn last_rollup(&self) -> Option<i64> {
        self.schedule.last_rollup()
    }

    /// Persist one poll taken at `at`, then roll up and prune if a period has elapsed.
    /// Failures are logged; none of them stop ingestion.
    #[instrument(skip(self, gpus), fields(operation = "ingest", devices = gpus.len()))]
    pub async fn ingest(&mut self, gpus: &[GpuInfo], at: DateTime<Utc>) -> IngestOutcome {
        let ts = at.timestamp();
        let devices = device_samples(gpus, ts);
        let users = user_samples(gpus, ts);
        if let Err(e) = self.store.insert_samples(&devices, &users).await {
            warn!(error = %e, operation = "insert_samples", timestamp = ts, "failed to store samples");
        }

        if !self.schedule.due(ts) {
            return IngestOutcome::Stored;
        }

        match aggregation::run_rollup(&self.store, ts, self.period_secs).await {
            Ok(outcome) => debug!(
                period_end = ts,
                device_rows = outcome.device_rows,
                user_rows = outcome.user_rows,
                "rollup complete"
            ),
            Err(e) => error!(error = %e, cause = ?std::error::Error::source(&e), "rollup failed"),
        }

        match self.retention.apply(&self.store, ts).await {
            Ok(outcome) if outcome.removed > 0 => info!(
                removed = outcome.removed,
                vacuumed = outcome.vacuumed,
                "raw retention"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, operation = "retention", "retention failed"),
        }

        IngestOutcome::StoredAndRolledUp { period_end: ts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuUsage, ProcessInfo};

    fn process(pid: u32, user: &str, mem: Option<u64>) -> ProcessInfo {
        ProcessInfo {
            pid,
            user: user.into(),
            used_memory: mem,
            cpu_usage: CpuUsage::Percent(1.0),
            name: "python".into(),
        }
    }

    fn gpu(index: u32, util: u32, processes: Vec<ProcessInfo>) -> GpuInfo {
        GpuInfo {
            gpu_index: index,
            name: "A100".into(),
            gpu_utilization: util,
            memory_utilization: 10,
            total_memory: 100,
            used_memory: 60,
            free_memory: 40,
            processes,
        }
    }

    #[test]
    fn utilization_is_split_equally_between_users() {
        let gpus = vec![gpu(
            0,
            80,
            vec![
                process(1, "alice", Some(10)),
                process(2, "alice", Some(20)),
                process(3, "bob", None),
                process(4, "carol", Some(5)),
            ],
        )];
        let rows = user_samples(&gpus, 100);
        assert_eq!(rows.len(), 3);
        let alice = rows.iter().find(|r| r.user == "alice").unwrap();
        assert_eq!(alice.gpu_utilization, 80.0 / 3.0);
        assert_eq!(alice.used_memory, 30);
        let bob = rows.iter().find(|r| r.user == "bob").unwrap();
        assert_eq!(bob.gpu_utilization, 80.0 / 3.0);
        assert_eq!(bob.used_memory, 0);
        assert!(rows.iter().all(|r| r.timestamp == 100 && r.gpu_index == 0));
    }

    #[test]
    fn user_with_more_processes_gets_the_same_share() {
        let gpus = vec![gpu(
            0,
            90,
            vec![
                process(1, "alice", Some(1)),
                process(2, "alice", Some(2)),
                process(3, "bob", Some(4)),
            ],
        )];
        let rows = user_samples(&gpus, 5);
        let shares: Vec<(&str, f64, u64)> = rows
            .iter()
            .map(|r| (r.user.as_str(), r.gpu_utilization, r.used_memory))
            .collect();
        assert_eq!(shares, vec![("alice", 45.0, 3), ("bob", 45.0, 4)]);
    }

    #[test]
    fn idle_device_has_no_user_rows() {
        let gpus = vec![
            gpu(0, 0, vec![]),
            gpu(1, 50, vec![process(1, "alice", Some(1))]),
        ];
        let rows = user_samples(&gpus, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gpu_index, 1);
        assert_eq!(rows[0].gpu_utilization, 50.0);
        assert_eq!(device_samples(&gpus, 1).len(), 2);
    }

    #[test]
    fn schedule_fires_at_period_minus_one() {
        let mut s = RollupSchedule::new(30);
        assert!(!s.due(1000));
        assert!(!s.due(1028));
        assert!(s.due(1029));
        assert_eq!(s.last_rollup(), Some(1029));
        assert!(!s.due(1030));
    }

    #[test]
    fn schedule_fires_when_clock_goes_backwards() {
        let mut s = RollupSchedule::starting_at(30, 1000);
        assert!(s.due(900));
        assert_eq!(s.last_rollup(), Some(900));
    }

    #[test]
    fn schedule_only_advances_on_arrival() {
        // No samples between 1000 and 5000: no rollup happens in between, one happens at 5000.
        let mut s = RollupSchedule::starting_at(30, 1000);
        assert!(s.due(5000));
        assert!(!s.due(5001));
    }
}
