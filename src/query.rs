// Query Service: read-only views over one host's store. History views are re-bucketed to an
// interval chosen from the requested range and report memory in GiB; realtime views return
// raw rows in bytes. Every call runs under a deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::models::{
    bytes_to_gib, DeviceAverage, DeviceHistoryView, DevicePoint, HistoryBounds, RawDeviceSample,
    RawUserSample, SeriesKey, UserHistoryView, UserPoint, UserSeries, UserTotal,
};
use crate::store::{DeviceBucket, Store, UserBucket};

const HOUR: i64 = 3600;
const DAY: i64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid range: start {start}, end {end}")]
    InvalidRange { start: i64, end: i64 },
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Re-aggregation interval (seconds) for a range of `duration` seconds.
pub fn adaptive_interval(duration: i64) -> i64 {
    if duration <= HOUR {
        30
    } else if duration <= DAY {
        60 * (duration / 28_800 + 1)
    } else if duration <= 7 * DAY {
        300 * (duration / DAY)
    } else {
        HOUR
    }
}

/// Reindex user buckets onto one regular axis spanning the first to the last bucket seen.
/// Every series gets a point for every axis entry; buckets where the user had no rows are zero.
pub fn gap_fill(buckets: &[UserBucket], interval_secs: i64) -> UserHistoryView {
    let lo = buckets.iter().map(|b| b.bucket).min();
    let hi = buckets.iter().map(|b| b.bucket).max();
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return UserHistoryView::empty(interval_secs);
    };
    if interval_secs <= 0 {
        return UserHistoryView::empty(interval_secs);
    }

    let axis: Vec<i64> = (lo..=hi).step_by(interval_secs as usize).collect();

    let mut by_series: BTreeMap<&SeriesKey, BTreeMap<i64, &UserBucket>> = BTreeMap::new();
    for b in buckets {
        by_series.entry(&b.key).or_default().insert(b.bucket, b);
    }

    let series = by_series
        .into_iter()
        .filter_map(|(key, rows)| {
            let first_active = *rows.keys().next()?;
            let last_active = *rows.keys().next_back()?;
            let points = axis
                .iter()
                .map(|&ts| rows.get(&ts).map_or(UserPoint::zero(ts), |b| user_point(b)))
                .collect();
            Some(UserSeries {
                user: key.user.clone(),
                gpu_index: key.gpu_index,
                first_active,
                last_active,
                points,
            })
        })
        .collect();

    UserHistoryView {
        interval_secs,
        axis,
        series,
    }
}

fn user_point(b: &UserBucket) -> UserPoint {
    UserPoint {
        timestamp: b.bucket,
        gpu_utilization: b.gpu_utilization_avg,
        gpu_utilization_min: b.gpu_utilization_min,
        gpu_utilization_max: b.gpu_utilization_max,
        used_memory_gib: bytes_to_gib(b.used_memory_avg),
        used_memory_gib_min: bytes_to_gib(b.used_memory_min),
        used_memory_gib_max: bytes_to_gib(b.used_memory_max),
    }
}

fn device_point(b: &DeviceBucket) -> DevicePoint {
    DevicePoint {
        gpu_index: b.gpu_index,
        timestamp: b.bucket,
        gpu_utilization: b.gpu_utilization_avg,
        gpu_utilization_min: b.gpu_utilization_min,
        gpu_utilization_max: b.gpu_utilization_max,
        used_memory_gib: bytes_to_gib(b.used_memory_avg),
        used_memory_gib_min: bytes_to_gib(b.used_memory_min),
        used_memory_gib_max: bytes_to_gib(b.used_memory_max),
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<Store>,
    timeout: Duration,
    period_secs: i64,
}

impl QueryService {
    pub fn new(store: Arc<Store>, timeout: Duration, period_secs: i64) -> Self {
        Self {
            store,
            timeout,
            period_secs,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, QueryError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        with_deadline(self.timeout, fut).await
    }

    /// Earliest and latest rollup timestamps; `None` when no history exists yet.
    #[instrument(skip(self), fields(repo = "query", operation = "bounds"))]
    pub async fn bounds(&self) -> Result<Option<HistoryBounds>, QueryError> {
        let bounds = self.bounded(self.store.history_bounds()).await?;
        Ok(bounds.map(|(start, end)| HistoryBounds { start, end }))
    }

    /// Per-device series over [start, end), re-bucketed to the adaptive interval.
    #[instrument(skip(self), fields(repo = "query", operation = "device_history"))]
    pub async fn device_history(
        &self,
        start: i64,
        end: i64,
    ) -> Result<DeviceHistoryView, QueryError> {
        let interval_secs = adaptive_interval(check_range(start, end)?);
        if start == end {
            return Ok(DeviceHistoryView {
                interval_secs,
                points: vec![],
            });
        }
        let buckets = self
            .bounded(self.store.device_history_buckets(start, end, interval_secs))
            .await?;
        Ok(DeviceHistoryView {
            interval_secs,
            points: buckets.iter().map(device_point).collect(),
        })
    }

    /// Per-(user, device) series over [start, end), re-bucketed and gap-filled with zeros.
    #[instrument(skip(self), fields(repo = "query", operation = "user_history"))]
    pub async fn user_history(&self, start: i64, end: i64) -> Result<UserHistoryView, QueryError> {
        let interval_secs = adaptive_interval(check_range(start, end)?);
        if start == end {
            return Ok(UserHistoryView::empty(interval_secs));
        }
        let buckets = self
            .bounded(self.store.user_history_buckets(start, end, interval_secs))
            .await?;
        Ok(gap_fill(&buckets, interval_secs))
    }

    /// Mean utilization and used memory (GiB) per device over [start, end).
    #[instrument(skip(self), fields(repo = "query", operation = "device_averages"))]
    pub async fn device_averages(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<DeviceAverage>, QueryError> {
        check_range(start, end)?;
        if start == end {
            return Ok(vec![]);
        }
        let means = self.bounded(self.store.device_means(start, end)).await?;
        Ok(means
            .into_iter()
            .map(|(gpu_index, util, mem)| DeviceAverage {
                gpu_index,
                avg_gpu_utilization: util,
                avg_used_memory_gib: bytes_to_gib(mem),
            })
            .collect())
    }

    /// Per-user usage over [start, end): utilization and memory are summed across devices and
    /// averaged over the rollup periods in range (idle periods count as zero). `gpu_hours` adds
    /// up utilization/100 x period for every row.
    #[instrument(skip(self), fields(repo = "query", operation = "user_totals"))]
    pub async fn user_totals(&self, start: i64, end: i64) -> Result<Vec<UserTotal>, QueryError> {
        check_range(start, end)?;
        if start == end {
            return Ok(vec![]);
        }
        let periods = self
            .bounded(self.store.history_period_count(start, end))
            .await?;
        let sums = self.bounded(self.store.user_sums(start, end)).await?;
        if periods == 0 {
            return Ok(vec![]);
        }
        let periods = periods as f64;
        Ok(sums
            .into_iter()
            .map(|s| UserTotal {
                avg_gpu_utilization: s.gpu_utilization_sum / periods,
                avg_used_memory_gib: bytes_to_gib(s.used_memory_sum / periods),
                gpu_hours: s.gpu_utilization_sum / 100.0 * self.period_secs as f64 / HOUR as f64,
                user: s.user,
            })
            .collect())
    }

    /// Device rows at the newest raw timestamp (bytes).
    #[instrument(skip(self), fields(repo = "query", operation = "latest_devices"))]
    pub async fn latest_devices(&self) -> Result<Vec<RawDeviceSample>, QueryError> {
        self.bounded(self.store.latest_devices()).await
    }

    /// Raw device rows in [start, end] (bytes).
    #[instrument(skip(self), fields(repo = "query", operation = "realtime_devices"))]
    pub async fn realtime_devices(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<RawDeviceSample>, QueryError> {
        check_range(start, end)?;
        self.bounded(self.store.device_samples_between(start, end))
            .await
    }

    /// Raw user rows in [start, end] (bytes).
    #[instrument(skip(self), fields(repo = "query", operation = "realtime_users"))]
    pub async fn realtime_users(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<RawUserSample>, QueryError> {
        check_range(start, end)?;
        self.bounded(self.store.user_samples_between(start, end))
            .await
    }
}

/// Run a store read, failing with `QueryError::Timeout` once `timeout` has passed.
async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, QueryError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(QueryError::Store),
        Err(_) => {
            warn!(?timeout, "query deadline exceeded");
            Err(QueryError::Timeout(timeout))
        }
    }
}

/// Length of [start, end] in seconds. Ranges that run backwards or whose length does not fit
/// in an i64 are rejected.
fn check_range(start: i64, end: i64) -> Result<i64, QueryError> {
    match end.checked_sub(start) {
        Some(span) if span >= 0 => Ok(span),
        _ => Err(QueryError::InvalidRange { start, end }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(user: &str, gpu: u32, ts: i64, util: f64) -> UserBucket {
        UserBucket {
            key: SeriesKey {
                user: user.into(),
                gpu_index: gpu,
            },
            bucket: ts,
            gpu_utilization_avg: util,
            gpu_utilization_min: util,
            gpu_utilization_max: util,
            used_memory_avg: 2.0 * 1_073_741_824.0,
            used_memory_min: 1_073_741_824.0,
            used_memory_max: 3.0 * 1_073_741_824.0,
        }
    }

    #[test]
    fn interval_breakpoints() {
        assert_eq!(adaptive_interval(0), 30);
        assert_eq!(adaptive_interval(3600), 30);
        assert_eq!(adaptive_interval(3601), 60);
        assert_eq!(adaptive_interval(28_799), 60);
        assert_eq!(adaptive_interval(28_800), 120);
        assert_eq!(adaptive_interval(86_400), 240);
        assert_eq!(adaptive_interval(86_401), 300);
        assert_eq!(adaptive_interval(2 * 86_400), 600);
        assert_eq!(adaptive_interval(7 * 86_400), 2100);
        assert_eq!(adaptive_interval(7 * 86_400 + 1), 3600);
        assert_eq!(adaptive_interval(365 * 86_400), 3600);
    }

    #[test]
    fn interval_is_monotonic() {
        let mut prev = adaptive_interval(0);
        for d in (0..=8 * 86_400).step_by(60) {
            let cur = adaptive_interval(d);
            assert!(cur >= prev, "interval dropped at {d}: {prev} -> {cur}");
            prev = cur;
        }
    }

    #[test]
    fn gap_fill_zeroes_inactive_buckets() {
        let buckets = vec![
            bucket("alice", 0, 0, 50.0),
            bucket("alice", 0, 30, 60.0),
            bucket("alice", 0, 60, 70.0),
            bucket("alice", 0, 90, 80.0),
            bucket("bob", 0, 30, 20.0),
        ];
        let view = gap_fill(&buckets, 30);
        assert_eq!(view.axis, vec![0, 30, 60, 90]);
        assert_eq!(view.series.len(), 2);

        let bob = view.series.iter().find(|s| s.user == "bob").unwrap();
        assert_eq!(bob.points.len(), view.axis.len());
        assert_eq!((bob.first_active, bob.last_active), (30, 30));
        assert_eq!(bob.points[1].gpu_utilization, 20.0);
        for i in [0, 2, 3] {
            assert_eq!(bob.points[i], UserPoint::zero(view.axis[i]));
        }
    }

    #[test]
    fn gap_fill_converts_memory_to_gib() {
        let view = gap_fill(&[bucket("alice", 1, 120, 10.0)], 60);
        let p = view.series[0].points[0];
        assert_eq!(p.used_memory_gib, 2.0);
        assert_eq!(p.used_memory_gib_min, 1.0);
        assert_eq!(p.used_memory_gib_max, 3.0);
    }

    #[test]
    fn gap_fill_of_nothing_is_empty() {
        let view = gap_fill(&[], 30);
        assert!(view.is_empty());
        assert!(view.axis.is_empty());
    }

    #[test]
    fn series_are_ordered_by_user_then_device() {
        let buckets = vec![
            bucket("bob", 1, 0, 1.0),
            bucket("alice", 2, 0, 1.0),
            bucket("alice", 0, 0, 1.0),
        ];
        let view = gap_fill(&buckets, 30);
        let keys: Vec<_> = view
            .series
            .iter()
            .map(|s| (s.user.as_str(), s.gpu_index))
            .collect();
        assert_eq!(keys, vec![("alice", 0), ("alice", 2), ("bob", 1)]);
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(matches!(
            check_range(10, 5),
            Err(QueryError::InvalidRange { start: 10, end: 5 })
        ));
        assert!(check_range(5, 5).is_ok());
    }

    #[test]
    fn range_too_long_for_i64_is_rejected() {
        assert!(matches!(
            check_range(i64::MIN, 0),
            Err(QueryError::InvalidRange { .. })
        ));
        assert!(matches!(
            check_range(-1, i64::MAX),
            Err(QueryError::InvalidRange { .. })
        ));
        assert_eq!(check_range(0, i64::MAX).unwrap(), i64::MAX);
        assert_eq!(adaptive_interval(i64::MAX), 3600);
    }

    #[tokio::test]
    async fn stalled_read_times_out() {
        let timeout = Duration::from_millis(10);
        let result = with_deadline(timeout, std::future::pending::<anyhow::Result<()>>()).await;
        assert!(matches!(result, Err(QueryError::Timeout(t)) if t == timeout));
    }

    #[tokio::test]
    async fn read_within_deadline_passes_through() {
        let ok = with_deadline(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        let failed = with_deadline(Duration::from_secs(1), async {
            Err::<(), _>(anyhow::anyhow!("disk gone"))
        })
        .await;
        assert!(matches!(failed, Err(QueryError::Store(_))));
    }
}
