// Raw retention: after a rollup at T, raw rows older than T - horizon are deleted and the
// raw file is vacuumed (now, or later on a cron schedule).

use std::str::FromStr;
use std::time::Duration;

use crate::store::Store;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumPolicy {
    /// VACUUM right after any pass that deleted rows.
    AfterPrune,
    /// VACUUM only when the scheduler asks for it.
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionOutcome {
    pub removed: u64,
    pub vacuumed: bool,
}

#[derive(Debug, Clone)]
pub struct Retention {
    horizon_secs: i64,
    vacuum: VacuumPolicy,
}

impl Retention {
    pub fn new(horizon_secs: i64, vacuum: VacuumPolicy) -> Self {
        Self {
            horizon_secs,
            vacuum,
        }
    }

    pub fn cutoff(&self, at: i64) -> i64 {
        at - self.horizon_secs
    }

    /// Delete raw rows older than `at - horizon`. Running it twice for the same `at` is a no-op.
    #[instrument(skip(self, store), fields(operation = "retention"))]
    pub async fn apply(&self, store: &Store, at: i64) -> anyhow::Result<RetentionOutcome> {
        let removed = store.delete_raw_before(self.cutoff(at)).await?;
        let vacuumed = removed > 0 && self.vacuum == VacuumPolicy::AfterPrune;
        if vacuumed {
            store.vacuum_raw().await?;
        }
        Ok(RetentionOutcome { removed, vacuumed })
    }
}

/// Sends a message on `tx` at each VACUUM time of the cron `schedule` (local time).
/// The receiving loop runs the VACUUM so that all writes stay on one task.
pub async fn vacuum_scheduler(schedule: String, tx: tokio::sync::mpsc::Sender<()>) {
    let Ok(schedule) = cron::Schedule::from_str(&schedule) else {
        warn!(cron = %schedule, "invalid vacuum_schedule; VACUUM will not run");
        return;
    };
    loop {
        let now = chrono::Local::now();
        match schedule.after(&now).next() {
            Some(next) => {
                let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(delay).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
            None => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
    }
}

/// Run a scheduled VACUUM, logging the result.
pub async fn run_scheduled_vacuum(store: &Store) {
    match store.vacuum_raw().await {
        Ok(()) => info!("vacuum complete"),
        Err(e) => warn!(error = %e, "vacuum failed"),
    }
}
