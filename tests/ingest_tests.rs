// Ingestion tests: raw writes, arrival-driven rollups, retention after rollup

mod common;

use common::*;
use gpuwatch::ingest::{IngestOutcome, Ingestor, RollupSchedule};
use gpuwatch::retention::{Retention, VacuumPolicy};
use gpuwatch::store::Table;

fn ingestor(store: std::sync::Arc<gpuwatch::store::Store>) -> Ingestor {
    Ingestor::new(
        store,
        RollupSchedule::new(30),
        Retention::new(3600, VacuumPolicy::AfterPrune),
        30,
    )
}

fn busy_gpu(util: u32) -> Vec<gpuwatch::models::GpuInfo> {
    vec![
        gpu(
            0,
            util,
            4 * GIB,
            vec![process(11, "alice", 3 * GIB), process(12, "bob", GIB)],
        ),
        gpu(1, 0, 0, vec![]),
    ]
}

#[tokio::test]
async fn ingest_rolls_up_once_a_period_has_elapsed() {
    let (_dir, store) = temp_store().await;
    let mut ing = ingestor(store.clone());

    let t0 = MAY_2024;
    for ts in t0..t0 + 29 {
        assert_eq!(ing.ingest(&busy_gpu(80), at(ts)).await, IngestOutcome::Stored);
    }
    assert_eq!(
        ing.ingest(&busy_gpu(80), at(t0 + 29)).await,
        IngestOutcome::StoredAndRolledUp { period_end: t0 + 29 }
    );
    assert_eq!(ing.last_rollup(), Some(t0 + 29));

    assert_eq!(store.count_rows(Table::DeviceRaw).await.unwrap(), 60);
    assert_eq!(store.count_rows(Table::UserRaw).await.unwrap(), 60);

    let devices = store.device_history_in(0, i64::MAX).await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].gpu_utilization_avg, 80.0);
    assert_eq!(devices[1].gpu_utilization_avg, 0.0);

    let users = store.user_history_in(0, i64::MAX).await.unwrap();
    assert_eq!(users.len(), 2);
    let alice = users.iter().find(|u| u.user == "alice").unwrap();
    assert_eq!(alice.gpu_utilization_avg, 40.0);
    assert_eq!(alice.used_memory_avg, 3.0 * GIB as f64);
}

#[tokio::test]
async fn stalled_sender_stalls_rollups() {
    let (_dir, store) = temp_store().await;
    let mut ing = ingestor(store.clone());

    let t0 = MAY_2024;
    ing.ingest(&busy_gpu(10), at(t0)).await;
    // Two hours of silence: nothing rolls up until the next sample arrives.
    assert_eq!(store.count_rows(Table::DeviceHistory).await.unwrap(), 0);

    let resumed = t0 + 7200;
    let outcome = ing.ingest(&busy_gpu(90), at(resumed)).await;
    assert_eq!(outcome, IngestOutcome::StoredAndRolledUp { period_end: resumed });

    // Only the resumed sample falls in (resumed - 30, resumed].
    let devices = store.device_history_in(0, i64::MAX).await.unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d.timestamp == resumed));
    assert_eq!(devices[0].gpu_utilization_avg, 90.0);

    // The stale sample is past the retention horizon and was pruned after the rollup.
    assert_eq!(store.count_rows(Table::DeviceRaw).await.unwrap(), 2);
    assert_eq!(
        store
            .count_rows_before(Table::DeviceRaw, resumed - 3600)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn clock_going_backwards_triggers_a_rollup() {
    let (_dir, store) = temp_store().await;
    let mut ing = Ingestor::new(
        store.clone(),
        RollupSchedule::starting_at(30, MAY_2024),
        Retention::new(3600, VacuumPolicy::AfterPrune),
        30,
    );
    let outcome = ing.ingest(&busy_gpu(50), at(MAY_2024 - 600)).await;
    assert_eq!(
        outcome,
        IngestOutcome::StoredAndRolledUp {
            period_end: MAY_2024 - 600
        }
    );
    assert_eq!(store.count_rows(Table::DeviceHistory).await.unwrap(), 2);
}

#[tokio::test]
async fn failed_rollup_still_runs_retention_and_keeps_ingesting() {
    let (_dir, store) = temp_store().await;
    let t0 = MAY_2024;
    // Old raw rows that retention should remove, and a history row that makes the rollup collide.
    store
        .insert_samples(&[device_sample(0, 1, 0, t0 - 7200)], &[])
        .await
        .unwrap();
    store
        .save_rollup(&[device_history(0, t0 + 30, 1.0, 0.0)], &[])
        .await
        .unwrap();

    let mut ing = Ingestor::new(
        store.clone(),
        RollupSchedule::starting_at(30, t0),
        Retention::new(3600, VacuumPolicy::AfterPrune),
        30,
    );
    ing.ingest(&busy_gpu(50), at(t0 + 30)).await;

    assert_eq!(
        store
            .count_rows_before(Table::DeviceRaw, t0 + 30 - 3600)
            .await
            .unwrap(),
        0
    );
    // Only the pre-existing row: the failed period wrote nothing.
    assert_eq!(store.count_rows(Table::DeviceHistory).await.unwrap(), 1);
    assert_eq!(store.count_rows(Table::UserHistory).await.unwrap(), 0);

    assert_eq!(
        ing.ingest(&busy_gpu(50), at(t0 + 31)).await,
        IngestOutcome::Stored
    );
    assert_eq!(store.count_rows(Table::DeviceRaw).await.unwrap(), 4);
}
