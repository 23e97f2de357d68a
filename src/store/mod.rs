// SQLite store for one monitored host: `gpu_info_<name>.db` holds raw per-tick rows,
// `gpu_history_<name>.db` holds 30s rollups. Both files run in WAL mode so readers see
// either all of a committed rollup or none of it.

mod schema;

pub use schema::Table;

use crate::models::{DeviceHistory, RawDeviceSample, RawUserSample, SeriesKey, UserHistory};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            max_connections: 4,
        }
    }
}

/// One re-bucketed group of device history rows. Memory stays in bytes here.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBucket {
    pub gpu_index: u32,
    pub bucket: i64,
    pub gpu_utilization_avg: f64,
    pub gpu_utilization_min: f64,
    pub gpu_utilization_max: f64,
    pub used_memory_avg: f64,
    pub used_memory_min: f64,
    pub used_memory_max: f64,
}

/// One re-bucketed group of user history rows. Memory stays in bytes here.
#[derive(Debug, Clone, PartialEq)]
pub struct UserBucket {
    pub key: SeriesKey,
    pub bucket: i64,
    pub gpu_utilization_avg: f64,
    pub gpu_utilization_min: f64,
    pub gpu_utilization_max: f64,
    pub used_memory_avg: f64,
    pub used_memory_min: f64,
    pub used_memory_max: f64,
}

/// Per-user sums of history averages over a range (bytes).
#[derive(Debug, Clone, PartialEq)]
pub struct UserSums {
    pub user: String,
    pub gpu_utilization_sum: f64,
    pub used_memory_sum: f64,
}

pub struct Store {
    raw: SqlitePool,
    history: SqlitePool,
}

pub fn raw_db_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("gpu_info_{}.db", name))
}

pub fn history_db_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("gpu_history_{}.db", name))
}

/// How a store's files are opened. Read-only pools never create files or change the journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

async fn open_pool(path: &Path, opts: &StoreOptions, access: Access) -> anyhow::Result<SqlitePool> {
    let base = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .busy_timeout(opts.busy_timeout);
    let connect = match access {
        Access::ReadWrite => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            base.create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        }
        Access::ReadOnly => base.read_only(true),
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(opts.max_connections)
        .connect_with(connect)
        .await?;
    Ok(pool)
}

impl Store {
    /// Open (creating if missing) the two database files for host `name` under `data_dir`.
    pub async fn open(data_dir: &Path, name: &str, opts: &StoreOptions) -> anyhow::Result<Self> {
        Self::open_with(data_dir, name, opts, Access::ReadWrite).await
    }

    /// Open existing database files for host `name` without write access.
    pub async fn open_read_only(
        data_dir: &Path,
        name: &str,
        opts: &StoreOptions,
    ) -> anyhow::Result<Self> {
        Self::open_with(data_dir, name, opts, Access::ReadOnly).await
    }

    async fn open_with(
        data_dir: &Path,
        name: &str,
        opts: &StoreOptions,
        access: Access,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            crate::config::is_valid_host_name(name),
            "invalid host name {:?}",
            name
        );
        Self::connect(
            &raw_db_path(data_dir, name),
            &history_db_path(data_dir, name),
            opts,
            access,
        )
        .await
    }

    async fn connect(
        raw_path: &Path,
        history_path: &Path,
        opts: &StoreOptions,
        access: Access,
    ) -> anyhow::Result<Self> {
        let raw = open_pool(raw_path, opts, access).await?;
        let history = open_pool(history_path, opts, access).await?;
        Ok(Self { raw, history })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        schema::init_raw_tables(&self.raw).await?;
        schema::init_history_tables(&self.history).await?;
        Ok(())
    }

    /// Insert one poll's worth of rows in a single transaction.
    #[instrument(skip(self, devices, users), fields(repo = "store", operation = "insert_samples", devices = devices.len(), users = users.len()))]
    pub async fn insert_samples(
        &self,
        devices: &[RawDeviceSample],
        users: &[RawUserSample],
    ) -> anyhow::Result<()> {
        if devices.is_empty() && users.is_empty() {
            return Ok(());
        }
        let mut tx = self.raw.begin().await?;
        for d in devices {
            sqlx::query(
                "INSERT INTO gpu_info (gpu_index, name, gpu_utilization, memory_utilization, total_memory, used_memory, free_memory, timestamp) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(d.gpu_index as i64)
            .bind(&d.name)
            .bind(d.gpu_utilization as i64)
            .bind(d.memory_utilization as i64)
            .bind(d.total_memory as i64)
            .bind(d.used_memory as i64)
            .bind(d.free_memory as i64)
            .bind(d.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        for u in users {
            sqlx::query(
                "INSERT INTO gpu_user_info (gpu_index, user, used_memory, gpu_utilization, timestamp) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(u.gpu_index as i64)
            .bind(&u.user)
            .bind(u.used_memory as i64)
            .bind(u.gpu_utilization)
            .bind(u.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Raw device rows with timestamp in (after, until]. Order: ascending by timestamp.
    pub async fn device_samples_in_window(
        &self,
        after: i64,
        until: i64,
    ) -> anyhow::Result<Vec<RawDeviceSample>> {
        let rows = sqlx::query(
            "SELECT gpu_index, name, gpu_utilization, memory_utilization, total_memory, used_memory, free_memory, timestamp
             FROM gpu_info WHERE timestamp > $1 AND timestamp <= $2 ORDER BY timestamp ASC, gpu_index ASC",
        )
        .bind(after)
        .bind(until)
        .fetch_all(&self.raw)
        .await?;
        rows.iter().map(parse_device_sample).collect()
    }

    /// Raw user rows with timestamp in (after, until]. Order: ascending by timestamp.
    pub async fn user_samples_in_window(
        &self,
        after: i64,
        until: i64,
    ) -> anyhow::Result<Vec<RawUserSample>> {
        let rows = sqlx::query(
            "SELECT gpu_index, user, used_memory, gpu_utilization, timestamp
             FROM gpu_user_info WHERE timestamp > $1 AND timestamp <= $2 ORDER BY timestamp ASC, gpu_index ASC",
        )
        .bind(after)
        .bind(until)
        .fetch_all(&self.raw)
        .await?;
        rows.iter().map(parse_user_sample).collect()
    }

    /// Write one period's rollup rows atomically: all of them or none.
    #[instrument(skip(self, devices, users), fields(repo = "store", operation = "save_rollup", devices = devices.len(), users = users.len()))]
    pub async fn save_rollup(
        &self,
        devices: &[DeviceHistory],
        users: &[UserHistory],
    ) -> anyhow::Result<()> {
        let mut tx = self.history.begin().await?;
        for d in devices {
            sqlx::query(
                r#"
                INSERT INTO gpu_history
                (gpu_index, gpu_utilization, gpu_utilization_max, gpu_utilization_min,
                 used_memory, used_memory_max, used_memory_min, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(d.gpu_index as i64)
            .bind(d.gpu_utilization_avg)
            .bind(d.gpu_utilization_max)
            .bind(d.gpu_utilization_min)
            .bind(d.used_memory_avg)
            .bind(d.used_memory_max)
            .bind(d.used_memory_min)
            .bind(d.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        for u in users {
            sqlx::query(
                r#"
                INSERT INTO gpu_user_history
                (gpu_index, user, used_memory, used_memory_max, used_memory_min,
                 gpu_utilization, gpu_utilization_max, gpu_utilization_min, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(u.gpu_index as i64)
            .bind(&u.user)
            .bind(u.used_memory_avg)
            .bind(u.used_memory_max)
            .bind(u.used_memory_min)
            .bind(u.gpu_utilization_avg)
            .bind(u.gpu_utilization_max)
            .bind(u.gpu_utilization_min)
            .bind(u.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete raw rows (device and user) with timestamp < cutoff. Returns rows removed.
    #[instrument(skip(self), fields(repo = "store", operation = "delete_raw_before"))]
    pub async fn delete_raw_before(&self, cutoff: i64) -> anyhow::Result<u64> {
        let mut tx = self.raw.begin().await?;
        let mut removed = 0;
        for table in Table::RAW {
            let r = sqlx::query(&format!(
                "DELETE FROM {} WHERE timestamp < $1",
                table.name()
            ))
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            removed += r.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Reclaim space in the raw file after deletes.
    #[instrument(skip(self), fields(repo = "store", operation = "vacuum_raw"))]
    pub async fn vacuum_raw(&self) -> anyhow::Result<()> {
        sqlx::query("VACUUM").execute(&self.raw).await?;
        Ok(())
    }

    pub async fn count_rows(&self, table: Table) -> anyhow::Result<i64> {
        let pool = self.pool_for(table);
        let n = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(pool)
            .await?;
        Ok(n)
    }

    /// Rows of `table` with timestamp < cutoff.
    pub async fn count_rows_before(&self, table: Table, cutoff: i64) -> anyhow::Result<i64> {
        let pool = self.pool_for(table);
        let n = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE timestamp < $1",
            table.name()
        ))
        .bind(cutoff)
        .fetch_one(pool)
        .await?;
        Ok(n)
    }

    fn pool_for(&self, table: Table) -> &SqlitePool {
        match table {
            Table::DeviceRaw | Table::UserRaw => &self.raw,
            Table::DeviceHistory | Table::UserHistory => &self.history,
        }
    }

    /// Device rows at the most recent raw timestamp.
    #[instrument(skip(self), fields(repo = "store", operation = "latest_devices"))]
    pub async fn latest_devices(&self) -> anyhow::Result<Vec<RawDeviceSample>> {
        let rows = sqlx::query(
            "SELECT gpu_index, name, gpu_utilization, memory_utilization, total_memory, used_memory, free_memory, timestamp
             FROM gpu_info WHERE timestamp = (SELECT MAX(timestamp) FROM gpu_info) ORDER BY gpu_index ASC",
        )
        .fetch_all(&self.raw)
        .await?;
        rows.iter().map(parse_device_sample).collect()
    }

    /// Raw device rows in [start, end]. Order: ascending by timestamp.
    #[instrument(skip(self), fields(repo = "store", operation = "device_samples_between"))]
    pub async fn device_samples_between(
        &self,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<RawDeviceSample>> {
        self.device_samples_in_window(start.saturating_sub(1), end).await
    }

    /// Raw user rows in [start, end]. Order: ascending by timestamp.
    #[instrument(skip(self), fields(repo = "store", operation = "user_samples_between"))]
    pub async fn user_samples_between(
        &self,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<RawUserSample>> {
        self.user_samples_in_window(start.saturating_sub(1), end).await
    }

    /// Earliest and latest device history timestamps; `None` when no history exists.
    pub async fn history_bounds(&self) -> anyhow::Result<Option<(i64, i64)>> {
        let row = sqlx::query("SELECT MIN(timestamp) AS lo, MAX(timestamp) AS hi FROM gpu_history")
            .fetch_one(&self.history)
            .await?;
        let lo: Option<i64> = row.try_get("lo")?;
        let hi: Option<i64> = row.try_get("hi")?;
        Ok(lo.zip(hi))
    }

    /// Device history in [start, end), re-bucketed to `interval` seconds: averages are
    /// re-averaged, min is the min of mins and max the max of maxes.
    #[instrument(skip(self), fields(repo = "store", operation = "device_history_buckets"))]
    pub async fn device_history_buckets(
        &self,
        start: i64,
        end: i64,
        interval: i64,
    ) -> anyhow::Result<Vec<DeviceBucket>> {
        anyhow::ensure!(interval > 0, "interval must be > 0, got {}", interval);
        let rows = sqlx::query(
            r#"
            SELECT gpu_index,
                   timestamp - (timestamp % $3) AS bucket,
                   AVG(gpu_utilization) AS util_avg,
                   MIN(gpu_utilization_min) AS util_min,
                   MAX(gpu_utilization_max) AS util_max,
                   AVG(used_memory) AS mem_avg,
                   MIN(used_memory_min) AS mem_min,
                   MAX(used_memory_max) AS mem_max
            FROM gpu_history
            WHERE timestamp >= $1 AND timestamp < $2
            GROUP BY gpu_index, bucket
            ORDER BY bucket ASC, gpu_index ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(interval)
        .fetch_all(&self.history)
        .await?;

        rows.iter()
            .map(|row| -> anyhow::Result<DeviceBucket> {
                Ok(DeviceBucket {
                    gpu_index: row.try_get::<i64, _>("gpu_index")? as u32,
                    bucket: row.try_get("bucket")?,
                    gpu_utilization_avg: row.try_get("util_avg")?,
                    gpu_utilization_min: row.try_get("util_min")?,
                    gpu_utilization_max: row.try_get("util_max")?,
                    used_memory_avg: row.try_get("mem_avg")?,
                    used_memory_min: row.try_get("mem_min")?,
                    used_memory_max: row.try_get("mem_max")?,
                })
            })
            .collect()
    }

    /// User history in [start, end), re-bucketed per (user, device) like `device_history_buckets`.
    #[instrument(skip(self), fields(repo = "store", operation = "user_history_buckets"))]
    pub async fn user_history_buckets(
        &self,
        start: i64,
        end: i64,
        interval: i64,
    ) -> anyhow::Result<Vec<UserBucket>> {
        anyhow::ensure!(interval > 0, "interval must be > 0, got {}", interval);
        let rows = sqlx::query(
            r#"
            SELECT user, gpu_index,
                   timestamp - (timestamp % $3) AS bucket,
                   AVG(gpu_utilization) AS util_avg,
                   MIN(gpu_utilization_min) AS util_min,
                   MAX(gpu_utilization_max) AS util_max,
                   AVG(used_memory) AS mem_avg,
                   MIN(used_memory_min) AS mem_min,
                   MAX(used_memory_max) AS mem_max
            FROM gpu_user_history
            WHERE timestamp >= $1 AND timestamp < $2
            GROUP BY user, gpu_index, bucket
            ORDER BY bucket ASC, user ASC, gpu_index ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(interval)
        .fetch_all(&self.history)
        .await?;

        rows.iter()
            .map(|row| -> anyhow::Result<UserBucket> {
                Ok(UserBucket {
                    key: SeriesKey {
                        user: row.try_get("user")?,
                        gpu_index: row.try_get::<i64, _>("gpu_index")? as u32,
                    },
                    bucket: row.try_get("bucket")?,
                    gpu_utilization_avg: row.try_get("util_avg")?,
                    gpu_utilization_min: row.try_get("util_min")?,
                    gpu_utilization_max: row.try_get("util_max")?,
                    used_memory_avg: row.try_get("mem_avg")?,
                    used_memory_min: row.try_get("mem_min")?,
                    used_memory_max: row.try_get("mem_max")?,
                })
            })
            .collect()
    }

    /// Per-device (utilization avg, used memory avg in bytes) over [start, end).
    pub async fn device_means(&self, start: i64, end: i64) -> anyhow::Result<Vec<(u32, f64, f64)>> {
        let rows = sqlx::query(
            "SELECT gpu_index, AVG(gpu_utilization) AS util, AVG(used_memory) AS mem
             FROM gpu_history WHERE timestamp >= $1 AND timestamp < $2
             GROUP BY gpu_index ORDER BY gpu_index ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.history)
        .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<(u32, f64, f64)> {
                Ok((
                    row.try_get::<i64, _>("gpu_index")? as u32,
                    row.try_get("util")?,
                    row.try_get("mem")?,
                ))
            })
            .collect()
    }

    /// Per-user sums of utilization/memory averages over [start, end), across devices.
    pub async fn user_sums(&self, start: i64, end: i64) -> anyhow::Result<Vec<UserSums>> {
        let rows = sqlx::query(
            "SELECT user, SUM(gpu_utilization) AS util, SUM(used_memory) AS mem
             FROM gpu_user_history WHERE timestamp >= $1 AND timestamp < $2
             GROUP BY user ORDER BY user ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.history)
        .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<UserSums> {
                Ok(UserSums {
                    user: row.try_get("user")?,
                    gpu_utilization_sum: row.try_get("util")?,
                    used_memory_sum: row.try_get("mem")?,
                })
            })
            .collect()
    }

    /// Number of distinct rollup periods recorded in [start, end).
    pub async fn history_period_count(&self, start: i64, end: i64) -> anyhow::Result<i64> {
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT timestamp) FROM gpu_history WHERE timestamp >= $1 AND timestamp < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.history)
        .await?;
        Ok(n)
    }

    /// Device history rows in [start, end), unbucketed.
    pub async fn device_history_in(
        &self,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<DeviceHistory>> {
        let rows = sqlx::query(
            "SELECT gpu_index, gpu_utilization, gpu_utilization_min, gpu_utilization_max,
                    used_memory, used_memory_min, used_memory_max, timestamp
             FROM gpu_history WHERE timestamp >= $1 AND timestamp < $2
             ORDER BY timestamp ASC, gpu_index ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.history)
        .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<DeviceHistory> {
                Ok(DeviceHistory {
                    gpu_index: row.try_get::<i64, _>("gpu_index")? as u32,
                    timestamp: row.try_get("timestamp")?,
                    gpu_utilization_avg: row.try_get("gpu_utilization")?,
                    gpu_utilization_min: row.try_get("gpu_utilization_min")?,
                    gpu_utilization_max: row.try_get("gpu_utilization_max")?,
                    used_memory_avg: row.try_get("used_memory")?,
                    used_memory_min: row.try_get("used_memory_min")?,
                    used_memory_max: row.try_get("used_memory_max")?,
                })
            })
            .collect()
    }

    /// User history rows in [start, end), unbucketed.
    pub async fn user_history_in(&self, start: i64, end: i64) -> anyhow::Result<Vec<UserHistory>> {
        let rows = sqlx::query(
            "SELECT gpu_index, user, used_memory, used_memory_min, used_memory_max,
                    gpu_utilization, gpu_utilization_min, gpu_utilization_max, timestamp
             FROM gpu_user_history WHERE timestamp >= $1 AND timestamp < $2
             ORDER BY timestamp ASC, gpu_index ASC, user ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.history)
        .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<UserHistory> {
                Ok(UserHistory {
                    gpu_index: row.try_get::<i64, _>("gpu_index")? as u32,
                    user: row.try_get("user")?,
                    timestamp: row.try_get("timestamp")?,
                    used_memory_avg: row.try_get("used_memory")?,
                    used_memory_min: row.try_get("used_memory_min")?,
                    used_memory_max: row.try_get("used_memory_max")?,
                    gpu_utilization_avg: row.try_get("gpu_utilization")?,
                    gpu_utilization_min: row.try_get("gpu_utilization_min")?,
                    gpu_utilization_max: row.try_get("gpu_utilization_max")?,
                })
            })
            .collect()
    }
}

fn parse_device_sample(row: &SqliteRow) -> anyhow::Result<RawDeviceSample> {
    Ok(RawDeviceSample {
        gpu_index: row.try_get::<i64, _>("gpu_index")? as u32,
        name: row.try_get("name")?,
        gpu_utilization: row.try_get::<i64, _>("gpu_utilization")? as u32,
        memory_utilization: row.try_get::<i64, _>("memory_utilization")? as u32,
        total_memory: row.try_get::<i64, _>("total_memory")? as u64,
        used_memory: row.try_get::<i64, _>("used_memory")? as u64,
        free_memory: row.try_get::<i64, _>("free_memory")? as u64,
        timestamp: row.try_get("timestamp")?,
    })
}

fn parse_user_sample(row: &SqliteRow) -> anyhow::Result<RawUserSample> {
    Ok(RawUserSample {
        gpu_index: row.try_get::<i64, _>("gpu_index")? as u32,
        user: row.try_get("user")?,
        used_memory: row.try_get::<i64, _>("used_memory")? as u64,
        gpu_utilization: row.try_get("gpu_utilization")?,
        timestamp: row.try_get("timestamp")?,
    })
}
