// Table definitions. Raw tables live in the realtime file, history tables in the history file.
// Table names come only from `Table`; nothing caller-supplied is ever spliced into SQL.

use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    DeviceRaw,
    UserRaw,
    DeviceHistory,
    UserHistory,
}

impl Table {
    pub const RAW: [Table; 2] = [Table::DeviceRaw, Table::UserRaw];
    pub const HISTORY: [Table; 2] = [Table::DeviceHistory, Table::UserHistory];

    pub const fn name(self) -> &'static str {
        match self {
            Table::DeviceRaw => "gpu_info",
            Table::UserRaw => "gpu_user_info",
            Table::DeviceHistory => "gpu_history",
            Table::UserHistory => "gpu_user_history",
        }
    }
}

pub(super) async fn init_raw_tables(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpu_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gpu_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            gpu_utilization INTEGER NOT NULL,
            memory_utilization INTEGER NOT NULL,
            total_memory INTEGER NOT NULL,
            used_memory INTEGER NOT NULL,
            free_memory INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpu_user_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gpu_index INTEGER NOT NULL,
            user TEXT NOT NULL,
            used_memory INTEGER NOT NULL,
            gpu_utilization REAL NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_gpu_timestamp ON gpu_info (timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_gpu_index ON gpu_info (gpu_index)",
        "CREATE INDEX IF NOT EXISTS idx_user_timestamp ON gpu_user_info (timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_user_gpu_index ON gpu_user_info (gpu_index)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

pub(super) async fn init_history_tables(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpu_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gpu_index INTEGER NOT NULL,
            gpu_utilization REAL NOT NULL,
            gpu_utilization_max REAL NOT NULL,
            gpu_utilization_min REAL NOT NULL,
            used_memory REAL NOT NULL,
            used_memory_max REAL NOT NULL,
            used_memory_min REAL NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gpu_user_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gpu_index INTEGER NOT NULL,
            user TEXT NOT NULL,
            used_memory REAL NOT NULL,
            used_memory_max REAL NOT NULL,
            used_memory_min REAL NOT NULL,
            gpu_utilization REAL NOT NULL,
            gpu_utilization_max REAL NOT NULL,
            gpu_utilization_min REAL NOT NULL,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per device (and device+user) per period: history rows are write-once.
    for ddl in [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_gpu_history_period ON gpu_history (timestamp, gpu_index)",
        "CREATE INDEX IF NOT EXISTS idx_gpu_history_gpu_index ON gpu_history (gpu_index)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_user_history_period ON gpu_user_history (timestamp, gpu_index, user)",
        "CREATE INDEX IF NOT EXISTS idx_user_history_gpu_index ON gpu_user_history (gpu_index)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
