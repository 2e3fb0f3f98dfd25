pub mod bars;
pub mod failures;
pub mod jobs;
pub mod lock;
pub mod metrics;
pub mod sectors;
pub mod snapshots;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub use bars::BarStore;
pub use failures::{FailureRecord, FailureTracker};
pub use lock::{DbLease, LeaseGuard, RunGuard, SectorLockRegistry};

const BUSY_TIMEOUT_SECS: u64 = 10;

/// Opens the durable store. Accepts either a `sqlite:` URL or a plain file path.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let opts = if database_url.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid DATABASE_URL: {database_url}"))?
    } else {
        SqliteConnectOptions::new().filename(database_url)
    };
    connect_with(opts).await
}

pub async fn open(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    let pool = connect_with(SqliteConnectOptions::new().filename(path)).await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn connect_with(opts: SqliteConnectOptions) -> anyhow::Result<SqlitePool> {
    let opts = opts
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .context("failed to open sqlite database")
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open(&dir.path().join("market.db")).await.unwrap();
    (pool, dir)
}
