use crate::domain::sector::normalize_sector_id;
use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily-populated map of per-sector async mutexes.
///
/// Entries are never removed, so every call for the same sector id returns the
/// same mutex for the lifetime of the registry. Owned by a long-lived service
/// instance; two registries never share locks.
#[derive(Debug, Default)]
pub struct SectorLockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SectorLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, sector_id: &str) -> Arc<AsyncMutex<()>> {
        let key = normalize_sector_id(sector_id);
        let mut locks = self.locks.lock();
        locks.entry(key).or_default().clone()
    }

    /// Waits for and holds the sector's mutex until the guard drops.
    pub async fn acquire(&self, sector_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(sector_id).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Lease rows live in `run_locks`, so the guard holds across every process
// sharing the database file. An expired row is taken over, which covers a
// holder that crashed without releasing.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(25);
const REFRESH_LEASE: &str = "snapshot_refresh";
const REFRESH_LEASE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Named database-backed lock with an expiry.
#[derive(Debug, Clone)]
pub struct DbLease {
    pool: SqlitePool,
    name: String,
    ttl: Duration,
}

impl DbLease {
    pub fn new(pool: SqlitePool, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pool,
            name: name.into(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` when an unexpired lease is held elsewhere.
    pub async fn try_acquire(&self) -> anyhow::Result<Option<LeaseGuard>> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let res = sqlx::query(
            "INSERT INTO run_locks (name, token, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET token = excluded.token, \
             acquired_at = excluded.acquired_at, expires_at = excluded.expires_at \
             WHERE run_locks.expires_at <= excluded.acquired_at",
        )
        .bind(&self.name)
        .bind(&token)
        .bind(now)
        .bind(now.saturating_add(ttl_ms))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to acquire lease (name={})", self.name))?;

        if res.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(LeaseGuard {
            pool: self.pool.clone(),
            name: self.name.clone(),
            token,
            released: false,
        }))
    }

    /// Polls until the lease is free or `timeout` passes.
    pub async fn acquire(&self, timeout: Duration) -> anyhow::Result<LeaseGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_acquire().await? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out after {timeout:?} waiting for lease {}", self.name);
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    /// True while an unexpired lease row exists.
    pub async fn is_held(&self) -> anyhow::Result<bool> {
        let held: Option<(String,)> =
            sqlx::query_as("SELECT token FROM run_locks WHERE name = ?1 AND expires_at > ?2")
                .bind(&self.name)
                .bind(Utc::now().timestamp_millis())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to read lease (name={})", self.name))?;
        Ok(held.is_some())
    }
}

/// Held lease. Call [`LeaseGuard::release`]; dropping it releases in the
/// background when a runtime is available, otherwise the row expires.
#[derive(Debug)]
pub struct LeaseGuard {
    pool: SqlitePool,
    name: String,
    token: String,
    released: bool,
}

impl LeaseGuard {
    pub async fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        release_lease(&self.pool, &self.name, &self.token).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (pool, name, token) = (self.pool.clone(), self.name.clone(), self.token.clone());
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = release_lease(&pool, &name, &token).await {
                    tracing::warn!(error = ?err, lease = %name, "lease release failed");
                }
            });
        }
    }
}

async fn release_lease(pool: &SqlitePool, name: &str, token: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM run_locks WHERE name = ?1 AND token = ?2")
        .bind(name)
        .bind(token)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release lease (name={name})"))?;
    Ok(())
}

/// Guard against overlapping bulk refresh runs, in this process or another
/// one on the same database.
#[derive(Debug, Clone)]
pub struct RunGuard {
    lease: DbLease,
}

impl RunGuard {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            lease: DbLease::new(pool, REFRESH_LEASE, REFRESH_LEASE_TTL),
        }
    }

    /// `None` when another run already holds the guard.
    pub async fn try_acquire(&self) -> anyhow::Result<Option<LeaseGuard>> {
        self.lease.try_acquire().await
    }
}
