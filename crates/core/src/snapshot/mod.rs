//! Materialized snapshot file: full writes, single-sector patches and
//! checksum-verified reads.

pub mod atomic;
pub mod error;

pub use atomic::{read_verified, sha256_hex, AtomicWriter, RenameFn};
pub use error::SnapshotError;

use crate::config::SnapshotConfig;
use crate::domain::sector::SectorRollup;
use crate::domain::snapshot::{SnapshotPayload, TickerMetricRecord};
use crate::storage::snapshots as archive;
use crate::storage::{DbLease, LeaseGuard};
use chrono::Utc;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

const WRITE_LEASE: &str = "snapshot_write";
const WRITE_LEASE_TTL: Duration = Duration::from_secs(120);
const WRITE_LEASE_WAIT: Duration = Duration::from_secs(60);

/// Owner of the snapshot files. Every write path (full or patch) runs under
/// one write lock; readers go straight to disk.
///
/// The lock is an in-process mutex plus, once a database is attached, the
/// `snapshot_write` lease, so stores in other processes serialize with this
/// one.
#[derive(Debug)]
pub struct SnapshotStore {
    config: SnapshotConfig,
    writer: AtomicWriter,
    archive: Option<SqlitePool>,
    write_lock: Mutex<()>,
    write_lease: Option<DbLease>,
}

/// Both halves of the write lock; the lease is released explicitly.
struct WriteGuard<'a> {
    _local: MutexGuard<'a, ()>,
    lease: Option<LeaseGuard>,
}

impl WriteGuard<'_> {
    async fn release(self) {
        if let Some(lease) = self.lease {
            if let Err(err) = lease.release().await {
                tracing::warn!(error = ?err, "failed to release snapshot write lease");
            }
        }
    }
}

impl SnapshotStore {
    pub fn new(config: SnapshotConfig) -> Self {
        let writer = AtomicWriter::new(config.scratch_dir());
        Self {
            config,
            writer,
            archive: None,
            write_lock: Mutex::new(()),
            write_lease: None,
        }
    }

    /// Also upsert every written payload into the `sector_snapshot` table and
    /// take the database write lease around every write.
    pub fn with_archive(mut self, pool: SqlitePool) -> Self {
        self.write_lease = Some(DbLease::new(pool.clone(), WRITE_LEASE, WRITE_LEASE_TTL));
        self.archive = Some(pool);
        self
    }

    pub fn with_writer(mut self, writer: AtomicWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn latest_path(&self) -> PathBuf {
        self.config.latest_path()
    }

    /// Replaces the latest snapshot and writes the dated copy for its date.
    pub async fn write_full(&self, payload: &SnapshotPayload) -> Result<(), SnapshotError> {
        let mut payload = payload.clone();
        payload.recount();
        let bytes = encode(&payload)?;

        let guard = self.lock_writes().await?;
        let latest = self.config.latest_path();
        let dated = self.config.dated_path(payload.snapshot_date);
        let targets = vec![
            (latest.clone(), self.config.checksum_path(&latest)),
            (dated.clone(), self.config.checksum_path(&dated)),
        ];
        let written = self.write_targets(targets, bytes).await;
        if written.is_ok() {
            self.archive(&payload).await;
        }
        guard.release().await;
        written?;

        tracing::info!(
            path = %latest.display(),
            snapshot_date = %payload.snapshot_date,
            sectors = payload.sectors_count,
            members = payload.members_count,
            "snapshot written"
        );
        Ok(())
    }

    /// Read-modify-write of one sector entry in the latest snapshot.
    ///
    /// The sector with the same id is replaced (or appended), counts are
    /// re-derived from the whole list, active member rows are merged into
    /// `ticker_metrics` and `generated_at` is bumped. Nothing else changes.
    pub async fn patch(&self, rollup: SectorRollup) -> Result<SnapshotPayload, SnapshotError> {
        let guard = self.lock_writes().await?;
        let patched = self.patch_locked(rollup).await;
        guard.release().await;
        patched
    }

    async fn patch_locked(&self, rollup: SectorRollup) -> Result<SnapshotPayload, SnapshotError> {
        let latest = self.config.latest_path();
        let checksum = self.config.checksum_path(&latest);

        let mut payload = self.read_payload(latest.clone(), checksum.clone()).await?;
        let sector_id = rollup.id.clone();

        for detail in rollup.members_detail.iter().filter(|d| !d.inactive) {
            let incoming = TickerMetricRecord::from(detail);
            payload
                .ticker_metrics
                .entry(detail.ticker.clone())
                .and_modify(|existing| merge_record(existing, &incoming))
                .or_insert(incoming);
        }
        let replaced = payload.upsert_sector(rollup);
        payload.recount();
        let now = Utc::now();
        payload.generated_at = if now > payload.generated_at {
            now
        } else {
            payload.generated_at + chrono::Duration::microseconds(1)
        };

        let bytes = encode(&payload)?;
        self.write_targets(vec![(latest, checksum)], bytes).await?;
        self.archive(&payload).await;

        tracing::info!(sector = %sector_id, replaced, sectors = payload.sectors_count, "snapshot patched");
        Ok(payload)
    }

    async fn lock_writes(&self) -> Result<WriteGuard<'_>, SnapshotError> {
        let local = self.write_lock.lock().await;
        let lease = match &self.write_lease {
            Some(lease) => Some(
                lease
                    .acquire(WRITE_LEASE_WAIT)
                    .await
                    .map_err(|e| SnapshotError::Lock(format!("{e:#}")))?,
            ),
            None => None,
        };
        Ok(WriteGuard {
            _local: local,
            lease,
        })
    }

    /// Latest payload, after checksum verification.
    pub async fn load_latest(&self) -> Result<SnapshotPayload, SnapshotError> {
        let latest = self.config.latest_path();
        let checksum = self.config.checksum_path(&latest);
        self.read_payload(latest, checksum).await
    }

    async fn read_payload(
        &self,
        path: PathBuf,
        checksum: PathBuf,
    ) -> Result<SnapshotPayload, SnapshotError> {
        let bytes = tokio::task::spawn_blocking(move || read_verified(&path, &checksum))
            .await
            .map_err(join_error)??;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_targets(
        &self,
        targets: Vec<(PathBuf, PathBuf)>,
        bytes: Vec<u8>,
    ) -> Result<(), SnapshotError> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            for (target, checksum) in &targets {
                writer.write_with_checksum(target, checksum, &bytes)?;
            }
            Ok::<_, SnapshotError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn archive(&self, payload: &SnapshotPayload) {
        let Some(pool) = &self.archive else {
            return;
        };
        // The file is the source of truth; a failed archive row is only logged.
        if let Err(err) = archive::upsert_snapshot(pool, payload).await {
            tracing::warn!(error = ?err, snapshot_date = %payload.snapshot_date, "snapshot archive upsert failed");
        }
    }
}

/// Pretty JSON with keys sorted at every level.
pub fn encode(payload: &SnapshotPayload) -> Result<Vec<u8>, SnapshotError> {
    let value = serde_json::to_value(payload)?;
    Ok(serde_json::to_vec_pretty(&value)?)
}

/// Overlays the defined fields of `incoming` on `existing`.
fn merge_record(existing: &mut TickerMetricRecord, incoming: &TickerMetricRecord) {
    fn overlay(slot: &mut Option<f64>, value: Option<f64>) {
        if value.is_some() {
            *slot = value;
        }
    }

    if incoming.last_date.is_some() {
        existing.last_date = incoming.last_date;
    }
    overlay(&mut existing.dollar_vol_today, incoming.dollar_vol_today);
    overlay(&mut existing.avg_dollar_vol10, incoming.avg_dollar_vol10);
    overlay(&mut existing.rel_vol10, incoming.rel_vol10);
    overlay(&mut existing.change1d, incoming.change1d);
    overlay(&mut existing.change5d, incoming.change5d);
    overlay(&mut existing.dollar_vol5d, incoming.dollar_vol5d);
    overlay(&mut existing.adr20_pct, incoming.adr20_pct);
    overlay(&mut existing.ytd_gain_to_high_pct, incoming.ytd_gain_to_high_pct);
    overlay(&mut existing.ytd_off_high_pct, incoming.ytd_off_high_pct);
    overlay(&mut existing.ralph_score, incoming.ralph_score);
    if !incoming.history.is_empty() {
        existing.history = incoming.history.clone();
    }
}

fn join_error(err: tokio::task::JoinError) -> SnapshotError {
    SnapshotError::io(
        PathBuf::new(),
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
    )
}
