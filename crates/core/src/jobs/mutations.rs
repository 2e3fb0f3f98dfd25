use super::{JobError, JobQueue};
use crate::domain::bar::normalize_symbol;
use crate::domain::sector::{normalize_sector_id, SectorDefinition};
use crate::pipeline::{Pipeline, SymbolOutcome};
use crate::storage::{sectors, SectorLockRegistry};
use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

/// Job factories for sector edits. Membership changes are written before the
/// job is queued; the job itself recomputes the sector under its lock and
/// patches the snapshot.
#[derive(Clone)]
pub struct SectorMutations {
    pipeline: Pipeline,
    queue: Arc<JobQueue>,
    locks: Arc<SectorLockRegistry>,
}

impl SectorMutations {
    pub fn new(pipeline: Pipeline, queue: Arc<JobQueue>, locks: Arc<SectorLockRegistry>) -> Self {
        Self {
            pipeline,
            queue,
            locks,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Recompute and patch one sector without touching its membership.
    pub async fn enqueue_sector_patch(&self, sector_id: &str) -> Result<String, JobError> {
        let sector_id = normalize_sector_id(sector_id);
        let pipeline = self.pipeline.clone();
        let locks = self.locks.clone();
        let key = sector_id.clone();

        self.queue
            .enqueue(
                "sector_patch",
                json!({ "sector_id": sector_id }),
                patch_sector(pipeline, locks, key),
            )
            .await
    }

    pub async fn enqueue_add_ticker(&self, sector_id: &str, symbol: &str) -> Result<String, JobError> {
        let sector_id = normalize_sector_id(sector_id);
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(anyhow::anyhow!("ticker symbol required").into());
        }
        let added = sectors::add_member(self.pipeline.pool(), &sector_id, &symbol).await?;
        if !added {
            tracing::debug!(sector = %sector_id, %symbol, "already a member; recomputing anyway");
        }

        let pipeline = self.pipeline.clone();
        let locks = self.locks.clone();
        let (key, ticker) = (sector_id.clone(), symbol.clone());
        self.queue
            .enqueue(
                "sector_add_ticker",
                json!({ "sector_id": sector_id, "symbol": symbol }),
                add_ticker(pipeline, locks, key, ticker),
            )
            .await
    }

    pub async fn enqueue_remove_ticker(
        &self,
        sector_id: &str,
        symbol: &str,
    ) -> Result<String, JobError> {
        let sector_id = normalize_sector_id(sector_id);
        let symbol = normalize_symbol(symbol);
        let removed = sectors::remove_member(self.pipeline.pool(), &sector_id, &symbol).await?;
        if !removed {
            tracing::debug!(sector = %sector_id, %symbol, "not a member; recomputing anyway");
        }

        let pipeline = self.pipeline.clone();
        let locks = self.locks.clone();
        let (key, ticker) = (sector_id.clone(), symbol.clone());
        self.queue
            .enqueue(
                "sector_remove_ticker",
                json!({ "sector_id": sector_id, "symbol": symbol }),
                remove_ticker(pipeline, locks, key, ticker),
            )
            .await
    }

    /// Persists the definition (replacing membership if the id exists), then
    /// queues seeding of every member followed by a patch.
    pub async fn enqueue_create_sector(&self, sector: SectorDefinition) -> Result<String, JobError> {
        let sector = sector.normalized();
        if sector.id.is_empty() {
            return Err(anyhow::anyhow!("sector id required").into());
        }
        let stored = sectors::upsert_sector_definition(self.pipeline.pool(), &sector)
            .await
            .with_context(|| format!("persist sector {} failed", sector.id))?;

        let pipeline = self.pipeline.clone();
        let locks = self.locks.clone();
        let meta = json!({ "sector_id": stored.id, "members": stored.members.len() });
        self.queue
            .enqueue("sector_create", meta, create_sector(pipeline, locks, stored))
            .await
    }
}

async fn patch_sector(
    pipeline: Pipeline,
    locks: Arc<SectorLockRegistry>,
    sector_id: String,
) -> anyhow::Result<String> {
    let _guard = locks.acquire(&sector_id).await;
    pipeline.recompute_and_patch(&sector_id).await?;
    Ok(format!("patched {sector_id}"))
}

async fn add_ticker(
    pipeline: Pipeline,
    locks: Arc<SectorLockRegistry>,
    sector_id: String,
    symbol: String,
) -> anyhow::Result<String> {
    let _guard = locks.acquire(&sector_id).await;
    let outcome = pipeline
        .ensure_symbol_data(&symbol, Utc::now().date_naive())
        .await?;
    pipeline.recompute_and_patch(&sector_id).await?;
    Ok(format!("added {symbol} ({})", describe(&outcome)))
}

async fn remove_ticker(
    pipeline: Pipeline,
    locks: Arc<SectorLockRegistry>,
    sector_id: String,
    symbol: String,
) -> anyhow::Result<String> {
    let _guard = locks.acquire(&sector_id).await;
    pipeline.recompute_and_patch(&sector_id).await?;
    Ok(format!("removed {symbol}"))
}

async fn create_sector(
    pipeline: Pipeline,
    locks: Arc<SectorLockRegistry>,
    sector: SectorDefinition,
) -> anyhow::Result<String> {
    let _guard = locks.acquire(&sector.id).await;
    let today = Utc::now().date_naive();
    let mut seeded = 0;
    for symbol in &sector.members {
        if pipeline.ensure_symbol_data(symbol, today).await?.metric().is_some() {
            seeded += 1;
        }
    }
    pipeline.recompute_and_patch(&sector.id).await?;
    Ok(format!(
        "created {} ({seeded}/{} members with metrics)",
        sector.id,
        sector.members.len()
    ))
}

fn describe(outcome: &SymbolOutcome) -> &'static str {
    match outcome {
        SymbolOutcome::Computed(_) => "metrics computed",
        SymbolOutcome::Stale { .. } => "fetch failed, stored bars used",
        SymbolOutcome::FetchFailed(_) => "fetch failed",
        SymbolOutcome::InsufficientHistory { .. } => "insufficient history",
    }
}
