//! Wiring between the stores, the metric computer and the snapshot.

pub mod refresh;

pub use refresh::{RefreshOptions, RefreshReport};

use crate::aggregate::aggregate_sector;
use crate::config::EngineConfig;
use crate::domain::metric::{MetricOutcome, TickerMetric};
use crate::domain::sector::SectorRollup;
use crate::domain::snapshot::SnapshotPayload;
use crate::ingest::MarketData;
use crate::metrics::MetricComputer;
use crate::snapshot::SnapshotStore;
use crate::storage::{metrics as metric_store, sectors, BarStore, FailureTracker, RunGuard};
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

const DAILY_INTERVAL: &str = "1d";

/// What happened to one symbol during a fetch-and-compute pass.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    /// Fresh bars fetched and a metric computed. Failure record cleared.
    Computed(TickerMetric),
    /// Fetch failed but stored bars still produce a metric. Failure recorded.
    Stale { metric: TickerMetric, error: String },
    /// Fetch failed and stored bars are not enough. Failure recorded.
    FetchFailed(String),
    /// Bars fetched but history is still too short. Failure recorded.
    InsufficientHistory { available: usize, required: usize },
}

impl SymbolOutcome {
    pub fn metric(&self) -> Option<&TickerMetric> {
        match self {
            SymbolOutcome::Computed(metric) | SymbolOutcome::Stale { metric, .. } => Some(metric),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pool: SqlitePool,
    bars: BarStore,
    failures: FailureTracker,
    computer: MetricComputer,
    provider: Arc<dyn MarketData>,
    snapshots: Arc<SnapshotStore>,
    config: EngineConfig,
    run_guard: RunGuard,
}

impl Pipeline {
    pub fn new(pool: SqlitePool, provider: Arc<dyn MarketData>, config: EngineConfig) -> Self {
        let snapshots =
            Arc::new(SnapshotStore::new(config.snapshot.clone()).with_archive(pool.clone()));
        Self::with_snapshots(pool, provider, config, snapshots)
    }

    pub fn with_snapshots(
        pool: SqlitePool,
        provider: Arc<dyn MarketData>,
        config: EngineConfig,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            bars: BarStore::new(pool.clone()),
            failures: FailureTracker::new(pool.clone(), config.failure),
            computer: MetricComputer::new(config.min_history_days),
            run_guard: RunGuard::new(pool.clone()),
            pool,
            provider,
            snapshots,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn bars(&self) -> &BarStore {
        &self.bars
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Period to request for a symbol given how many bars are already stored.
    fn fetch_period(&self, stored: i64) -> &str {
        if stored == 0 {
            &self.config.backfill_period
        } else if (stored as usize) < self.computer.min_history() {
            &self.config.seed_period
        } else {
            &self.config.daily_period
        }
    }

    /// Fetches, stores, prunes and recomputes one symbol, keeping the failure
    /// tracker in step. Provider errors are outcomes; storage errors are not.
    pub async fn ensure_symbol_data(
        &self,
        symbol: &str,
        as_of: NaiveDate,
    ) -> anyhow::Result<SymbolOutcome> {
        let stored = self.bars.count(symbol).await?;
        let period = self.fetch_period(stored).to_string();

        let fetch_error = match self.provider.get_ohlc(symbol, &period, DAILY_INTERVAL).await {
            Ok(bars) if !bars.is_empty() => {
                self.bars.upsert(symbol, &bars).await?;
                self.bars
                    .prune(
                        symbol,
                        self.config.retention_days,
                        self.computer.min_history(),
                        as_of,
                    )
                    .await?;
                None
            }
            Ok(_) => Some(format!("no bars returned for {symbol}")),
            Err(err) => Some(format!("{err:#}")),
        };

        let history = self.bars.history(symbol).await?;
        let outcome = match (self.computer.compute(symbol, &history), fetch_error) {
            (MetricOutcome::Computed(metric), None) => {
                self.failures.clear_failure(symbol).await?;
                SymbolOutcome::Computed(metric)
            }
            (MetricOutcome::Computed(metric), Some(error)) => {
                tracing::warn!(%symbol, %period, %error, "fetch failed; using stored bars");
                self.failures.record_failure(symbol).await?;
                SymbolOutcome::Stale { metric, error }
            }
            (MetricOutcome::InsufficientHistory { .. }, Some(error)) => {
                tracing::warn!(%symbol, %period, %error, "fetch failed");
                self.failures.record_failure(symbol).await?;
                SymbolOutcome::FetchFailed(error)
            }
            (MetricOutcome::InsufficientHistory { available, required }, None) => {
                tracing::info!(%symbol, available, required, "insufficient history for metrics");
                self.failures.record_failure(symbol).await?;
                SymbolOutcome::InsufficientHistory {
                    available,
                    required,
                }
            }
        };

        if let Some(metric) = outcome.metric() {
            metric_store::upsert_ticker_metrics(&self.pool, std::slice::from_ref(metric)).await?;
        }
        Ok(outcome)
    }

    /// Computes metrics fresh from stored bars for the given symbols, skipping
    /// the ones that do not have enough history.
    pub async fn compute_from_store(
        &self,
        symbols: &[String],
    ) -> anyhow::Result<HashMap<String, TickerMetric>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            let history = self.bars.history(symbol).await?;
            if let Some(metric) = self.computer.compute(symbol, &history).into_metric() {
                out.insert(metric.symbol.clone(), metric);
            }
        }
        Ok(out)
    }

    /// Rollup for one sector, from current membership and stored bars.
    pub async fn recompute_sector(&self, sector_id: &str) -> anyhow::Result<SectorRollup> {
        let sector = sectors::load_sector(&self.pool, sector_id)
            .await?
            .with_context(|| format!("sector not found: {sector_id}"))?;
        let inactive = self.failures.inactive(Utc::now()).await?;
        let active: Vec<String> = sector
            .members
            .iter()
            .filter(|s| !inactive.contains(*s))
            .cloned()
            .collect();
        let metrics = self.compute_from_store(&active).await?;

        let rollup = aggregate_sector(&sector, &metrics, &inactive);
        tracing::debug!(
            sector = %sector.id,
            members = sector.members.len(),
            with_metrics = metrics.len(),
            "sector recomputed"
        );
        Ok(rollup)
    }

    /// Recomputes one sector and patches it into the latest snapshot.
    pub async fn recompute_and_patch(&self, sector_id: &str) -> anyhow::Result<SnapshotPayload> {
        let rollup = self.recompute_sector(sector_id).await?;
        let payload = self.snapshots.patch(rollup).await?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bar::OhlcvBar;
    use crate::domain::sector::SectorDefinition;
    use crate::storage::test_pool;
    use anyhow::Result;
    use chrono::Duration;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Serves a fixed bar series per symbol and records requested periods.
    #[derive(Default)]
    struct ScriptedProvider {
        bars: HashMap<String, Vec<OhlcvBar>>,
        periods: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl MarketData for ScriptedProvider {
        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        async fn get_ohlc(&self, symbol: &str, period: &str, _interval: &str) -> Result<Vec<OhlcvBar>> {
            self.periods.lock().push((symbol.to_string(), period.to_string()));
            self.bars
                .get(symbol)
                .cloned()
                .with_context(|| format!("unknown symbol {symbol}"))
        }

        async fn get_last_price(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(None)
        }

        async fn get_quote_term(&self) -> Result<Option<BTreeMap<String, f64>>> {
            Ok(None)
        }
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn series(symbol: &str, days: i64) -> Vec<OhlcvBar> {
        (0..days)
            .map(|i| OhlcvBar::new(symbol, start() + Duration::days(i), 10.0 + i as f64, 100.0))
            .collect()
    }

    async fn pipeline(
        provider: Arc<ScriptedProvider>,
    ) -> (Pipeline, tempfile::TempDir, tempfile::TempDir) {
        let (pool, db_dir) = test_pool().await;
        let snap_dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(snap_dir.path());
        (Pipeline::new(pool, provider, config), db_dir, snap_dir)
    }

    #[tokio::test]
    async fn first_fetch_backfills_then_goes_incremental() {
        let mut provider = ScriptedProvider::default();
        provider.bars.insert("AAA".into(), series("AAA", 12));
        let provider = Arc::new(provider);
        let (pipeline, _db, _snap) = pipeline(provider.clone()).await;
        let as_of = start() + Duration::days(11);

        let first = pipeline.ensure_symbol_data("AAA", as_of).await.unwrap();
        assert!(matches!(first, SymbolOutcome::Computed(_)));
        pipeline.ensure_symbol_data("AAA", as_of).await.unwrap();

        let periods: Vec<String> = provider.periods.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(periods, vec!["1y", "5d"]);
        let loaded = metric_store::load_ticker_metrics(pipeline.pool()).await.unwrap();
        assert!(loaded.contains_key("AAA"));
        assert!(pipeline.failures().load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_recorded_per_outcome() {
        let mut provider = ScriptedProvider::default();
        provider.bars.insert("SHORT".into(), series("SHORT", 5));
        let (pipeline, _db, _snap) = pipeline(Arc::new(provider)).await;
        let as_of = start() + Duration::days(11);

        let short = pipeline.ensure_symbol_data("SHORT", as_of).await.unwrap();
        assert_eq!(
            short,
            SymbolOutcome::InsufficientHistory {
                available: 5,
                required: 11
            }
        );
        let missing = pipeline.ensure_symbol_data("MISSING", as_of).await.unwrap();
        assert!(matches!(missing, SymbolOutcome::FetchFailed(_)));

        let records = pipeline.failures().load_all().await.unwrap();
        let counts: Vec<_> = records.iter().map(|r| (r.symbol.as_str(), r.failure_count)).collect();
        assert_eq!(counts, vec![("MISSING", 1), ("SHORT", 1)]);
    }

    #[tokio::test]
    async fn stored_bars_cover_a_failed_fetch() {
        let (pipeline, _db, _snap) = pipeline(Arc::default()).await;
        pipeline.bars().upsert("AAA", &series("AAA", 12)).await.unwrap();

        let outcome = pipeline
            .ensure_symbol_data("AAA", start() + Duration::days(11))
            .await
            .unwrap();
        assert!(matches!(outcome, SymbolOutcome::Stale { .. }));
        assert_eq!(pipeline.failures().load_all().await.unwrap()[0].failure_count, 1);
    }

    #[tokio::test]
    async fn recompute_sector_requires_existing_sector() {
        let (pipeline, _db, _snap) = pipeline(Arc::default()).await;
        assert!(pipeline.recompute_sector("nope").await.is_err());

        sectors::upsert_sector_definition(
            pipeline.pool(),
            &SectorDefinition::new("alpha", "Alpha", ["AAA", "BBB"]),
        )
        .await
        .unwrap();
        pipeline.bars().upsert("AAA", &series("AAA", 12)).await.unwrap();

        let rollup = pipeline.recompute_sector("ALPHA").await.unwrap();
        assert_eq!(rollup.members, vec!["AAA", "BBB"]);
        assert_eq!(rollup.leaders.len(), 1);
        assert_eq!(rollup.members_detail.len(), 2);
    }
}
