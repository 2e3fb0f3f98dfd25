use super::{Pipeline, SymbolOutcome};
use crate::aggregate::aggregate;
use crate::domain::metric::TickerMetric;
use crate::domain::snapshot::{InactiveTicker, SnapshotPayload, TickerMetricRecord};
use crate::storage::sectors;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
    pub as_of: NaiveDate,
    /// Compute everything but leave the snapshot files and archive alone.
    pub dry_run: bool,
}

impl RefreshOptions {
    pub fn today() -> Self {
        Self {
            as_of: Utc::now().date_naive(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub processed: usize,
    pub skipped_inactive: usize,
    pub fetch_failures: usize,
    pub stale: usize,
    pub insufficient: usize,
    pub metrics_computed: usize,
    pub sectors_written: usize,
    pub inactive: usize,
}

impl Pipeline {
    /// Walks the whole symbol universe and publishes a fresh snapshot.
    ///
    /// Returns `Ok(None)` when another refresh already holds the run guard.
    /// Per-symbol provider failures are recorded and skipped; storage and
    /// snapshot errors abort the run.
    pub async fn build_snapshot(
        &self,
        options: RefreshOptions,
    ) -> anyhow::Result<Option<(RefreshReport, SnapshotPayload)>> {
        let Some(run) = self.run_guard.try_acquire().await? else {
            tracing::warn!("snapshot refresh already running; skipping");
            return Ok(None);
        };
        let result = self.refresh(options).await;
        if let Err(err) = run.release().await {
            tracing::warn!(error = ?err, "failed to release refresh guard");
        }
        result.map(Some)
    }

    async fn refresh(&self, options: RefreshOptions) -> anyhow::Result<(RefreshReport, SnapshotPayload)> {

        if let Some(seed) = &self.config.sectors_seed_path {
            let imported = sectors::bootstrap_from_seed(&self.pool, seed).await?;
            if imported > 0 {
                tracing::info!(imported, seed = %seed.display(), "sector definitions seeded");
            }
        }

        let definitions = sectors::load_sectors(&self.pool).await?;
        let mut universe: BTreeSet<String> = sectors::universe(&self.pool).await?.into_iter().collect();
        universe.extend(self.bars.symbols().await?);
        anyhow::ensure!(!universe.is_empty(), "no symbols configured for snapshot refresh");

        let inactive_at_start = self.failures.inactive(Utc::now()).await?;
        tracing::info!(
            symbols = universe.len(),
            sectors = definitions.len(),
            inactive = inactive_at_start.len(),
            as_of = %options.as_of,
            "snapshot refresh started"
        );

        let mut report = RefreshReport::default();
        let mut metrics: HashMap<String, TickerMetric> = HashMap::new();
        for symbol in &universe {
            if inactive_at_start.contains(symbol) {
                tracing::debug!(%symbol, "skipping inactive symbol");
                report.skipped_inactive += 1;
                continue;
            }
            report.processed += 1;
            match self.ensure_symbol_data(symbol, options.as_of).await? {
                SymbolOutcome::Computed(metric) => {
                    metrics.insert(symbol.clone(), metric);
                }
                SymbolOutcome::Stale { metric, .. } => {
                    report.stale += 1;
                    metrics.insert(symbol.clone(), metric);
                }
                SymbolOutcome::FetchFailed(_) => report.fetch_failures += 1,
                SymbolOutcome::InsufficientHistory { .. } => report.insufficient += 1,
            }
        }

        // Failures recorded during this run can push a symbol over the threshold.
        let inactive_records = self.failures.inactive_records(Utc::now()).await?;
        let inactive: BTreeSet<String> = inactive_records.iter().map(|r| r.symbol.clone()).collect();
        metrics.retain(|symbol, _| !inactive.contains(symbol));
        anyhow::ensure!(!metrics.is_empty(), "no ticker metrics could be computed");

        let rollups = aggregate(&definitions, &metrics, &inactive);
        let ticker_metrics: BTreeMap<String, TickerMetricRecord> = metrics
            .iter()
            .map(|(symbol, metric)| (symbol.clone(), TickerMetricRecord::from(metric)))
            .collect();
        let inactive_tickers: Vec<InactiveTicker> =
            inactive_records.iter().map(InactiveTicker::from).collect();

        report.metrics_computed = metrics.len();
        report.inactive = inactive_tickers.len();
        let payload = SnapshotPayload::new(
            options.as_of,
            Utc::now(),
            rollups,
            ticker_metrics,
            inactive_tickers,
        );

        if options.dry_run {
            tracing::info!(?report, "dry run; snapshot not written");
        } else {
            self.snapshots.write_full(&payload).await?;
            report.sectors_written = payload.sectors.len();
            tracing::info!(
                ?report,
                path = %self.snapshots.latest_path().display(),
                "snapshot refresh finished"
            );
        }
        Ok((report, payload))
    }
}
