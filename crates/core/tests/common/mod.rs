//! Shared fixtures for the core integration tests: a scripted market data
//! provider, bar series and a pipeline over a temp database and snapshot dir.
#![allow(dead_code)]

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use sectorflow_core::config::EngineConfig;
use sectorflow_core::domain::OhlcvBar;
use sectorflow_core::ingest::MarketData;
use sectorflow_core::jobs::{JobQueue, SectorMutations};
use sectorflow_core::pipeline::Pipeline;
use sectorflow_core::storage::{self, SectorLockRegistry};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Serves whatever series was registered for a symbol; unknown or failing
/// symbols return an error.
#[derive(Default)]
pub struct FakeMarketData {
    bars: Mutex<HashMap<String, Vec<OhlcvBar>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeMarketData {
    pub fn with_series(series: impl IntoIterator<Item = Vec<OhlcvBar>>) -> Arc<Self> {
        let fake = Self::default();
        for bars in series {
            fake.set_bars(bars);
        }
        Arc::new(fake)
    }

    pub fn set_bars(&self, bars: Vec<OhlcvBar>) {
        if let Some(first) = bars.first() {
            self.bars.lock().insert(first.symbol.clone(), bars);
        }
    }

    pub fn fail(&self, symbol: &str) {
        self.failing.lock().insert(symbol.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MarketData for FakeMarketData {
    fn provider_name(&self) -> &'static str {
        "fake"
    }

    async fn get_ohlc(&self, symbol: &str, _period: &str, _interval: &str) -> Result<Vec<OhlcvBar>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(symbol) {
            anyhow::bail!("provider unavailable for {symbol}");
        }
        self.bars
            .lock()
            .get(symbol)
            .cloned()
            .with_context(|| format!("no data for {symbol}"))
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self
            .bars
            .lock()
            .get(symbol)
            .and_then(|bars| bars.last().map(|b| b.close)))
    }

    async fn get_quote_term(&self) -> Result<Option<BTreeMap<String, f64>>> {
        Ok(None)
    }
}

/// First date of a `days`-long series ending today.
pub fn start_for(days: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(days - 1)
}

/// Price and volume both climbing one step per day.
pub fn rising(symbol: &str, days: i64) -> Vec<OhlcvBar> {
    let start = start_for(days);
    (0..days)
        .map(|i| {
            OhlcvBar::new(
                symbol,
                start + Duration::days(i),
                10.0 + i as f64,
                100.0 + 10.0 * i as f64,
            )
        })
        .collect()
}

pub fn flat(symbol: &str, days: i64) -> Vec<OhlcvBar> {
    let start = start_for(days);
    (0..days)
        .map(|i| OhlcvBar::new(symbol, start + Duration::days(i), 20.0, 100.0))
        .collect()
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub provider: Arc<FakeMarketData>,
    db_dir: tempfile::TempDir,
    _snapshot_dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new(provider: Arc<FakeMarketData>) -> Self {
        let db_dir = tempfile::tempdir().unwrap();
        let snapshot_dir = tempfile::tempdir().unwrap();
        let pool = storage::open(&db_dir.path().join("market.db")).await.unwrap();
        let config = EngineConfig::new(snapshot_dir.path());
        let pipeline = Pipeline::new(pool, provider.clone(), config);
        Self {
            pipeline,
            provider,
            db_dir,
            _snapshot_dir: snapshot_dir,
        }
    }

    /// A pipeline with its own pool over the same database file and snapshot
    /// directory, standing in for a second process.
    pub async fn sibling(&self) -> Pipeline {
        let pool = storage::open(&self.db_dir.path().join("market.db")).await.unwrap();
        Pipeline::new(pool, self.provider.clone(), self.pipeline.config().clone())
    }

    /// Mutation front end over a started queue.
    pub fn mutations(&self) -> SectorMutations {
        let queue = Arc::new(JobQueue::new(self.pipeline.pool().clone()));
        queue.start();
        SectorMutations::new(
            self.pipeline.clone(),
            queue,
            Arc::new(SectorLockRegistry::new()),
        )
    }
}
