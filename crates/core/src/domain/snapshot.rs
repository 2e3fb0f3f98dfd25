use crate::domain::bar::DailyPoint;
use crate::domain::metric::TickerMetric;
use crate::domain::sector::{MemberDetail, SectorRollup};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The single externally visible artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub snapshot_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub sectors: Vec<SectorRollup>,
    pub sectors_count: usize,
    pub members_count: usize,
    pub ticker_metrics: BTreeMap<String, TickerMetricRecord>,
    pub inactive_tickers: Vec<InactiveTicker>,
}

impl SnapshotPayload {
    pub fn new(
        snapshot_date: NaiveDate,
        generated_at: DateTime<Utc>,
        sectors: Vec<SectorRollup>,
        ticker_metrics: BTreeMap<String, TickerMetricRecord>,
        inactive_tickers: Vec<InactiveTicker>,
    ) -> Self {
        let mut payload = Self {
            snapshot_date,
            generated_at,
            sectors,
            sectors_count: 0,
            members_count: 0,
            ticker_metrics,
            inactive_tickers,
        };
        payload.recount();
        payload
    }

    /// Re-derives `sectors_count` / `members_count` from the sector list.
    pub fn recount(&mut self) {
        self.sectors_count = self.sectors.len();
        self.members_count = self.sectors.iter().map(|s| s.members.len()).sum();
    }

    /// Replaces the sector with the same id, or appends it. Returns true on replace.
    pub fn upsert_sector(&mut self, rollup: SectorRollup) -> bool {
        match self.sectors.iter_mut().find(|s| s.id == rollup.id) {
            Some(slot) => {
                *slot = rollup;
                true
            }
            None => {
                self.sectors.push(rollup);
                false
            }
        }
    }

    pub fn sector(&self, id: &str) -> Option<&SectorRollup> {
        self.sectors.iter().find(|s| s.id == id)
    }
}

/// Flattened per-symbol record in `ticker_metrics`. Every numeric field is an
/// explicit nullable so a missing value serializes as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerMetricRecord {
    pub last_date: Option<NaiveDate>,
    pub dollar_vol_today: Option<f64>,
    pub avg_dollar_vol10: Option<f64>,
    pub rel_vol10: Option<f64>,
    pub change1d: Option<f64>,
    pub change5d: Option<f64>,
    pub dollar_vol5d: Option<f64>,
    pub adr20_pct: Option<f64>,
    pub ytd_gain_to_high_pct: Option<f64>,
    pub ytd_off_high_pct: Option<f64>,
    pub ralph_score: Option<f64>,
    #[serde(default)]
    pub history: Vec<DailyPoint>,
}

impl From<&TickerMetric> for TickerMetricRecord {
    fn from(m: &TickerMetric) -> Self {
        Self {
            last_date: Some(m.last_date),
            dollar_vol_today: Some(m.dollar_vol_today),
            avg_dollar_vol10: Some(m.avg_dollar_vol10),
            rel_vol10: m.rel_vol10,
            change1d: m.change1d,
            change5d: m.change5d,
            dollar_vol5d: m.dollar_vol5d,
            adr20_pct: m.adr20_pct,
            ytd_gain_to_high_pct: m.ytd_gain_to_high_pct,
            ytd_off_high_pct: m.ytd_off_high_pct,
            ralph_score: m.ralph_score,
            history: m.history.clone(),
        }
    }
}

impl From<&MemberDetail> for TickerMetricRecord {
    fn from(d: &MemberDetail) -> Self {
        Self {
            last_date: d.last_updated,
            dollar_vol_today: d.dollar_vol_today,
            avg_dollar_vol10: d.avg_dollar_vol10,
            rel_vol10: d.rel_vol10,
            change1d: d.change1d,
            change5d: d.change5d,
            dollar_vol5d: d.dollar_vol5d,
            adr20_pct: d.adr20_pct,
            ytd_gain_to_high_pct: d.ytd_gain_to_high_pct,
            ytd_off_high_pct: d.ytd_off_high_pct,
            ralph_score: d.ralph_score,
            history: d.history.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InactiveTicker {
    pub symbol: String,
    pub failure_count: i64,
    pub last_failure: Option<DateTime<Utc>>,
}
