use crate::domain::bar::DailyPoint;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Per-symbol trading metrics derived from the bar store.
///
/// Recomputed from scratch on every run, never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerMetric {
    pub symbol: String,
    pub last_date: NaiveDate,
    pub dollar_vol_today: f64,
    pub avg_dollar_vol10: f64,
    pub rel_vol10: Option<f64>,
    pub change1d: Option<f64>,
    pub change5d: Option<f64>,
    pub dollar_vol5d: Option<f64>,
    pub adr20_pct: Option<f64>,
    pub ytd_gain_to_high_pct: Option<f64>,
    pub ytd_off_high_pct: Option<f64>,
    pub ralph_score: Option<f64>,
    pub history: Vec<DailyPoint>,
}

/// "Not enough bars" is an expected outcome, so it is a variant rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOutcome {
    Computed(TickerMetric),
    InsufficientHistory { available: usize, required: usize },
}

impl MetricOutcome {
    pub fn into_metric(self) -> Option<TickerMetric> {
        match self {
            MetricOutcome::Computed(metric) => Some(metric),
            MetricOutcome::InsufficientHistory { .. } => None,
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, MetricOutcome::Computed(_))
    }
}

/// YTD gain / drawdown / ralph triple. All three are present or none is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YtdRalph {
    pub gain_to_high_pct: f64,
    pub off_high_pct: f64,
    pub ralph_score: f64,
}
