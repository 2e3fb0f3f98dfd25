use crate::domain::bar::{normalize_symbol, DailyPoint};
use crate::domain::metric::TickerMetric;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// User-defined group of symbols. Membership is the only user-writable part
/// of the data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(alias = "tickers")]
    pub members: Vec<String>,
}

impl SectorDefinition {
    /// Normalizes id (lowercase) and members (trimmed, uppercase, first occurrence wins).
    pub fn new(id: &str, name: &str, members: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let mut out = Self {
            id: normalize_sector_id(id),
            name: name.trim().to_string(),
            sort_order: 0,
            members: Vec::new(),
        };
        for member in members {
            out.push_member(member.as_ref());
        }
        out
    }

    pub fn push_member(&mut self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() || self.members.contains(&symbol) {
            return false;
        }
        self.members.push(symbol);
        true
    }

    pub fn normalized(self) -> Self {
        let mut out = Self::new(&self.id, &self.name, &self.members);
        out.sort_order = self.sort_order;
        out
    }
}

pub fn normalize_sector_id(id: &str) -> String {
    id.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerLeader {
    pub ticker: String,
    #[serde(rename = "relVol10")]
    pub rel_vol10: Option<f64>,
    pub change1d: Option<f64>,
}

/// One member row inside a rollup. Inactive or data-less members keep a row
/// with null metric fields so membership stays visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDetail {
    pub ticker: String,
    pub change1d: Option<f64>,
    pub change5d: Option<f64>,
    #[serde(rename = "relVol10")]
    pub rel_vol10: Option<f64>,
    #[serde(rename = "dollarVolToday")]
    pub dollar_vol_today: Option<f64>,
    #[serde(rename = "avgDollarVol10")]
    pub avg_dollar_vol10: Option<f64>,
    #[serde(rename = "dollarVol5d")]
    pub dollar_vol5d: Option<f64>,
    #[serde(rename = "adr20Pct")]
    pub adr20_pct: Option<f64>,
    #[serde(rename = "ytdGainToHighPct")]
    pub ytd_gain_to_high_pct: Option<f64>,
    #[serde(rename = "ytdOffHighPct")]
    pub ytd_off_high_pct: Option<f64>,
    #[serde(rename = "ralphScore")]
    pub ralph_score: Option<f64>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<NaiveDate>,
    pub inactive: bool,
    pub history: Vec<DailyPoint>,
}

impl MemberDetail {
    pub fn empty(ticker: &str, inactive: bool) -> Self {
        Self {
            ticker: ticker.to_string(),
            change1d: None,
            change5d: None,
            rel_vol10: None,
            dollar_vol_today: None,
            avg_dollar_vol10: None,
            dollar_vol5d: None,
            adr20_pct: None,
            ytd_gain_to_high_pct: None,
            ytd_off_high_pct: None,
            ralph_score: None,
            last_updated: None,
            inactive,
            history: Vec::new(),
        }
    }

    pub fn from_metric(metric: &TickerMetric) -> Self {
        Self {
            ticker: metric.symbol.clone(),
            change1d: metric.change1d,
            change5d: metric.change5d,
            rel_vol10: metric.rel_vol10,
            dollar_vol_today: Some(metric.dollar_vol_today),
            avg_dollar_vol10: Some(metric.avg_dollar_vol10),
            dollar_vol5d: metric.dollar_vol5d,
            adr20_pct: metric.adr20_pct,
            ytd_gain_to_high_pct: metric.ytd_gain_to_high_pct,
            ytd_off_high_pct: metric.ytd_off_high_pct,
            ralph_score: metric.ralph_score,
            last_updated: Some(metric.last_date),
            inactive: false,
            history: metric.history.clone(),
        }
    }
}

/// Sector-level aggregate. Purely derived, never hand-edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorRollup {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    #[serde(rename = "relVol10_median")]
    pub rel_vol10_median: Option<f64>,
    #[serde(rename = "dollarVol_today_sum")]
    pub dollar_vol_today_sum: Option<f64>,
    #[serde(rename = "avgDollarVol10_sum")]
    pub avg_dollar_vol10_sum: Option<f64>,
    pub change1d_median: Option<f64>,
    pub change1d_weighted: Option<f64>,
    pub change5d_weighted: Option<f64>,
    pub leaders: Vec<TickerLeader>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<NaiveDate>,
    pub members_detail: Vec<MemberDetail>,
}

impl SectorRollup {
    /// Rollup with membership preserved and every aggregate null.
    pub fn empty(definition: &SectorDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            members: definition.members.clone(),
            rel_vol10_median: None,
            dollar_vol_today_sum: None,
            avg_dollar_vol10_sum: None,
            change1d_median: None,
            change1d_weighted: None,
            change5d_weighted: None,
            leaders: Vec::new(),
            last_updated: None,
            members_detail: Vec::new(),
        }
    }
}
