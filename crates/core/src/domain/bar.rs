use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One trading day for one symbol.
///
/// `dollar_volume` is never stored on the bar itself; it is always derived from
/// `close * volume` so a stale or hand-edited value can't leak into metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: f64,
}

impl OhlcvBar {
    pub fn new(symbol: &str, date: NaiveDate, close: f64, volume: f64) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume,
        }
    }

    pub fn with_range(mut self, open: f64, high: f64, low: f64) -> Self {
        self.open = Some(open);
        self.high = Some(high);
        self.low = Some(low);
        self
    }

    pub fn dollar_volume(&self) -> f64 {
        self.close * self.volume
    }

    pub fn is_valid(&self) -> bool {
        self.close.is_finite() && self.volume.is_finite()
    }

    /// `high / low` when both are usable, for average-daily-range.
    pub fn range_ratio(&self) -> Option<f64> {
        match (self.high, self.low) {
            (Some(h), Some(l)) if h.is_finite() && l.is_finite() && h > 0.0 && l > 0.0 => {
                Some(h / l)
            }
            _ => None,
        }
    }
}

/// Bounded trailing history entry carried with a metric for sparklines and
/// downstream weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub close: f64,
    pub volume: f64,
    #[serde(rename = "dollarVolume")]
    pub dollar_volume: f64,
}

impl From<&OhlcvBar> for DailyPoint {
    fn from(bar: &OhlcvBar) -> Self {
        Self {
            date: bar.date,
            close: bar.close,
            volume: bar.volume,
            dollar_volume: bar.dollar_volume(),
        }
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_volume_is_derived() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let bar = OhlcvBar::new(" aaa ", d, 10.0, 250.0);
        assert_eq!(bar.symbol, "AAA");
        assert_eq!(bar.dollar_volume(), 2500.0);
    }

    #[test]
    fn range_ratio_requires_positive_high_and_low() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let bar = OhlcvBar::new("AAA", d, 10.0, 1.0);
        assert_eq!(bar.range_ratio(), None);

        let bar = bar.with_range(10.0, 11.0, 0.0);
        assert_eq!(bar.range_ratio(), None);

        let bar = OhlcvBar::new("AAA", d, 10.0, 1.0).with_range(10.0, 11.0, 10.0);
        assert_eq!(bar.range_ratio(), Some(1.1));
    }
}
