use crate::domain::bar::OhlcvBar;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcResponse {
    pub symbol: String,
    #[serde(default)]
    pub rows: Vec<OhlcRow>,
}

/// One upstream row. Providers disagree on casing, so both spellings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcRow {
    #[serde(alias = "Date")]
    pub date: String,
    #[serde(default, alias = "Open")]
    pub open: Option<f64>,
    #[serde(default, alias = "High")]
    pub high: Option<f64>,
    #[serde(default, alias = "Low")]
    pub low: Option<f64>,
    #[serde(default, alias = "Close")]
    pub close: Option<f64>,
    #[serde(default, alias = "Volume")]
    pub volume: Option<f64>,
}

impl OhlcRow {
    /// `None` when close, volume or the date is missing or unparsable.
    pub fn into_bar(self, symbol: &str) -> Option<OhlcvBar> {
        let date = parse_row_date(&self.date)?;
        let close = self.close?;
        let volume = self.volume?;
        let mut bar = OhlcvBar::new(symbol, date, close, volume);
        bar.open = self.open;
        bar.high = self.high;
        bar.low = self.low;
        bar.is_valid().then_some(bar)
    }
}

fn parse_row_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.date())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub symbol: String,
    #[serde(default)]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteTermResponse {
    #[serde(default)]
    pub values: Option<BTreeMap<String, f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_missing_close_or_volume_are_skipped() {
        let resp: OhlcResponse = serde_json::from_value(json!({
            "symbol": "AAA",
            "rows": [
                {"Date": "2024-01-02", "Open": 1.0, "High": 2.0, "Low": 0.5, "Close": 1.5, "Volume": 10.0},
                {"date": "2024-01-03T00:00:00", "close": 1.6, "volume": 12.0},
                {"date": "2024-01-04", "close": 1.7},
                {"date": "not a date", "close": 1.8, "volume": 1.0}
            ]
        }))
        .unwrap();

        let bars: Vec<OhlcvBar> = resp.rows.into_iter().filter_map(|r| r.into_bar("aaa")).collect();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].symbol, "AAA");
        assert_eq!(bars[0].high, Some(2.0));
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(bars[1].high, None);
    }

    #[test]
    fn quote_term_accepts_null_values() {
        let resp: QuoteTermResponse = serde_json::from_value(json!({"values": null})).unwrap();
        assert!(resp.values.is_none());
    }
}
