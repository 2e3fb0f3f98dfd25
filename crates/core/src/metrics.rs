//! Per-symbol metric derivation over a bar history.
//!
//! Everything here is pure and synchronous; callers load bars from the
//! [`BarStore`](crate::storage::BarStore) and persist the result themselves.

use crate::domain::bar::{normalize_symbol, DailyPoint, OhlcvBar};
use crate::domain::metric::{MetricOutcome, TickerMetric, YtdRalph};
use chrono::{Datelike, NaiveDate};

pub const MIN_HISTORY_DAYS: usize = 11;
pub const HISTORY_WINDOW: usize = 30;
const AVG_WINDOW: usize = 10;
const CHANGE5D_PERIODS: usize = 5;
const ADR_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct MetricComputer {
    min_history: usize,
}

impl Default for MetricComputer {
    fn default() -> Self {
        Self {
            min_history: MIN_HISTORY_DAYS,
        }
    }
}

impl MetricComputer {
    /// `min_history` below the built-in floor is raised to it; the ten-session
    /// average cannot be computed from fewer bars.
    pub fn new(min_history: usize) -> Self {
        Self {
            min_history: min_history.max(MIN_HISTORY_DAYS),
        }
    }

    pub fn min_history(&self) -> usize {
        self.min_history
    }

    pub fn compute(&self, symbol: &str, bars: &[OhlcvBar]) -> MetricOutcome {
        let mut valid: Vec<&OhlcvBar> = bars.iter().filter(|b| b.is_valid()).collect();
        valid.sort_by_key(|b| b.date);
        valid.dedup_by(|later, earlier| {
            if later.date == earlier.date {
                *earlier = *later;
                true
            } else {
                false
            }
        });

        let n = valid.len();
        if n < self.min_history {
            return MetricOutcome::InsufficientHistory {
                available: n,
                required: self.min_history,
            };
        }

        let closes: Vec<f64> = valid.iter().map(|b| b.close).collect();
        let dollar_vols: Vec<f64> = valid.iter().map(|b| b.dollar_volume()).collect();

        let dollar_vol_today = dollar_vols[n - 1];
        let prior = &dollar_vols[n - 1 - AVG_WINDOW..n - 1];
        let avg_dollar_vol10 = prior.iter().sum::<f64>() / AVG_WINDOW as f64;
        let rel_vol10 = (avg_dollar_vol10 > 0.0).then(|| dollar_vol_today / avg_dollar_vol10);

        let change1d = pct_change(closes[n - 2], closes[n - 1]);
        let change5d = (n > CHANGE5D_PERIODS)
            .then(|| pct_change(closes[n - 1 - CHANGE5D_PERIODS], closes[n - 1]))
            .flatten();
        let dollar_vol5d = Some(dollar_vols[n - CHANGE5D_PERIODS..].iter().sum());

        let adr20_pct = adr_pct(&valid);

        let ytd_points: Vec<(NaiveDate, f64)> = valid.iter().map(|b| (b.date, b.close)).collect();
        let ytd = compute_ytd_ralph(&ytd_points);

        let history: Vec<DailyPoint> = valid[n.saturating_sub(HISTORY_WINDOW)..]
            .iter()
            .map(|b| DailyPoint::from(*b))
            .collect();

        MetricOutcome::Computed(TickerMetric {
            symbol: normalize_symbol(symbol),
            last_date: valid[n - 1].date,
            dollar_vol_today,
            avg_dollar_vol10,
            rel_vol10,
            change1d,
            change5d,
            dollar_vol5d,
            adr20_pct,
            ytd_gain_to_high_pct: ytd.map(|y| y.gain_to_high_pct),
            ytd_off_high_pct: ytd.map(|y| y.off_high_pct),
            ralph_score: ytd.map(|y| y.ralph_score),
            history,
        })
    }
}

fn pct_change(from: f64, to: f64) -> Option<f64> {
    if from == 0.0 || !from.is_finite() || !to.is_finite() {
        return None;
    }
    Some((to / from - 1.0) * 100.0)
}

/// Mean high/low ratio over the trailing 20 bars that carry a usable range.
fn adr_pct(bars: &[&OhlcvBar]) -> Option<f64> {
    let ratios: Vec<f64> = bars.iter().filter_map(|b| b.range_ratio()).collect();
    if ratios.len() < ADR_WINDOW {
        return None;
    }
    let window = &ratios[ratios.len() - ADR_WINDOW..];
    let mean = window.iter().sum::<f64>() / ADR_WINDOW as f64;
    Some((mean - 1.0) * 100.0)
}

/// YTD gain-to-high, drawdown from high and ralph score over `(date, close)`
/// points. The window starts Jan 1 of the latest point's year.
pub fn compute_ytd_ralph(points: &[(NaiveDate, f64)]) -> Option<YtdRalph> {
    let latest = points.iter().map(|(d, _)| *d).max()?;
    let year_start = NaiveDate::from_ymd_opt(latest.year(), 1, 1)?;

    let mut window: Vec<(NaiveDate, f64)> = points
        .iter()
        .filter(|(d, _)| *d >= year_start)
        .copied()
        .collect();
    window.sort_by_key(|(d, _)| *d);

    let open_ytd = window.first()?.1;
    let close_latest = window.last()?.1;
    let high_ytd = window.iter().map(|(_, c)| *c).fold(f64::NAN, f64::max);

    let usable = |v: f64| v.is_finite() && v > 0.0;
    if !(usable(open_ytd) && usable(close_latest) && usable(high_ytd)) {
        return None;
    }

    let gain_to_high_pct = (high_ytd / open_ytd - 1.0) * 100.0;
    let off_high_pct = ((1.0 - close_latest / high_ytd) * 100.0).max(0.0);
    let ralph_score = gain_to_high_pct / off_high_pct.max(1.0);

    Some(YtdRalph {
        gain_to_high_pct,
        off_high_pct,
        ralph_score,
    })
}

/// Percent change over `periods` sessions from a bounded history, when it is
/// long enough.
pub fn history_change(history: &[DailyPoint], periods: usize) -> Option<f64> {
    if periods == 0 || history.len() <= periods {
        return None;
    }
    let end = history[history.len() - 1].close;
    let start = history[history.len() - 1 - periods].close;
    pct_change(start, end)
}

/// Sum of the trailing `periods` dollar volumes, when the history is long enough.
pub fn history_dollar_volume(history: &[DailyPoint], periods: usize) -> Option<f64> {
    if periods == 0 || history.len() < periods {
        return None;
    }
    Some(history[history.len() - periods..].iter().map(|p| p.dollar_volume).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.unwrap();
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn series(start: NaiveDate, closes: &[f64], volumes: &[f64]) -> Vec<OhlcvBar> {
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (c, v))| OhlcvBar::new("aaa", start + Duration::days(i as i64), *c, *v))
            .collect()
    }

    #[test]
    fn fewer_than_eleven_valid_bars_is_insufficient() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut bars = series(start, &[10.0; 10], &[100.0; 10]);
        bars.push(OhlcvBar::new("AAA", start + Duration::days(20), f64::NAN, 100.0));

        let outcome = MetricComputer::default().compute("AAA", &bars);
        assert_eq!(
            outcome,
            MetricOutcome::InsufficientHistory {
                available: 10,
                required: 11
            }
        );
    }

    #[test]
    fn twelve_day_ascending_series_matches_hand_computed_values() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let closes: Vec<f64> = (0..12).map(|i| 10.0 + i as f64).collect();
        let mut volumes = vec![1000.0; 12];
        volumes[11] = 2000.0;
        let mut bars = series(start, &closes, &volumes);
        bars.reverse();

        let metric = MetricComputer::default()
            .compute("aaa", &bars)
            .into_metric()
            .unwrap();

        assert_eq!(metric.symbol, "AAA");
        assert_eq!(metric.last_date, start + Duration::days(11));
        assert_eq!(metric.dollar_vol_today, 42_000.0);
        // Prior ten sessions: closes 11..=20 at volume 1000.
        assert_eq!(metric.avg_dollar_vol10, 15_500.0);
        assert_close(metric.rel_vol10, 42_000.0 / 15_500.0);
        assert_close(metric.change1d, 5.0);
        assert_close(metric.change5d, 31.25);
        assert_close(metric.dollar_vol5d, 17_000.0 + 18_000.0 + 19_000.0 + 20_000.0 + 42_000.0);
        assert_eq!(metric.adr20_pct, None);
        assert_eq!(metric.history.len(), 12);
        assert_eq!(metric.history[0].date, start);
    }

    #[test]
    fn zero_average_leaves_rel_vol_undefined() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut volumes = vec![0.0; 11];
        volumes[10] = 5.0;
        let bars = series(start, &[10.0; 11], &volumes);

        let metric = MetricComputer::default().compute("AAA", &bars).into_metric().unwrap();
        assert_eq!(metric.avg_dollar_vol10, 0.0);
        assert_eq!(metric.rel_vol10, None);
    }

    #[test]
    fn adr_uses_trailing_twenty_ranges_and_history_is_bounded() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let bars: Vec<OhlcvBar> = (0..40)
            .map(|i| {
                let bar = OhlcvBar::new("AAA", start + Duration::days(i), 100.0, 10.0);
                // Older bars have a wider range that must not leak into the mean.
                if i < 20 {
                    bar.with_range(100.0, 110.0, 100.0)
                } else {
                    bar.with_range(100.0, 102.0, 100.0)
                }
            })
            .collect();

        let metric = MetricComputer::default().compute("AAA", &bars).into_metric().unwrap();
        assert_close(metric.adr20_pct, 2.0);
        assert_eq!(metric.history.len(), HISTORY_WINDOW);
        assert_eq!(metric.history[HISTORY_WINDOW - 1].date, start + Duration::days(39));
    }

    #[test]
    fn ytd_ralph_reports_gain_drawdown_and_score() {
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        let points = vec![
            (NaiveDate::from_ymd_opt(2023, 12, 29).unwrap(), 50.0),
            (d(1, 2), 100.0),
            (d(2, 1), 120.0),
            (d(3, 1), 108.0),
        ];

        let ytd = compute_ytd_ralph(&points).unwrap();
        assert_close(Some(ytd.gain_to_high_pct), 20.0);
        assert_close(Some(ytd.off_high_pct), 10.0);
        assert_close(Some(ytd.ralph_score), 2.0);
    }

    #[test]
    fn ytd_ralph_floors_denominator_at_high() {
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        let points = vec![(d(1, 2), 100.0), (d(1, 3), 105.0), (d(1, 4), 110.0)];

        let ytd = compute_ytd_ralph(&points).unwrap();
        assert_close(Some(ytd.gain_to_high_pct), 10.0);
        assert_eq!(ytd.off_high_pct, 0.0);
        assert_close(Some(ytd.ralph_score), 10.0);
    }

    #[test]
    fn ytd_ralph_rejects_non_positive_inputs() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        assert!(compute_ytd_ralph(&[]).is_none());
        assert!(compute_ytd_ralph(&[(d(2), 0.0), (d(3), 5.0)]).is_none());
    }

    #[test]
    fn history_fallbacks_need_enough_points() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let history: Vec<DailyPoint> = series(start, &[10.0, 11.0, 12.0, 13.0, 14.0, 15.0], &[1.0; 6])
            .iter()
            .map(DailyPoint::from)
            .collect();

        assert_close(history_change(&history, 5), 50.0);
        assert_eq!(history_change(&history[1..], 5), None);
        assert_close(history_dollar_volume(&history, 5), 65.0);
        assert_eq!(history_dollar_volume(&history[..4], 5), None);
    }
}
