//! Sector rollups over per-symbol metrics.

use crate::domain::metric::TickerMetric;
use crate::domain::sector::{MemberDetail, SectorDefinition, SectorRollup, TickerLeader};
use crate::metrics::{history_change, history_dollar_volume};
use std::collections::{BTreeSet, HashMap};

const LEADER_COUNT: usize = 3;
const FIVE_DAY: usize = 5;

pub fn aggregate(
    sectors: &[SectorDefinition],
    metrics: &HashMap<String, TickerMetric>,
    inactive: &BTreeSet<String>,
) -> Vec<SectorRollup> {
    sectors
        .iter()
        .map(|sector| aggregate_sector(sector, metrics, inactive))
        .collect()
}

/// One rollup per sector, always. Membership is carried over as configured;
/// only members that are active and have a metric feed the aggregates.
pub fn aggregate_sector(
    sector: &SectorDefinition,
    metrics: &HashMap<String, TickerMetric>,
    inactive: &BTreeSet<String>,
) -> SectorRollup {
    let mut rollup = SectorRollup::empty(sector);
    let mut included: Vec<&TickerMetric> = Vec::new();

    for symbol in &sector.members {
        if inactive.contains(symbol) {
            rollup.members_detail.push(MemberDetail::empty(symbol, true));
            continue;
        }
        match metrics.get(symbol) {
            Some(metric) => {
                rollup.members_detail.push(MemberDetail::from_metric(metric));
                included.push(metric);
            }
            None => rollup.members_detail.push(MemberDetail::empty(symbol, false)),
        }
    }

    if included.is_empty() {
        tracing::debug!(sector = %sector.id, "no member metrics; emitting empty rollup");
        return rollup;
    }

    rollup.rel_vol10_median = median(included.iter().filter_map(|m| m.rel_vol10).collect());
    rollup.change1d_median = median(included.iter().filter_map(|m| m.change1d).collect());
    rollup.dollar_vol_today_sum = Some(included.iter().map(|m| m.dollar_vol_today).sum());
    rollup.avg_dollar_vol10_sum = Some(included.iter().map(|m| m.avg_dollar_vol10).sum());

    rollup.change1d_weighted = weighted_mean(
        included
            .iter()
            .map(|m| (m.change1d, Some(m.dollar_vol_today))),
    );
    rollup.change5d_weighted = weighted_mean(included.iter().map(|m| {
        let change = m.change5d.or_else(|| history_change(&m.history, FIVE_DAY));
        let weight = m
            .dollar_vol5d
            .or_else(|| history_dollar_volume(&m.history, FIVE_DAY));
        (change, weight)
    }));

    let mut leaders: Vec<TickerLeader> = included
        .iter()
        .filter(|m| m.rel_vol10.is_some())
        .map(|m| TickerLeader {
            ticker: m.symbol.clone(),
            rel_vol10: m.rel_vol10,
            change1d: m.change1d,
        })
        .collect();
    leaders.sort_by(|a, b| {
        let a = a.rel_vol10.unwrap_or(f64::NEG_INFINITY);
        let b = b.rel_vol10.unwrap_or(f64::NEG_INFINITY);
        b.total_cmp(&a)
    });
    leaders.truncate(LEADER_COUNT);
    rollup.leaders = leaders;

    rollup.last_updated = included.iter().map(|m| m.last_date).max();
    rollup
}

/// Standard median; `None` for an empty input.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Σ(value × weight) / Σ(weight) over pairs with both defined and weight > 0.
fn weighted_mean(pairs: impl Iterator<Item = (Option<f64>, Option<f64>)>) -> Option<f64> {
    let mut num = 0.0;
    let mut den = 0.0;
    for (value, weight) in pairs {
        let (Some(value), Some(weight)) = (value, weight) else {
            continue;
        };
        if !value.is_finite() || !weight.is_finite() || weight <= 0.0 {
            continue;
        }
        num += value * weight;
        den += weight;
    }
    (den > 0.0).then(|| num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bar::DailyPoint;
    use chrono::NaiveDate;

    fn metric(symbol: &str, rel: Option<f64>, change1d: Option<f64>, dv_today: f64) -> TickerMetric {
        TickerMetric {
            symbol: symbol.to_string(),
            last_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            dollar_vol_today: dv_today,
            avg_dollar_vol10: 100.0,
            rel_vol10: rel,
            change1d,
            change5d: None,
            dollar_vol5d: None,
            adr20_pct: None,
            ytd_gain_to_high_pct: None,
            ytd_off_high_pct: None,
            ralph_score: None,
            history: Vec::new(),
        }
    }

    #[test]
    fn median_handles_odd_even_and_empty() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(Vec::new()), None);
    }

    #[test]
    fn sector_without_usable_members_keeps_membership() {
        let sector = SectorDefinition::new("alpha", "Alpha", ["AAA", "BBB"]);
        let inactive: BTreeSet<String> = ["AAA".to_string()].into();

        let rollup = aggregate_sector(&sector, &HashMap::new(), &inactive);

        assert_eq!(rollup.members, vec!["AAA", "BBB"]);
        assert_eq!(rollup.rel_vol10_median, None);
        assert_eq!(rollup.dollar_vol_today_sum, None);
        assert_eq!(rollup.change1d_weighted, None);
        assert!(rollup.leaders.is_empty());
        assert_eq!(rollup.last_updated, None);
        assert_eq!(rollup.members_detail.len(), 2);
        assert!(rollup.members_detail[0].inactive);
        assert!(!rollup.members_detail[1].inactive);
    }

    #[test]
    fn aggregates_exclude_inactive_members() {
        let sector = SectorDefinition::new("alpha", "Alpha", ["AAA", "BBB", "CCC", "DDD", "EEE"]);
        let metrics: HashMap<String, TickerMetric> = [
            metric("AAA", Some(3.0), Some(2.0), 300.0),
            metric("BBB", Some(1.0), Some(-1.0), 100.0),
            metric("CCC", None, Some(4.0), 0.0),
            metric("DDD", Some(9.0), Some(50.0), 1000.0),
            metric("EEE", Some(2.0), None, 50.0),
        ]
        .into_iter()
        .map(|m| (m.symbol.clone(), m))
        .collect();
        let inactive: BTreeSet<String> = ["DDD".to_string()].into();

        let rollup = aggregate_sector(&sector, &metrics, &inactive);

        assert_eq!(rollup.members.len(), 5);
        assert_eq!(rollup.rel_vol10_median, Some(2.0));
        assert_eq!(rollup.change1d_median, Some(2.0));
        assert_eq!(rollup.dollar_vol_today_sum, Some(450.0));
        assert_eq!(rollup.avg_dollar_vol10_sum, Some(400.0));
        // CCC has zero weight, EEE has no change.
        assert_eq!(rollup.change1d_weighted, Some((2.0 * 300.0 - 100.0) / 400.0));
        let leaders: Vec<_> = rollup.leaders.iter().map(|l| l.ticker.as_str()).collect();
        assert_eq!(leaders, vec!["AAA", "EEE", "BBB"]);
        assert!(rollup.members_detail.iter().any(|d| d.ticker == "DDD" && d.inactive));
    }

    #[test]
    fn five_day_weighted_falls_back_to_history() {
        let sector = SectorDefinition::new("alpha", "Alpha", ["AAA", "BBB"]);
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut aaa = metric("AAA", Some(1.0), Some(1.0), 10.0);
        aaa.history = (0..6)
            .map(|i| DailyPoint {
                date: start + chrono::Duration::days(i),
                close: if i == 0 { 10.0 } else { 11.0 },
                volume: 1.0,
                dollar_volume: 20.0,
            })
            .collect();
        let mut bbb = metric("BBB", Some(1.0), Some(1.0), 10.0);
        bbb.change5d = Some(-10.0);
        bbb.dollar_vol5d = Some(300.0);
        let metrics: HashMap<String, TickerMetric> =
            [aaa, bbb].into_iter().map(|m| (m.symbol.clone(), m)).collect();

        let rollup = aggregate_sector(&sector, &metrics, &BTreeSet::new());
        let expected = (10.0 * 100.0 - 10.0 * 300.0) / 400.0;
        let actual = rollup.change5d_weighted.unwrap();
        assert!((actual - expected).abs() < 1e-9, "{actual} vs {expected}");
    }
}
