use crate::domain::bar::DailyPoint;
use crate::domain::metric::TickerMetric;
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;

type MetricRow = (
    String,
    NaiveDate,
    f64,
    f64,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    String,
);

pub async fn upsert_ticker_metrics(
    pool: &SqlitePool,
    metrics: &[TickerMetric],
) -> anyhow::Result<u64> {
    if metrics.is_empty() {
        return Ok(0);
    }
    let updated_at = Utc::now();
    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let mut affected: u64 = 0;

    for metric in metrics {
        let history = serde_json::to_string(&metric.history)
            .with_context(|| format!("serialize price history failed for {}", metric.symbol))?;
        let res = sqlx::query(
            "INSERT INTO ticker_metrics ( \
                 symbol, last_date, dollar_vol_today, avg_dollar_vol10, rel_vol10, change1d, \
                 change5d, dollar_vol5d, adr20_pct, ytd_gain_to_high_pct, ytd_off_high_pct, \
                 ralph_score, price_history, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             ON CONFLICT (symbol) DO UPDATE SET \
                 last_date = excluded.last_date, \
                 dollar_vol_today = excluded.dollar_vol_today, \
                 avg_dollar_vol10 = excluded.avg_dollar_vol10, \
                 rel_vol10 = excluded.rel_vol10, \
                 change1d = excluded.change1d, \
                 change5d = excluded.change5d, \
                 dollar_vol5d = excluded.dollar_vol5d, \
                 adr20_pct = excluded.adr20_pct, \
                 ytd_gain_to_high_pct = excluded.ytd_gain_to_high_pct, \
                 ytd_off_high_pct = excluded.ytd_off_high_pct, \
                 ralph_score = excluded.ralph_score, \
                 price_history = excluded.price_history, \
                 updated_at = excluded.updated_at",
        )
        .bind(&metric.symbol)
        .bind(metric.last_date)
        .bind(metric.dollar_vol_today)
        .bind(metric.avg_dollar_vol10)
        .bind(metric.rel_vol10)
        .bind(metric.change1d)
        .bind(metric.change5d)
        .bind(metric.dollar_vol5d)
        .bind(metric.adr20_pct)
        .bind(metric.ytd_gain_to_high_pct)
        .bind(metric.ytd_off_high_pct)
        .bind(metric.ralph_score)
        .bind(history)
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("upsert ticker_metrics failed for {}", metric.symbol))?;
        affected += res.rows_affected();
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

pub async fn load_ticker_metrics(pool: &SqlitePool) -> anyhow::Result<HashMap<String, TickerMetric>> {
    let rows = sqlx::query_as::<_, MetricRow>(
        "SELECT symbol, last_date, dollar_vol_today, avg_dollar_vol10, rel_vol10, change1d, \
                change5d, dollar_vol5d, adr20_pct, ytd_gain_to_high_pct, ytd_off_high_pct, \
                ralph_score, price_history \
         FROM ticker_metrics",
    )
    .fetch_all(pool)
    .await
    .context("load ticker_metrics failed")?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let metric = from_row(row)?;
        out.insert(metric.symbol.clone(), metric);
    }
    Ok(out)
}

fn from_row(row: MetricRow) -> anyhow::Result<TickerMetric> {
    let (
        symbol,
        last_date,
        dollar_vol_today,
        avg_dollar_vol10,
        rel_vol10,
        change1d,
        change5d,
        dollar_vol5d,
        adr20_pct,
        ytd_gain_to_high_pct,
        ytd_off_high_pct,
        ralph_score,
        history_json,
    ) = row;
    let history: Vec<DailyPoint> = serde_json::from_str(&history_json)
        .with_context(|| format!("invalid price_history JSON for {symbol}"))?;

    Ok(TickerMetric {
        symbol,
        last_date,
        dollar_vol_today,
        avg_dollar_vol10,
        rel_vol10,
        change1d,
        change5d,
        dollar_vol5d,
        adr20_pct,
        ytd_gain_to_high_pct,
        ytd_off_high_pct,
        ralph_score,
        history,
    })
}
