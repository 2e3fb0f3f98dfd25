use crate::domain::bar::{normalize_symbol, OhlcvBar};
use anyhow::Context;
use chrono::{Duration, NaiveDate};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

// 9 binds per row keeps a full chunk well under SQLite's bind limit.
const UPSERT_CHUNK_SIZE: usize = 100;

type BarRow = (NaiveDate, Option<f64>, Option<f64>, Option<f64>, f64, f64);

/// Durable per-symbol OHLCV history keyed by (symbol, date).
#[derive(Debug, Clone)]
pub struct BarStore {
    pool: SqlitePool,
}

impl BarStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or overwrites bars by (symbol, date). Re-ingesting the same day is
    /// idempotent; within one call the last bar for a date wins.
    pub async fn upsert(&self, symbol: &str, bars: &[OhlcvBar]) -> anyhow::Result<u64> {
        let symbol = normalize_symbol(symbol);
        anyhow::ensure!(!symbol.is_empty(), "symbol must be non-empty");

        let mut by_date: BTreeMap<NaiveDate, &OhlcvBar> = BTreeMap::new();
        for bar in bars {
            if !bar.is_valid() {
                tracing::debug!(%symbol, date = %bar.date, "skipping bar with non-finite close/volume");
                continue;
            }
            by_date.insert(bar.date, bar);
        }
        if by_date.is_empty() {
            return Ok(0);
        }
        let rows: Vec<&OhlcvBar> = by_date.into_values().collect();

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        let mut affected: u64 = 0;
        for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO ticker_ohlc (symbol, date, open, high, low, close, volume, dollar_volume) ",
            );
            qb.push_values(chunk, |mut b, bar| {
                b.push_bind(symbol.as_str())
                    .push_bind(bar.date)
                    .push_bind(bar.open)
                    .push_bind(bar.high)
                    .push_bind(bar.low)
                    .push_bind(bar.close)
                    .push_bind(bar.volume)
                    .push_bind(bar.dollar_volume());
            });
            qb.push(
                " ON CONFLICT (symbol, date) DO UPDATE \
                   SET open = excluded.open, high = excluded.high, low = excluded.low, \
                       close = excluded.close, volume = excluded.volume, \
                       dollar_volume = excluded.dollar_volume",
            );

            let res = qb
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("batch upsert ticker_ohlc failed for {symbol}"))?;
            affected += res.rows_affected();
        }
        tx.commit().await.context("commit transaction failed")?;

        tracing::debug!(%symbol, rows = rows.len(), "ticker_ohlc upsert");
        Ok(affected)
    }

    /// Deletes bars older than `as_of - retention_days`, always keeping the most
    /// recent `keep_latest` bars so pruning alone never starves metric computation.
    pub async fn prune(
        &self,
        symbol: &str,
        retention_days: i64,
        keep_latest: usize,
        as_of: NaiveDate,
    ) -> anyhow::Result<u64> {
        let symbol = normalize_symbol(symbol);
        let cutoff = as_of - Duration::days(retention_days);

        let res = sqlx::query(
            "DELETE FROM ticker_ohlc \
             WHERE symbol = ?1 AND date < ?2 \
               AND date NOT IN ( \
                   SELECT date FROM ticker_ohlc WHERE symbol = ?1 ORDER BY date DESC LIMIT ?3 \
               )",
        )
        .bind(&symbol)
        .bind(cutoff)
        .bind(keep_latest as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("prune ticker_ohlc failed for {symbol}"))?;

        if res.rows_affected() > 0 {
            tracing::debug!(%symbol, %cutoff, pruned = res.rows_affected(), "pruned old bars");
        }
        Ok(res.rows_affected())
    }

    /// Bars in `[from, to]`, ascending by date.
    pub async fn range_scan(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<OhlcvBar>> {
        let symbol = normalize_symbol(symbol);
        let rows = sqlx::query_as::<_, BarRow>(
            "SELECT date, open, high, low, close, volume \
             FROM ticker_ohlc \
             WHERE symbol = ?1 AND date >= ?2 AND date <= ?3 \
             ORDER BY date ASC",
        )
        .bind(&symbol)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("range scan ticker_ohlc failed for {symbol}"))?;

        Ok(into_bars(&symbol, rows))
    }

    /// Full stored history, ascending by date.
    pub async fn history(&self, symbol: &str) -> anyhow::Result<Vec<OhlcvBar>> {
        let symbol = normalize_symbol(symbol);
        let rows = sqlx::query_as::<_, BarRow>(
            "SELECT date, open, high, low, close, volume \
             FROM ticker_ohlc \
             WHERE symbol = ?1 \
             ORDER BY date ASC",
        )
        .bind(&symbol)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("load ticker_ohlc failed for {symbol}"))?;

        Ok(into_bars(&symbol, rows))
    }

    pub async fn count(&self, symbol: &str) -> anyhow::Result<i64> {
        let symbol = normalize_symbol(symbol);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ticker_ohlc WHERE symbol = ?1")
            .bind(&symbol)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("count ticker_ohlc failed for {symbol}"))?;
        Ok(count)
    }

    pub async fn symbols(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT symbol FROM ticker_ohlc ORDER BY symbol")
                .fetch_all(&self.pool)
                .await
                .context("list ticker_ohlc symbols failed")?;
        Ok(rows)
    }
}

fn into_bars(symbol: &str, rows: Vec<BarRow>) -> Vec<OhlcvBar> {
    rows.into_iter()
        .map(|(date, open, high, low, close, volume)| OhlcvBar {
            symbol: symbol.to_string(),
            date,
            open,
            high,
            low,
            close,
            volume,
        })
        .collect()
}
