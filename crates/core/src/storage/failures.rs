use crate::config::FailurePolicy;
use crate::domain::bar::normalize_symbol;
use crate::domain::snapshot::InactiveTicker;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub symbol: String,
    pub failure_count: i64,
    pub last_failure: DateTime<Utc>,
}

impl FailureRecord {
    /// Inactive = at least `threshold` failures with the latest one inside the
    /// rolling window. Old failures expire so a symbol gets another chance.
    pub fn is_inactive(&self, as_of: DateTime<Utc>, policy: FailurePolicy) -> bool {
        if self.failure_count < policy.threshold {
            return false;
        }
        self.last_failure >= as_of - Duration::days(policy.window_days)
    }
}

impl From<&FailureRecord> for InactiveTicker {
    fn from(r: &FailureRecord) -> Self {
        Self {
            symbol: r.symbol.clone(),
            failure_count: r.failure_count,
            last_failure: Some(r.last_failure),
        }
    }
}

/// Consecutive-failure counter per symbol, backed by `ticker_failures`.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    pool: SqlitePool,
    policy: FailurePolicy,
}

impl FailureTracker {
    pub fn new(pool: SqlitePool, policy: FailurePolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub async fn record_failure(&self, symbol: &str) -> anyhow::Result<i64> {
        self.record_failure_at(symbol, Utc::now()).await
    }

    /// Bumps the counter and timestamp. Returns the new count.
    pub async fn record_failure_at(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let symbol = normalize_symbol(symbol);
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO ticker_failures (symbol, failure_count, last_failure) \
             VALUES (?1, 1, ?2) \
             ON CONFLICT (symbol) DO UPDATE \
               SET failure_count = ticker_failures.failure_count + 1, \
                   last_failure = excluded.last_failure \
             RETURNING failure_count",
        )
        .bind(&symbol)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("record failure failed for {symbol}"))?;

        tracing::debug!(%symbol, failure_count = count, "recorded ticker failure");
        Ok(count)
    }

    pub async fn clear_failure(&self, symbol: &str) -> anyhow::Result<()> {
        let symbol = normalize_symbol(symbol);
        sqlx::query("DELETE FROM ticker_failures WHERE symbol = ?1")
            .bind(&symbol)
            .execute(&self.pool)
            .await
            .with_context(|| format!("clear failure failed for {symbol}"))?;
        Ok(())
    }

    pub async fn load_all(&self) -> anyhow::Result<Vec<FailureRecord>> {
        let rows = sqlx::query_as::<_, (String, i64, DateTime<Utc>)>(
            "SELECT symbol, failure_count, last_failure FROM ticker_failures ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await
        .context("load ticker_failures failed")?;

        Ok(rows
            .into_iter()
            .map(|(symbol, failure_count, last_failure)| FailureRecord {
                symbol,
                failure_count,
                last_failure,
            })
            .collect())
    }

    /// Records for symbols that are inactive as of `as_of`, sorted by symbol.
    pub async fn inactive_records(&self, as_of: DateTime<Utc>) -> anyhow::Result<Vec<FailureRecord>> {
        let policy = self.policy;
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.is_inactive(as_of, policy))
            .collect())
    }

    pub async fn inactive(&self, as_of: DateTime<Utc>) -> anyhow::Result<BTreeSet<String>> {
        Ok(self
            .inactive_records(as_of)
            .await?
            .into_iter()
            .map(|r| r.symbol)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn counts_accumulate_and_clear() {
        let (pool, _dir) = test_pool().await;
        let tracker = FailureTracker::new(pool, FailurePolicy::default());

        assert_eq!(tracker.record_failure_at("aaa", at(2024, 3, 1)).await.unwrap(), 1);
        assert_eq!(tracker.record_failure_at("AAA", at(2024, 3, 2)).await.unwrap(), 2);

        let all = tracker.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_failure, at(2024, 3, 2));

        tracker.clear_failure("aaa").await.unwrap();
        assert!(tracker.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_outside_window_expire() {
        let (pool, _dir) = test_pool().await;
        let tracker = FailureTracker::new(pool, FailurePolicy::default());
        let now = at(2024, 6, 1);

        for day in 1..=3 {
            tracker.record_failure_at("OLD", at(2024, 3, day)).await.unwrap();
        }
        assert!(tracker.inactive(now).await.unwrap().is_empty());

        // A fresh failure brings the most recent one inside the window.
        tracker.record_failure_at("OLD", at(2024, 5, 20)).await.unwrap();
        let inactive = tracker.inactive(now).await.unwrap();
        assert!(inactive.contains("OLD"));
    }

    #[tokio::test]
    async fn below_threshold_is_never_inactive() {
        let (pool, _dir) = test_pool().await;
        let tracker = FailureTracker::new(pool, FailurePolicy::default());
        let now = at(2024, 6, 1);

        tracker.record_failure_at("FLAKY", now).await.unwrap();
        tracker.record_failure_at("FLAKY", now).await.unwrap();
        assert!(tracker.inactive(now).await.unwrap().is_empty());

        tracker.record_failure_at("FLAKY", now).await.unwrap();
        let records = tracker.inactive_records(now).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_count, 3);
    }
}
