use crate::domain::snapshot::SnapshotPayload;
use anyhow::Context;
use chrono::NaiveDate;
use sqlx::SqlitePool;

/// Archives the payload under its snapshot date, replacing any earlier row.
pub async fn upsert_snapshot(pool: &SqlitePool, payload: &SnapshotPayload) -> anyhow::Result<()> {
    let body = serde_json::to_string(payload).context("serialize snapshot payload failed")?;
    sqlx::query(
        "INSERT INTO sector_snapshot (snapshot_date, generated_at, payload) VALUES (?1, ?2, ?3) \
         ON CONFLICT (snapshot_date) DO UPDATE \
           SET generated_at = excluded.generated_at, payload = excluded.payload",
    )
    .bind(payload.snapshot_date)
    .bind(payload.generated_at)
    .bind(body)
    .execute(pool)
    .await
    .with_context(|| format!("upsert sector_snapshot failed for {}", payload.snapshot_date))?;
    Ok(())
}

pub async fn load_snapshot(
    pool: &SqlitePool,
    snapshot_date: NaiveDate,
) -> anyhow::Result<Option<SnapshotPayload>> {
    let body: Option<String> =
        sqlx::query_scalar("SELECT payload FROM sector_snapshot WHERE snapshot_date = ?1")
            .bind(snapshot_date)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("load sector_snapshot failed for {snapshot_date}"))?;
    body.map(|b| decode(&b)).transpose()
}

pub async fn load_latest_snapshot(pool: &SqlitePool) -> anyhow::Result<Option<SnapshotPayload>> {
    let body: Option<String> = sqlx::query_scalar(
        "SELECT payload FROM sector_snapshot ORDER BY snapshot_date DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("load latest sector_snapshot failed")?;
    body.map(|b| decode(&b)).transpose()
}

fn decode(body: &str) -> anyhow::Result<SnapshotPayload> {
    serde_json::from_str(body).context("invalid sector_snapshot payload")
}
