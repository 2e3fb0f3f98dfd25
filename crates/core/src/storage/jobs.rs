use crate::domain::job::{JobRecord, JobStatus};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

type JobRow = (
    String,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<String>,
    String,
);

pub async fn insert_job(pool: &SqlitePool, job: &JobRecord) -> anyhow::Result<()> {
    let meta = serde_json::to_string(&job.meta).context("serialize job meta failed")?;
    sqlx::query(
        "INSERT INTO job_runs (id, kind, status, created_at, started, ended, message, meta) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&job.id)
    .bind(&job.kind)
    .bind(job.status.as_str())
    .bind(job.created_at)
    .bind(job.started)
    .bind(job.ended)
    .bind(&job.message)
    .bind(meta)
    .execute(pool)
    .await
    .with_context(|| format!("insert job_runs failed for {}", job.id))?;
    Ok(())
}

/// Writes the mutable part of a job (status, timestamps, message).
pub async fn update_job(pool: &SqlitePool, job: &JobRecord) -> anyhow::Result<()> {
    let res = sqlx::query(
        "UPDATE job_runs SET status = ?2, started = ?3, ended = ?4, message = ?5 WHERE id = ?1",
    )
    .bind(&job.id)
    .bind(job.status.as_str())
    .bind(job.started)
    .bind(job.ended)
    .bind(&job.message)
    .execute(pool)
    .await
    .with_context(|| format!("update job_runs failed for {}", job.id))?;
    anyhow::ensure!(res.rows_affected() == 1, "job_runs row missing for {}", job.id);
    Ok(())
}

pub async fn load_job(pool: &SqlitePool, id: &str) -> anyhow::Result<Option<JobRecord>> {
    let row = sqlx::query_as::<_, JobRow>(
        "SELECT id, kind, status, created_at, started, ended, message, meta \
         FROM job_runs WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("load job_runs failed for {id}"))?;
    row.map(from_row).transpose()
}

fn from_row(row: JobRow) -> anyhow::Result<JobRecord> {
    let (id, kind, status, created_at, started, ended, message, meta) = row;
    let status: JobStatus = status.parse()?;
    let meta = serde_json::from_str(&meta).with_context(|| format!("invalid meta JSON for job {id}"))?;
    Ok(JobRecord {
        id,
        kind,
        status,
        created_at,
        started,
        ended,
        message,
        meta,
    })
}
