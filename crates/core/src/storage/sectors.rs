use crate::domain::bar::normalize_symbol;
use crate::domain::sector::{normalize_sector_id, SectorDefinition};
use anyhow::Context;
use serde::Deserialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    sectors: Vec<SectorDefinition>,
}

/// All sectors ordered by `sort_order`, members in their stored position.
pub async fn load_sectors(pool: &SqlitePool) -> anyhow::Result<Vec<SectorDefinition>> {
    let defs = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT sector_id, name, sort_order FROM sector_definitions ORDER BY sort_order, sector_id",
    )
    .fetch_all(pool)
    .await
    .context("load sector_definitions failed")?;

    let members = sqlx::query_as::<_, (String, String)>(
        "SELECT sector_id, symbol FROM sectors_map ORDER BY sector_id, position",
    )
    .fetch_all(pool)
    .await
    .context("load sectors_map failed")?;

    let mut out: Vec<SectorDefinition> = defs
        .into_iter()
        .map(|(id, name, sort_order)| SectorDefinition {
            id,
            name,
            sort_order,
            members: Vec::new(),
        })
        .collect();
    for (sector_id, symbol) in members {
        if let Some(def) = out.iter_mut().find(|d| d.id == sector_id) {
            def.members.push(symbol);
        }
    }
    Ok(out)
}

pub async fn load_sector(pool: &SqlitePool, sector_id: &str) -> anyhow::Result<Option<SectorDefinition>> {
    let id = normalize_sector_id(sector_id);
    let def = sqlx::query_as::<_, (String, i64)>(
        "SELECT name, sort_order FROM sector_definitions WHERE sector_id = ?1",
    )
    .bind(&id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("load sector {id} failed"))?;

    let Some((name, sort_order)) = def else {
        return Ok(None);
    };
    let members: Vec<String> = sqlx::query_scalar(
        "SELECT symbol FROM sectors_map WHERE sector_id = ?1 ORDER BY position",
    )
    .bind(&id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("load members of {id} failed"))?;

    Ok(Some(SectorDefinition {
        id,
        name,
        sort_order,
        members,
    }))
}

/// Creates or replaces a sector and its full membership. New sectors are
/// appended after the current last `sort_order`; existing ones keep theirs.
pub async fn upsert_sector_definition(
    pool: &SqlitePool,
    sector: &SectorDefinition,
) -> anyhow::Result<SectorDefinition> {
    let sector = sector.clone().normalized();
    anyhow::ensure!(!sector.id.is_empty(), "sector id must be non-empty");

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT sort_order FROM sector_definitions WHERE sector_id = ?1")
            .bind(&sector.id)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("lookup sector {} failed", sector.id))?;

    let sort_order = match existing {
        Some(order) => order,
        None => {
            let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sort_order) FROM sector_definitions")
                .fetch_one(&mut *tx)
                .await
                .context("read max sort_order failed")?;
            max.map(|m| m + 1).unwrap_or(0)
        }
    };

    sqlx::query(
        "INSERT INTO sector_definitions (sector_id, name, sort_order) VALUES (?1, ?2, ?3) \
         ON CONFLICT (sector_id) DO UPDATE SET name = excluded.name",
    )
    .bind(&sector.id)
    .bind(&sector.name)
    .bind(sort_order)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("upsert sector_definitions failed for {}", sector.id))?;

    replace_members(&mut tx, &sector.id, &sector.members).await?;
    tx.commit().await.context("commit transaction failed")?;

    tracing::info!(sector = %sector.id, members = sector.members.len(), "sector definition saved");
    Ok(SectorDefinition { sort_order, ..sector })
}

async fn replace_members(
    tx: &mut Transaction<'_, Sqlite>,
    sector_id: &str,
    members: &[String],
) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM sectors_map WHERE sector_id = ?1")
        .bind(sector_id)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("clear sectors_map failed for {sector_id}"))?;
    if members.is_empty() {
        return Ok(());
    }

    let mut qb = sqlx::QueryBuilder::new("INSERT INTO sectors_map (sector_id, symbol, position) ");
    qb.push_values(members.iter().enumerate(), |mut b, (pos, symbol)| {
        b.push_bind(sector_id)
            .push_bind(symbol.as_str())
            .push_bind(pos as i64);
    });
    qb.build()
        .execute(&mut **tx)
        .await
        .with_context(|| format!("insert sectors_map failed for {sector_id}"))?;
    Ok(())
}

/// Appends a member at the end. Returns false if it was already present.
pub async fn add_member(pool: &SqlitePool, sector_id: &str, symbol: &str) -> anyhow::Result<bool> {
    let id = normalize_sector_id(sector_id);
    let symbol = normalize_symbol(symbol);
    anyhow::ensure!(!symbol.is_empty(), "symbol must be non-empty");
    ensure_sector_exists(pool, &id).await?;

    let res = sqlx::query(
        "INSERT INTO sectors_map (sector_id, symbol, position) \
         SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0) FROM sectors_map WHERE sector_id = ?1 \
         ON CONFLICT (sector_id, symbol) DO NOTHING",
    )
    .bind(&id)
    .bind(&symbol)
    .execute(pool)
    .await
    .with_context(|| format!("add {symbol} to {id} failed"))?;

    Ok(res.rows_affected() > 0)
}

/// Returns false if the symbol was not a member.
pub async fn remove_member(pool: &SqlitePool, sector_id: &str, symbol: &str) -> anyhow::Result<bool> {
    let id = normalize_sector_id(sector_id);
    let symbol = normalize_symbol(symbol);
    ensure_sector_exists(pool, &id).await?;

    let res = sqlx::query("DELETE FROM sectors_map WHERE sector_id = ?1 AND symbol = ?2")
        .bind(&id)
        .bind(&symbol)
        .execute(pool)
        .await
        .with_context(|| format!("remove {symbol} from {id} failed"))?;

    Ok(res.rows_affected() > 0)
}

async fn ensure_sector_exists(pool: &SqlitePool, id: &str) -> anyhow::Result<()> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sector_definitions WHERE sector_id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("lookup sector {id} failed"))?;
    anyhow::ensure!(found.is_some(), "sector not found: {id}");
    Ok(())
}

/// Distinct members across every sector, sorted.
pub async fn universe(pool: &SqlitePool) -> anyhow::Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar("SELECT DISTINCT symbol FROM sectors_map ORDER BY symbol")
        .fetch_all(pool)
        .await
        .context("load sector universe failed")?;
    Ok(rows)
}

/// Imports a `{"sectors": [...]}` seed file, but only into an empty store.
/// Returns the number of sectors imported.
pub async fn bootstrap_from_seed(pool: &SqlitePool, path: &Path) -> anyhow::Result<usize> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sector_definitions")
        .fetch_one(pool)
        .await
        .context("count sector_definitions failed")?;
    if existing > 0 {
        tracing::debug!(existing, "sector definitions present; skipping seed");
        return Ok(0);
    }

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read sectors seed {}", path.display()))?;
    let seed: SeedFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid sectors seed JSON {}", path.display()))?;

    let mut imported = 0;
    for sector in seed.sectors {
        let sector = sector.normalized();
        if sector.id.is_empty() {
            continue;
        }
        upsert_sector_definition(pool, &sector).await?;
        imported += 1;
    }
    tracing::info!(imported, seed = %path.display(), "bootstrapped sector definitions");
    Ok(imported)
}
