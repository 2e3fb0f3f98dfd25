use anyhow::Context;
use clap::Parser;
use sectorflow_core::config::{EngineConfig, Settings};
use sectorflow_core::ingest::HttpMarketData;
use sectorflow_core::pipeline::{Pipeline, RefreshOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sectorflow_worker")]
struct Args {
    /// Snapshot date (YYYY-MM-DD). Defaults to today's UTC date.
    #[arg(long)]
    as_of_date: Option<String>,

    /// Fetch and compute everything, but do not publish the snapshot.
    #[arg(long)]
    dry_run: bool,

    /// JSON seed of sector definitions, imported only into an empty store.
    #[arg(long)]
    sectors_seed: Option<PathBuf>,

    /// Overrides SNAPSHOT_DIR.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    if let Err(err) = run(&settings, args).await {
        sentry_anyhow::capture_anyhow(&err);
        tracing::error!(error = %format!("{err:#}"), "snapshot refresh failed");
        return Err(err);
    }
    Ok(())
}

async fn run(settings: &Settings, args: Args) -> anyhow::Result<()> {
    let as_of = resolve_as_of_date(args.as_of_date.as_deref())?;

    let mut config = EngineConfig::from_env()?;
    if let Some(seed) = args.sectors_seed {
        config.sectors_seed_path = Some(seed);
    }
    if let Some(dir) = args.snapshot_dir {
        config.snapshot.dir = dir;
    }

    let db_url = settings.require_database_url()?;
    let pool = sectorflow_core::storage::connect(db_url).await?;
    sectorflow_core::storage::migrate(&pool).await?;

    let provider = HttpMarketData::from_settings(settings)?;
    let pipeline = Pipeline::new(pool, Arc::new(provider), config);

    let options = RefreshOptions {
        as_of,
        dry_run: args.dry_run,
    };
    match pipeline.build_snapshot(options).await? {
        Some((report, payload)) => {
            tracing::info!(
                %as_of,
                dry_run = args.dry_run,
                processed = report.processed,
                skipped_inactive = report.skipped_inactive,
                fetch_failures = report.fetch_failures,
                insufficient = report.insufficient,
                metrics = report.metrics_computed,
                sectors = payload.sectors_count,
                members = payload.members_count,
                "snapshot refresh complete"
            );
        }
        None => {
            tracing::warn!(%as_of, "another refresh holds the run guard; nothing done");
        }
    }
    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

fn resolve_as_of_date(as_of_date_arg: Option<&str>) -> anyhow::Result<chrono::NaiveDate> {
    match as_of_date_arg {
        Some(s) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid --as-of-date: {s}")),
        None => Ok(chrono::Utc::now().date_naive()),
    }
}
