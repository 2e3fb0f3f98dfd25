use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sectorflow_core::cache::{FetchCoalescingCache, Namespace, NamespaceStats};
use sectorflow_core::config::{CacheConfig, EngineConfig, Settings};
use sectorflow_core::domain::{JobRecord, OhlcvBar, SectorDefinition, SectorRollup, SnapshotPayload};
use sectorflow_core::ingest::{CachedMarketData, HttpMarketData, MarketData};
use sectorflow_core::jobs::{JobError, JobQueue, SectorMutations};
use sectorflow_core::pipeline::Pipeline;
use sectorflow_core::snapshot::SnapshotError;
use sectorflow_core::storage::{self, sectors, SectorLockRegistry};

const MAX_WAIT_SECS: u64 = 60;

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

    let state = match build_state(&settings).await {
        Ok(state) => state,
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %format!("{err:#}"), "api startup failed");
            return Err(err);
        }
    };
    let queue = state.mutations.queue().clone();
    queue.start();

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/snapshots/latest", get(get_latest_snapshot))
        .route("/sectors", post(create_sector))
        .route("/sectors/:id/tickers", post(add_ticker))
        .route("/sectors/:id/tickers/:symbol", delete(remove_ticker))
        .route("/sectors/:id/recompute", post(recompute_sector))
        .route("/sectors/:id/rollup", get(preview_rollup))
        .route("/tasks/:id", get(get_task))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/:namespace", delete(purge_cache))
        .route("/price/:symbol", get(get_price))
        .route("/ohlc/:symbol", get(get_ohlc))
        .route("/quote_term", get(get_quote_term))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.stop();
    Ok(())
}

#[derive(Clone)]
struct AppState {
    mutations: SectorMutations,
    market: Arc<CachedMarketData>,
}

impl AppState {
    fn pipeline(&self) -> &Pipeline {
        self.mutations.pipeline()
    }

    fn cache(&self) -> &Arc<FetchCoalescingCache> {
        self.market.cache()
    }
}

async fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    let config = EngineConfig::from_env()?;
    let pool = storage::connect(settings.require_database_url()?).await?;
    storage::migrate(&pool).await?;
    if let Some(seed) = &config.sectors_seed_path {
        sectors::bootstrap_from_seed(&pool, seed).await?;
    }

    let cache = Arc::new(FetchCoalescingCache::new(CacheConfig::from_env()?)?);
    let http: Arc<dyn MarketData> = Arc::new(HttpMarketData::from_settings(settings)?);
    let market = Arc::new(CachedMarketData::new(http, cache));

    let pipeline = Pipeline::new(pool.clone(), market.clone(), config);
    let queue = Arc::new(JobQueue::new(pool));
    let mutations = SectorMutations::new(pipeline, queue, Arc::new(SectorLockRegistry::new()));
    Ok(AppState { mutations, market })
}

async fn healthz() -> &'static str {
    "ok"
}

fn internal(err: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&err);
    tracing::error!(error = %format!("{err:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn upstream(err: anyhow::Error) -> StatusCode {
    tracing::warn!(error = %format!("{err:#}"), "market data request failed");
    StatusCode::BAD_GATEWAY
}

fn job_status(err: JobError) -> StatusCode {
    match err {
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        JobError::Storage(err) => internal(err),
    }
}

async fn get_latest_snapshot(
    State(state): State<AppState>,
) -> Result<Json<SnapshotPayload>, StatusCode> {
    match state.pipeline().snapshots().load_latest().await {
        Ok(payload) => Ok(Json(payload)),
        Err(SnapshotError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(err @ (SnapshotError::ChecksumMissing(_) | SnapshotError::ChecksumMismatch { .. })) => {
            tracing::error!(error = %err, "latest snapshot failed verification");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(err) => Err(internal(err.into())),
    }
}

#[derive(Debug, Serialize)]
struct Accepted {
    task_id: String,
}

fn accepted(result: Result<String, JobError>) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    let task_id = result.map_err(job_status)?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { task_id })))
}

async fn ensure_sector(state: &AppState, id: &str) -> Result<(), StatusCode> {
    match sectors::load_sector(state.pipeline().pool(), id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => Err(internal(err)),
    }
}

async fn create_sector(
    State(state): State<AppState>,
    Json(sector): Json<SectorDefinition>,
) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    if sector.id.trim().is_empty() || sector.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    accepted(state.mutations.enqueue_create_sector(sector).await)
}

#[derive(Debug, Deserialize)]
struct TickerIn {
    symbol: String,
}

async fn add_ticker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TickerIn>,
) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    if body.symbol.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_sector(&state, &id).await?;
    accepted(state.mutations.enqueue_add_ticker(&id, &body.symbol).await)
}

async fn remove_ticker(
    State(state): State<AppState>,
    Path((id, symbol)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    ensure_sector(&state, &id).await?;
    accepted(state.mutations.enqueue_remove_ticker(&id, &symbol).await)
}

async fn recompute_sector(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), StatusCode> {
    ensure_sector(&state, &id).await?;
    accepted(state.mutations.enqueue_sector_patch(&id).await)
}

/// Rollup computed from stored bars without touching the snapshot.
async fn preview_rollup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SectorRollup>, StatusCode> {
    ensure_sector(&state, &id).await?;
    let key = id.trim().to_lowercase();
    let pipeline = state.pipeline().clone();
    let sector_id = key.clone();
    let rollup = state
        .cache()
        .get_or_fetch(Namespace::Computed, &key, || async move {
            pipeline.recompute_sector(&sector_id).await
        })
        .await
        .map_err(|err| internal(err.into()))?;
    Ok(Json(rollup))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    /// Seconds to block until the job finishes.
    wait: Option<u64>,
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<JobRecord>, StatusCode> {
    let queue = state.mutations.queue();
    if let Some(secs) = query.wait {
        let timeout = Duration::from_secs(secs.min(MAX_WAIT_SECS));
        match queue.wait(&id, timeout).await {
            Ok(record) => return Ok(Json(record)),
            Err(JobError::Timeout { .. }) => {}
            Err(err) => return Err(job_status(err)),
        }
    }
    match queue.get(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => Err(job_status(err)),
    }
}

async fn cache_stats(State(state): State<AppState>) -> Json<BTreeMap<Namespace, NamespaceStats>> {
    Json(state.cache().stats())
}

#[derive(Debug, Serialize)]
struct Purged {
    namespace: Namespace,
    removed: usize,
}

async fn purge_cache(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<Purged>, StatusCode> {
    let namespace = Namespace::parse(&namespace).ok_or(StatusCode::BAD_REQUEST)?;
    let removed = state.market.purge(namespace).await;
    Ok(Json(Purged { namespace, removed }))
}

#[derive(Debug, Serialize)]
struct PriceOut {
    symbol: String,
    price: Option<f64>,
}

async fn get_price(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<PriceOut>, StatusCode> {
    let symbol = symbol.trim().to_uppercase();
    let price = state.market.get_last_price(&symbol).await.map_err(upstream)?;
    Ok(Json(PriceOut { symbol, price }))
}

#[derive(Debug, Deserialize)]
struct OhlcQuery {
    period: Option<String>,
    interval: Option<String>,
}

async fn get_ohlc(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<OhlcQuery>,
) -> Result<Json<Vec<OhlcvBar>>, StatusCode> {
    let period = query.period.as_deref().unwrap_or("1mo");
    let interval = query.interval.as_deref().unwrap_or("1d");
    let bars = state
        .market
        .get_ohlc(&symbol, period, interval)
        .await
        .map_err(upstream)?;
    Ok(Json(bars))
}

async fn get_quote_term(
    State(state): State<AppState>,
) -> Result<Json<Option<BTreeMap<String, f64>>>, StatusCode> {
    let term = state.market.get_quote_term().await.map_err(upstream)?;
    Ok(Json(term))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
