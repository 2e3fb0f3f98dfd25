use crate::config::Settings;
use crate::domain::bar::{normalize_symbol, OhlcvBar};
use crate::ingest::types::{OhlcResponse, QuoteResponse, QuoteTermResponse};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;
const OHLC_PATH: &str = "/v1/ohlc";
const QUOTE_PATH: &str = "/v1/quote";
const QUOTE_TERM_PATH: &str = "/v1/quote_term";

/// Upstream market data as the core sees it.
///
/// The contract makes no retry promise. An implementation may retry its own
/// transport a bounded number of times (`HttpMarketData` does), but once a
/// call returns an error it is final for that call: the pipeline records the
/// failure and the symbol is fetched again on the next refresh or cache miss.
#[async_trait::async_trait]
pub trait MarketData: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn get_ohlc(&self, symbol: &str, period: &str, interval: &str) -> Result<Vec<OhlcvBar>>;

    async fn get_last_price(&self, symbol: &str) -> Result<Option<f64>>;

    async fn get_quote_term(&self) -> Result<Option<BTreeMap<String, f64>>>;
}

#[derive(Debug, Clone)]
pub struct HttpMarketData {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retries: u32,
}

impl HttpMarketData {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_data_provider_base_url()?.to_string();
        let api_key = settings.data_provider_api_key.clone();

        let timeout_secs = std::env::var("DATA_PROVIDER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("DATA_PROVIDER_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES)
            .max(1);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build market data http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let res = self
            .http
            .get(self.url(path))
            .headers(self.headers()?)
            .query(query)
            .send()
            .await
            .with_context(|| format!("market data request failed: {path}"))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read market data response")?;
        if !status.is_success() {
            anyhow::bail!("market data HTTP {status} for {path}: {text}");
        }
        serde_json::from_str::<T>(&text)
            .with_context(|| format!("market data response for {path} is malformed: {text}"))
    }

    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.get_once(path, query).await {
                Ok(parsed) => return Ok(parsed),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = retry_backoff(attempt);
                    tracing::warn!(attempt, ?backoff, path, error = %err, "market data fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Delay before the attempt after `attempt` (1-based): 1s, 2s, 4s, ... capped at 30s.
fn retry_backoff(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.saturating_sub(1).min(5);
    Duration::from_secs(secs.min(30))
}

#[async_trait::async_trait]
impl MarketData for HttpMarketData {
    fn provider_name(&self) -> &'static str {
        "http_json"
    }

    async fn get_ohlc(&self, symbol: &str, period: &str, interval: &str) -> Result<Vec<OhlcvBar>> {
        let symbol = normalize_symbol(symbol);
        let resp: OhlcResponse = self
            .get_with_retry(
                OHLC_PATH,
                &[("symbol", symbol.as_str()), ("period", period), ("interval", interval)],
            )
            .await?;

        let total = resp.rows.len();
        let bars: Vec<OhlcvBar> = resp
            .rows
            .into_iter()
            .filter_map(|row| row.into_bar(&symbol))
            .collect();
        if bars.len() < total {
            tracing::debug!(%symbol, skipped = total - bars.len(), "dropped incomplete ohlc rows");
        }
        anyhow::ensure!(!bars.is_empty(), "market data returned no usable bars for {symbol}");
        Ok(bars)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Option<f64>> {
        let symbol = normalize_symbol(symbol);
        let resp: QuoteResponse = self.get_with_retry(QUOTE_PATH, &[("symbol", symbol.as_str())]).await?;
        Ok(resp.price.filter(|p| p.is_finite()))
    }

    async fn get_quote_term(&self) -> Result<Option<BTreeMap<String, f64>>> {
        let resp: QuoteTermResponse = self.get_with_retry(QUOTE_TERM_PATH, &[]).await?;
        Ok(resp.values)
    }
}
