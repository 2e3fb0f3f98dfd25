use crate::cache::{FetchCoalescingCache, Namespace};
use crate::domain::bar::{normalize_symbol, OhlcvBar};
use crate::ingest::provider::MarketData;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

const QUOTE_TERM_KEY: &str = "term";

/// `MarketData` that routes every call through the coalescing cache.
#[derive(Clone)]
pub struct CachedMarketData {
    inner: Arc<dyn MarketData>,
    cache: Arc<FetchCoalescingCache>,
}

impl CachedMarketData {
    pub fn new(inner: Arc<dyn MarketData>, cache: Arc<FetchCoalescingCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<FetchCoalescingCache> {
        &self.cache
    }

    /// Drops every cached entry of one namespace, returning how many went.
    pub async fn purge(&self, ns: Namespace) -> usize {
        self.cache.purge(ns).await
    }
}

pub fn ohlc_key(symbol: &str, period: &str, interval: &str) -> String {
    format!("{}:{period}:{interval}", normalize_symbol(symbol))
}

#[async_trait::async_trait]
impl MarketData for CachedMarketData {
    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    async fn get_ohlc(&self, symbol: &str, period: &str, interval: &str) -> Result<Vec<OhlcvBar>> {
        let key = ohlc_key(symbol, period, interval);
        let bars = self
            .cache
            .get_or_fetch(Namespace::Ohlc, &key, || {
                self.inner.get_ohlc(symbol, period, interval)
            })
            .await?;
        Ok(bars)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Option<f64>> {
        let key = normalize_symbol(symbol);
        let price = self
            .cache
            .get_or_fetch(Namespace::Quotes, &key, || self.inner.get_last_price(symbol))
            .await?;
        Ok(price)
    }

    async fn get_quote_term(&self) -> Result<Option<BTreeMap<String, f64>>> {
        let term = self
            .cache
            .get_or_fetch(Namespace::QuoteTerm, QUOTE_TERM_KEY, || self.inner.get_quote_term())
            .await?;
        Ok(term)
    }
}
