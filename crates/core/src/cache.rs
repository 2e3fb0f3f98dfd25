//! TTL cache in front of the market data provider.
//!
//! Concurrent misses on the same `(namespace, key)` share one upstream call:
//! the first caller becomes the owner and runs the fetcher, later callers
//! wait on a watch channel for the owner's result (or error).

use crate::config::{CacheConfig, NamespacePolicy};
use crate::snapshot::AtomicWriter;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Quotes,
    Ohlc,
    QuoteTerm,
    Computed,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Quotes,
        Namespace::Ohlc,
        Namespace::QuoteTerm,
        Namespace::Computed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Quotes => "quotes",
            Namespace::Ohlc => "ohlc",
            Namespace::QuoteTerm => "quote_term",
            Namespace::Computed => "computed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == s)
    }

    fn policy(&self, config: &CacheConfig) -> NamespacePolicy {
        match self {
            Namespace::Quotes => config.quotes,
            Namespace::Ohlc => config.ohlc,
            Namespace::QuoteTerm => config.quote_term,
            Namespace::Computed => config.computed,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("upstream fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),

    #[error("cache value serialization failed: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("invalid cache configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: usize,
}

type CacheKey = (Namespace, String);
type Shared = Result<Value, CacheError>;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
    expires_wall: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    expires_at: DateTime<Utc>,
    value: Value,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<CacheKey, Entry>,
    inflight: HashMap<CacheKey, watch::Receiver<Option<Shared>>>,
    stats: HashMap<Namespace, NamespaceStats>,
}

impl State {
    fn stats_mut(&mut self, ns: Namespace) -> &mut NamespaceStats {
        self.stats.entry(ns).or_default()
    }

    /// Drops expired entries, then the soonest-expiring ones until at most
    /// `max` remain.
    fn evict(&mut self, max: usize) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        if self.entries.len() > max {
            let mut by_expiry: Vec<(Instant, CacheKey)> = self
                .entries
                .iter()
                .map(|(k, e)| (e.expires_at, k.clone()))
                .collect();
            by_expiry.sort_by(|a, b| a.0.cmp(&b.0));
            let excess = self.entries.len() - max;
            for (_, key) in by_expiry.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
        before - self.entries.len()
    }

    fn namespace_snapshot(&self, ns: Namespace) -> BTreeMap<String, PersistedEntry> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|((n, _), e)| *n == ns && e.expires_at > now)
            .map(|((_, key), e)| {
                (
                    key.clone(),
                    PersistedEntry {
                        expires_at: e.expires_wall,
                        value: e.value.clone(),
                    },
                )
            })
            .collect()
    }
}

enum Role {
    Hit(Value),
    Wait(watch::Receiver<Option<Shared>>),
    Fetch(watch::Sender<Option<Shared>>),
}

#[derive(Debug)]
pub struct FetchCoalescingCache {
    config: CacheConfig,
    state: Mutex<State>,
    writer: Option<AtomicWriter>,
    /// Serializes snapshot-and-write of each namespace file.
    persist_locks: BTreeMap<Namespace, AsyncMutex<()>>,
}

impl FetchCoalescingCache {
    /// Validates the config and reloads unexpired entries of persistent
    /// namespaces from `persist_dir`.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config
            .validate()
            .map_err(|e| CacheError::Config(format!("{e:#}")))?;
        let writer = config
            .persist_dir
            .as_ref()
            .map(|dir| AtomicWriter::new(dir.join(".tmp")));
        let cache = Self {
            config,
            state: Mutex::new(State::default()),
            writer,
            persist_locks: Namespace::ALL
                .into_iter()
                .map(|ns| (ns, AsyncMutex::new(())))
                .collect(),
        };
        cache.load_persisted();
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cached value for `(ns, key)`, or the fetcher's result under the
    /// namespace's TTL.
    pub async fn get_or_fetch<T, F, Fut>(&self, ns: Namespace, key: &str, fetch: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ttl = ns.policy(&self.config).ttl;
        self.get_or_fetch_with_ttl(ns, key, ttl, fetch).await
    }

    pub async fn get_or_fetch_with_ttl<T, F, Fut>(
        &self,
        ns: Namespace,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let cache_key: CacheKey = (ns, key.to_string());

        let role = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let fresh = state
                .entries
                .get(&cache_key)
                .filter(|e| e.expires_at > now)
                .map(|e| e.value.clone());
            if let Some(value) = fresh {
                state.stats_mut(ns).hits += 1;
                Role::Hit(value)
            } else if let Some(rx) = state.inflight.get(&cache_key).cloned() {
                state.stats_mut(ns).coalesced += 1;
                Role::Wait(rx)
            } else {
                state.entries.remove(&cache_key);
                state.stats_mut(ns).misses += 1;
                let (tx, rx) = watch::channel(None);
                state.inflight.insert(cache_key.clone(), rx);
                Role::Fetch(tx)
            }
        };

        let shared = match role {
            Role::Hit(value) => Ok(value),
            Role::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(result) => result.clone().unwrap_or_else(|| Err(abandoned())),
                Err(_) => Err(abandoned()),
            },
            Role::Fetch(tx) => {
                let mut guard = InflightGuard {
                    cache: self,
                    key: cache_key,
                    tx,
                    done: false,
                };
                let result: Shared = match fetch().await {
                    Ok(value) => {
                        serde_json::to_value(&value).map_err(|e| CacheError::Serialization(Arc::new(e)))
                    }
                    Err(err) => Err(CacheError::Fetch(Arc::new(err))),
                };
                let should_persist = self.complete(&guard.key, &result, ttl);
                guard.done = true;
                guard.tx.send_replace(Some(result.clone()));
                drop(guard);

                if should_persist {
                    self.persist(ns).await;
                }
                result
            }
        };

        let value = shared?;
        serde_json::from_value(value).map_err(|e| CacheError::Serialization(Arc::new(e)))
    }

    /// Stores a successful result and clears the in-flight marker under one
    /// lock, so no caller can observe neither. True when the namespace file
    /// needs rewriting.
    fn complete(&self, key: &CacheKey, result: &Shared, ttl: Duration) -> bool {
        let mut state = self.state.lock();
        state.inflight.remove(key);
        let Ok(value) = result else {
            return false;
        };
        state.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
                expires_wall: Utc::now()
                    + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            },
        );
        let evicted = state.evict(self.config.max_entries);
        if evicted > 0 {
            tracing::debug!(evicted, "cache entries evicted");
        }

        key.0.policy(&self.config).persist && self.writer.is_some()
    }

    /// Drops every entry of one namespace, in memory and on disk.
    pub async fn purge(&self, ns: Namespace) -> usize {
        let _persisting = self.lock_persist(ns).await;
        let removed = {
            let mut state = self.state.lock();
            let before = state.entries.len();
            state.entries.retain(|(n, _), _| *n != ns);
            before - state.entries.len()
        };
        if let Some(path) = self.persist_path(ns) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(error = %e, path = %path.display(), "failed to remove cache file"),
            }
        }
        tracing::info!(namespace = %ns, removed, "cache namespace purged");
        removed
    }

    pub fn stats(&self) -> BTreeMap<Namespace, NamespaceStats> {
        let state = self.state.lock();
        let mut out: BTreeMap<Namespace, NamespaceStats> = Namespace::ALL
            .into_iter()
            .map(|ns| (ns, state.stats.get(&ns).copied().unwrap_or_default()))
            .collect();
        for (ns, _) in state.entries.keys() {
            if let Some(stats) = out.get_mut(ns) {
                stats.entries += 1;
            }
        }
        out
    }

    fn persist_path(&self, ns: Namespace) -> Option<PathBuf> {
        self.config
            .persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", ns.as_str())))
    }

    async fn lock_persist(&self, ns: Namespace) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match self.persist_locks.get(&ns) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Rewrites the namespace file from the current entries. The copy is taken
    /// after the namespace's persist lock is held, so a later writer never
    /// lands an older copy.
    async fn persist(&self, ns: Namespace) {
        let (Some(writer), Some(path)) = (self.writer.clone(), self.persist_path(ns)) else {
            return;
        };
        let _persisting = self.lock_persist(ns).await;
        let entries = self.state.lock().namespace_snapshot(ns);
        let bytes = match serde_json::to_vec(&entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, namespace = %ns, "cache persist encode failed");
                return;
            }
        };
        let res = tokio::task::spawn_blocking(move || writer.write(&path, &bytes)).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, namespace = %ns, "cache persist failed"),
            Err(e) => tracing::warn!(error = %e, namespace = %ns, "cache persist task failed"),
        }
    }

    fn load_persisted(&self) {
        let now_wall = Utc::now();
        let now = Instant::now();
        let mut loaded = 0usize;
        let mut state = self.state.lock();

        for ns in Namespace::ALL {
            if !ns.policy(&self.config).persist {
                continue;
            }
            let Some(path) = self.persist_path(ns) else {
                continue;
            };
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "cache file unreadable");
                    continue;
                }
            };
            let entries: BTreeMap<String, PersistedEntry> = match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "cache file is corrupt; ignoring");
                    continue;
                }
            };
            for (key, persisted) in entries {
                let Ok(remaining) = (persisted.expires_at - now_wall).to_std() else {
                    continue;
                };
                if remaining.is_zero() {
                    continue;
                }
                state.entries.insert(
                    (ns, key),
                    Entry {
                        value: persisted.value,
                        expires_at: now + remaining,
                        expires_wall: persisted.expires_at,
                    },
                );
                loaded += 1;
            }
        }
        state.evict(self.config.max_entries);
        if loaded > 0 {
            tracing::info!(loaded, "restored persisted cache entries");
        }
    }
}

/// Clears the in-flight marker and wakes waiters if the owning future is
/// dropped before it completes.
struct InflightGuard<'a> {
    cache: &'a FetchCoalescingCache,
    key: CacheKey,
    tx: watch::Sender<Option<Shared>>,
    done: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.cache.state.lock().inflight.remove(&self.key);
        self.tx.send_replace(Some(Err(abandoned())));
    }
}

fn abandoned() -> CacheError {
    CacheError::Fetch(Arc::new(anyhow::anyhow!("in-flight fetch was cancelled")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(config: CacheConfig) -> Arc<FetchCoalescingCache> {
        Arc::new(FetchCoalescingCache::new(config).unwrap())
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(Namespace::Quotes, "AAA", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(101.5_f64)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 101.5);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats()[&Namespace::Quotes];
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 7);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn errors_propagate_to_every_waiter_and_are_not_cached() {
        let cache = cache(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(Namespace::Ohlc, "AAA:5d:1d", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<f64, _>(anyhow::anyhow!("provider down"))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::Fetch(_)));
            assert!(err.to_string().contains("provider down"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = cache
            .get_or_fetch(Namespace::Ohlc, "AAA:5d:1d", || async { Ok(1.0_f64) })
            .await
            .unwrap();
        assert_eq!(value, 1.0);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = cache(CacheConfig::default());
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7_i64)
        };

        let ttl = Duration::from_millis(30);
        cache.get_or_fetch_with_ttl(Namespace::Computed, "k", ttl, fetch).await.unwrap();
        cache.get_or_fetch_with_ttl(Namespace::Computed, "k", ttl, fetch).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.get_or_fetch_with_ttl(Namespace::Computed, "k", ttl, fetch).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats()[&Namespace::Computed].hits, 1);
    }

    #[tokio::test]
    async fn oldest_expiring_entries_are_evicted_first() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = cache(config);
        for (key, secs) in [("short", 10), ("long", 30), ("mid", 20)] {
            cache
                .get_or_fetch_with_ttl(Namespace::Computed, key, Duration::from_secs(secs), move || async move {
                    Ok(key.to_string())
                })
                .await
                .unwrap();
        }

        let counter = AtomicUsize::new(0);
        let calls = &counter;
        for key in ["long", "mid", "short"] {
            cache
                .get_or_fetch(Namespace::Computed, key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(key.to_string())
                })
                .await
                .unwrap();
        }
        // Only "short" had to be refetched.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_namespace_survives_restart_and_purge_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            persist_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };

        let first = cache(config.clone());
        first
            .get_or_fetch(Namespace::Ohlc, "AAA:15d:1d", || async { Ok(vec![1.0_f64, 2.0]) })
            .await
            .unwrap();
        first
            .get_or_fetch(Namespace::Quotes, "AAA", || async { Ok(3.0_f64) })
            .await
            .unwrap();
        assert!(dir.path().join("ohlc.json").exists());
        assert!(!dir.path().join("quotes.json").exists());

        let second = cache(config.clone());
        let restored: Vec<f64> = second
            .get_or_fetch(Namespace::Ohlc, "AAA:15d:1d", || async {
                anyhow::bail!("should have been served from disk")
            })
            .await
            .unwrap();
        assert_eq!(restored, vec![1.0, 2.0]);
        assert_eq!(second.stats()[&Namespace::Quotes].entries, 0);

        assert_eq!(second.purge(Namespace::Ohlc).await, 1);
        assert!(!dir.path().join("ohlc.json").exists());
        assert_eq!(cache(config).stats()[&Namespace::Ohlc].entries, 0);
    }

    #[tokio::test]
    async fn concurrent_completions_leave_every_entry_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            persist_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let first = cache(config.clone());

        let mut handles = Vec::new();
        for n in 0..16 {
            let cache = first.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(Namespace::Ohlc, &format!("S{n}:1mo:1d"), || async move {
                        tokio::task::yield_now().await;
                        Ok(vec![n as f64])
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let restored = cache(config);
        assert_eq!(restored.stats()[&Namespace::Ohlc].entries, 16);
    }

    #[test]
    fn namespace_names_parse() {
        for ns in Namespace::ALL {
            assert_eq!(Namespace::parse(ns.as_str()), Some(ns));
        }
        assert_eq!(Namespace::parse("nope"), None);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = CacheConfig::default();
        config.max_entries = 0;
        assert!(matches!(
            FetchCoalescingCache::new(config),
            Err(CacheError::Config(_))
        ));
    }
}
