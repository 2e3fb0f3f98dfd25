use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub sentry_dsn: Option<String>,
    pub data_provider_base_url: Option<String>,
    pub data_provider_api_key: Option<String>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            data_provider_base_url: std::env::var("DATA_PROVIDER_BASE_URL").ok(),
            data_provider_api_key: std::env::var("DATA_PROVIDER_API_KEY").ok(),
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is required")
    }

    pub fn require_data_provider_base_url(&self) -> anyhow::Result<&str> {
        self.data_provider_base_url
            .as_deref()
            .context("DATA_PROVIDER_BASE_URL is required")
    }
}

/// Circuit-breaker policy for unreliable symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub threshold: i64,
    pub window_days: i64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub dir: PathBuf,
    pub latest_name: String,
    /// Where `<name>.sha256` sidecars go. `None` puts them next to the snapshot.
    pub checksum_dir: Option<PathBuf>,
    /// Scratch directory for temp files. Must be on the same filesystem as `dir`
    /// for the final rename to be atomic. `None` means `<dir>/.tmp`.
    pub scratch_dir: Option<PathBuf>,
}

impl SnapshotConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            latest_name: "sectors_volume_latest.json".to_string(),
            checksum_dir: None,
            scratch_dir: None,
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(&self.latest_name)
    }

    pub fn dated_path(&self, date: chrono::NaiveDate) -> PathBuf {
        self.dir.join(format!("sectors_volume_{date}.json"))
    }

    pub fn checksum_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = match &self.checksum_dir {
            Some(dir) => dir.clone(),
            None => target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.dir.clone()),
        };
        dir.join(format!("{name}.sha256"))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.dir.join(".tmp"))
    }
}

/// Knobs for the materialization pipeline. Passed in explicitly; nothing in
/// the core reads the environment on its own.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retention_days: i64,
    pub min_history_days: usize,
    pub failure: FailurePolicy,
    pub seed_period: String,
    pub daily_period: String,
    pub backfill_period: String,
    pub sectors_seed_path: Option<PathBuf>,
    pub snapshot: SnapshotConfig,
}

impl EngineConfig {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            retention_days: 90,
            min_history_days: 11,
            failure: FailurePolicy::default(),
            seed_period: "15d".to_string(),
            daily_period: "5d".to_string(),
            backfill_period: "1y".to_string(),
            sectors_seed_path: None,
            snapshot: SnapshotConfig::new(snapshot_dir),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let dir = std::env::var("SNAPSHOT_DIR").unwrap_or_else(|_| "snapshots".to_string());
        let mut out = Self::new(dir);

        out.retention_days = env_parse("OHLC_RETENTION_DAYS").unwrap_or(out.retention_days);
        out.min_history_days = env_parse("MIN_HISTORY_DAYS").unwrap_or(out.min_history_days);
        out.failure.threshold = env_parse("FAILURE_THRESHOLD").unwrap_or(out.failure.threshold);
        out.failure.window_days =
            env_parse("FAILURE_WINDOW_DAYS").unwrap_or(out.failure.window_days);
        out.sectors_seed_path = std::env::var("SECTORS_SEED_PATH").ok().map(PathBuf::from);
        out.snapshot.checksum_dir = std::env::var("SNAPSHOT_CHECKSUM_DIR").ok().map(PathBuf::from);
        out.snapshot.scratch_dir = std::env::var("SNAPSHOT_TMP_DIR").ok().map(PathBuf::from);

        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // avg_dollar_vol10 needs ten prior sessions plus today.
        anyhow::ensure!(
            self.min_history_days >= 11,
            "MIN_HISTORY_DAYS must be >= 11 (got {})",
            self.min_history_days
        );
        anyhow::ensure!(
            self.retention_days >= 1,
            "OHLC_RETENTION_DAYS must be >= 1 (got {})",
            self.retention_days
        );
        anyhow::ensure!(
            self.failure.threshold >= 1,
            "FAILURE_THRESHOLD must be >= 1 (got {})",
            self.failure.threshold
        );
        anyhow::ensure!(
            self.failure.window_days >= 1,
            "FAILURE_WINDOW_DAYS must be >= 1 (got {})",
            self.failure.window_days
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespacePolicy {
    pub ttl: Duration,
    pub persist: bool,
}

impl NamespacePolicy {
    pub const fn memory(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            persist: false,
        }
    }

    pub const fn persistent(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            persist: true,
        }
    }
}

/// One policy per cache namespace.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub quotes: NamespacePolicy,
    pub ohlc: NamespacePolicy,
    pub quote_term: NamespacePolicy,
    pub computed: NamespacePolicy,
    pub max_entries: usize,
    pub persist_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quotes: NamespacePolicy::memory(15),
            // Daily bars survive restarts.
            ohlc: NamespacePolicy::persistent(180),
            quote_term: NamespacePolicy::memory(60),
            computed: NamespacePolicy::memory(30),
            max_entries: 4096,
            persist_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();
        if let Some(secs) = env_parse::<u64>("CACHE_TTL_QUOTES") {
            out.quotes.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CACHE_TTL_OHLC") {
            out.ohlc.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CACHE_TTL_QUOTE_TERM") {
            out.quote_term.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CACHE_TTL_COMPUTED") {
            out.computed.ttl = Duration::from_secs(secs);
        }
        if let Some(persist) = env_parse::<bool>("CACHE_PERSIST_COMPUTED") {
            out.computed.persist = persist;
        }
        out.max_entries = env_parse("CACHE_MAX_ENTRIES").unwrap_or(out.max_entries);
        out.persist_dir = std::env::var("CACHE_PERSIST_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, policy) in [
            ("quotes", self.quotes),
            ("ohlc", self.ohlc),
            ("quote_term", self.quote_term),
            ("computed", self.computed),
        ] {
            anyhow::ensure!(!policy.ttl.is_zero(), "cache ttl for {name} must be > 0");
        }
        anyhow::ensure!(self.max_entries >= 1, "CACHE_MAX_ENTRIES must be >= 1");
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}
