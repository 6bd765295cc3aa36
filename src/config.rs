//! Configuration types and loading
//!
//! YAML file with a fallback chain (explicit path → project-local →
//! user config → defaults), then enumerated `LISTINGD_*` environment
//! overrides on top. Env beats file, file beats defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::challenge::ChallengeBrokerConfig;
use crate::limiter::AutoSizePolicy;
use crate::retry::RetryPolicy;

/// Serde adapter for durations stored as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sources: SourcesConfig,
    pub scheduler: SchedulerConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryPolicy,
    pub challenge: ChallengeConfig,
    pub lock: LockConfig,
    pub standby: StandbyConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with the fallback chain, then apply env overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".listingd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("listingd").join("listingd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply the enumerated `LISTINGD_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Some(v) = env_u64("LISTINGD_RUN_INTERVAL_SECS") {
            self.scheduler.run_interval_secs = v;
        }
        if let Some(v) = env_u64("LISTINGD_BATCH_LIMIT") {
            self.scheduler.batch_limit = v;
        }
        if let Some(v) = env_u64("LISTINGD_BREAK_SECS") {
            self.scheduler.break_secs = v;
        }
        if let Some(v) = env_u64("LISTINGD_ENRICH_RETRY_SECS") {
            self.scheduler.enrich_retry_secs = v;
        }
        if let Some(v) = env_u64("LISTINGD_BACKPRESSURE_THRESHOLD") {
            self.scheduler.backpressure_threshold = v;
        }
        if let Some(v) = env_bool("LISTINGD_ONLY_MISSING") {
            self.scheduler.only_missing = v;
        }
        if let Some(v) = env_u64("LISTINGD_STANDBY_POLL_SECS") {
            self.standby.poll_secs = v;
        }
        if let Some(v) = env_u64("LISTINGD_STANDBY_JITTER_SECS") {
            self.standby.jitter_secs = v;
        }
        if let Some(v) = env_u64("LISTINGD_LOCK_STALE_SECS") {
            self.lock.stale_after_secs = v;
        }
        if let Some(v) = env_string("LISTINGD_LOCK_PATH") {
            self.lock.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_u64("LISTINGD_CHALLENGE_TIMEOUT_SECS") {
            self.challenge.timeout_secs = v;
        }
        if let Some(v) = env_u64("LISTINGD_MAX_RETRY_ATTEMPTS") {
            self.retry.max_attempts = v as u32;
        }
        if let Some(v) = env_u64("LISTINGD_RETRY_DELAY_SECS") {
            self.retry.delay = Duration::from_secs(v);
        }
        if let Some(v) = env_string("LISTINGD_SOURCES") {
            self.sources.selected = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = env_string("LISTINGD_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(v));
        }
    }

    /// Effective lock marker path
    pub fn lock_path(&self) -> PathBuf {
        self.lock
            .path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir().join("listingd.lock"))
    }
}

/// Externally supplied source selection set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Ordered source ids the cycle walks over
    pub selected: Vec<String>,
}

/// Phase scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between cycle starts
    pub run_interval_secs: u64,

    /// Per-cycle scrape cap per source; the counter resets when that
    /// source's enrich backlog fully drains
    pub batch_limit: u64,

    /// Break duration between phases, seconds
    pub break_secs: u64,

    /// Delay before an enrich phase re-enters itself while backlog remains
    pub enrich_retry_secs: u64,

    /// Records fetched per enrich pass
    pub enrich_chunk: usize,

    /// Pending-valuation count at which a source's scrape phase is
    /// skipped in favor of its enrich phase. Scoped per source: a
    /// saturated source must not starve the others' scrape phases.
    pub backpressure_threshold: u64,

    /// Enrich only records without an existing estimate
    pub only_missing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_interval_secs: 300,
            batch_limit: 25,
            break_secs: 30,
            enrich_retry_secs: 5,
            enrich_chunk: 10,
            backpressure_threshold: 50,
            only_missing: true,
        }
    }
}

impl SchedulerConfig {
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_secs)
    }

    pub fn enrich_retry_delay(&self) -> Duration {
        Duration::from_secs(self.enrich_retry_secs)
    }
}

/// Limiter sizing: auto-sizing policy plus per-source pins
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Healthy-unit count reported by the built-in static pool
    pub pool_units: usize,

    /// Auto-sizing policy applied when no override matches
    pub auto: AutoSizePolicy,

    /// Explicit per-source bounds; always win over auto-sizing
    pub overrides: BTreeMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            pool_units: 4,
            auto: AutoSizePolicy::default(),
            overrides: BTreeMap::new(),
        }
    }
}

impl ConcurrencyConfig {
    /// Effective limiter bound for a source given observed pool health
    pub fn limit_for(&self, source: &str, healthy_units: usize) -> usize {
        match self.overrides.get(source) {
            Some(&pinned) => pinned.max(1),
            None => self.auto.size_for(healthy_units),
        }
    }
}

/// One-time-code arbitration tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub timeout_secs: u64,
    pub store_poll_secs: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            store_poll_secs: 2,
        }
    }
}

impl ChallengeConfig {
    pub fn broker_config(&self) -> ChallengeBrokerConfig {
        ChallengeBrokerConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            store_poll_interval: Duration::from_secs(self.store_poll_secs),
        }
    }
}

/// Singleton lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Marker path; defaults to `<data_dir>/listingd.lock`
    pub path: Option<PathBuf>,
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: None,
            stale_after_secs: 600,
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Standby polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbyConfig {
    pub poll_secs: u64,
    /// Upper bound of the random jitter added to each poll
    pub jitter_secs: u64,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            poll_secs: 30,
            jitter_secs: 10,
        }
    }
}

impl StandbyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn jitter_bound(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for catalog, watermark, challenges, drops, and logs
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("listingd")
        })
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir().join("catalog.json")
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.data_dir().join("watermark")
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.data_dir().join("challenges")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir().join("inbox")
    }

    pub fn drop_dir(&self, source: &str) -> PathBuf {
        self.data_dir().join("drops").join(source)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env_string(key)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable boolean override");
            None
        }
    }
}
