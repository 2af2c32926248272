//! Configuration for the controller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::warn;
use virtops_api::{ObjectStore, SqliteStore};

/// Clone controller tuning.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    /// Non-transient reconcile failures tolerated before a clone is Failed.
    pub max_retries: u32,

    /// How long a clone may wait for a missing source before it is Failed.
    /// `None` waits forever.
    pub source_timeout: Option<Duration>,

    /// First requeue delay while the source is missing; doubles per miss.
    pub source_backoff_base: Duration,

    /// Ceiling for the missing-source requeue delay.
    pub source_backoff_max: Duration,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            max_retries: virtops_reconcile::DEFAULT_MAX_RETRIES,
            source_timeout: None,
            source_backoff_base: virtops_reconcile::DEFAULT_BACKOFF_BASE,
            source_backoff_max: virtops_reconcile::DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Rolling upgrade coordinator tuning.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Time budget per node still to update before a rollout counts as stuck.
    pub per_node_timeout: Duration,

    /// Old pods left when the rollout narrows back to one at a time.
    pub safety_margin: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            per_node_timeout: Duration::from_secs(60),
            safety_margin: 1,
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding the object store; `None` keeps it in memory.
    pub data_path: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Namespace the controllers watch.
    pub namespace: String,

    /// Period of the reconcile passes.
    pub reconcile_interval: Duration,

    /// Period of the garbage collection pass.
    pub gc_interval: Duration,

    pub clone: CloneConfig,

    pub rollout: RolloutConfig,

    /// Run the mock provisioner alongside the controllers.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: None,
            log_level: "info".to_string(),
            namespace: "default".to_string(),
            reconcile_interval: Duration::from_millis(1000),
            gc_interval: Duration::from_millis(5000),
            clone: CloneConfig::default(),
            rollout: RolloutConfig::default(),
            dev_mode: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let data_path = match std::env::var("VIRTOPS_DATA_DIR") {
            Ok(dir) if dir == ":memory:" => None,
            Ok(dir) => Some(format!("{}/store.db", dir.trim_end_matches('/'))),
            Err(_) => Some("/var/lib/virtops/store.db".to_string()),
        };

        let log_level = std::env::var("VIRTOPS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let namespace = std::env::var("VIRTOPS_NAMESPACE").unwrap_or(defaults.namespace);

        let reconcile_interval = env_millis("VIRTOPS_RECONCILE_INTERVAL_MS")?
            .unwrap_or(defaults.reconcile_interval);

        let gc_interval = env_millis("VIRTOPS_GC_INTERVAL_MS")?.unwrap_or(defaults.gc_interval);

        let clone = CloneConfig {
            max_retries: env_parse("VIRTOPS_CLONE_MAX_RETRIES")?
                .unwrap_or(defaults.clone.max_retries),
            source_timeout: env_parse::<u64>("VIRTOPS_CLONE_SOURCE_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            ..defaults.clone
        };

        let rollout = RolloutConfig {
            per_node_timeout: env_parse::<u64>("VIRTOPS_CANARY_PER_NODE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.rollout.per_node_timeout),
            ..defaults.rollout
        };

        let dev_mode = std::env::var("VIRTOPS_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            data_path,
            log_level,
            namespace,
            reconcile_interval,
            gc_interval,
            clone,
            rollout,
            dev_mode,
        })
    }
}

impl Config {
    /// Opens the object store at `data_path`, creating its directory, or an
    /// in-memory store when no path is configured.
    pub fn open_store(&self) -> Result<Arc<dyn ObjectStore>> {
        let Some(path) = &self.data_path else {
            warn!("No data directory configured, objects will not survive a restart");
            return Ok(Arc::new(
                SqliteStore::open_in_memory().context("failed to open object store")?,
            ));
        };
        if let Some(dir) = Path::new(path).parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let store = SqliteStore::open(path)
            .with_context(|| format!("failed to open object store at {path}"))?;
        Ok(Arc::new(store))
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}
