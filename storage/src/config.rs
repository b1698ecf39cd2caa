//! Engine configuration.
//!
//! `EngineConfig` can be built in code (`EngineConfig::new` plus the `with_*`
//! setters) or loaded from a file overlaid with `TABLEDB_*` environment
//! variables through [`EngineConfig::load`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Result, StorageError};

pub const DEFAULT_MAX_LOGICAL_PAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_DATA_MEMORY: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_PK_MEMORY: u64 = 128 * 1024 * 1024;
pub const DEFAULT_CHECKPOINT_PERIOD_MS: u64 = 15 * 60 * 1000;
pub const DEFAULT_MEMORY_WATCHER_PERIOD_MS: u64 = 1000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Smallest page that can still hold a page header and one tiny record.
pub const MIN_LOGICAL_PAGE_SIZE: usize = 128;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/txlog`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_max_logical_page_size")]
    pub max_logical_page_size: usize,
    #[serde(default = "default_max_data_memory")]
    pub max_data_memory: u64,
    #[serde(default = "default_max_pk_memory")]
    pub max_pk_memory: u64,
    /// 0 disables periodic checkpoints.
    #[serde(default = "default_checkpoint_period_ms")]
    pub checkpoint_period_ms: u64,
    /// Baseline for the memory watcher thresholds, in bytes. Required.
    pub memory_reference: u64,
    #[serde(default = "default_percent")]
    pub overall_maximum_limit_percent: f64,
    #[serde(default = "default_percent")]
    pub lowerbound_percent: f64,
    /// 0 disables the background memory watcher.
    #[serde(default = "default_memory_watcher_period_ms")]
    pub memory_watcher_period_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub sync_on_commit: bool,
    #[serde(default = "default_percent")]
    pub compaction_threshold_percent: f64,
}

fn default_max_logical_page_size() -> usize {
    DEFAULT_MAX_LOGICAL_PAGE_SIZE
}
fn default_max_data_memory() -> u64 {
    DEFAULT_MAX_DATA_MEMORY
}
fn default_max_pk_memory() -> u64 {
    DEFAULT_MAX_PK_MEMORY
}
fn default_checkpoint_period_ms() -> u64 {
    DEFAULT_CHECKPOINT_PERIOD_MS
}
fn default_memory_watcher_period_ms() -> u64 {
    DEFAULT_MEMORY_WATCHER_PERIOD_MS
}
fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}
fn default_percent() -> f64 {
    50.0
}
fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>, memory_reference: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            log_dir: None,
            max_logical_page_size: DEFAULT_MAX_LOGICAL_PAGE_SIZE,
            max_data_memory: DEFAULT_MAX_DATA_MEMORY,
            max_pk_memory: DEFAULT_MAX_PK_MEMORY,
            checkpoint_period_ms: DEFAULT_CHECKPOINT_PERIOD_MS,
            memory_reference,
            overall_maximum_limit_percent: default_percent(),
            lowerbound_percent: default_percent(),
            memory_watcher_period_ms: DEFAULT_MEMORY_WATCHER_PERIOD_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            sync_on_commit: true,
            compaction_threshold_percent: default_percent(),
        }
    }

    /// Loads from an optional config file (any format the `config` crate
    /// understands) with `TABLEDB_*` environment variables taking precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("TABLEDB"))
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;
        let cfg: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| StorageError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_reference == 0 {
            return Err(StorageError::Config(
                "memory_reference must be set to a positive number of bytes".to_string(),
            ));
        }
        if self.max_logical_page_size < MIN_LOGICAL_PAGE_SIZE {
            return Err(StorageError::Config(format!(
                "max_logical_page_size must be at least {} bytes",
                MIN_LOGICAL_PAGE_SIZE
            )));
        }
        for (name, pct) in [
            ("overall_maximum_limit_percent", self.overall_maximum_limit_percent),
            ("lowerbound_percent", self.lowerbound_percent),
            ("compaction_threshold_percent", self.compaction_threshold_percent),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(StorageError::Config(format!(
                    "{} must be in (0, 100], got {}",
                    name, pct
                )));
            }
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("txlog"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn checkpoint_period(&self) -> Option<Duration> {
        (self.checkpoint_period_ms > 0).then(|| Duration::from_millis(self.checkpoint_period_ms))
    }

    pub fn memory_watcher_period(&self) -> Option<Duration> {
        (self.memory_watcher_period_ms > 0)
            .then(|| Duration::from_millis(self.memory_watcher_period_ms))
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_max_logical_page_size(mut self, bytes: usize) -> Self {
        self.max_logical_page_size = bytes;
        self
    }

    pub fn with_max_data_memory(mut self, bytes: u64) -> Self {
        self.max_data_memory = bytes;
        self
    }

    pub fn with_max_pk_memory(mut self, bytes: u64) -> Self {
        self.max_pk_memory = bytes;
        self
    }

    pub fn with_checkpoint_period_ms(mut self, ms: u64) -> Self {
        self.checkpoint_period_ms = ms;
        self
    }

    pub fn with_memory_limits(mut self, overall_percent: f64, lowerbound_percent: f64) -> Self {
        self.overall_maximum_limit_percent = overall_percent;
        self.lowerbound_percent = lowerbound_percent;
        self
    }

    pub fn with_memory_watcher_period_ms(mut self, ms: u64) -> Self {
        self.memory_watcher_period_ms = ms;
        self
    }

    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn with_compaction_threshold_percent(mut self, pct: f64) -> Self {
        self.compaction_threshold_percent = pct;
        self
    }
}
