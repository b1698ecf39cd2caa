//! Memory watcher.
//!
//! Resident page memory is kept between two thresholds derived from an
//! operator-provided reference value:
//!
//! ```text
//! overall_maximum_limit = reference * overall_percent / 100     (ceiling)
//! lowerbound            = overall_maximum_limit * lower_percent / 100
//! ```
//!
//! Nothing happens below the ceiling. At or above it the watcher asks the
//! reclaimer to release `usage - lowerbound` bytes; the reclaimer evicts one
//! page at a time and consults the stop/continue check after each step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::EngineConfig;
use crate::{Result, StorageError};

/// Current resident usage, in bytes.
pub trait MemoryUsageProvider: Send + Sync {
    fn used_memory(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimStep {
    Continue,
    Stop,
}

/// Decides after each eviction whether to keep reclaiming, given the current
/// usage and the floor.
pub type ReclaimCheck = fn(current: u64, lowerbound: u64) -> ReclaimStep;

pub fn check_lower_bound(current: u64, lowerbound: u64) -> ReclaimStep {
    if current <= lowerbound {
        ReclaimStep::Stop
    } else {
        ReclaimStep::Continue
    }
}

pub trait MemoryReclaimer {
    /// Evicts pages, least recently used first, until `check` says stop or
    /// nothing evictable is left. Returns the number of bytes released.
    fn try_release_memory(&self, reclaim: u64, lowerbound: u64, check: ReclaimCheck) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    NotNeeded { used: u64 },
    Reclaimed { before: u64, after: u64, released: u64 },
}

pub struct MemoryWatcher {
    overall_maximum_limit: u64,
    lowerbound: u64,
    usage: Arc<dyn MemoryUsageProvider>,
    runs: AtomicU64,
    reclaims: AtomicU64,
}

impl MemoryWatcher {
    pub fn new(
        reference: u64,
        overall_maximum_limit_percent: f64,
        lowerbound_percent: f64,
        usage: Arc<dyn MemoryUsageProvider>,
    ) -> Self {
        let overall_maximum_limit = (reference as f64 * overall_maximum_limit_percent / 100.0) as u64;
        let lowerbound = (overall_maximum_limit as f64 * lowerbound_percent / 100.0) as u64;
        info!(
            "Memory watcher: reference {} bytes, ceiling {} bytes ({}%), lowerbound {} bytes ({}%)",
            reference, overall_maximum_limit, overall_maximum_limit_percent, lowerbound, lowerbound_percent
        );
        Self {
            overall_maximum_limit,
            lowerbound,
            usage,
            runs: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EngineConfig, usage: Arc<dyn MemoryUsageProvider>) -> Self {
        Self::new(
            config.memory_reference,
            config.overall_maximum_limit_percent,
            config.lowerbound_percent,
            usage,
        )
    }

    pub fn overall_maximum_limit(&self) -> u64 {
        self.overall_maximum_limit
    }

    pub fn lowerbound(&self) -> u64 {
        self.lowerbound
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Cycles that had to reclaim.
    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    /// One watcher cycle.
    pub fn run(&self, reclaimer: &dyn MemoryReclaimer) -> Result<ReclaimOutcome> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let used = self.usage.used_memory();
        if used < self.overall_maximum_limit {
            debug!("Memory usage {} below ceiling {}", used, self.overall_maximum_limit);
            return Ok(ReclaimOutcome::NotNeeded { used });
        }

        self.reclaims.fetch_add(1, Ordering::Relaxed);
        let reclaim = used.saturating_sub(self.lowerbound);
        info!(
            "Memory usage {} at or above ceiling {}, reclaiming {} bytes down to {}",
            used, self.overall_maximum_limit, reclaim, self.lowerbound
        );
        let released = reclaimer.try_release_memory(reclaim, self.lowerbound, check_lower_bound)?;
        let after = self.usage.used_memory();
        info!("Released {} bytes, usage now {}", released, after);

        if after >= self.overall_maximum_limit {
            warn!(
                "Memory pressure not relieved: {} bytes still resident, ceiling {}",
                after, self.overall_maximum_limit
            );
            return Err(StorageError::MemoryPressureUnrelievable {
                used: after,
                limit: self.overall_maximum_limit,
            });
        }
        Ok(ReclaimOutcome::Reclaimed {
            before: used,
            after,
            released,
        })
    }
}
