//! Engine: the set of table-spaces plus the background maintenance thread
//! that runs periodic checkpoints and the memory watcher.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::EngineConfig;
use crate::memory::{
    MemoryReclaimer, MemoryUsageProvider, MemoryWatcher, ReclaimCheck, ReclaimOutcome, ReclaimStep,
};
use crate::page::PageId;
use crate::table::TableManager;
use crate::tablespace::{validate_name, TableSpaceManager, DEFAULT_TABLE_SPACE};
use crate::{Result, StorageError};

type Registry = Arc<RwLock<BTreeMap<String, Arc<TableSpaceManager>>>>;

/// Resident pages of every table in every table-space; what the memory
/// watcher measures and reclaims.
struct ResidentPages {
    table_spaces: Registry,
}

impl ResidentPages {
    fn tables(&self) -> Vec<Arc<TableManager>> {
        self.table_spaces
            .read()
            .values()
            .flat_map(|ts| ts.tables_snapshot())
            .collect()
    }
}

impl MemoryUsageProvider for ResidentPages {
    fn used_memory(&self) -> u64 {
        self.table_spaces.read().values().map(|ts| ts.resident_bytes()).sum()
    }
}

impl MemoryReclaimer for ResidentPages {
    fn try_release_memory(&self, reclaim: u64, lowerbound: u64, check: ReclaimCheck) -> Result<u64> {
        let mut candidates: Vec<(u64, Arc<TableManager>, PageId)> = Vec::new();
        for table in self.tables() {
            for (last_access, page_id) in table.evictable_pages() {
                candidates.push((last_access, Arc::clone(&table), page_id));
            }
        }
        candidates.sort_unstable_by_key(|(last_access, _, _)| *last_access);
        debug!(
            "Reclaiming {} bytes from {} evictable pages",
            reclaim,
            candidates.len()
        );

        let mut released = 0;
        for (_, table, page_id) in candidates {
            if check(self.used_memory(), lowerbound) == ReclaimStep::Stop {
                break;
            }
            let before = table.resident_bytes();
            if table.unload_page(page_id)? {
                released += before.saturating_sub(table.resident_bytes());
            }
        }
        Ok(released)
    }
}

struct Maintenance {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Maintenance {
    /// Sleeps until `deadline`; `false` once the engine is stopping.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

pub struct Engine {
    config: EngineConfig,
    table_spaces: Registry,
    booted: Mutex<HashSet<String>>,
    boot_signal: Condvar,
    /// Serializes table-space creation.
    boot_lock: Mutex<()>,
    pages: Arc<ResidentPages>,
    watcher: Arc<MemoryWatcher>,
    maintenance: Arc<Maintenance>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Opens every table-space under `data_dir`, creating the default one
    /// if needed, and starts the maintenance thread.
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        info!("Starting engine in {}", config.data_dir.display());

        let table_spaces: Registry = Arc::new(RwLock::new(BTreeMap::new()));
        let pages = Arc::new(ResidentPages {
            table_spaces: Arc::clone(&table_spaces),
        });
        let usage: Arc<dyn MemoryUsageProvider> = pages.clone();
        let engine = Self {
            watcher: Arc::new(MemoryWatcher::from_config(&config, usage)),
            config,
            table_spaces,
            booted: Mutex::new(HashSet::new()),
            boot_signal: Condvar::new(),
            boot_lock: Mutex::new(()),
            pages,
            maintenance: Arc::new(Maintenance {
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        };

        let mut names = engine.existing_table_spaces()?;
        if !names.iter().any(|n| n == DEFAULT_TABLE_SPACE) {
            names.insert(0, DEFAULT_TABLE_SPACE.to_string());
        }
        for name in names {
            engine.boot(&name)?;
        }
        engine.spawn_maintenance()?;
        Ok(engine)
    }

    /// Table-space directories already present on disk.
    fn existing_table_spaces(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.path().join("tables").is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn boot(&self, name: &str) -> Result<Arc<TableSpaceManager>> {
        let table_space = Arc::new(TableSpaceManager::open(name, &self.config)?);
        self.table_spaces
            .write()
            .insert(name.to_string(), Arc::clone(&table_space));
        self.booted.lock().insert(name.to_string());
        self.boot_signal.notify_all();
        info!("Table space {} booted", name);
        Ok(table_space)
    }

    fn spawn_maintenance(&self) -> Result<()> {
        let checkpoint_period = self.config.checkpoint_period();
        let watcher_period = self.config.memory_watcher_period();
        if checkpoint_period.is_none() && watcher_period.is_none() {
            return Ok(());
        }
        let table_spaces = Arc::clone(&self.table_spaces);
        let pages = Arc::clone(&self.pages);
        let watcher = Arc::clone(&self.watcher);
        let maintenance = Arc::clone(&self.maintenance);
        let handle = thread::Builder::new()
            .name("tabledb-maintenance".to_string())
            .spawn(move || {
                run_maintenance(
                    &maintenance,
                    &table_spaces,
                    &pages,
                    &watcher,
                    checkpoint_period,
                    watcher_period,
                )
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Blocks until the table-space has finished recovery.
    pub fn wait_for_table_space_boot(&self, name: &str, timeout: Duration) -> Result<Arc<TableSpaceManager>> {
        let deadline = Instant::now() + timeout;
        let mut booted = self.booted.lock();
        while !booted.contains(name) {
            if self.boot_signal.wait_until(&mut booted, deadline).timed_out() {
                if booted.contains(name) {
                    break;
                }
                return Err(StorageError::TableSpaceNotFound(name.to_string()));
            }
        }
        drop(booted);
        self.table_space(name)
    }

    pub fn table_space(&self, name: &str) -> Result<Arc<TableSpaceManager>> {
        self.table_spaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::TableSpaceNotFound(name.to_string()))
    }

    pub fn default_table_space(&self) -> Result<Arc<TableSpaceManager>> {
        self.table_space(DEFAULT_TABLE_SPACE)
    }

    pub fn table_space_names(&self) -> Vec<String> {
        self.table_spaces.read().keys().cloned().collect()
    }

    pub fn create_table_space(&self, name: &str) -> Result<Arc<TableSpaceManager>> {
        validate_name(name)?;
        let _boot = self.boot_lock.lock();
        if self.table_spaces.read().contains_key(name) {
            return Err(StorageError::TableSpaceAlreadyExists(name.to_string()));
        }
        self.boot(name)
    }

    /// Bytes of resident pages across all table-spaces.
    pub fn used_memory(&self) -> u64 {
        self.pages.used_memory()
    }

    pub fn memory_watcher(&self) -> &MemoryWatcher {
        &self.watcher
    }

    /// Runs one memory watcher cycle on the calling thread.
    pub fn run_memory_watcher(&self) -> Result<ReclaimOutcome> {
        self.watcher.run(self.pages.as_ref())
    }

    /// Checkpoints every table-space now.
    pub fn checkpoint(&self) -> Result<()> {
        let table_spaces: Vec<_> = self.table_spaces.read().values().cloned().collect();
        for table_space in table_spaces {
            table_space.checkpoint()?;
        }
        Ok(())
    }

    fn stop_maintenance(&self) {
        self.maintenance.stop();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Maintenance thread panicked");
            }
        }
    }

    /// Orderly shutdown: stops background work and writes a final checkpoint
    /// of every table-space.
    pub fn shutdown(self) -> Result<()> {
        info!("Shutting down engine");
        self.stop_maintenance();
        let table_spaces: Vec<_> = self.table_spaces.read().values().cloned().collect();
        let mut result = Ok(());
        for table_space in table_spaces {
            if let Err(e) = table_space.close(true) {
                error!("Final checkpoint of {} failed: {}", table_space.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for Engine {
    /// Without `shutdown` nothing is checkpointed; the next start recovers
    /// from the log as after a crash.
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

fn run_maintenance(
    maintenance: &Maintenance,
    table_spaces: &Registry,
    pages: &ResidentPages,
    watcher: &MemoryWatcher,
    checkpoint_period: Option<Duration>,
    watcher_period: Option<Duration>,
) {
    let start = Instant::now();
    let mut next_checkpoint = checkpoint_period.map(|p| start + p);
    let mut next_watch = watcher_period.map(|p| start + p);
    debug!(
        "Maintenance thread started (checkpoint every {:?}, memory watcher every {:?})",
        checkpoint_period, watcher_period
    );

    loop {
        let deadline = match (next_checkpoint, next_watch) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return,
        };
        if !maintenance.sleep_until(deadline) {
            debug!("Maintenance thread stopped");
            return;
        }
        let now = Instant::now();

        if let (Some(due), Some(period)) = (next_watch, watcher_period) {
            if now >= due {
                match watcher.run(pages) {
                    Ok(ReclaimOutcome::Reclaimed { before, after, .. }) => {
                        debug!("Memory watcher reclaimed {} -> {} bytes", before, after)
                    }
                    Ok(ReclaimOutcome::NotNeeded { .. }) => {}
                    Err(e) => warn!("Memory watcher: {}", e),
                }
                next_watch = Some(now + period);
            }
        }

        if let (Some(due), Some(period)) = (next_checkpoint, checkpoint_period) {
            if now >= due {
                let targets: Vec<_> = table_spaces.read().values().cloned().collect();
                for table_space in targets {
                    if table_space.is_closed() {
                        continue;
                    }
                    if let Err(e) = table_space.checkpoint() {
                        error!("Checkpoint of {} failed: {}", table_space.name(), e);
                    }
                }
                next_checkpoint = Some(Instant::now() + period);
            }
        }
    }
}
