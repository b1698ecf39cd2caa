// storage/src/table/mod.rs

//! Table manager.
//!
//! A table keeps every record in exactly one logical page and maps each
//! primary key to that page through the always-resident key index:
//!
//! ```text
//!   keys: BTreeMap<Key, PageId>          pages: PageId -> PageHandle
//!   +--------+------+                    +----+----------------------------+
//!   | "a"    |  3   | ---------------->  |  3 | resident, flushed, 2 dead   |
//!   | "b"    |  7   | ---------------->  |  7 | current (open for appends)  |
//!   +--------+------+                    +----+----------------------------+
//! ```
//!
//! Committed writes are appended to the current page; when it is full it is
//! sealed and a new page with a fresh id takes its place. A page that reached
//! the page store is never modified again: superseding one of its records
//! only re-points the key and counts the old copy as dead, and checkpoints
//! later rewrite or drop pages with many dead copies. A page that was never
//! flushed is always resident, so evicting it means flushing it first.

mod index;
mod scan;
mod stats;

pub use index::SecondaryIndex;
pub use scan::{DataScanner, RowFilter, ScanPredicate, ScanSource};
pub(crate) use scan::ReadContext;
pub use stats::TableStats;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tabledb_core::{decode_row, encode_key, encode_row, IndexDefinition, Row, TableSchema, Value};

use crate::config::EngineConfig;
use crate::file::PageStore;
use crate::page::{Key, PageId, RecordPage, PAGE_HEADER_SIZE};
use crate::{display_key, Result, StorageError};

/// Estimated per-entry overhead of the key index on top of the key bytes.
pub const PK_ENTRY_OVERHEAD: u64 = 48;

/// Process-wide access clock, so recency is comparable across tables.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

fn tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

fn key_cost(key: &[u8]) -> u64 {
    key.len() as u64 + PK_ENTRY_OVERHEAD
}

/// Residency and accounting of one page. The mutex guards loading, flushing
/// and unloading; a page is never half-loaded.
struct PageHandle {
    id: PageId,
    page: Mutex<Option<Arc<RecordPage>>>,
    resident: AtomicBool,
    flushed: AtomicBool,
    live: AtomicU64,
    dead: AtomicU64,
    last_access: AtomicU64,
}

impl PageHandle {
    fn resident(page: Arc<RecordPage>) -> Self {
        Self {
            id: page.id(),
            page: Mutex::new(Some(page)),
            resident: AtomicBool::new(true),
            flushed: AtomicBool::new(false),
            live: AtomicU64::new(0),
            dead: AtomicU64::new(0),
            last_access: AtomicU64::new(tick()),
        }
    }

    fn evicted(id: PageId, live: u64, dead: u64) -> Self {
        Self {
            id,
            page: Mutex::new(None),
            resident: AtomicBool::new(false),
            flushed: AtomicBool::new(true),
            live: AtomicU64::new(live),
            dead: AtomicU64::new(dead),
            last_access: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_access.store(tick(), Ordering::Relaxed);
    }

    fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }
}

/// A page as recorded in checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub id: PageId,
    /// Records in the stored image, live or not.
    pub records: u64,
}

/// What a table contributes to a checkpoint.
#[derive(Debug, Default)]
pub struct TableCheckpointState {
    pub next_page_id: PageId,
    pub pages: Vec<PageMeta>,
    pub keys: Vec<(Key, PageId)>,
    pub compacted_pages: usize,
    pub dropped_pages: usize,
}

pub struct TableManager {
    name: String,
    /// Name of this table's directory in the page store; unique per
    /// incarnation of the table.
    storage: String,
    schema: RwLock<TableSchema>,
    store: Arc<dyn PageStore>,
    max_page_size: usize,
    max_data_memory: u64,
    max_pk_memory: u64,
    keys: RwLock<BTreeMap<Key, PageId>>,
    pages: RwLock<BTreeMap<PageId, Arc<PageHandle>>>,
    current: Mutex<Option<Arc<RecordPage>>>,
    /// Id of the page open for appends, 0 when none.
    current_page_id: AtomicU64,
    next_page_id: AtomicU64,
    indexes: RwLock<Vec<SecondaryIndex>>,
    record_count: AtomicU64,
    key_memory: AtomicU64,
    resident_bytes: AtomicU64,
    resident_pages: AtomicU64,
    loaded_pages: AtomicU64,
    unloaded_pages: AtomicU64,
}

impl TableManager {
    pub fn new(
        schema: TableSchema,
        storage: &str,
        store: Arc<dyn PageStore>,
        config: &EngineConfig,
    ) -> Result<Self> {
        Self::build(schema, storage, store, config, 1)
    }

    fn build(
        schema: TableSchema,
        storage: &str,
        store: Arc<dyn PageStore>,
        config: &EngineConfig,
        next_page_id: PageId,
    ) -> Result<Self> {
        if schema.primary_key_indices().is_empty() {
            return Err(tabledb_core::CoreError::NoPrimaryKey(schema.name.clone()).into());
        }
        let indexes = schema
            .indexes
            .iter()
            .map(|def| SecondaryIndex::new(&schema, def.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: schema.name.clone(),
            storage: storage.to_string(),
            schema: RwLock::new(schema),
            store,
            max_page_size: config.max_logical_page_size,
            max_data_memory: config.max_data_memory,
            max_pk_memory: config.max_pk_memory,
            keys: RwLock::new(BTreeMap::new()),
            pages: RwLock::new(BTreeMap::new()),
            current: Mutex::new(None),
            current_page_id: AtomicU64::new(0),
            next_page_id: AtomicU64::new(next_page_id.max(1)),
            indexes: RwLock::new(indexes),
            record_count: AtomicU64::new(0),
            key_memory: AtomicU64::new(0),
            resident_bytes: AtomicU64::new(0),
            resident_pages: AtomicU64::new(0),
            loaded_pages: AtomicU64::new(0),
            unloaded_pages: AtomicU64::new(0),
        })
    }

    /// Rebuilds a table from checkpoint state. Pages start evicted; live
    /// counts come from the key snapshot.
    pub fn restore(
        schema: TableSchema,
        storage: &str,
        store: Arc<dyn PageStore>,
        config: &EngineConfig,
        next_page_id: PageId,
        pages: &[PageMeta],
        keys: Vec<(Key, PageId)>,
    ) -> Result<Self> {
        let table = Self::build(schema, storage, store, config, next_page_id)?;

        let mut live: HashMap<PageId, u64> = HashMap::new();
        let mut key_memory = 0u64;
        {
            let mut index = table.keys.write();
            for (key, page_id) in keys {
                *live.entry(page_id).or_default() += 1;
                key_memory += key_cost(&key);
                index.insert(key, page_id);
            }
            table.record_count.store(index.len() as u64, Ordering::Relaxed);
        }
        table.key_memory.store(key_memory, Ordering::Relaxed);

        {
            let mut registry = table.pages.write();
            for meta in pages {
                let live = live.remove(&meta.id).unwrap_or(0);
                let dead = meta.records.saturating_sub(live);
                registry.insert(meta.id, Arc::new(PageHandle::evicted(meta.id, live, dead)));
            }
        }
        if let Some((page_id, count)) = live.into_iter().next() {
            return Err(StorageError::RecoveryFailure(format!(
                "{} keys of table {} point to page {} missing from the checkpoint",
                count, table.name, page_id
            )));
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_key(&self) -> &str {
        &self.storage
    }

    pub fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Validates `row` and returns its encoded key and value.
    pub fn encode_record(&self, row: &Row) -> Result<(Key, Bytes)> {
        let schema = self.schema.read();
        schema.validate_row(row)?;
        let key = Bytes::from(schema.primary_key(row));
        let value = Bytes::from(encode_row(row));
        let size = RecordPage::record_size(&key, &value);
        let max = RecordPage::max_record_size(self.max_page_size);
        if size > max {
            return Err(StorageError::RecordTooLarge { size, max });
        }
        Ok((key, value))
    }

    /// Encodes a primary key given as column values.
    pub fn encode_primary_key(&self, values: &[Value]) -> Result<Key> {
        let schema = self.schema.read();
        let expected = schema.primary_key_indices().len();
        if values.len() != expected {
            return Err(tabledb_core::CoreError::ArityMismatch {
                table: self.name.clone(),
                expected,
                actual: values.len(),
            }
            .into());
        }
        Ok(Bytes::from(encode_key(values)))
    }

    pub fn decode(&self, value: &[u8]) -> Result<Row> {
        Ok(decode_row(value)?)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.keys.read().contains_key(key)
    }

    pub fn len(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails when adding `key` would push the key index over its budget.
    pub fn check_key_budget(&self, key: &[u8]) -> Result<()> {
        let used = self.key_memory.load(Ordering::Relaxed);
        if used + key_cost(key) > self.max_pk_memory {
            return Err(StorageError::IndexMemoryExhausted {
                table: self.name.clone(),
                used,
                limit: self.max_pk_memory,
            });
        }
        Ok(())
    }

    /// First committed key strictly inside `(after, upper)`.
    pub fn next_key(&self, after: Bound<&[u8]>, upper: Bound<&[u8]>) -> Option<Key> {
        let keys = self.keys.read();
        let (key, _) = keys.range::<[u8], _>((after, Bound::Unbounded)).next()?;
        let in_range = match upper {
            Bound::Unbounded => true,
            Bound::Included(end) => key.as_ref() <= end,
            Bound::Excluded(end) => key.as_ref() < end,
        };
        in_range.then(|| key.clone())
    }

    /// Committed value of `key`, faulting its page in if needed.
    pub fn read(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let page_id = match self.keys.read().get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        let page = self.fetch_page(page_id)?;
        match page.get(key) {
            Some(value) => Ok(Some(value)),
            None => Err(StorageError::CorruptPage {
                table: self.name.clone(),
                page_id,
                reason: format!("record {} missing", display_key(key)),
            }),
        }
    }

    pub fn read_row(&self, key: &[u8]) -> Result<Option<Row>> {
        match self.read(key)? {
            Some(value) => Ok(Some(self.decode(&value)?)),
            None => Ok(None),
        }
    }

    fn handle(&self, page_id: PageId) -> Option<Arc<PageHandle>> {
        self.pages.read().get(&page_id).cloned()
    }

    fn add_resident(&self, delta: i64) {
        if delta >= 0 {
            self.resident_bytes.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.resident_bytes.fetch_sub(delta.unsigned_abs(), Ordering::AcqRel);
        }
    }

    fn fetch_page(&self, page_id: PageId) -> Result<Arc<RecordPage>> {
        let handle = self.handle(page_id).ok_or_else(|| StorageError::CorruptPage {
            table: self.name.clone(),
            page_id,
            reason: "page is not registered".to_string(),
        })?;
        handle.touch();

        let loaded = {
            let mut slot = handle.page.lock();
            if let Some(page) = slot.as_ref() {
                return Ok(Arc::clone(page));
            }
            let data = self.store.read_page(&self.storage, page_id)?;
            let page = Arc::new(RecordPage::deserialize(
                &self.name,
                page_id,
                &data,
                self.max_page_size.max(data.len()),
            )?);
            self.add_resident(page.serialized_size() as i64);
            self.resident_pages.fetch_add(1, Ordering::Relaxed);
            self.loaded_pages.fetch_add(1, Ordering::Relaxed);
            handle.resident.store(true, Ordering::Release);
            *slot = Some(Arc::clone(&page));
            page
        };
        debug!("Loaded page {} of {} ({} records)", page_id, self.name, loaded.len());
        self.enforce_data_budget();
        Ok(loaded)
    }

    /// Flushes the page if it was never flushed, then drops it from memory.
    /// Returns `false` for the current page and for pages already evicted.
    pub fn unload_page(&self, page_id: PageId) -> Result<bool> {
        let Some(handle) = self.handle(page_id) else {
            return Ok(false);
        };
        let mut slot = handle.page.lock();
        if self.current_page_id.load(Ordering::Acquire) == page_id {
            return Ok(false);
        }
        let Some(page) = slot.as_ref() else {
            return Ok(false);
        };
        if !handle.is_flushed() {
            self.store.write_page(&self.storage, page_id, &page.serialize())?;
            handle.flushed.store(true, Ordering::Release);
        }
        let size = page.serialized_size();
        *slot = None;
        handle.resident.store(false, Ordering::Release);
        self.add_resident(-(size as i64));
        self.resident_pages.fetch_sub(1, Ordering::Relaxed);
        self.unloaded_pages.fetch_add(1, Ordering::Relaxed);
        debug!("Unloaded page {} of {} ({} bytes)", page_id, self.name, size);
        Ok(true)
    }

    /// Resident pages that may be evicted, least recently touched first,
    /// as `(last access, page id)`.
    pub fn evictable_pages(&self) -> Vec<(u64, PageId)> {
        let current = self.current_page_id.load(Ordering::Acquire);
        let mut candidates: Vec<(u64, PageId)> = self
            .pages
            .read()
            .values()
            .filter(|h| h.id != current && h.resident.load(Ordering::Acquire))
            .map(|h| (h.last_access.load(Ordering::Relaxed), h.id))
            .collect();
        candidates.sort_unstable();
        candidates
    }

    /// Evicts this table's least recently used pages until its resident
    /// bytes fit `max_data_memory`. Failures are logged, not returned.
    pub fn enforce_data_budget(&self) {
        if self.resident_bytes() <= self.max_data_memory {
            return;
        }
        for (_, page_id) in self.evictable_pages() {
            if self.resident_bytes() <= self.max_data_memory {
                break;
            }
            if let Err(e) = self.unload_page(page_id) {
                warn!("Could not evict page {} of {}: {}", page_id, self.name, e);
                break;
            }
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Acquire)
    }

    fn allocate_page(&self) -> Arc<RecordPage> {
        let id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(RecordPage::new(id, self.max_page_size));
        // Publish the new current id before the handle becomes visible to
        // evictors.
        self.current_page_id.store(id, Ordering::Release);
        self.pages
            .write()
            .insert(id, Arc::new(PageHandle::resident(Arc::clone(&page))));
        self.add_resident(PAGE_HEADER_SIZE as i64);
        self.resident_pages.fetch_add(1, Ordering::Relaxed);
        page
    }

    /// Writes a record into the current page, sealing it and opening a new
    /// one when it is full. Returns the page that now holds the record.
    fn append(&self, key: &Key, value: &Bytes) -> Result<PageId> {
        let size = RecordPage::record_size(key, value);
        let mut current = self.current.lock();
        if let Some(page) = current.as_ref() {
            let replaced = page.get(key);
            if page.try_put(key.clone(), value.clone()) {
                let delta = match &replaced {
                    Some(old) => size as i64 - RecordPage::record_size(key, old) as i64,
                    None => size as i64,
                };
                self.add_resident(delta);
                if let Some(handle) = self.handle(page.id()) {
                    if replaced.is_none() {
                        handle.live.fetch_add(1, Ordering::AcqRel);
                    }
                    handle.touch();
                }
                return Ok(page.id());
            }
        }

        let max = RecordPage::max_record_size(self.max_page_size);
        if size > max {
            return Err(StorageError::RecordTooLarge { size, max });
        }
        if let Some(full) = current.as_ref() {
            debug!(
                "Sealed page {} of {} at {:.1}% full ({} records)",
                full.id(),
                self.name,
                full.fill_percentage(),
                full.len()
            );
        }
        let page = self.allocate_page();
        if !page.try_put(key.clone(), value.clone()) {
            return Err(StorageError::RecordTooLarge { size, max });
        }
        self.add_resident(size as i64);
        if let Some(handle) = self.handle(page.id()) {
            handle.live.fetch_add(1, Ordering::AcqRel);
        }
        let id = page.id();
        *current = Some(page);
        Ok(id)
    }

    /// Accounts for the copy of `key` left behind in `page_id`: removed
    /// outright from a page that was never flushed, counted dead otherwise.
    fn release_record(&self, page_id: PageId, key: &[u8]) {
        let Some(handle) = self.handle(page_id) else {
            return;
        };
        let slot = handle.page.lock();
        if !handle.is_flushed() {
            if let Some(removed) = slot.as_ref().and_then(|page| page.remove(key)) {
                self.add_resident(-(RecordPage::record_size(key, &removed) as i64));
            }
        } else {
            handle.dead.fetch_add(1, Ordering::AcqRel);
        }
        let _ = handle
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn has_indexes(&self) -> bool {
        !self.indexes.read().is_empty()
    }

    /// Applies a committed put. With `maintain_indexes` the secondary indexes
    /// follow the change; replay skips that and rebuilds them afterwards.
    pub fn apply_put(&self, key: Key, value: Bytes, maintain_indexes: bool) -> Result<()> {
        let maintain = maintain_indexes && self.has_indexes();
        let old_row = if maintain { self.read_row(&key)? } else { None };
        let new_row = if maintain { Some(self.decode(&value)?) } else { None };

        let page_id = self.append(&key, &value)?;
        let previous = self.keys.write().insert(key.clone(), page_id);
        match previous {
            Some(old) if old != page_id => self.release_record(old, &key),
            Some(_) => {}
            None => {
                self.record_count.fetch_add(1, Ordering::Relaxed);
                self.key_memory.fetch_add(key_cost(&key), Ordering::Relaxed);
            }
        }

        if let Some(new_row) = new_row {
            let mut indexes = self.indexes.write();
            for index in indexes.iter_mut() {
                if let Some(old_row) = &old_row {
                    index.remove(old_row, &key);
                }
                index.insert(&new_row, key.clone());
            }
        }
        self.enforce_data_budget();
        Ok(())
    }

    pub fn apply_delete(&self, key: &[u8], maintain_indexes: bool) -> Result<()> {
        let maintain = maintain_indexes && self.has_indexes();
        let old_row = if maintain { self.read_row(key)? } else { None };

        let previous = self.keys.write().remove(key);
        if let Some(page_id) = previous {
            self.release_record(page_id, key);
            self.record_count.fetch_sub(1, Ordering::Relaxed);
            self.key_memory.fetch_sub(key_cost(key), Ordering::Relaxed);
        }
        if let Some(old_row) = old_row {
            let mut indexes = self.indexes.write();
            for index in indexes.iter_mut() {
                index.remove(&old_row, key);
            }
        }
        Ok(())
    }

    /// Runs `f` over the secondary indexes under a read latch.
    pub fn with_indexes<R>(&self, f: impl FnOnce(&[SecondaryIndex]) -> R) -> R {
        f(&self.indexes.read())
    }

    /// Encoded tuples of `row` for every unique index, as
    /// `(index name, tuple)`; rows with NULL index columns are skipped.
    pub fn unique_tuples(&self, row: &Row) -> Vec<(String, Bytes)> {
        self.with_indexes(|indexes| {
            indexes
                .iter()
                .filter(|i| i.is_unique())
                .filter_map(|i| i.unique_tuple(row).map(|t| (i.name().to_string(), t)))
                .collect()
        })
    }

    /// Committed keys indexed under `tuple` in index `index`.
    pub fn index_lookup(&self, index: &str, tuple: &[u8]) -> Vec<Key> {
        self.with_indexes(|indexes| {
            indexes
                .iter()
                .find(|i| i.name() == index)
                .map(|i| i.lookup(tuple))
                .unwrap_or_default()
        })
    }

    fn all_keys(&self) -> Vec<Key> {
        self.keys.read().keys().cloned().collect()
    }

    /// Fills `index` from every committed row.
    fn populate(&self, index: &mut SecondaryIndex) -> Result<()> {
        index.clear();
        let mut seen: HashMap<Bytes, Key> = HashMap::new();
        for key in self.all_keys() {
            let Some(row) = self.read_row(&key)? else {
                continue;
            };
            if index.is_unique() {
                if let Some(tuple) = index.unique_tuple(&row) {
                    if seen.insert(tuple, key.clone()).is_some() {
                        return Err(StorageError::DuplicateKey {
                            table: self.name.clone(),
                            key: format!("{} on index {}", display_key(&key), index.name()),
                        });
                    }
                }
            }
            index.insert(&row, key);
        }
        Ok(())
    }

    /// Adds an index and builds it from the committed rows. Callers must keep
    /// commits out while this runs.
    pub fn add_index(&self, definition: IndexDefinition) -> Result<()> {
        if self
            .schema
            .read()
            .indexes
            .iter()
            .any(|i| i.name == definition.name)
        {
            return Err(StorageError::IndexAlreadyExists(definition.name));
        }
        let mut index = SecondaryIndex::new(&self.schema.read(), definition.clone())?;
        self.populate(&mut index)?;
        self.schema.write().indexes.push(definition);
        self.indexes.write().push(index);
        Ok(())
    }

    /// Registers an index without building it; used during log replay,
    /// which rebuilds every index at the end.
    pub fn declare_index(&self, definition: IndexDefinition) -> Result<()> {
        let index = SecondaryIndex::new(&self.schema.read(), definition.clone())?;
        self.schema.write().indexes.push(definition);
        self.indexes.write().push(index);
        Ok(())
    }

    pub fn rebuild_indexes(&self) -> Result<()> {
        let mut indexes = std::mem::take(&mut *self.indexes.write());
        let result = indexes.iter_mut().try_for_each(|index| self.populate(index));
        *self.indexes.write() = indexes;
        result
    }

    /// Drops a page from the registry along with its resident content.
    fn discard_page(&self, handle: &PageHandle) {
        self.pages.write().remove(&handle.id);
        let mut slot = handle.page.lock();
        if let Some(page) = slot.take() {
            handle.resident.store(false, Ordering::Release);
            self.add_resident(-(page.serialized_size() as i64));
            self.resident_pages.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn seal_current(&self) {
        let mut current = self.current.lock();
        *current = None;
        self.current_page_id.store(0, Ordering::Release);
    }

    /// Moves the live records of a flushed page into fresh pages.
    fn compact_page(&self, handle: &PageHandle) -> Result<()> {
        let page = self.fetch_page(handle.id)?;
        for (key, value) in page.entries() {
            if self.keys.read().get(&key) != Some(&handle.id) {
                continue;
            }
            let new_page = self.append(&key, &value)?;
            self.keys.write().insert(key, new_page);
        }
        self.discard_page(handle);
        Ok(())
    }

    /// Seals the current page, compacts or drops pages full of dead records,
    /// flushes every page never flushed, and snapshots the key index.
    ///
    /// Must run with commits excluded.
    pub fn prepare_checkpoint(&self, compaction_threshold_percent: f64) -> Result<TableCheckpointState> {
        self.seal_current();

        let mut state = TableCheckpointState::default();
        let handles: Vec<Arc<PageHandle>> = self.pages.read().values().cloned().collect();
        for handle in handles {
            let live = handle.live.load(Ordering::Acquire);
            let dead = handle.dead.load(Ordering::Acquire);
            if live == 0 {
                self.discard_page(&handle);
                state.dropped_pages += 1;
            } else if handle.is_flushed()
                && dead > 0
                && (dead as f64) * 100.0 >= compaction_threshold_percent * (live + dead) as f64
            {
                self.compact_page(&handle)?;
                state.compacted_pages += 1;
            }
        }
        self.seal_current();

        let handles: Vec<Arc<PageHandle>> = self.pages.read().values().cloned().collect();
        for handle in &handles {
            let slot = handle.page.lock();
            if !handle.is_flushed() {
                if let Some(page) = slot.as_ref() {
                    self.store.write_page(&self.storage, handle.id, &page.serialize())?;
                }
                handle.flushed.store(true, Ordering::Release);
            }
            state.pages.push(PageMeta {
                id: handle.id,
                records: handle.live.load(Ordering::Acquire) + handle.dead.load(Ordering::Acquire),
            });
        }
        state.next_page_id = self.next_page_id.load(Ordering::SeqCst);
        state.keys = self
            .keys
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), *p))
            .collect();
        Ok(state)
    }

    /// Deletes stored pages that `referenced` does not list.
    pub fn purge_unreferenced_pages(&self, referenced: &[PageId]) -> Result<usize> {
        let mut purged = 0;
        for page_id in self.store.list_pages(&self.storage)? {
            if referenced.binary_search(&page_id).is_err() {
                self.store.delete_page(&self.storage, page_id)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Ids of every registered page, ascending.
    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages.read().keys().copied().collect()
    }

    pub fn stats(&self) -> TableStats {
        let pages = self.pages.read();
        TableStats {
            table_size: self.len(),
            dirty_records: pages
                .values()
                .map(|h| h.dead.load(Ordering::Relaxed))
                .sum(),
            loaded_pages_count: self.loaded_pages.load(Ordering::Relaxed),
            unloaded_pages_count: self.unloaded_pages.load(Ordering::Relaxed),
            buffers_used_memory: self.resident_bytes(),
            key_memory: self.key_memory.load(Ordering::Relaxed),
            page_count: pages.len() as u64,
            resident_pages: self.resident_pages.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableManager")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryPageStore;
    use pretty_assertions::assert_eq;
    use tabledb_core::{ColumnDefinition, DataType};

    fn schema() -> TableSchema {
        TableSchema::new("t")
            .add_column(ColumnDefinition::new("id", DataType::Text).primary_key())
            .add_column(ColumnDefinition::new("n1", DataType::BigInt))
    }

    fn config(page_size: usize, data_memory: u64) -> EngineConfig {
        EngineConfig::new("/unused", 1 << 30)
            .with_max_logical_page_size(page_size)
            .with_max_data_memory(data_memory)
    }

    fn setup(page_size: usize, data_memory: u64) -> (Arc<MemoryPageStore>, TableManager) {
        let store = Arc::new(MemoryPageStore::new());
        let table = TableManager::new(schema(), "t.1", store.clone(), &config(page_size, data_memory)).unwrap();
        (store, table)
    }

    fn put(table: &TableManager, id: &str, n1: i64) {
        let (key, value) = table
            .encode_record(&vec![Value::from(id), Value::BigInt(n1)])
            .unwrap();
        table.apply_put(key, value, true).unwrap();
    }

    fn get(table: &TableManager, id: &str) -> Option<Row> {
        let key = table.encode_primary_key(&[Value::from(id)]).unwrap();
        table.read_row(&key).unwrap()
    }

    #[test]
    fn test_put_read_delete() {
        let (_store, table) = setup(4096, 1 << 20);
        put(&table, "a", 1);
        put(&table, "b", 2);
        assert_eq!(get(&table, "a"), Some(vec![Value::from("a"), Value::BigInt(1)]));
        assert_eq!(table.len(), 2);

        put(&table, "a", 10);
        assert_eq!(get(&table, "a").unwrap()[1], Value::BigInt(10));
        assert_eq!(table.len(), 2);

        let key = table.encode_primary_key(&[Value::from("b")]).unwrap();
        table.apply_delete(&key, true).unwrap();
        assert_eq!(get(&table, "b"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_page_is_sealed() {
        let (_store, table) = setup(256, 1 << 20);
        for i in 0..50 {
            put(&table, &format!("key{:03}", i), i);
        }
        let stats = table.stats();
        assert!(stats.page_count > 1);
        for i in 0..50 {
            assert_eq!(get(&table, &format!("key{:03}", i)).unwrap()[1], Value::BigInt(i));
        }
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let (_store, table) = setup(128, 1 << 20);
        let row = vec![Value::from("x".repeat(200)), Value::BigInt(1)];
        assert!(matches!(
            table.encode_record(&row),
            Err(StorageError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_data_budget_evicts_and_reloads() {
        let (store, table) = setup(256, 600);
        for i in 0..100 {
            put(&table, &format!("key{:03}", i), i);
        }
        let stats = table.stats();
        assert!(stats.unloaded_pages_count > 0);
        assert!(stats.buffers_used_memory <= 600 + 256);
        assert!(store.write_count() > 0);

        for i in 0..100 {
            assert_eq!(get(&table, &format!("key{:03}", i)).unwrap()[1], Value::BigInt(i));
        }
        assert!(table.stats().loaded_pages_count > 0);
    }

    #[test]
    fn test_update_of_flushed_record_counts_dead_copy() {
        let (_store, table) = setup(256, 1 << 20);
        for i in 0..20 {
            put(&table, &format!("key{:03}", i), i);
        }
        let first_page = table.page_ids()[0];
        assert!(table.unload_page(first_page).unwrap());

        put(&table, "key000", 1000);
        assert_eq!(table.stats().dirty_records, 1);
        assert_eq!(get(&table, "key000").unwrap()[1], Value::BigInt(1000));
    }

    #[test]
    fn test_current_page_is_never_unloaded() {
        let (_store, table) = setup(4096, 1 << 20);
        put(&table, "a", 1);
        let ids = table.page_ids();
        assert_eq!(ids.len(), 1);
        assert!(!table.unload_page(ids[0]).unwrap());
        assert!(table.evictable_pages().is_empty());
    }

    #[test]
    fn test_checkpoint_compacts_and_restores() {
        let (store, table) = setup(256, 1 << 20);
        for i in 0..40 {
            put(&table, &format!("key{:03}", i), i);
        }
        table.prepare_checkpoint(50.0).unwrap();
        for i in 0..30 {
            put(&table, &format!("key{:03}", i), i + 100);
        }
        let state = table.prepare_checkpoint(50.0).unwrap();
        assert!(state.compacted_pages + state.dropped_pages > 0);
        assert_eq!(table.stats().dirty_records as usize, {
            let pages: u64 = state.pages.iter().map(|p| p.records).sum();
            pages as usize - state.keys.len()
        });

        let restored = TableManager::restore(
            schema(),
            "t.1",
            store.clone(),
            &config(256, 1 << 20),
            state.next_page_id,
            &state.pages,
            state.keys.clone(),
        )
        .unwrap();
        assert_eq!(restored.len(), 40);
        assert_eq!(restored.stats().resident_pages, 0);
        for i in 0..40 {
            let expected = if i < 30 { i + 100 } else { i };
            assert_eq!(get(&restored, &format!("key{:03}", i)).unwrap()[1], Value::BigInt(expected));
        }
    }

    #[test]
    fn test_key_budget() {
        let store = Arc::new(MemoryPageStore::new());
        let cfg = config(4096, 1 << 20).with_max_pk_memory(PK_ENTRY_OVERHEAD + 8);
        let table = TableManager::new(schema(), "t.1", store, &cfg).unwrap();
        let (key, value) = table
            .encode_record(&vec![Value::from("a"), Value::BigInt(1)])
            .unwrap();
        assert!(table.check_key_budget(&key).is_ok());
        table.apply_put(key, value, true).unwrap();
        let other = table.encode_primary_key(&[Value::from("b")]).unwrap();
        assert!(matches!(
            table.check_key_budget(&other),
            Err(StorageError::IndexMemoryExhausted { .. })
        ));
    }

    #[test]
    fn test_add_unique_index_over_duplicates_fails() {
        let (_store, table) = setup(4096, 1 << 20);
        put(&table, "a", 1);
        put(&table, "b", 1);
        assert!(matches!(
            table.add_index(IndexDefinition::new("ix", &["n1"]).unique()),
            Err(StorageError::DuplicateKey { .. })
        ));
        table.add_index(IndexDefinition::new("ix", &["n1"])).unwrap();
        assert!(matches!(
            table.add_index(IndexDefinition::new("ix", &["n1"])),
            Err(StorageError::IndexAlreadyExists(_))
        ));
        let tuple = encode_key(&[Value::BigInt(1)]);
        assert_eq!(table.index_lookup("ix", &tuple).len(), 2);

        put(&table, "a", 2);
        assert_eq!(table.index_lookup("ix", &tuple).len(), 1);
    }
}
