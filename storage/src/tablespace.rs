//! Table-space manager.
//!
//! A table-space groups tables that share one commit log, one lock manager
//! and one transaction registry. It is the entry point for DML: every
//! statement names a table and a [`TransactionContext`].
//!
//! Only writers take key locks. Lock order is key locks, then the checkpoint
//! latch, then the visibility latch. Commits and reads hold the checkpoint
//! latch shared; checkpoints and DDL that must not race with commits hold it
//! exclusively. Commits hold the visibility latch exclusively while applying
//! a write set, and each committed-record read holds it shared.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tabledb_core::{IndexDefinition, Row, TableSchema, Value};

use crate::checkpoint::{self, CheckpointMetadata, TableCheckpoint};
use crate::config::EngineConfig;
use crate::file::{FilePageStore, PageStore};
use crate::lock::{Acquired, LockKey, LockManager};
use crate::page::{Key, PageId};
use crate::table::{DataScanner, ReadContext, ScanPredicate, TableManager, TableStats};
use crate::transaction::{
    PendingWrite, Transaction, TransactionContext, TransactionId, TransactionManager,
    TransactionState,
};
use crate::wal::{CommitLog, LogEntry, Lsn, Mutation};
use crate::{display_key, Result, StorageError};

pub const DEFAULT_TABLE_SPACE: &str = "default";

const TABLES_DIR: &str = "tables";
const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmlResult {
    pub update_count: u64,
    /// The transaction the statement ran under; `None` for
    /// [`TransactionContext::None`].
    pub transaction_id: Option<TransactionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub record: Option<Row>,
    pub transaction_id: Option<TransactionId>,
}

/// Names of table-spaces and tables end up in paths.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn storage_key(table: &str, lsn: Lsn) -> String {
    format!("{}.{}", table, lsn)
}

pub struct TableSpaceManager {
    name: String,
    dir: PathBuf,
    config: EngineConfig,
    store: Arc<dyn PageStore>,
    tables: RwLock<BTreeMap<String, Arc<TableManager>>>,
    locks: Arc<LockManager>,
    transactions: TransactionManager,
    log: CommitLog,
    checkpoint_latch: Arc<RwLock<()>>,
    visibility: Arc<RwLock<()>>,
    ddl: Mutex<()>,
    closed: AtomicBool,
    /// Set when a logged commit could not be applied in memory; memory is
    /// then behind the log until the table-space is reopened.
    failure: Mutex<Option<String>>,
}

impl TableSpaceManager {
    /// Opens (recovering if needed) a table-space stored under
    /// `<data_dir>/<name>`.
    pub fn open(name: &str, config: &EngineConfig) -> Result<Self> {
        validate_name(name)?;
        let dir = config.data_dir.join(name);
        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&dir.join(TABLES_DIR))?);
        Self::open_with_store(name, config, store)
    }

    /// Like [`open`](Self::open) with page images kept in `store`; checkpoint
    /// metadata, key snapshots and the log still live on disk.
    pub fn open_with_store(name: &str, config: &EngineConfig, store: Arc<dyn PageStore>) -> Result<Self> {
        validate_name(name)?;
        let started = Instant::now();
        let dir = config.data_dir.join(name);
        fs::create_dir_all(&dir)?;
        let log_dir = config.log_dir().join(name);

        let metadata = checkpoint::read_metadata(&dir)?;
        let (checkpoint_lsn, next_transaction_id) = metadata
            .as_ref()
            .map_or((0, 1), |m| (m.lsn, m.next_transaction_id));

        let mut tables = BTreeMap::new();
        let mut referenced = HashSet::new();
        if let Some(metadata) = metadata {
            for entry in metadata.tables {
                let name = entry.schema.name.clone();
                let keys = checkpoint::read_key_snapshot(
                    &dir.join(SNAPSHOTS_DIR).join(&entry.storage_key),
                    checkpoint_lsn,
                )?;
                let table = TableManager::restore(
                    entry.schema,
                    &entry.storage_key,
                    Arc::clone(&store),
                    config,
                    entry.next_page_id,
                    &entry.pages,
                    keys,
                )?;
                let pages: Vec<PageId> = entry.pages.iter().map(|p| p.id).collect();
                let orphans = table.purge_unreferenced_pages(&pages)?;
                if orphans > 0 {
                    debug!("Deleted {} orphan pages of {}", orphans, name);
                }
                referenced.insert(entry.storage_key);
                tables.insert(name, Arc::new(table));
            }
        }
        // Tables created after the checkpoint are rebuilt from the log.
        for key in store.list_tables()? {
            if !referenced.contains(&key) {
                store.drop_table(&key)?;
            }
        }

        let transactions = TransactionManager::new(next_transaction_id);
        let replay = CommitLog::read_all(&log_dir)?;
        let mut replayed = 0usize;
        for record in replay.records {
            if record.lsn <= checkpoint_lsn {
                continue;
            }
            if let LogEntry::Commit { transaction_id, .. } = &record.entry {
                transactions.advance_past(*transaction_id);
            }
            Self::replay_entry(&mut tables, &store, config, record.lsn, record.entry)?;
            replayed += 1;
        }
        for table in tables.values() {
            table.rebuild_indexes()?;
        }

        let next_lsn = replay.last_lsn.max(checkpoint_lsn) + 1;
        let log = CommitLog::open(&log_dir, replay.last_segment, next_lsn, config.sync_on_commit)?;
        info!(
            "Recovered table space {} from checkpoint at lsn {}: {} tables, {} log records replayed in {:?}",
            name,
            checkpoint_lsn,
            tables.len(),
            replayed,
            started.elapsed()
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            config: config.clone(),
            store,
            tables: RwLock::new(tables),
            locks: Arc::new(LockManager::new(config.lock_timeout())),
            transactions,
            log,
            checkpoint_latch: Arc::new(RwLock::new(())),
            visibility: Arc::new(RwLock::new(())),
            ddl: Mutex::new(()),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    fn replay_entry(
        tables: &mut BTreeMap<String, Arc<TableManager>>,
        store: &Arc<dyn PageStore>,
        config: &EngineConfig,
        lsn: Lsn,
        entry: LogEntry,
    ) -> Result<()> {
        let missing = |table: &str| {
            StorageError::RecoveryFailure(format!("log record {} names unknown table {}", lsn, table))
        };
        match entry {
            LogEntry::CreateTable(schema) => {
                let table = TableManager::new(
                    schema.clone(),
                    &storage_key(&schema.name, lsn),
                    Arc::clone(store),
                    config,
                )?;
                if tables.insert(schema.name.clone(), Arc::new(table)).is_some() {
                    return Err(StorageError::RecoveryFailure(format!(
                        "log record {} creates existing table {}",
                        lsn, schema.name
                    )));
                }
            }
            LogEntry::CreateIndex { table, index } => {
                tables
                    .get(&table)
                    .ok_or_else(|| missing(&table))?
                    .declare_index(index)?;
            }
            LogEntry::DropTable(table) => {
                tables.remove(&table).ok_or_else(|| missing(&table))?;
            }
            LogEntry::Commit { mutations, .. } => {
                for mutation in mutations {
                    let table = tables
                        .get(mutation.table())
                        .ok_or_else(|| missing(mutation.table()))?;
                    match mutation {
                        Mutation::Put { key, value, .. } => table.apply_put(key, value, false)?,
                        Mutation::Delete { key, .. } => table.apply_delete(&key, false)?,
                    }
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::ShuttingDown);
        }
        self.ensure_healthy()
    }

    fn ensure_healthy(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(StorageError::TableSpaceFailed {
                name: self.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn mark_failed(&self, reason: String) {
        error!("Table space {} failed, statements refused until reopened: {}", self.name, reason);
        self.failure.lock().get_or_insert(reason);
    }

    /// Why the table-space stopped accepting statements, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableManager>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub(crate) fn tables_snapshot(&self) -> Vec<Arc<TableManager>> {
        self.tables.read().values().cloned().collect()
    }

    pub fn table_stats(&self, name: &str) -> Result<TableStats> {
        Ok(self.table(name)?.stats())
    }

    /// Resident page bytes across all tables.
    pub fn resident_bytes(&self) -> u64 {
        self.tables.read().values().map(|t| t.resident_bytes()).sum()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.transactions.active_ids()
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.ensure_open()?;
        validate_name(&schema.name)?;
        if schema.primary_key_indices().is_empty() {
            return Err(tabledb_core::CoreError::NoPrimaryKey(schema.name.clone()).into());
        }
        let mut seen = HashSet::new();
        for index in &schema.indexes {
            schema.index_column_indices(index)?;
            if !seen.insert(index.name.as_str()) {
                return Err(StorageError::IndexAlreadyExists(index.name.clone()));
            }
        }

        let _ddl = self.ddl.lock();
        let _latch = self.checkpoint_latch.read();
        if self.tables.read().contains_key(&schema.name) {
            return Err(StorageError::TableAlreadyExists(schema.name));
        }
        let lsn = self.log.append(LogEntry::CreateTable(schema.clone()))?;
        let table = TableManager::new(
            schema.clone(),
            &storage_key(&schema.name, lsn),
            Arc::clone(&self.store),
            &self.config,
        )?;
        self.tables.write().insert(schema.name.clone(), Arc::new(table));
        info!("Created table {}.{}", self.name, schema.name);
        Ok(())
    }

    /// Drops a table. Its files stay until the next checkpoint no longer
    /// references them; pending writes to it fail at commit.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let _ddl = self.ddl.lock();
        let _latch = self.checkpoint_latch.write();
        if !self.tables.read().contains_key(name) {
            return Err(StorageError::TableNotFound(name.to_string()));
        }
        self.log.append(LogEntry::DropTable(name.to_string()))?;
        self.tables.write().remove(name);
        info!("Dropped table {}.{}", self.name, name);
        Ok(())
    }

    /// Adds a secondary index and builds it from the committed rows.
    pub fn create_index(&self, table: &str, index: IndexDefinition) -> Result<()> {
        self.ensure_open()?;
        let _ddl = self.ddl.lock();
        let _latch = self.checkpoint_latch.write();
        let manager = self.table(table)?;
        manager.add_index(index.clone())?;
        self.log.append(LogEntry::CreateIndex {
            table: table.to_string(),
            index: index.clone(),
        })?;
        info!("Created index {} on {}.{}", index.name, self.name, table);
        Ok(())
    }

    pub fn begin_transaction(&self) -> Result<TransactionId> {
        self.ensure_open()?;
        let (id, _) = self.transactions.begin();
        debug!("Began transaction {} on {}", id, self.name);
        Ok(id)
    }

    pub fn commit_transaction(&self, id: TransactionId) -> Result<()> {
        let shared = self.transactions.get(id)?;
        let mut tx = shared.lock();
        tx.ensure_active()?;
        let result = self.commit_owned(&mut tx);
        if result.is_err() {
            self.rollback_owned(&mut tx);
        }
        self.transactions.remove(id);
        result
    }

    pub fn rollback_transaction(&self, id: TransactionId) -> Result<()> {
        let shared = self.transactions.get(id)?;
        let mut tx = shared.lock();
        tx.ensure_active()?;
        self.rollback_owned(&mut tx);
        self.transactions.remove(id);
        debug!("Rolled back transaction {} on {}", id, self.name);
        Ok(())
    }

    /// Runs `op` under the transaction `ctx` designates.
    fn run<T>(
        &self,
        ctx: TransactionContext,
        op: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<(T, Option<TransactionId>)> {
        self.ensure_open()?;
        match ctx {
            TransactionContext::None | TransactionContext::Auto => {
                let mut tx = self.transactions.ephemeral();
                let result = op(&mut tx).and_then(|value| {
                    self.commit_owned(&mut tx)?;
                    Ok(value)
                });
                if result.is_err() {
                    self.rollback_owned(&mut tx);
                }
                let reported = (ctx == TransactionContext::Auto).then_some(tx.id());
                result.map(|value| (value, reported))
            }
            TransactionContext::Begin => {
                let (id, shared) = self.transactions.begin();
                let mut tx = shared.lock();
                match op(&mut tx) {
                    Ok(value) => Ok((value, Some(id))),
                    Err(e) => {
                        self.rollback_owned(&mut tx);
                        self.transactions.remove(id);
                        Err(e)
                    }
                }
            }
            TransactionContext::Id(id) => {
                let shared = self.transactions.get(id)?;
                let mut tx = shared.lock();
                tx.ensure_active()?;
                op(&mut tx).map(|value| (value, Some(id)))
            }
        }
    }

    fn lock_exclusive(&self, tx: &mut Transaction, key: LockKey) -> Result<()> {
        if self.locks.acquire(tx.id(), &key)? == Acquired::New {
            tx.hold_lock(key);
        }
        Ok(())
    }

    fn read_context(&self) -> ReadContext {
        ReadContext {
            checkpoint: Arc::clone(&self.checkpoint_latch),
            visibility: Arc::clone(&self.visibility),
        }
    }

    /// Whether `key` exists as seen by `tx`.
    fn visible_exists(&self, tx: &Transaction, table: &TableManager, key: &[u8]) -> bool {
        match tx.pending(table.name(), key) {
            Some(PendingWrite::Put(_)) => true,
            Some(PendingWrite::Delete) => false,
            None => table.contains_key(key),
        }
    }

    /// Takes the unique-index tuples of `row` for `tx`, failing with
    /// `DuplicateKey` if another visible row already has one of them.
    fn claim_unique_tuples(
        &self,
        tx: &mut Transaction,
        table: &TableManager,
        key: &Key,
        row: &Row,
    ) -> Result<()> {
        for (index, tuple) in table.unique_tuples(row) {
            self.lock_exclusive(tx, LockKey::index_tuple(table.name(), &index, tuple.clone()))?;
            let duplicate = || StorageError::DuplicateKey {
                table: table.name().to_string(),
                key: format!("{} on index {}", display_key(&tuple), index),
            };

            for owner in table.index_lookup(&index, &tuple) {
                if owner == *key {
                    continue;
                }
                match tx.pending(table.name(), &owner) {
                    Some(PendingWrite::Delete) => {}
                    Some(PendingWrite::Put(value)) => {
                        let other = table.decode(value)?;
                        if tuple_of(table, &index, &other).as_ref() == Some(&tuple) {
                            return Err(duplicate());
                        }
                    }
                    None => return Err(duplicate()),
                }
            }
            for (other_key, value) in tx.pending_puts(table.name()) {
                if other_key == key {
                    continue;
                }
                let other = table.decode(value)?;
                if tuple_of(table, &index, &other).as_ref() == Some(&tuple) {
                    return Err(duplicate());
                }
            }
        }
        Ok(())
    }

    pub fn insert(&self, table: &str, row: Row, ctx: TransactionContext) -> Result<DmlResult> {
        let table = self.table(table)?;
        let (key, value) = table.encode_record(&row)?;
        let ((), transaction_id) = self.run(ctx, |tx| {
            self.lock_exclusive(tx, LockKey::record(table.name(), key.clone()))?;
            if self.visible_exists(tx, &table, &key) {
                return Err(StorageError::DuplicateKey {
                    table: table.name().to_string(),
                    key: display_key(&key),
                });
            }
            if !table.contains_key(&key) {
                table.check_key_budget(&key)?;
            }
            self.claim_unique_tuples(tx, &table, &key, &row)?;
            tx.record_write(table.name(), key.clone(), PendingWrite::Put(value.clone()));
            Ok(())
        })?;
        Ok(DmlResult {
            update_count: 1,
            transaction_id,
        })
    }

    /// Replaces the row with the same primary key as `row`.
    pub fn update(&self, table: &str, row: Row, ctx: TransactionContext) -> Result<DmlResult> {
        let table = self.table(table)?;
        let (key, value) = table.encode_record(&row)?;
        let (update_count, transaction_id) = self.run(ctx, |tx| {
            self.lock_exclusive(tx, LockKey::record(table.name(), key.clone()))?;
            if !self.visible_exists(tx, &table, &key) {
                return Ok(0);
            }
            self.claim_unique_tuples(tx, &table, &key, &row)?;
            tx.record_write(table.name(), key.clone(), PendingWrite::Put(value.clone()));
            Ok(1)
        })?;
        Ok(DmlResult {
            update_count,
            transaction_id,
        })
    }

    pub fn delete(&self, table: &str, primary_key: &[Value], ctx: TransactionContext) -> Result<DmlResult> {
        let table = self.table(table)?;
        let key = table.encode_primary_key(primary_key)?;
        let (update_count, transaction_id) = self.run(ctx, |tx| {
            self.lock_exclusive(tx, LockKey::record(table.name(), key.clone()))?;
            if !self.visible_exists(tx, &table, &key) {
                return Ok(0);
            }
            tx.record_write(table.name(), key.clone(), PendingWrite::Delete);
            Ok(1)
        })?;
        Ok(DmlResult {
            update_count,
            transaction_id,
        })
    }

    pub fn get(&self, table: &str, primary_key: &[Value], ctx: TransactionContext) -> Result<GetResult> {
        let table = self.table(table)?;
        let key = table.encode_primary_key(primary_key)?;
        let (record, transaction_id) = self.run(ctx, |tx| match tx.pending(table.name(), &key) {
            Some(PendingWrite::Put(value)) => Ok(Some(table.decode(value)?)),
            Some(PendingWrite::Delete) => Ok(None),
            None => self.read_context().read_committed(&table, &key),
        })?;
        Ok(GetResult {
            record,
            transaction_id,
        })
    }

    /// Like [`get`](Self::get), but an absent key is [`StorageError::NotFound`].
    pub fn get_required(
        &self,
        table: &str,
        primary_key: &[Value],
        ctx: TransactionContext,
    ) -> Result<(Row, Option<TransactionId>)> {
        let result = self.get(table, primary_key, ctx)?;
        match result.record {
            Some(row) => Ok((row, result.transaction_id)),
            None => Err(StorageError::NotFound {
                table: table.to_string(),
                key: primary_key
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn scan(&self, table: &str, predicate: ScanPredicate, ctx: TransactionContext) -> Result<DataScanner> {
        self.ensure_open()?;
        let table = self.table(table)?;
        match ctx {
            TransactionContext::None | TransactionContext::Auto => {
                let reported = (ctx == TransactionContext::Auto).then(|| self.transactions.next_id());
                DataScanner::new(table, predicate, self.read_context(), None, reported)
            }
            TransactionContext::Begin => {
                let (id, shared) = self.transactions.begin();
                DataScanner::new(table, predicate, self.read_context(), Some(shared), Some(id))
            }
            TransactionContext::Id(id) => {
                let shared = self.transactions.get(id)?;
                shared.lock().ensure_active()?;
                DataScanner::new(table, predicate, self.read_context(), Some(shared), Some(id))
            }
        }
    }

    /// Commit-time re-check of unique indexes against everything committed
    /// since the statements ran.
    fn validate_unique(&self, tx: &Transaction, tables: &HashMap<String, Arc<TableManager>>) -> Result<()> {
        for (name, writes) in tx.writes() {
            let Some(table) = tables.get(name) else {
                continue;
            };
            let has_unique = table.with_indexes(|ix| ix.iter().any(|i| i.is_unique()));
            if !has_unique {
                continue;
            }
            let mut claimed: HashMap<(String, Bytes), &Key> = HashMap::new();
            for (key, write) in writes {
                let PendingWrite::Put(value) = write else {
                    continue;
                };
                let row = table.decode(value)?;
                for (index, tuple) in table.unique_tuples(&row) {
                    let conflict = || {
                        StorageError::Conflict(format!(
                            "unique index {}.{} already holds {}",
                            name,
                            index,
                            display_key(&tuple)
                        ))
                    };
                    if claimed.insert((index.clone(), tuple.clone()), key).is_some() {
                        return Err(conflict());
                    }
                    for owner in table.index_lookup(&index, &tuple) {
                        if owner != *key && !writes.contains_key(&owner) {
                            return Err(conflict());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Logs and applies the write set of `tx`, then releases its locks.
    fn commit_owned(&self, tx: &mut Transaction) -> Result<()> {
        if tx.is_read_only() {
            tx.set_state(TransactionState::Committed);
            self.locks.release_all(tx.id(), tx.take_locks().iter());
            return Ok(());
        }

        let latch = self.checkpoint_latch.read();
        self.ensure_healthy()?;
        let mut tables = HashMap::new();
        for name in tx.tables() {
            let table = self.table(name).map_err(|_| {
                StorageError::Conflict(format!("table {} was dropped before commit", name))
            })?;
            tables.insert(name.to_string(), table);
        }
        self.validate_unique(tx, &tables)?;

        let mutations = tx
            .writes()
            .iter()
            .flat_map(|(table, writes)| {
                writes.iter().map(move |(key, write)| match write {
                    PendingWrite::Put(value) => Mutation::Put {
                        table: table.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    },
                    PendingWrite::Delete => Mutation::Delete {
                        table: table.clone(),
                        key: key.clone(),
                    },
                })
            })
            .collect();
        let lsn = self.log.append(LogEntry::Commit {
            transaction_id: tx.id(),
            mutations,
        })?;

        // The commit is durable from here on; an apply failure leaves memory
        // behind the log until the next restart replays it.
        tx.set_state(TransactionState::Committed);
        let visibility = self.visibility.write();
        let mut applied = Ok(());
        'apply: for (name, writes) in tx.writes() {
            let table = &tables[name];
            for (key, write) in writes {
                let result = match write {
                    PendingWrite::Put(value) => table.apply_put(key.clone(), value.clone(), true),
                    PendingWrite::Delete => table.apply_delete(key, true),
                };
                if let Err(e) = result {
                    self.mark_failed(format!(
                        "applying committed transaction {} (lsn {}) to {} failed: {}",
                        tx.id(),
                        lsn,
                        name,
                        e
                    ));
                    applied = Err(e);
                    break 'apply;
                }
            }
        }
        drop(visibility);
        drop(latch);

        tx.clear_writes();
        self.locks.release_all(tx.id(), tx.take_locks().iter());
        applied
    }

    fn rollback_owned(&self, tx: &mut Transaction) {
        if tx.state() == TransactionState::Active {
            tx.set_state(TransactionState::RolledBack);
        }
        tx.clear_writes();
        self.locks.release_all(tx.id(), tx.take_locks().iter());
    }

    fn snapshot_dir(&self, storage_key: &str) -> PathBuf {
        self.dir.join(SNAPSHOTS_DIR).join(storage_key)
    }

    /// Flushes every table, snapshots the key indexes, records the log
    /// position and drops what the new checkpoint no longer needs.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let _latch = self.checkpoint_latch.write();
        self.ensure_healthy()?;
        let started = Instant::now();
        let lsn = self.log.last_lsn();
        let tables = self.tables_snapshot();

        let mut metadata = CheckpointMetadata {
            lsn,
            next_transaction_id: self.transactions.peek_next_id(),
            tables: Vec::with_capacity(tables.len()),
        };
        let mut compacted = 0;
        for table in &tables {
            let state = table.prepare_checkpoint(self.config.compaction_threshold_percent)?;
            checkpoint::write_key_snapshot(&self.snapshot_dir(table.storage_key()), lsn, &state.keys)?;
            compacted += state.compacted_pages + state.dropped_pages;
            metadata.tables.push(TableCheckpoint {
                schema: table.schema(),
                storage_key: table.storage_key().to_string(),
                next_page_id: state.next_page_id,
                pages: state.pages,
            });
        }

        let segment = self.log.roll()?;
        checkpoint::write_metadata(&self.dir, &metadata)?;

        let mut purged = 0;
        for (table, entry) in tables.iter().zip(&metadata.tables) {
            let pages: Vec<PageId> = entry.pages.iter().map(|p| p.id).collect();
            purged += table.purge_unreferenced_pages(&pages)?;
            checkpoint::purge_snapshots(&self.snapshot_dir(table.storage_key()), lsn)?;
        }
        self.purge_unreferenced_tables(&metadata)?;
        let segments = self.log.drop_segments_before(segment)?;

        info!(
            "Checkpoint of {} at lsn {}: {} tables, {} pages compacted or dropped, {} page files and {} log segments deleted in {:?}",
            self.name,
            lsn,
            tables.len(),
            compacted,
            purged,
            segments,
            started.elapsed()
        );
        Ok(lsn)
    }

    /// Removes storage of dropped tables.
    fn purge_unreferenced_tables(&self, metadata: &CheckpointMetadata) -> Result<()> {
        let referenced: HashSet<&str> = metadata.tables.iter().map(|t| t.storage_key.as_str()).collect();
        for key in self.store.list_tables()? {
            if !referenced.contains(key.as_str()) {
                self.store.drop_table(&key)?;
            }
        }
        let snapshots = self.dir.join(SNAPSHOTS_DIR);
        if snapshots.exists() {
            for entry in fs::read_dir(&snapshots)? {
                let entry = entry?;
                let name = entry.file_name();
                let stale = name.to_str().map_or(false, |n| !referenced.contains(n));
                if stale {
                    if let Err(e) = fs::remove_dir_all(entry.path()) {
                        warn!("Could not remove {}: {}", entry.path().display(), e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops accepting statements; with `checkpoint` also writes a final
    /// checkpoint. Active transactions are discarded.
    pub fn close(&self, checkpoint: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for id in self.transactions.active_ids() {
            if let Ok(shared) = self.transactions.get(id) {
                let mut tx = shared.lock();
                debug!(
                    "{}: rolling back transaction {} open for {:?}",
                    self.name,
                    id,
                    tx.started().elapsed()
                );
                self.rollback_owned(&mut tx);
                drop(tx);
                self.transactions.remove(id);
            }
        }
        if checkpoint {
            match self.failure() {
                Some(reason) => warn!("Skipping final checkpoint of failed table space {}: {}", self.name, reason),
                None => {
                    self.checkpoint()?;
                }
            }
        }
        self.log.sync()?;
        info!("Closed table space {}", self.name);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }
}

fn tuple_of(table: &TableManager, index: &str, row: &Row) -> Option<Bytes> {
    table
        .unique_tuples(row)
        .into_iter()
        .find(|(name, _)| name == index)
        .map(|(_, tuple)| tuple)
}
