//! Transactions: ids, contexts, pending write sets and the registry of
//! active transactions.
//!
//! Writes are buffered per transaction and never touch pages until commit;
//! the table-space applies the whole write set in one step.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::lock::LockKey;
use crate::page::Key;
use crate::{Result, StorageError};

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// How a statement relates to transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionContext {
    /// The statement commits by itself; no id is reported.
    None,
    /// A transaction is opened and committed around the statement; its
    /// (closed) id is reported.
    Auto,
    /// A transaction is opened for the statement and left active; the caller
    /// commits or rolls back the reported id.
    Begin,
    /// The statement joins an explicit, active transaction.
    Id(TransactionId),
}

impl TransactionContext {
    /// Maps the raw wire convention: `0` is no transaction, negative values
    /// are auto-transactions, positive values are explicit ids.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => TransactionContext::None,
            r if r < 0 => TransactionContext::Auto,
            r => TransactionContext::Id(r as TransactionId),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Put(Bytes),
    Delete,
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    started: Instant,
    state: TransactionState,
    writes: BTreeMap<String, BTreeMap<Key, PendingWrite>>,
    locks: Vec<LockKey>,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            started: Instant::now(),
            state: TransactionState::Active,
            writes: BTreeMap::new(),
            locks: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(StorageError::TransactionAlreadyTerminal { id: self.id, state }),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.values().all(|w| w.is_empty())
    }

    pub fn record_write(&mut self, table: &str, key: Key, write: PendingWrite) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key, write);
    }

    pub fn pending(&self, table: &str, key: &[u8]) -> Option<&PendingWrite> {
        self.writes.get(table)?.get(key)
    }

    /// First pending write of `table` strictly after `after` and within
    /// `upper`.
    pub fn next_pending(
        &self,
        table: &str,
        after: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(&Key, &PendingWrite)> {
        let writes = self.writes.get(table)?;
        let (key, write) = writes
            .range::<[u8], _>((after, Bound::Unbounded))
            .next()?;
        let in_range = match upper {
            Bound::Unbounded => true,
            Bound::Included(end) => key.as_ref() <= end,
            Bound::Excluded(end) => key.as_ref() < end,
        };
        in_range.then_some((key, write))
    }

    pub fn pending_puts<'a>(&'a self, table: &str) -> impl Iterator<Item = (&'a Key, &'a Bytes)> + 'a {
        self.writes
            .get(table)
            .into_iter()
            .flat_map(|w| w.iter())
            .filter_map(|(k, w)| match w {
                PendingWrite::Put(v) => Some((k, v)),
                PendingWrite::Delete => None,
            })
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.writes.keys().map(|t| t.as_str())
    }

    pub fn writes(&self) -> &BTreeMap<String, BTreeMap<Key, PendingWrite>> {
        &self.writes
    }

    pub fn write_count(&self) -> usize {
        self.writes.values().map(|w| w.len()).sum()
    }

    /// Remembers an exclusive lock to be released at commit or rollback.
    pub fn hold_lock(&mut self, key: LockKey) {
        self.locks.push(key);
    }

    pub fn take_locks(&mut self) -> Vec<LockKey> {
        std::mem::take(&mut self.locks)
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }
}

pub type SharedTransaction = Arc<Mutex<Transaction>>;

/// Registry of active transactions of one table-space.
pub struct TransactionManager {
    next_id: AtomicU64,
    active: Mutex<HashMap<TransactionId, SharedTransaction>>,
}

impl TransactionManager {
    pub fn new(first_id: TransactionId) -> Self {
        Self {
            next_id: AtomicU64::new(first_id.max(1)),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> TransactionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next transaction will get; persisted at checkpoints.
    pub fn peek_next_id(&self) -> TransactionId {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Makes sure future ids are greater than `id`.
    pub fn advance_past(&self, id: TransactionId) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Opens and registers a transaction.
    pub fn begin(&self) -> (TransactionId, SharedTransaction) {
        let id = self.next_id();
        let tx = Arc::new(Mutex::new(Transaction::new(id)));
        self.active.lock().insert(id, Arc::clone(&tx));
        (id, tx)
    }

    /// A transaction that lives only for one statement and is never
    /// registered.
    pub fn ephemeral(&self) -> Transaction {
        Transaction::new(self.next_id())
    }

    pub fn get(&self, id: TransactionId) -> Result<SharedTransaction> {
        self.active
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StorageError::TransactionNotFound(id))
    }

    pub fn remove(&self, id: TransactionId) {
        self.active.lock().remove(&id);
    }

    pub fn active_ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
