use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tabledb_core::{encode_key, Row, Value};

use super::TableManager;
use crate::page::Key;
use crate::transaction::{PendingWrite, SharedTransaction, TransactionId};
use crate::{Result, StorageError};

pub type RowFilter = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanSource {
    FullScan,
    /// Bounds are full primary keys, given as column values.
    PrimaryKeyRange {
        from: Bound<Vec<Value>>,
        to: Bound<Vec<Value>>,
    },
    /// Equality on the leading columns of a secondary index.
    IndexSeek { index: String, values: Vec<Value> },
}

#[derive(Clone)]
pub struct ScanPredicate {
    pub source: ScanSource,
    pub filter: Option<RowFilter>,
}

impl ScanPredicate {
    pub fn full_scan() -> Self {
        Self {
            source: ScanSource::FullScan,
            filter: None,
        }
    }

    pub fn primary_key_range(from: Bound<Vec<Value>>, to: Bound<Vec<Value>>) -> Self {
        Self {
            source: ScanSource::PrimaryKeyRange { from, to },
            filter: None,
        }
    }

    pub fn primary_key(values: Vec<Value>) -> Self {
        Self::primary_key_range(Bound::Included(values.clone()), Bound::Included(values))
    }

    pub fn index_seek(index: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            source: ScanSource::IndexSeek {
                index: index.into(),
                values,
            },
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&Row) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn accepts(&self, row: &Row) -> bool {
        self.filter.as_ref().map_or(true, |f| f(row))
    }
}

impl std::fmt::Debug for ScanPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanPredicate")
            .field("source", &self.source)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// How a statement reads committed records. Reads never wait on key locks;
/// they hold off checkpoints and the apply phase of commits for the duration
/// of one record read, so a record is seen either before or after a whole
/// commit.
#[derive(Clone)]
pub(crate) struct ReadContext {
    pub checkpoint: Arc<RwLock<()>>,
    pub visibility: Arc<RwLock<()>>,
}

impl ReadContext {
    pub fn read_committed(&self, table: &TableManager, key: &Key) -> Result<Option<Row>> {
        let _checkpoint = self.checkpoint.read();
        let _visibility = self.visibility.read();
        table.read_row(key)
    }
}

fn encode_bound(bound: &Bound<Vec<Value>>) -> Bound<Key> {
    match bound {
        Bound::Included(v) => Bound::Included(Bytes::from(encode_key(v))),
        Bound::Excluded(v) => Bound::Excluded(Bytes::from(encode_key(v))),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn as_slice(bound: &Bound<Key>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_ref()),
        Bound::Excluded(k) => Bound::Excluded(k.as_ref()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

enum Cursor {
    Keys {
        lower: Bound<Key>,
        upper: Bound<Key>,
        last: Option<Key>,
    },
    Index {
        index: String,
        prefix: Bytes,
        position: Option<(Bytes, Key)>,
        /// Committed entries exhausted; now yielding the transaction's own
        /// new rows.
        pending_phase: bool,
        last_pending: Option<Key>,
    },
}

/// Lazy cursor over a table.
///
/// Every call to `next` re-seeks strictly after the last key it returned,
/// so nothing stays pinned between records and concurrent writers are never
/// blocked by an idle scanner.
pub struct DataScanner {
    table: Arc<TableManager>,
    reads: ReadContext,
    tx: Option<SharedTransaction>,
    predicate: ScanPredicate,
    cursor: Cursor,
    transaction_id: Option<TransactionId>,
    done: bool,
}

impl DataScanner {
    pub(crate) fn new(
        table: Arc<TableManager>,
        predicate: ScanPredicate,
        reads: ReadContext,
        tx: Option<SharedTransaction>,
        transaction_id: Option<TransactionId>,
    ) -> Result<Self> {
        let cursor = match &predicate.source {
            ScanSource::FullScan => Cursor::Keys {
                lower: Bound::Unbounded,
                upper: Bound::Unbounded,
                last: None,
            },
            ScanSource::PrimaryKeyRange { from, to } => Cursor::Keys {
                lower: encode_bound(from),
                upper: encode_bound(to),
                last: None,
            },
            ScanSource::IndexSeek { index, values } => {
                let known = table.with_indexes(|ix| ix.iter().any(|i| i.name() == index));
                if !known {
                    return Err(StorageError::IndexNotFound(format!(
                        "{}.{}",
                        table.name(),
                        index
                    )));
                }
                Cursor::Index {
                    index: index.clone(),
                    prefix: Bytes::from(encode_key(values)),
                    position: None,
                    pending_phase: false,
                    last_pending: None,
                }
            }
        };
        Ok(Self {
            table,
            reads,
            tx,
            predicate,
            cursor,
            transaction_id,
            done: false,
        })
    }

    /// Transaction the scan ran under, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    /// Drains the scanner.
    pub fn consume(self) -> Result<Vec<Row>> {
        self.collect()
    }

    fn pending(&self, key: &[u8]) -> Option<PendingWrite> {
        let tx = self.tx.as_ref()?;
        let tx = tx.lock();
        tx.pending(self.table.name(), key).cloned()
    }

    /// The row this scan sees for `key`: the transaction's own pending write
    /// if any, the committed row otherwise.
    fn visible(&self, key: &Key) -> Result<Option<Row>> {
        match self.pending(key) {
            Some(PendingWrite::Put(value)) => Ok(Some(self.table.decode(&value)?)),
            Some(PendingWrite::Delete) => Ok(None),
            None => self.reads.read_committed(&self.table, key),
        }
    }

    fn next_pending_key(&self, after: Bound<&[u8]>, upper: Bound<&[u8]>) -> Option<Key> {
        let tx = self.tx.as_ref()?;
        let tx = tx.lock();
        tx.next_pending(self.table.name(), after, upper)
            .map(|(key, _)| key.clone())
    }

    fn advance_keys(&mut self) -> Result<Option<Row>> {
        loop {
            let Cursor::Keys { lower, upper, last } = &self.cursor else {
                return Ok(None);
            };
            let after = match last {
                Some(key) => Bound::Excluded(key.as_ref()),
                None => as_slice(lower),
            };
            let upper_slice = as_slice(upper);
            let committed = self.table.next_key(after, upper_slice);
            let pending = self.next_pending_key(after, upper_slice);
            let key = match (committed, pending) {
                (Some(c), Some(p)) => c.min(p),
                (Some(k), None) | (None, Some(k)) => k,
                (None, None) => return Ok(None),
            };
            if let Cursor::Keys { last, .. } = &mut self.cursor {
                *last = Some(key.clone());
            }
            if let Some(row) = self.visible(&key)? {
                if self.predicate.accepts(&row) {
                    return Ok(Some(row));
                }
            }
        }
    }

    fn advance_index(&mut self) -> Result<Option<Row>> {
        loop {
            let Cursor::Index {
                index,
                prefix,
                position,
                pending_phase,
                last_pending,
            } = &self.cursor
            else {
                return Ok(None);
            };
            let index = index.clone();
            let prefix = prefix.clone();

            if !*pending_phase {
                let entry = self.table.with_indexes(|ix| {
                    ix.iter()
                        .find(|i| i.name() == index)
                        .and_then(|i| i.seek_after(&prefix, position.as_ref()))
                });
                let Some(entry) = entry else {
                    if let Cursor::Index { pending_phase, .. } = &mut self.cursor {
                        *pending_phase = true;
                    }
                    continue;
                };
                let key = entry.1.clone();
                if let Cursor::Index { position, .. } = &mut self.cursor {
                    *position = Some(entry);
                }
                // The index may be stale for this reader: re-check the row.
                if let Some(row) = self.visible(&key)? {
                    if self.matches_index(&index, &row, &prefix) && self.predicate.accepts(&row) {
                        return Ok(Some(row));
                    }
                }
                continue;
            }

            // Rows this transaction wrote that the committed index does not
            // list under the prefix.
            let after = match last_pending {
                Some(key) => Bound::Excluded(key.as_ref()),
                None => Bound::Unbounded,
            };
            let next = match self.tx.as_ref() {
                Some(tx) => {
                    let tx = tx.lock();
                    tx.next_pending(self.table.name(), after, Bound::Unbounded)
                        .map(|(k, w)| (k.clone(), w.clone()))
                }
                None => None,
            };
            let Some((key, write)) = next else {
                return Ok(None);
            };
            if let Cursor::Index { last_pending, .. } = &mut self.cursor {
                *last_pending = Some(key.clone());
            }
            let PendingWrite::Put(value) = write else {
                continue;
            };
            let row = self.table.decode(&value)?;
            if !self.matches_index(&index, &row, &prefix) || !self.predicate.accepts(&row) {
                continue;
            }
            let committed = self.reads.read_committed(&self.table, &key)?;
            let already_seen = committed
                .map(|c| self.matches_index(&index, &c, &prefix))
                .unwrap_or(false);
            if !already_seen {
                return Ok(Some(row));
            }
        }
    }

    fn matches_index(&self, index: &str, row: &Row, prefix: &[u8]) -> bool {
        self.table.with_indexes(|ix| {
            ix.iter()
                .find(|i| i.name() == index)
                .map_or(false, |i| i.matches_prefix(row, prefix))
        })
    }
}

impl Iterator for DataScanner {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.cursor {
            Cursor::Keys { .. } => self.advance_keys(),
            Cursor::Index { .. } => self.advance_index(),
        };
        match result {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
