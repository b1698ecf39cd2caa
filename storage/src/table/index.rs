use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use bytes::Bytes;
use tabledb_core::{encode_key, IndexDefinition, Row, TableSchema, Value};

use crate::page::Key;
use crate::Result;

/// Secondary index: encoded column tuple -> primary keys.
///
/// Entries are ordered by `(tuple, primary key)`, which is also the order an
/// index seek yields rows in.
#[derive(Debug)]
pub struct SecondaryIndex {
    definition: IndexDefinition,
    columns: Vec<usize>,
    entries: BTreeMap<Bytes, BTreeSet<Key>>,
    size: usize,
}

impl SecondaryIndex {
    pub fn new(schema: &TableSchema, definition: IndexDefinition) -> Result<Self> {
        let columns = schema.index_column_indices(&definition)?;
        Ok(Self {
            definition,
            columns,
            entries: BTreeMap::new(),
            size: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn is_unique(&self) -> bool {
        self.definition.unique
    }

    /// Number of (tuple, key) entries.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn values(&self, row: &Row) -> Vec<Value> {
        self.columns
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Encoded tuple of `row`. `None` when a column is NULL: such rows are
    /// indexed but never take part in uniqueness.
    pub fn unique_tuple(&self, row: &Row) -> Option<Bytes> {
        let values = self.values(row);
        if values.iter().any(Value::is_null) {
            return None;
        }
        Some(Bytes::from(encode_key(&values)))
    }

    pub fn tuple(&self, row: &Row) -> Bytes {
        Bytes::from(encode_key(&self.values(row)))
    }

    /// Whether `row`'s leading columns equal `prefix`.
    pub fn matches_prefix(&self, row: &Row, prefix: &[u8]) -> bool {
        self.tuple(row).starts_with(prefix)
    }

    pub fn insert(&mut self, row: &Row, key: Key) {
        let tuple = self.tuple(row);
        if self.entries.entry(tuple).or_default().insert(key) {
            self.size += 1;
        }
    }

    pub fn remove(&mut self, row: &Row, key: &[u8]) {
        let tuple = self.tuple(row);
        if let Some(keys) = self.entries.get_mut(&tuple) {
            if keys.remove(key) {
                self.size -= 1;
            }
            if keys.is_empty() {
                self.entries.remove(&tuple);
            }
        }
    }

    /// Primary keys currently indexed under exactly `tuple`.
    pub fn lookup(&self, tuple: &[u8]) -> Vec<Key> {
        self.entries
            .get(tuple)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// First entry whose tuple starts with `prefix` and that sorts strictly
    /// after `after`.
    pub fn seek_after(&self, prefix: &[u8], after: Option<&(Bytes, Key)>) -> Option<(Bytes, Key)> {
        let start: Bound<&[u8]> = match after {
            Some((tuple, _)) => Bound::Included(tuple.as_ref()),
            None => Bound::Included(prefix),
        };
        for (tuple, keys) in self.entries.range::<[u8], _>((start, Bound::Unbounded)) {
            if !tuple.starts_with(prefix) {
                return None;
            }
            let next = match after {
                Some((last_tuple, last_key)) if last_tuple == tuple => keys
                    .range::<[u8], _>((Bound::Excluded(last_key.as_ref()), Bound::Unbounded))
                    .next(),
                _ => keys.iter().next(),
            };
            if let Some(key) = next {
                return Some((tuple.clone(), key.clone()));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}
