use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::PageStore;
use crate::page::PageId;
use crate::{Result, StorageError};

/// Volatile page store for tests and scratch table-spaces.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<BTreeMap<(String, PageId), Vec<u8>>>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl PageStore for MemoryPageStore {
    fn write_page(&self, table: &str, page_id: PageId, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.pages
            .lock()
            .insert((table.to_string(), page_id), data.to_vec());
        Ok(())
    }

    fn read_page(&self, table: &str, page_id: PageId) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.pages
            .lock()
            .get(&(table.to_string(), page_id))
            .cloned()
            .ok_or_else(|| {
                StorageError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("page {} of {} not stored", page_id, table),
                ))
            })
    }

    fn delete_page(&self, table: &str, page_id: PageId) -> Result<()> {
        self.pages.lock().remove(&(table.to_string(), page_id));
        Ok(())
    }

    fn list_pages(&self, table: &str) -> Result<Vec<PageId>> {
        Ok(self
            .pages
            .lock()
            .keys()
            .filter(|(t, _)| t == table)
            .map(|(_, id)| *id)
            .collect())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.pages.lock().retain(|(t, _), _| t != table);
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut tables: Vec<String> = self.pages.lock().keys().map(|(t, _)| t.clone()).collect();
        tables.dedup();
        Ok(tables)
    }
}
