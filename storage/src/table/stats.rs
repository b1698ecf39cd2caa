use std::fmt;

/// Point-in-time statistics of one table. Counters are read without
/// blocking writers, so a snapshot taken under load is approximate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Committed records.
    pub table_size: u64,
    /// Superseded record copies still held by flushed pages.
    pub dirty_records: u64,
    /// Cumulative page loads from the page store.
    pub loaded_pages_count: u64,
    /// Cumulative page evictions.
    pub unloaded_pages_count: u64,
    /// Bytes of resident page content.
    pub buffers_used_memory: u64,
    /// Estimated bytes held by the primary-key index.
    pub key_memory: u64,
    pub page_count: u64,
    pub resident_pages: u64,
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} dirty={} loaded={} unloaded={} buffers={}B keys={}B pages={}/{}",
            self.table_size,
            self.dirty_records,
            self.loaded_pages_count,
            self.unloaded_pages_count,
            self.buffers_used_memory,
            self.key_memory,
            self.resident_pages,
            self.page_count
        )
    }
}
