//! Storage engine for tabledb
//!
//! This crate provides the transactional table store: logical record pages
//! and their page store, per-table managers with primary-key and secondary
//! indexes, per-key locking, transactions, the commit log, checkpoint and
//! recovery, and the memory watcher that keeps resident pages bounded.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod file;
pub mod lock;
pub mod memory;
pub mod page;
pub mod table;
pub mod tablespace;
pub mod transaction;
pub mod wal;

pub use config::EngineConfig;
pub use engine::Engine;
pub use file::{FilePageStore, MemoryPageStore, PageStore};
pub use memory::{MemoryReclaimer, MemoryUsageProvider, MemoryWatcher, ReclaimOutcome, ReclaimStep};
pub use page::{PageId, RecordPage};
pub use table::{DataScanner, ScanPredicate, ScanSource, TableManager, TableStats};
pub use tablespace::{DmlResult, GetResult, TableSpaceManager, DEFAULT_TABLE_SPACE};
pub use transaction::{TransactionContext, TransactionId, TransactionState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Duplicate key in {table}: {key}")]
    DuplicateKey { table: String, key: String },

    #[error("Key not found in {table}: {key}")]
    NotFound { table: String, key: String },

    #[error("Timed out waiting for lock on {table} key {key}")]
    LockTimeout { table: String, key: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("Transaction {id} is already {state:?}")]
    TransactionAlreadyTerminal {
        id: TransactionId,
        state: TransactionState,
    },

    #[error("Memory pressure unrelievable: {used} bytes used, limit {limit}")]
    MemoryPressureUnrelievable { used: u64, limit: u64 },

    #[error("Corrupt page {page_id} of table {table}: {reason}")]
    CorruptPage {
        table: String,
        page_id: PageId,
        reason: String,
    },

    #[error("Checksum mismatch for page {0}")]
    ChecksumMismatch(PageId),

    #[error("Recovery failed: {0}")]
    RecoveryFailure(String),

    #[error("Table {0} not found")]
    TableNotFound(String),

    #[error("Table {0} already exists")]
    TableAlreadyExists(String),

    #[error("Table space {0} not found")]
    TableSpaceNotFound(String),

    #[error("Table space {0} already exists")]
    TableSpaceAlreadyExists(String),

    #[error("Index {0} already exists")]
    IndexAlreadyExists(String),

    #[error("Index {0} not found")]
    IndexNotFound(String),

    #[error("Invalid name {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidName(String),

    #[error("Record of {size} bytes does not fit a page of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Primary key memory exhausted for {table}: {used} of {limit} bytes")]
    IndexMemoryExhausted { table: String, used: u64, limit: u64 },

    #[error("Invalid row: {0}")]
    InvalidRow(#[from] tabledb_core::CoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Commit log unusable after a failed append: {0}")]
    CommitLogPoisoned(String),

    #[error("Table space {name} failed and needs a restart: {reason}")]
    TableSpaceFailed { name: String, reason: String },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Renders an encoded key or index tuple for error messages as its column
/// values, falling back to hex for bytes that do not decode.
pub(crate) fn display_key(key: &[u8]) -> String {
    match tabledb_core::decode_key(key) {
        Ok(values) if !values.is_empty() => values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        _ => key.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}
