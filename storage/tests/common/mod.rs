#![allow(dead_code)]

use std::path::Path;

use tabledb_core::{ColumnDefinition, DataType, Row, TableSchema, Value};
use tabledb_storage::EngineConfig;

/// Routes `log` output of the engine through a tracing subscriber; honours
/// `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small pages and a small data budget so tests exercise eviction, with
/// background work disabled unless a test turns it on.
pub fn small_config(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir.join("data"), 64 * 1024 * 1024)
        .with_log_dir(dir.join("log"))
        .with_max_logical_page_size(10 * 1024)
        .with_max_data_memory(256 * 1024)
        .with_max_pk_memory(1024 * 1024)
        .with_checkpoint_period_ms(0)
        .with_memory_watcher_period_ms(0)
        .with_sync_on_commit(false)
        .with_lock_timeout_ms(5_000)
}

/// `mytable (id text primary key, n1 bigint, n2 integer)`.
pub fn mytable() -> TableSchema {
    TableSchema::new("mytable")
        .add_column(ColumnDefinition::new("id", DataType::Text).primary_key())
        .add_column(ColumnDefinition::new("n1", DataType::BigInt))
        .add_column(ColumnDefinition::new("n2", DataType::Integer))
}

pub fn row(id: &str, n1: i64) -> Row {
    vec![Value::from(id), Value::BigInt(n1), Value::Integer(2)]
}

pub fn key(id: &str) -> Vec<Value> {
    vec![Value::from(id)]
}
