//! Concurrent updates against one table, then restart.
//!
//! 2000 rows start with `n1 = 1`. A pool of 100 workers runs 4000 random
//! operations, half updates to a random value and half point reads. An
//! oracle map serializes work per key: a worker claims a key by removing it
//! from the map and puts the expected value back when done. At the end, and
//! again after a restart, every stored `n1` must equal the oracle.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Result};
use parking_lot::Mutex;
use rand::Rng;
use tabledb_core::{IndexDefinition, Value};
use tabledb_storage::{
    Engine, EngineConfig, ScanPredicate, TableSpaceManager, TransactionContext, DEFAULT_TABLE_SPACE,
};

use common::{init_tracing, key, mytable, row, small_config};

const TABLE_SIZE: usize = 2000;
const MULTIPLIER: usize = 2;
const WORKERS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    /// Statements commit by themselves.
    NoTransactions,
    /// Each statement opens a transaction the worker then commits.
    Transactions,
    /// Each statement runs in an auto-committed transaction.
    AutoTransactions,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Indexes {
    None,
    NonUnique,
    Unique,
}

fn context(mode: Mode) -> TransactionContext {
    match mode {
        Mode::NoTransactions => TransactionContext::None,
        Mode::Transactions => TransactionContext::Begin,
        Mode::AutoTransactions => TransactionContext::Auto,
    }
}

fn read_n1(table_space: &TableSpaceManager, id: &str) -> Result<Option<i64>> {
    let rows = table_space
        .scan("mytable", ScanPredicate::primary_key(key(id)), TransactionContext::None)?
        .consume()?;
    ensure!(rows.len() <= 1, "{} rows for key {}", rows.len(), id);
    Ok(rows.first().and_then(|r| r[1].as_i64()))
}

fn verify(table_space: &TableSpaceManager, expected: &HashMap<String, i64>) -> Result<()> {
    let mut errored = Vec::new();
    for (id, value) in expected {
        let actual = read_n1(table_space, id)?.ok_or_else(|| anyhow!("key {} missing", id))?;
        if actual != *value {
            errored.push(format!("{}: expected {}, got {}", id, value, actual));
        }
    }
    ensure!(errored.is_empty(), "wrong values: {:?}", errored);
    Ok(())
}

fn worker_step(
    table_space: &TableSpaceManager,
    oracle: &Mutex<HashMap<String, i64>>,
    mode: Mode,
    updates: &AtomicU64,
    gets: &AtomicU64,
    skipped: &AtomicU64,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    let update = rng.gen_bool(0.5);
    let k = rng.gen_range(0..TABLE_SIZE);
    let mut value = rng.gen_range(0..TABLE_SIZE as i64);
    let id = format!("test_{}", k);

    let Some(actual) = oracle.lock().remove(&id) else {
        // another worker owns this key
        skipped.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    };

    let transaction_id = if update {
        updates.fetch_add(1, Ordering::Relaxed);
        let result = table_space.update("mytable", row(&id, value), context(mode))?;
        ensure!(result.update_count == 1, "{} not updated", id);
        result.transaction_id
    } else {
        gets.fetch_add(1, Ordering::Relaxed);
        let mut scanner =
            table_space.scan("mytable", ScanPredicate::primary_key(key(&id)), context(mode))?;
        ensure!(scanner.next().transpose()?.is_some(), "{} not found", id);
        value = actual;
        scanner.transaction_id()
    };

    match mode {
        Mode::Transactions => {
            let id = transaction_id.ok_or_else(|| anyhow!("no transaction"))?;
            table_space.commit_transaction(id)?;
        }
        Mode::AutoTransactions => {
            ensure!(transaction_id.is_some(), "no transaction id reported");
        }
        Mode::NoTransactions => {
            ensure!(transaction_id.is_none(), "unexpected transaction id");
        }
    }
    oracle.lock().insert(id, value);
    Ok(())
}

fn perform_test(mode: Mode, checkpoint_period_ms: u64, indexes: Indexes) -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config: EngineConfig = small_config(dir.path()).with_checkpoint_period_ms(checkpoint_period_ms);

    let oracle: Mutex<HashMap<String, i64>> = Mutex::new(HashMap::new());
    let engine = Engine::start(config.clone())?;
    {
        let table_space = engine.wait_for_table_space_boot(DEFAULT_TABLE_SPACE, Duration::from_secs(30))?;
        table_space.create_table(mytable())?;
        match indexes {
            Indexes::None => {}
            // n1 + id keeps tuples distinct, so workers never collide on them
            Indexes::Unique => table_space.create_index(
                "mytable",
                IndexDefinition::new("theindex", &["n1", "id"]).unique(),
            )?,
            Indexes::NonUnique => {
                table_space.create_index("mytable", IndexDefinition::new("theindex", &["n1"]))?
            }
        }

        let tx = table_space.begin_transaction()?;
        for i in 0..TABLE_SIZE {
            let id = format!("test_{}", i);
            table_space.insert("mytable", row(&id, 1), TransactionContext::Id(tx))?;
            oracle.lock().insert(id, 1);
        }
        table_space.commit_transaction(tx)?;

        let updates = AtomicU64::new(0);
        let gets = AtomicU64::new(0);
        let skipped = AtomicU64::new(0);
        let remaining = AtomicUsize::new(TABLE_SIZE * MULTIPLIER);
        let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..WORKERS {
                scope.spawn(|| {
                    while remaining
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        if let Err(e) =
                            worker_step(&table_space, &oracle, mode, &updates, &gets, &skipped)
                        {
                            failures.lock().push(e.to_string());
                        }
                    }
                });
            }
        });

        let failures = failures.into_inner();
        if !failures.is_empty() {
            bail!("{} operations failed, first: {}", failures.len(), failures[0]);
        }
        tracing::info!(
            "updates: {}, gets: {}, skipped: {}",
            updates.load(Ordering::Relaxed),
            gets.load(Ordering::Relaxed),
            skipped.load(Ordering::Relaxed)
        );
        assert!(updates.load(Ordering::Relaxed) > 0);
        assert!(gets.load(Ordering::Relaxed) > 0);

        let expected = oracle.lock().clone();
        assert_eq!(expected.len(), TABLE_SIZE);
        verify(&table_space, &expected)?;

        let stats = table_space.table_stats("mytable")?;
        tracing::info!("{}", stats);
        assert_eq!(stats.table_size, TABLE_SIZE as u64);
        assert!(table_space.active_transactions().is_empty());

        if indexes != Indexes::None {
            let ones = table_space
                .scan(
                    "mytable",
                    ScanPredicate::index_seek("theindex", vec![Value::BigInt(1)]),
                    TransactionContext::None,
                )?
                .consume()?;
            let expected_ones = expected.values().filter(|v| **v == 1).count();
            assert_eq!(ones.len(), expected_ones);
        }
    }
    engine.shutdown()?;

    // restart and recovery
    let engine = Engine::start(config)?;
    let table_space = engine.wait_for_table_space_boot(DEFAULT_TABLE_SPACE, Duration::from_secs(300))?;
    let expected = oracle.into_inner();
    verify(&table_space, &expected)?;
    assert_eq!(table_space.table_stats("mytable")?.table_size, TABLE_SIZE as u64);
    engine.shutdown()?;
    Ok(())
}

#[test]
fn test_concurrent_updates_no_transactions() -> Result<()> {
    perform_test(Mode::NoTransactions, 0, Indexes::None)
}

#[test]
fn test_concurrent_updates_transactions() -> Result<()> {
    perform_test(Mode::Transactions, 0, Indexes::None)
}

#[test]
fn test_concurrent_updates_auto_transactions() -> Result<()> {
    perform_test(Mode::AutoTransactions, 0, Indexes::None)
}

#[test]
fn test_concurrent_updates_with_checkpoints() -> Result<()> {
    perform_test(Mode::NoTransactions, 10, Indexes::None)
}

#[test]
fn test_concurrent_updates_transactions_with_checkpoints() -> Result<()> {
    perform_test(Mode::Transactions, 10, Indexes::None)
}

#[test]
fn test_concurrent_updates_non_unique_index() -> Result<()> {
    perform_test(Mode::NoTransactions, 0, Indexes::NonUnique)
}

#[test]
fn test_concurrent_updates_transactions_unique_index() -> Result<()> {
    perform_test(Mode::Transactions, 0, Indexes::Unique)
}

#[test]
fn test_concurrent_updates_transactions_index_with_checkpoints() -> Result<()> {
    perform_test(Mode::Transactions, 10, Indexes::NonUnique)
}
