//! Transaction semantics: key ownership, read-committed visibility, unique
//! indexes and terminal states.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use pretty_assertions::assert_eq;
use tabledb_core::{IndexDefinition, TableSchema, Value};
use tabledb_storage::{
    Engine, ScanPredicate, StorageError, TableSpaceManager, TransactionContext, TransactionState,
};

use common::{init_tracing, key, mytable, row, small_config};

fn setup() -> Result<(tempfile::TempDir, Engine, Arc<TableSpaceManager>)> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let engine = Engine::start(small_config(dir.path()).with_lock_timeout_ms(200))?;
    let ts = engine.default_table_space()?;
    ts.create_table(mytable())?;
    for id in ["a", "b", "c"] {
        ts.insert("mytable", row(id, 1), TransactionContext::None)?;
    }
    Ok((dir, engine, ts))
}

fn n1(ts: &TableSpaceManager, id: &str, ctx: TransactionContext) -> Result<Option<i64>> {
    n1_in(ts, "mytable", id, ctx)
}

fn n1_in(ts: &TableSpaceManager, table: &str, id: &str, ctx: TransactionContext) -> Result<Option<i64>> {
    let got = ts.get(table, &key(id), ctx)?;
    Ok(got.record.and_then(|r| r[1].as_i64()))
}

/// Same columns as `mytable`, under another name.
fn other_table() -> TableSchema {
    let mut schema = mytable();
    schema.name = "other".to_string();
    schema
}

#[test]
fn test_writer_blocks_writer_until_timeout() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    let first = ts.begin_transaction()?;
    let second = ts.begin_transaction()?;
    ts.update("mytable", row("b", 20), TransactionContext::Id(second))?;
    ts.update("mytable", row("a", 10), TransactionContext::Id(first))?;

    let started = Instant::now();
    let blocked = ts.update("mytable", row("a", 99), TransactionContext::Id(second));
    assert!(matches!(blocked, Err(StorageError::LockTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(200));

    // the failed statement keeps the earlier writes of the transaction
    ts.commit_transaction(second)?;
    ts.commit_transaction(first)?;
    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(10));
    assert_eq!(n1(&ts, "b", TransactionContext::None)?, Some(20));
    Ok(())
}

#[test]
fn test_waiting_writer_proceeds_after_commit() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    let holder = ts.begin_transaction()?;
    ts.update("mytable", row("a", 10), TransactionContext::Id(holder))?;

    let waiter = {
        let ts = Arc::clone(&ts);
        thread::spawn(move || ts.update("mytable", row("a", 11), TransactionContext::None))
    };
    thread::sleep(Duration::from_millis(20));
    ts.commit_transaction(holder)?;
    let result = waiter.join().expect("waiter panicked")?;
    assert_eq!(result.update_count, 1);
    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(11));
    Ok(())
}

#[test]
fn test_rollback_discards_and_releases() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    let tx = ts.begin_transaction()?;
    ts.update("mytable", row("a", 10), TransactionContext::Id(tx))?;
    ts.delete("mytable", &key("b"), TransactionContext::Id(tx))?;
    ts.insert("mytable", row("d", 4), TransactionContext::Id(tx))?;
    assert_eq!(n1(&ts, "a", TransactionContext::Id(tx))?, Some(10));
    assert_eq!(n1(&ts, "b", TransactionContext::Id(tx))?, None);
    ts.rollback_transaction(tx)?;

    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(1));
    assert_eq!(n1(&ts, "b", TransactionContext::None)?, Some(1));
    assert_eq!(n1(&ts, "d", TransactionContext::None)?, None);
    // locks are gone
    ts.update("mytable", row("a", 2), TransactionContext::None)?;
    Ok(())
}

#[test]
fn test_pending_writes_are_invisible_to_others() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    let tx = ts.begin_transaction()?;
    ts.insert("mytable", row("z", 26), TransactionContext::Id(tx))?;

    let others = ts
        .scan("mytable", ScanPredicate::full_scan(), TransactionContext::None)?
        .consume()?;
    assert_eq!(others.len(), 3);
    let own = ts
        .scan("mytable", ScanPredicate::full_scan(), TransactionContext::Id(tx))?
        .consume()?;
    assert_eq!(own.len(), 4);

    // readers of keys owned by a writer do not wait and see the committed state
    ts.update("mytable", row("a", 10), TransactionContext::Id(tx))?;
    let started = Instant::now();
    assert_eq!(n1(&ts, "z", TransactionContext::None)?, None);
    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(1));
    let reader = ts.begin_transaction()?;
    assert_eq!(n1(&ts, "a", TransactionContext::Id(reader))?, Some(1));
    assert!(started.elapsed() < Duration::from_millis(200));

    ts.commit_transaction(tx)?;
    assert_eq!(n1(&ts, "z", TransactionContext::None)?, Some(26));
    // read committed: the open reader now sees the new value
    assert_eq!(n1(&ts, "a", TransactionContext::Id(reader))?, Some(10));
    ts.commit_transaction(reader)?;
    Ok(())
}

#[test]
fn test_transaction_spanning_two_tables() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    ts.create_table(other_table())?;
    ts.insert("other", row("a", 1), TransactionContext::None)?;

    let tx = ts.begin_transaction()?;
    ts.update("mytable", row("a", 2), TransactionContext::Id(tx))?;
    ts.update("other", row("a", 2), TransactionContext::Id(tx))?;
    ts.insert("other", row("b", 2), TransactionContext::Id(tx))?;
    ts.rollback_transaction(tx)?;
    assert_eq!(n1_in(&ts, "mytable", "a", TransactionContext::None)?, Some(1));
    assert_eq!(n1_in(&ts, "other", "a", TransactionContext::None)?, Some(1));
    assert_eq!(n1_in(&ts, "other", "b", TransactionContext::None)?, None);

    let tx = ts.begin_transaction()?;
    ts.update("mytable", row("a", 3), TransactionContext::Id(tx))?;
    ts.update("other", row("a", 3), TransactionContext::Id(tx))?;
    ts.delete("mytable", &key("b"), TransactionContext::Id(tx))?;
    ts.insert("other", row("b", 3), TransactionContext::Id(tx))?;
    ts.commit_transaction(tx)?;
    assert_eq!(n1_in(&ts, "mytable", "a", TransactionContext::None)?, Some(3));
    assert_eq!(n1_in(&ts, "other", "a", TransactionContext::None)?, Some(3));
    assert_eq!(n1_in(&ts, "mytable", "b", TransactionContext::None)?, None);
    assert_eq!(n1_in(&ts, "other", "b", TransactionContext::None)?, Some(3));
    assert_eq!(ts.table_stats("mytable")?.table_size, 2);
    assert_eq!(ts.table_stats("other")?.table_size, 2);
    Ok(())
}

#[test]
fn test_readers_never_see_half_a_commit() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    ts.create_table(other_table())?;
    ts.insert("other", row("a", 1), TransactionContext::None)?;

    let writer = {
        let ts = Arc::clone(&ts);
        thread::spawn(move || -> Result<()> {
            for i in 2..=300 {
                let tx = ts.begin_transaction()?;
                ts.update("mytable", row("a", i), TransactionContext::Id(tx))?;
                ts.update("other", row("a", i), TransactionContext::Id(tx))?;
                ts.commit_transaction(tx)?;
            }
            Ok(())
        })
    };

    // mytable is applied first: a reader that saw its new value must find
    // the same commit in other.
    let mut checks = 0;
    while !writer.is_finished() || checks == 0 {
        let first = n1_in(&ts, "mytable", "a", TransactionContext::None)?.unwrap_or_default();
        let second = n1_in(&ts, "other", "a", TransactionContext::None)?.unwrap_or_default();
        assert!(second >= first, "saw mytable at {} but other at {}", first, second);
        checks += 1;
    }
    writer.join().expect("writer panicked")?;
    assert_eq!(n1_in(&ts, "mytable", "a", TransactionContext::None)?, Some(300));
    assert_eq!(n1_in(&ts, "other", "a", TransactionContext::None)?, Some(300));
    Ok(())
}

#[test]
fn test_delete_then_insert_in_one_transaction() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    let tx = ts.begin_transaction()?;
    assert_eq!(
        ts.delete("mytable", &key("a"), TransactionContext::Id(tx))?.update_count,
        1
    );
    assert_eq!(
        ts.update("mytable", row("a", 5), TransactionContext::Id(tx))?.update_count,
        0
    );
    ts.insert("mytable", row("a", 7), TransactionContext::Id(tx))?;
    assert!(matches!(
        ts.insert("mytable", row("a", 8), TransactionContext::Id(tx)),
        Err(StorageError::DuplicateKey { .. })
    ));
    ts.commit_transaction(tx)?;
    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(7));
    assert_eq!(ts.table_stats("mytable")?.table_size, 3);
    Ok(())
}

#[test]
fn test_unique_index_claims() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    ts.update("mytable", row("b", 2), TransactionContext::None)?;
    ts.update("mytable", row("c", 3), TransactionContext::None)?;
    ts.create_index("mytable", IndexDefinition::new("u_n1", &["n1"]).unique())?;

    assert!(matches!(
        ts.insert("mytable", row("d", 1), TransactionContext::None),
        Err(StorageError::DuplicateKey { .. })
    ));

    // a pending claim blocks other writers of the same tuple
    let tx = ts.begin_transaction()?;
    ts.insert("mytable", row("d", 4), TransactionContext::Id(tx))?;
    assert!(matches!(
        ts.insert("mytable", row("e", 4), TransactionContext::None),
        Err(StorageError::LockTimeout { .. })
    ));
    // and the transaction cannot claim it twice
    assert!(matches!(
        ts.insert("mytable", row("e", 4), TransactionContext::Id(tx)),
        Err(StorageError::DuplicateKey { .. })
    ));
    // moving a row off a tuple frees it within the transaction
    ts.update("mytable", row("a", 10), TransactionContext::Id(tx))?;
    ts.insert("mytable", row("e", 1), TransactionContext::Id(tx))?;
    ts.commit_transaction(tx)?;

    let ones = ts
        .scan(
            "mytable",
            ScanPredicate::index_seek("u_n1", vec![Value::BigInt(1)]),
            TransactionContext::None,
        )?
        .consume()?;
    assert_eq!(ones, vec![row("e", 1)]);
    assert_eq!(ts.table_stats("mytable")?.table_size, 5);
    Ok(())
}

#[test]
fn test_index_seek_sees_own_pending_rows() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    ts.create_index("mytable", IndexDefinition::new("by_n1", &["n1"]))?;
    let tx = ts.begin_transaction()?;
    ts.update("mytable", row("a", 2), TransactionContext::Id(tx))?;
    ts.insert("mytable", row("d", 1), TransactionContext::Id(tx))?;

    let mut ids: Vec<String> = ts
        .scan(
            "mytable",
            ScanPredicate::index_seek("by_n1", vec![Value::BigInt(1)]),
            TransactionContext::Id(tx),
        )?
        .map(|r| r.map(|r| r[0].as_str().unwrap_or_default().to_string()))
        .collect::<Result<_, _>>()?;
    ids.sort();
    assert_eq!(ids, vec!["b", "c", "d"]);

    assert!(matches!(
        ts.scan(
            "mytable",
            ScanPredicate::index_seek("missing", vec![]),
            TransactionContext::None
        ),
        Err(StorageError::IndexNotFound(_))
    ));
    ts.rollback_transaction(tx)?;
    Ok(())
}

#[test]
fn test_scan_filters_and_ranges() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    ts.insert("mytable", row("d", 5), TransactionContext::None)?;
    let range = ts
        .scan(
            "mytable",
            ScanPredicate::primary_key_range(
                std::ops::Bound::Excluded(key("a")),
                std::ops::Bound::Included(key("c")),
            ),
            TransactionContext::None,
        )?
        .consume()?;
    assert_eq!(range, vec![row("b", 1), row("c", 1)]);

    let big = ts
        .scan(
            "mytable",
            ScanPredicate::full_scan().with_filter(|r| r[1].as_i64() > Some(1)),
            TransactionContext::None,
        )?
        .consume()?;
    assert_eq!(big, vec![row("d", 5)]);
    Ok(())
}

#[test]
fn test_terminal_transactions() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    assert!(matches!(
        ts.commit_transaction(12345),
        Err(StorageError::TransactionNotFound(12345))
    ));
    assert!(matches!(
        ts.update("mytable", row("a", 2), TransactionContext::Id(12345)),
        Err(StorageError::TransactionNotFound(12345))
    ));

    let tx = ts.begin_transaction()?;
    ts.update("mytable", row("a", 2), TransactionContext::Id(tx))?;
    let racers: Vec<_> = (0..4)
        .map(|_| {
            let ts = Arc::clone(&ts);
            thread::spawn(move || ts.commit_transaction(tx))
        })
        .collect();
    let results: Vec<_> = racers
        .into_iter()
        .map(|h| h.join().expect("committer panicked"))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.into_iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(StorageError::TransactionNotFound(_))
                | Err(StorageError::TransactionAlreadyTerminal {
                    state: TransactionState::Committed,
                    ..
                })
        ));
    }
    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(2));
    Ok(())
}

#[test]
fn test_raw_transaction_ids() {
    assert_eq!(TransactionContext::from_raw(0), TransactionContext::None);
    assert_eq!(TransactionContext::from_raw(-1), TransactionContext::Auto);
    assert_eq!(TransactionContext::from_raw(42), TransactionContext::Id(42));
}

#[test]
fn test_auto_transaction_commits_immediately() -> Result<()> {
    let (_dir, _engine, ts) = setup()?;
    let result = ts.update("mytable", row("a", 3), TransactionContext::Auto)?;
    let id = result.transaction_id.expect("auto transaction id");
    assert!(matches!(
        ts.commit_transaction(id),
        Err(StorageError::TransactionNotFound(_))
    ));
    assert_eq!(n1(&ts, "a", TransactionContext::None)?, Some(3));
    assert!(ts.active_transactions().is_empty());
    Ok(())
}
