//! Per-key lock manager.
//!
//! Locks are keyed by `(namespace, key)`: the namespace is a table name for
//! record keys, or `table.index` for unique-index tuples. Only writers lock;
//! a key has at most one owner and acquisition is re-entrant. Waiters park on
//! their shard's condition variable and give up with `LockTimeout` at the
//! deadline.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::transaction::TransactionId;
use crate::{display_key, Result, StorageError};

const LOCK_SHARDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub namespace: String,
    pub key: Bytes,
}

impl LockKey {
    pub fn record(table: &str, key: Bytes) -> Self {
        Self {
            namespace: table.to_string(),
            key,
        }
    }

    pub fn index_tuple(table: &str, index: &str, tuple: Bytes) -> Self {
        Self {
            namespace: format!("{}.{}", table, index),
            key: tuple,
        }
    }
}

/// Result of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The transaction did not hold the key before.
    New,
    /// The transaction already held the key.
    AlreadyHeld,
}

struct LockShard {
    locks: Mutex<HashMap<LockKey, TransactionId>>,
    released: Condvar,
}

pub struct LockManager {
    shards: Vec<LockShard>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        let shards = (0..LOCK_SHARDS)
            .map(|_| LockShard {
                locks: Mutex::new(HashMap::new()),
                released: Condvar::new(),
            })
            .collect();
        Self { shards, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn shard(&self, key: &LockKey) -> &LockShard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % LOCK_SHARDS]
    }

    pub fn acquire(&self, tx: TransactionId, key: &LockKey) -> Result<Acquired> {
        let shard = self.shard(key);
        let deadline = Instant::now() + self.timeout;
        let mut locks = shard.locks.lock();
        loop {
            match locks.get(key) {
                Some(&owner) if owner == tx => return Ok(Acquired::AlreadyHeld),
                Some(_) => {}
                None => {
                    locks.insert(key.clone(), tx);
                    return Ok(Acquired::New);
                }
            }
            if shard.released.wait_until(&mut locks, deadline).timed_out() {
                // Re-check once: a release may have raced with the timeout.
                if !locks.contains_key(key) {
                    locks.insert(key.clone(), tx);
                    return Ok(Acquired::New);
                }
                return Err(StorageError::LockTimeout {
                    table: key.namespace.clone(),
                    key: display_key(&key.key),
                });
            }
        }
    }

    /// Drops `key` if `tx` owns it.
    pub fn release(&self, tx: TransactionId, key: &LockKey) {
        let shard = self.shard(key);
        let mut locks = shard.locks.lock();
        if locks.get(key) == Some(&tx) {
            locks.remove(key);
            shard.released.notify_all();
        }
    }

    pub fn release_all<'a>(&self, tx: TransactionId, keys: impl IntoIterator<Item = &'a LockKey>) {
        for key in keys {
            self.release(tx, key);
        }
    }

    /// Number of keys currently owned.
    pub fn locked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.locks.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(k: &str) -> LockKey {
        LockKey::record("t", Bytes::copy_from_slice(k.as_bytes()))
    }

    #[test]
    fn test_acquire_is_reentrant() {
        let locks = LockManager::new(Duration::from_millis(50));
        assert_eq!(locks.acquire(1, &key("a")).unwrap(), Acquired::New);
        assert_eq!(locks.acquire(1, &key("a")).unwrap(), Acquired::AlreadyHeld);
        assert_eq!(locks.locked_keys(), 1);
    }

    #[test]
    fn test_other_owner_times_out_and_release_by_non_owner_is_ignored() {
        let locks = LockManager::new(Duration::from_millis(30));
        locks.acquire(1, &key("a")).unwrap();
        match locks.acquire(2, &key("a")) {
            Err(StorageError::LockTimeout { table, key }) => {
                assert_eq!(table, "t");
                assert_eq!(key, "61");
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        locks.release(2, &key("a"));
        assert!(locks.acquire(3, &key("a")).is_err());
        locks.release(1, &key("a"));
        assert_eq!(locks.acquire(3, &key("a")).unwrap(), Acquired::New);
    }

    #[test]
    fn test_timeout_leaves_no_stale_entry() {
        let locks = LockManager::new(Duration::from_millis(20));
        locks.acquire(1, &key("a")).unwrap();
        assert!(locks.acquire(2, &key("a")).is_err());
        locks.release(1, &key("a"));
        assert_eq!(locks.locked_keys(), 0);
    }

    #[test]
    fn test_waiter_is_woken_on_release() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        locks.acquire(1, &key("a")).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire(2, &key("a")))
        };
        thread::sleep(Duration::from_millis(30));
        locks.release_all(1, [key("a")].iter());
        assert_eq!(waiter.join().unwrap().unwrap(), Acquired::New);
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let locks = LockManager::new(Duration::from_millis(20));
        let tuple = Bytes::from_static(b"x");
        locks
            .acquire(1, &LockKey::index_tuple("t", "ix", tuple.clone()))
            .unwrap();
        locks
            .acquire(2, &LockKey::record("t", tuple))
            .unwrap();
        assert_eq!(locks.locked_keys(), 2);
    }
}
