//! In-memory write-ahead log.
//!
//! Decouples fast writers from slower persistent writes: `set` is an O(1)
//! map insert under a write lock and never blocks on I/O. `flush` drains
//! the pending map while holding the lock only for the drain itself, then
//! pushes the batch into a table according to the configured policy.

use lumapix_store::PersistentTable;
use parking_lot::RwLock;
use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::{debug, warn};

/// How a flushed batch lands in the table.
///
/// `Overwrite` replaces existing rows (explicit saves); `AddOnly` only
/// inserts missing keys, so a first-time import never clobbers richer data
/// that already made it to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    Overwrite,
    AddOnly,
}

/// Staging map of not-yet-persisted writes. Last writer for a key wins
/// until the next flush.
pub struct WriteAheadLog<K, V> {
    policy: FlushPolicy,
    pending: RwLock<HashMap<K, V>>,
}

impl<K, V> WriteAheadLog<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Insert or overwrite a pending write
    pub fn set(&self, key: K, value: V) {
        self.pending.write().insert(key, value);
    }

    /// Bulk import, used to migrate a legacy whole-file index
    pub fn set_many(&self, entries: HashMap<K, V>) {
        if entries.is_empty() {
            return;
        }
        let mut pending = self.pending.write();
        for (key, value) in entries {
            pending.insert(key, value);
        }
    }

    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.pending.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }
}

impl<K, V> WriteAheadLog<K, V>
where
    K: Eq + Hash + Clone + AsRef<str>,
    V: Clone + Serialize,
{
    /// Flush all pending writes into `table`.
    ///
    /// The write lock covers only the drain; serialization and table I/O
    /// run outside it. Rows the table reports as failed are put back into
    /// the log to be retried on the next flush; rows not reported failed
    /// are considered durable. Returns the number of entries that left the
    /// log for good.
    pub fn flush(&self, table: &PersistentTable) -> usize {
        let drained: Vec<(K, V)> = {
            let mut pending = self.pending.write();
            if pending.is_empty() {
                return 0;
            }
            pending.drain().collect()
        };

        let mut rows = Vec::with_capacity(drained.len());
        let mut entries = Vec::with_capacity(drained.len());
        for (key, value) in drained {
            match bincode::serialize(&value) {
                Ok(bytes) => {
                    rows.push((key.as_ref().to_string(), bytes));
                    entries.push((key, value));
                }
                Err(e) => {
                    warn!(key = key.as_ref(), error = %e, "dropping entry that failed to serialize");
                }
            }
        }
        if rows.is_empty() {
            return 0;
        }

        match self.policy {
            FlushPolicy::Overwrite => match table.try_set_many(&rows) {
                Ok(failed) if failed.is_empty() => {
                    debug!(rows = rows.len(), "WAL flushed");
                    rows.len()
                }
                Ok(failed) => {
                    warn!(
                        failed = failed.len(),
                        "restoring entries that failed to flush"
                    );
                    let settled = rows.len() - failed.len();
                    self.restore(failed.into_iter().map(|index| entries[index].clone()));
                    settled
                }
                Err(e) => {
                    warn!(error = %e, "flush transaction failed, restoring all entries");
                    self.restore(entries.into_iter());
                    0
                }
            },
            FlushPolicy::AddOnly => match table.try_add_many(&rows) {
                Ok(added) => {
                    debug!(added, skipped = rows.len() - added, "add-only WAL flushed");
                    rows.len()
                }
                Err(e) => {
                    warn!(error = %e, "add-only flush failed, restoring all entries");
                    self.restore(entries.into_iter());
                    0
                }
            },
        }
    }

    /// A write that raced in while the flush was running is fresher than
    /// the entry being restored, so it must win.
    fn restore(&self, entries: impl Iterator<Item = (K, V)>) {
        let mut pending = self.pending.write();
        for (key, value) in entries {
            pending.entry(key).or_insert(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumapix_store::PersistentStore;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Payload(String);

    #[test]
    fn test_last_writer_wins() {
        let wal: WriteAheadLog<String, Payload> = WriteAheadLog::new(FlushPolicy::Overwrite);
        wal.set("k".into(), Payload("v1".into()));
        wal.set("k".into(), Payload("v2".into()));

        assert_eq!(wal.try_get("k"), Some(Payload("v2".into())));
        assert_eq!(wal.len(), 1);
    }

    #[test]
    fn test_set_many_bulk_import() {
        let wal: WriteAheadLog<String, Payload> = WriteAheadLog::new(FlushPolicy::Overwrite);
        let mut existing = HashMap::new();
        existing.insert("a".to_string(), Payload("1".into()));
        existing.insert("b".to_string(), Payload("2".into()));

        wal.set_many(existing);
        assert_eq!(wal.len(), 2);
        assert_eq!(wal.try_get("a"), Some(Payload("1".into())));
    }

    #[test]
    fn test_flush_clears_log_and_persists() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open("test", dir.path().join("test.db"), None).unwrap();
        let table = store.get_table("wal").unwrap();

        let wal: WriteAheadLog<String, Payload> = WriteAheadLog::new(FlushPolicy::Overwrite);
        wal.set("k".into(), Payload("v".into()));

        assert_eq!(wal.flush(&table), 1);
        assert!(wal.is_empty());

        let raw = table.try_get_value("k").unwrap().unwrap();
        let value: Payload = bincode::deserialize(&raw).unwrap();
        assert_eq!(value, Payload("v".into()));

        // Nothing pending, second flush is a no-op
        assert_eq!(wal.flush(&table), 0);
    }

    #[test]
    fn test_partial_failure_restores_only_failed_entry() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open("test", dir.path().join("test.db"), None).unwrap();
        let table = store.get_table("wal").unwrap();

        let wal: WriteAheadLog<String, Payload> = WriteAheadLog::new(FlushPolicy::Overwrite);
        // The empty key is rejected by the table and reported by index
        wal.set(String::new(), Payload("bad".into()));
        wal.set("good".into(), Payload("fine".into()));

        assert_eq!(wal.flush(&table), 1);

        assert_eq!(wal.len(), 1);
        assert_eq!(wal.try_get(""), Some(Payload("bad".into())));
        assert!(table.try_get_value("good").unwrap().is_some());
    }

    #[test]
    fn test_add_only_skips_are_not_failures() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open("test", dir.path().join("test.db"), None).unwrap();
        let table = store.get_table("wal").unwrap();

        table
            .try_set_value("k", &bincode::serialize(&Payload("rich".into())).unwrap())
            .unwrap();

        let wal: WriteAheadLog<String, Payload> = WriteAheadLog::new(FlushPolicy::AddOnly);
        wal.set("k".into(), Payload("import".into()));
        wal.flush(&table);

        // The skipped row stays flushed out of the log and the richer
        // value stays persisted
        assert!(wal.is_empty());
        let raw = table.try_get_value("k").unwrap().unwrap();
        let value: Payload = bincode::deserialize(&raw).unwrap();
        assert_eq!(value, Payload("rich".into()));
    }
}
