//! Persistent store backed by redb.
//!
//! A store is a single on-disk file exposing named tables; a table is an
//! opaque `&str` key -> `&[u8]` value collection. Batch operations run in
//! one write transaction and commit with eventual durability; callers make
//! them durable with [`PersistentStore::sync`], which issues an
//! immediate-durability commit.

use lumapix_common::{Error, Result, ShutdownBarrier};
use parking_lot::Mutex;
use redb::{Durability, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

struct StoreInner {
    db: redb::Database,
    /// Serializes point reads issued from arbitrary threads so concurrent
    /// readers do not stack overlapping queries on the store. Batch writes
    /// never take this.
    read_mutex: Mutex<()>,
    closed: AtomicBool,
}

impl StoreInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::storage("store is closed"));
        }
        Ok(())
    }
}

/// A single on-disk store holding named key-value tables
pub struct PersistentStore {
    name: String,
    path: PathBuf,
    inner: Arc<StoreInner>,
    tables: Mutex<HashMap<String, Arc<PersistentTable>>>,
    barrier: Option<Arc<ShutdownBarrier>>,
}

impl PersistentStore {
    /// Open (or create) the store file at `path`.
    ///
    /// Registers one party on `barrier`; [`finalize`](Self::finalize)
    /// reports it. Failure to open surfaces as
    /// [`Error::StoreUnavailable`] and callers are expected to degrade to
    /// WAL/memory-only operation.
    pub fn open(
        name: &str,
        path: impl AsRef<Path>,
        barrier: Option<Arc<ShutdownBarrier>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::store_unavailable(name, format!("creating {parent:?}: {e}")))?;
        }

        let db = redb::Database::create(&path)
            .map_err(|e| Error::store_unavailable(name, e))?;

        if let Some(barrier) = &barrier {
            barrier.about_to_begin(1);
        }

        info!(store = name, ?path, "opened store");
        Ok(Self {
            name: name.to_string(),
            path,
            inner: Arc::new(StoreInner {
                db,
                read_mutex: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
            tables: Mutex::new(HashMap::new()),
            barrier,
        })
    }

    /// Verify the store accepts write transactions. Idempotent; tables are
    /// created lazily by [`get_table`](Self::get_table).
    pub fn initialize(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let txn = self.inner.db.begin_write()?;
        txn.commit()?;
        debug!(store = %self.name, "store initialized");
        Ok(())
    }

    /// Get (creating if necessary) the named table. Handles are cached and
    /// reused for the lifetime of the store.
    pub fn get_table(&self, name: &str) -> Result<Arc<PersistentTable>> {
        self.inner.ensure_open()?;

        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }

        // Create the table eagerly so later read txns don't fail
        let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(name);
        let txn = self.inner.db.begin_write()?;
        {
            let _table = txn.open_table(definition)?;
        }
        txn.commit()?;

        let table = Arc::new(PersistentTable {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        });
        tables.insert(name.to_string(), Arc::clone(&table));
        debug!(store = %self.name, table = name, "table ready");
        Ok(table)
    }

    /// Make all previously committed batches durable.
    ///
    /// Batch operations commit with eventual durability; this issues an
    /// immediate-durability commit that persists everything before it.
    pub fn sync(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut txn = self.inner.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        txn.commit()?;
        debug!(store = %self.name, "store synced");
        Ok(())
    }

    /// Close the store and report completion on the barrier.
    ///
    /// Idempotent; only the first call reports. Operations on the store or
    /// its tables fail afterwards.
    pub fn finalize(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(store = %self.name, "store closed");
        if let Some(barrier) = &self.barrier {
            barrier.just_ended();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// A named key-value table inside a [`PersistentStore`]
pub struct PersistentTable {
    name: String,
    inner: Arc<StoreInner>,
}

impl PersistentTable {
    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(self.name.as_str())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Point read. Serialized through the per-store read mutex.
    pub fn try_get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.ensure_open()?;
        if key.is_empty() {
            return Ok(None);
        }

        let _serial = self.inner.read_mutex.lock();
        let txn = self.inner.db.begin_read()?;
        let table = txn.open_table(self.definition())?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Single upsert, immediately durable.
    pub fn try_set_value(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.ensure_open()?;
        if key.is_empty() || value.is_empty() {
            return Err(Error::storage("refusing to store an empty key or value"));
        }

        let txn = self.inner.db.begin_write()?;
        {
            let mut table = txn.open_table(self.definition())?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Insert-only single write; an existing key is left untouched.
    /// Returns whether the row was inserted.
    pub fn try_add_value(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.inner.ensure_open()?;
        if key.is_empty() || value.is_empty() {
            return Err(Error::storage("refusing to store an empty key or value"));
        }

        let txn = self.inner.db.begin_write()?;
        let inserted = {
            let mut table = txn.open_table(self.definition())?;
            if table.get(key)?.is_some() {
                false
            } else {
                table.insert(key, value)?;
                true
            }
        };
        txn.commit()?;
        Ok(inserted)
    }

    /// Batch upsert inside one transaction.
    ///
    /// Per-row failures (empty keys, oversized rows) are reported by index
    /// and do not abort the batch. A transaction-level failure is returned
    /// as an error and means no row of the batch is durable.
    pub fn try_set_many(&self, rows: &[(String, Vec<u8>)]) -> Result<Vec<usize>> {
        self.inner.ensure_open()?;
        debug!(table = %self.name, rows = rows.len(), "batch set");

        let mut failed = Vec::new();
        let mut txn = self.inner.db.begin_write()?;
        txn.set_durability(Durability::Eventual);
        {
            let mut table = txn.open_table(self.definition())?;
            for (index, (key, value)) in rows.iter().enumerate() {
                if key.is_empty() || value.is_empty() {
                    warn!(table = %self.name, index, "skipping empty row in batch set");
                    failed.push(index);
                    continue;
                }
                if let Err(e) = table.insert(key.as_str(), value.as_slice()) {
                    warn!(table = %self.name, key = %key, error = %e, "failed to set row");
                    failed.push(index);
                }
            }
        }
        txn.commit()?;
        Ok(failed)
    }

    /// Insert-only batch inside one transaction; existing keys are skipped,
    /// not overwritten. Returns the number of rows actually inserted.
    pub fn try_add_many(&self, rows: &[(String, Vec<u8>)]) -> Result<usize> {
        self.inner.ensure_open()?;
        debug!(table = %self.name, rows = rows.len(), "batch add");

        let mut added = 0;
        let mut txn = self.inner.db.begin_write()?;
        txn.set_durability(Durability::Eventual);
        {
            let mut table = txn.open_table(self.definition())?;
            for (key, value) in rows {
                if key.is_empty() || value.is_empty() {
                    warn!(table = %self.name, "skipping empty row in batch add");
                    continue;
                }
                if table.get(key.as_str())?.is_some() {
                    continue;
                }
                table.insert(key.as_str(), value.as_slice())?;
                added += 1;
            }
        }
        txn.commit()?;
        Ok(added)
    }

    /// Delete a row by key. Returns whether the row existed.
    pub fn try_delete_record(&self, key: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        if key.is_empty() {
            return Ok(false);
        }

        let txn = self.inner.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(self.definition())?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(existed)
    }

    /// Delete many rows inside one transaction. Returns the number of rows
    /// actually removed.
    pub fn try_delete_many(&self, keys: &[String]) -> Result<usize> {
        self.inner.ensure_open()?;
        debug!(table = %self.name, keys = keys.len(), "batch delete");

        let mut removed = 0;
        let mut txn = self.inner.db.begin_write()?;
        txn.set_durability(Durability::Eventual);
        {
            let mut table = txn.open_table(self.definition())?;
            for key in keys {
                if table.remove(key.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    /// Lazy one-shot walk over every row, for bulk export. The visitor
    /// returns `false` to abort early.
    pub fn for_each_row(&self, mut visitor: impl FnMut(&str, &[u8]) -> bool) -> Result<()> {
        self.inner.ensure_open()?;

        let txn = self.inner.db.begin_read()?;
        let table = txn.open_table(self.definition())?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            if !visitor(key.value(), value.value()) {
                break;
            }
        }
        Ok(())
    }
}
