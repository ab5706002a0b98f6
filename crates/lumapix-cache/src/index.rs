//! Tiered cache index.
//!
//! Answers "latest known value for key" while keeping table access and
//! memory use bounded. Reads check the WAL (freshest, not yet durable),
//! then the memory index (previously read), then the persistent table; a
//! table hit is promoted into the memory index on the way out. Writes go
//! to the WAL only and reach the table on the next `sync`.
//!
//! When the backing store failed to open the index keeps working as a
//! WAL/memory-only cache; `sync` then skips the flush and compaction.

use crate::records::CacheRecord;
use crate::wal::{FlushPolicy, WriteAheadLog};
use lumapix_common::CompactionConfig;
use lumapix_store::{PersistentStore, PersistentTable, StoreRegistry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The persistent side of a cache: one store and the table inside it
pub struct Backing {
    pub store: Arc<PersistentStore>,
    pub table: Arc<PersistentTable>,
}

impl Backing {
    /// Open the named store and table through the registry. Returns `None`
    /// when the store is unavailable; the cache then degrades to
    /// WAL/memory-only operation for the rest of the session.
    pub fn open(registry: &StoreRegistry, store_name: &str, table_name: &str) -> Option<Self> {
        let store = match registry.open_store(store_name) {
            Ok(store) => store,
            Err(e) => {
                warn!(store = store_name, error = %e, "store unavailable, running WAL/memory-only");
                return None;
            }
        };
        match store.get_table(table_name) {
            Ok(table) => Some(Self { store, table }),
            Err(e) => {
                warn!(store = store_name, table = table_name, error = %e, "table unavailable, running WAL/memory-only");
                store.finalize();
                None
            }
        }
    }
}

struct MemoryIndex<V> {
    entries: HashMap<String, V>,
    /// Highest service counter ever promoted. Never decays; eviction
    /// thresholds derive from it.
    max_requests_seen: u64,
}

/// Read-through cache over WAL, memory index, and persistent table
pub struct TieredCacheIndex<V: CacheRecord> {
    wal: WriteAheadLog<String, V>,
    memory: RwLock<MemoryIndex<V>>,
    backing: Option<Backing>,
    config: CompactionConfig,
}

impl<V: CacheRecord> TieredCacheIndex<V> {
    pub fn new(backing: Option<Backing>, config: CompactionConfig) -> Self {
        Self {
            wal: WriteAheadLog::new(FlushPolicy::Overwrite),
            memory: RwLock::new(MemoryIndex {
                entries: HashMap::new(),
                max_requests_seen: 0,
            }),
            backing,
            config,
        }
    }

    /// Whether the cache is running without its persistent table
    pub fn is_degraded(&self) -> bool {
        self.backing.is_none()
    }

    pub fn table(&self) -> Option<&Arc<PersistentTable>> {
        self.backing.as_ref().map(|backing| &backing.table)
    }

    /// Look up `key` through all three tiers
    pub fn try_get(&self, key: &str) -> Option<V> {
        // The most fresh, not yet written to the table
        if let Some(value) = self.wal.try_get(key) {
            return Some(value);
        }

        // A little less fresh, already read from the table before
        {
            let memory = self.memory.read();
            if let Some(value) = memory.entries.get(key) {
                return Some(value.clone());
            }
        }

        // Slow path
        let backing = self.backing.as_ref()?;
        let raw = match backing.table.try_get_value(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "table read failed");
                return None;
            }
        };

        // A row that fails to decode is a miss; the row itself stays put
        let value: V = match bincode::deserialize(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "corrupt cache row treated as a miss");
                return None;
            }
        };
        if !value.format_current() {
            debug!(key, "cached row has a foreign format tag");
            return None;
        }

        self.promote(key, value.clone());
        Some(value)
    }

    /// Stage a write. The table is only touched by a later `sync`.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.wal.set(key.into(), value);
    }

    /// Counter-merging write: the new record takes over the existing
    /// record's counter plus one, or one if the key is unknown.
    pub fn update(&self, key: &str, mut value: V) {
        let prior = self.try_get(key);
        let served = prior.map_or(1, |p| p.requests_served() + 1);
        value.set_requests_served(served);
        self.insert(key, value);
    }

    /// One-time migration of a legacy whole-file index into the WAL
    pub fn import_legacy(&self, entries: HashMap<String, V>) {
        info!(count = entries.len(), "importing legacy cache index");
        self.wal.set_many(entries);
    }

    /// Flush the WAL, checkpoint the store, and compact the memory index.
    /// Idempotent; a second call with no intervening writes is a no-op.
    pub fn sync(&self) {
        debug!("sync");
        let Some(backing) = &self.backing else {
            return;
        };

        self.wal.flush(&backing.table);
        if let Err(e) = backing.store.sync() {
            warn!(error = %e, "store checkpoint failed, retrying on next sync");
        }
        self.compact();
    }

    /// Final sync, then close the backing store (reporting shutdown)
    pub fn finalize(&self) {
        debug!("finalize");
        self.sync();
        if let Some(backing) = &self.backing {
            backing.store.finalize();
        }
    }

    fn promote(&self, key: &str, value: V) {
        let mut memory = self.memory.write();
        memory.max_requests_seen = memory.max_requests_seen.max(value.requests_served());
        memory.entries.insert(key.to_string(), value);
    }

    /// Eviction cascade over the memory index. Runs only at capacity;
    /// never touches the WAL or the table.
    fn compact(&self) {
        let (size, watermark) = {
            let memory = self.memory.read();
            (memory.entries.len(), memory.max_requests_seen)
        };
        let max_items = self.config.max_memory_items;
        if size < max_items {
            return;
        }
        info!(size, max_items, watermark, "compacting memory index");

        // Each pass runs only if the previous ones freed no more than this
        let low_water = max_items / self.config.escape_fraction;

        let threshold = watermark / self.config.primary_divisor;
        let mut removed = self.remove_where(|_, value| value.requests_served() <= threshold);
        debug!(threshold, removed, "first compaction pass");

        if removed <= low_water {
            let threshold = watermark / self.config.secondary_divisor;
            removed += self.remove_where(|_, value| value.requests_served() <= threshold);
            debug!(threshold, removed, "second compaction pass");
        }

        if removed <= low_water {
            // Positional thinning guarantees progress when every entry
            // shares the same counter. The stride floors at two so an
            // index sitting exactly at capacity still shrinks.
            let stride = (size / max_items).max(2);
            removed += self.remove_where(|position, _| position % stride != 0);
            debug!(stride, removed, "positional compaction pass");
        }

        let remaining = self.memory.read().entries.len();
        info!(removed, remaining, "memory index compacted");
    }

    fn remove_where(&self, predicate: impl Fn(usize, &V) -> bool) -> usize {
        let mut memory = self.memory.write();
        let mut position = 0;
        let mut removed = 0;
        memory.entries.retain(|_, value| {
            let drop = predicate(position, value);
            position += 1;
            if drop {
                removed += 1;
            }
            !drop
        });
        removed
    }

    #[cfg(test)]
    fn memory_len(&self) -> usize {
        self.memory.read().entries.len()
    }

    #[cfg(test)]
    fn wal_len(&self) -> usize {
        self.wal.len()
    }
}
