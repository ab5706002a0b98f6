//! Metadata read-back cache.
//!
//! Stores the last title/description/keywords read for each artwork so a
//! reopened project shows its metadata before the files are parsed again.
//! Two WALs feed one table: explicit saves go through the overwrite WAL,
//! first-time imports through an add-only WAL that never clobbers richer
//! data the user may already have produced.

use crate::index::{Backing, TieredCacheIndex};
use crate::records::{CacheRecord, CachedArtwork};
use crate::wal::{FlushPolicy, WriteAheadLog};
use lumapix_common::{CompactionConfig, Result};
use lumapix_store::StoreRegistry;
use tracing::{info, warn};

pub const METADATA_STORE: &str = "metadata.db";
pub const ARTWORKS_TABLE: &str = "artworks";

pub struct MetadataCache {
    index: TieredCacheIndex<CachedArtwork>,
    add_wal: WriteAheadLog<String, CachedArtwork>,
}

impl MetadataCache {
    pub fn open(registry: &StoreRegistry, config: CompactionConfig) -> Self {
        let backing = Backing::open(registry, METADATA_STORE, ARTWORKS_TABLE);
        if backing.is_some() {
            info!("metadata cache initialized");
        }
        Self {
            index: TieredCacheIndex::new(backing, config),
            add_wal: WriteAheadLog::new(FlushPolicy::AddOnly),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.index.is_degraded()
    }

    /// Latest known metadata for the artwork at `key`
    pub fn read(&self, key: &str) -> Option<CachedArtwork> {
        self.index
            .try_get(key)
            .or_else(|| self.add_wal.try_get(key))
    }

    /// Stage metadata for `key`. `overwrite` routes through the overwrite
    /// WAL (explicit save); otherwise the add-only WAL, which on flush
    /// skips keys the table already has.
    pub fn save(&self, key: &str, mut artwork: CachedArtwork, overwrite: bool) {
        let served = self.read(key).map_or(1, |prior| prior.requests_served() + 1);
        artwork.set_requests_served(served);

        if overwrite {
            self.index.insert(key, artwork);
        } else {
            self.add_wal.set(key.to_string(), artwork);
        }
    }

    /// Flush both WALs and compact. First-import rows land first so an
    /// explicit save of the same key wins within one sync.
    pub fn sync(&self) {
        if let Some(table) = self.index.table() {
            self.add_wal.flush(table);
        }
        self.index.sync();
    }

    /// Final sync, then close the backing store
    pub fn finalize(&self) {
        if let Some(table) = self.index.table() {
            self.add_wal.flush(table);
        }
        self.index.finalize();
    }

    /// Lazy walk over every persisted artwork, for bulk export. The
    /// visitor returns `false` to abort early.
    pub fn dump(&self, mut visitor: impl FnMut(&str, &CachedArtwork) -> bool) -> Result<()> {
        let Some(table) = self.index.table() else {
            return Ok(());
        };
        table.for_each_row(|key, raw| match bincode::deserialize::<CachedArtwork>(raw) {
            Ok(artwork) => visitor(key, &artwork),
            Err(e) => {
                warn!(key, error = %e, "skipping corrupt row in dump");
                true
            }
        })
    }
}
