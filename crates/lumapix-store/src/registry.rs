//! Store registry: opens named stores under one directory and coordinates
//! their shutdown.

use crate::store::PersistentStore;
use lumapix_common::{CoordinationStatus, Error, Result, ShutdownBarrier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Opens, tracks, and closes the application's persistent stores.
///
/// Every store opened here registers one party on the shared barrier;
/// caches report through [`PersistentStore::finalize`] when their final
/// sync is done. [`prepare_to_finalize`](StoreRegistry::prepare_to_finalize)
/// waits for those reports, then closes whatever is left either way.
pub struct StoreRegistry {
    dir: PathBuf,
    barrier: Arc<ShutdownBarrier>,
    stores: Mutex<HashMap<String, Arc<PersistentStore>>>,
}

impl StoreRegistry {
    /// Create the store directory and an empty registry.
    pub fn initialize(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::store_unavailable(dir.display().to_string(), e))?;
        info!(?dir, "store registry initialized");

        Ok(Self {
            dir,
            barrier: Arc::new(ShutdownBarrier::new()),
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// Open (or reuse) the named store. The store file lives directly under
    /// the registry directory.
    pub fn open_store(&self, name: &str) -> Result<Arc<PersistentStore>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(name) {
            return Ok(Arc::clone(store));
        }

        let path = self.dir.join(name);
        let store = Arc::new(PersistentStore::open(
            name,
            &path,
            Some(Arc::clone(&self.barrier)),
        )?);

        if let Err(e) = store.initialize() {
            warn!(store = name, error = %e, "store failed to initialize");
            store.finalize();
            return Err(e);
        }

        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// The barrier stores report shutdown on.
    pub fn barrier(&self) -> &Arc<ShutdownBarrier> {
        &self.barrier
    }

    /// Wait for every store to report finalization, bounded by `timeout`,
    /// then close anything still open. On timeout the flush is best-effort:
    /// stores are closed regardless.
    pub fn prepare_to_finalize(&self, timeout: Option<Duration>) -> CoordinationStatus {
        let status = self.barrier.wait(timeout);
        info!(?status, "finalizing stores");
        self.close_all();
        status
    }

    /// Close every tracked store. Already-finalized stores are untouched.
    pub fn close_all(&self) {
        let stores = self.stores.lock();
        for store in stores.values() {
            store.finalize();
        }
        info!(count = stores.len(), "stores closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_open_store_is_reused() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::initialize(dir.path().join("db")).unwrap();

        let first = registry.open_store("previews.db").unwrap();
        let second = registry.open_store("previews.db").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_finalize_waits_for_stores() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::initialize(dir.path().join("db")).unwrap();
        let store = registry.open_store("previews.db").unwrap();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            store.finalize();
        });

        let status = registry.prepare_to_finalize(Some(Duration::from_secs(5)));
        assert_eq!(status, CoordinationStatus::AllDone);
        worker.join().unwrap();
    }

    #[test]
    fn test_finalize_times_out_and_still_closes() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::initialize(dir.path().join("db")).unwrap();
        let store = registry.open_store("previews.db").unwrap();

        // Nobody reports; the registry must proceed anyway
        let status = registry.prepare_to_finalize(Some(Duration::from_millis(20)));
        assert_eq!(status, CoordinationStatus::Timeout);

        // close_all finalized the store behind our handle
        assert!(store.sync().is_err());
    }
}
