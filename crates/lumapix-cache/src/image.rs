//! Image preview cache.
//!
//! Keys are source-file paths; values describe the generated preview file
//! living in the previews directory. Preview filenames are the sha256 of
//! the source path so one source maps to one artifact regardless of where
//! the cache directory moves.

use crate::index::{Backing, TieredCacheIndex};
use crate::records::{CachedPreview, PreviewSize};
use crate::worker::CacheJob;
use lumapix_common::CompactionConfig;
use lumapix_store::StoreRegistry;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

pub const PREVIEWS_STORE: &str = "previews.db";
pub const PREVIEWS_TABLE: &str = "previews";

/// Fallback when a request arrives with a zero dimension
const DEFAULT_PREVIEW_SIZE: PreviewSize = PreviewSize::new(150, 150);

/// A cache hit and whether the caller should regenerate. A stale record
/// stays usable as a placeholder until the regeneration lands.
pub struct PreviewHit {
    pub record: CachedPreview,
    pub stale: bool,
}

/// Tiered index of generated image previews
pub struct ImageCacheIndex {
    index: TieredCacheIndex<CachedPreview>,
}

impl ImageCacheIndex {
    pub fn open(registry: &StoreRegistry, config: CompactionConfig) -> Self {
        let backing = Backing::open(registry, PREVIEWS_STORE, PREVIEWS_TABLE);
        if backing.is_some() {
            info!("image cache initialized");
        }
        Self {
            index: TieredCacheIndex::new(backing, config),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.index.is_degraded()
    }

    pub fn try_get(&self, key: &str) -> Option<CachedPreview> {
        self.index.try_get(key)
    }

    /// Look up a preview and classify it against the current request
    pub fn lookup(
        &self,
        key: &str,
        requested: PreviewSize,
        source_modified: SystemTime,
    ) -> Option<PreviewHit> {
        let record = self.index.try_get(key)?;
        let stale = record.is_stale(source_modified, requested);
        Some(PreviewHit { record, stale })
    }

    /// Record a (re)generated preview, carrying the service counter over
    pub fn update(&self, key: &str, record: CachedPreview) {
        self.index.update(key, record);
    }

    /// One-time migration of the legacy whole-file index
    pub fn import_legacy(&self, existing: HashMap<String, CachedPreview>) {
        self.index.import_legacy(existing);
    }

    pub fn sync(&self) {
        self.index.sync();
    }

    pub fn finalize(&self) {
        self.index.finalize();
    }
}

/// Name of the preview artifact for a source path
pub fn preview_filename(source_path: &str) -> String {
    let digest = Sha256::digest(source_path.as_bytes());
    let suffix = Path::new(source_path)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("jpg");
    format!("{digest:x}.{suffix}")
}

/// Produces the actual preview file; the pixel work lives outside this
/// crate.
pub trait PreviewGenerator: Send + 'static {
    fn generate(
        &mut self,
        source: &Path,
        requested: PreviewSize,
        target: &Path,
    ) -> std::io::Result<()>;
}

impl<F> PreviewGenerator for F
where
    F: FnMut(&Path, PreviewSize, &Path) -> std::io::Result<()> + Send + 'static,
{
    fn generate(
        &mut self,
        source: &Path,
        requested: PreviewSize,
        target: &Path,
    ) -> std::io::Result<()> {
        self(source, requested, target)
    }
}

pub struct PreviewRequest {
    pub source: PathBuf,
    pub requested_size: PreviewSize,
    /// Regenerate even when a fresh preview exists
    pub recache: bool,
}

/// The image cache's side of the worker loop
pub struct PreviewJob<G> {
    cache: Arc<ImageCacheIndex>,
    previews_dir: PathBuf,
    generator: G,
}

impl<G: PreviewGenerator> PreviewJob<G> {
    pub fn new(cache: Arc<ImageCacheIndex>, previews_dir: impl Into<PathBuf>, generator: G) -> Self {
        Self {
            cache,
            previews_dir: previews_dir.into(),
            generator,
        }
    }
}

fn source_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

impl<G: PreviewGenerator> CacheJob for PreviewJob<G> {
    type Request = PreviewRequest;

    fn is_processed(&mut self, request: &PreviewRequest) -> bool {
        if request.recache {
            return false;
        }
        let key = request.source.to_string_lossy();
        let Some(modified) = source_modified(&request.source) else {
            return false;
        };
        match self.cache.lookup(&key, request.requested_size, modified) {
            Some(hit) if !hit.stale => self.previews_dir.join(&hit.record.filename).exists(),
            _ => false,
        }
    }

    fn process(&mut self, request: PreviewRequest) -> Option<PreviewRequest> {
        let key = request.source.to_string_lossy().into_owned();

        let requested = if request.requested_size.is_valid() {
            request.requested_size
        } else {
            warn!(source = %request.source.display(), "invalid requested size, using default");
            DEFAULT_PREVIEW_SIZE
        };

        let filename = preview_filename(&key);
        let target = self.previews_dir.join(&filename);
        match self.generator.generate(&request.source, requested, &target) {
            Ok(()) => {
                let modified = source_modified(&request.source).unwrap_or_else(SystemTime::now);
                let record = CachedPreview::new(filename, modified, requested);
                self.cache.update(&key, record);
            }
            Err(e) => {
                warn!(source = %request.source.display(), error = %e, "preview generation failed");
            }
        }
        None
    }

    fn sync(&mut self) {
        self.cache.sync();
    }

    fn finalize(&mut self) {
        self.cache.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::CacheRecord;
    use std::time::Duration;
    use tempfile::tempdir;

    fn t(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn test_preview_filename_is_stable_and_keeps_suffix() {
        let first = preview_filename("/photos/shoot/img1.png");
        let second = preview_filename("/photos/shoot/img1.png");
        assert_eq!(first, second);
        assert!(first.ends_with(".png"));

        let other = preview_filename("/photos/shoot/img2.png");
        assert_ne!(first, other);
    }

    #[test]
    fn test_lookup_staleness_scenario() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::initialize(dir.path().join("db")).unwrap();
        let cache = ImageCacheIndex::open(&registry, CompactionConfig::with_capacity(100));

        let size = PreviewSize::new(100, 100);
        cache.update("img1.jpg", CachedPreview::new("abc.jpg", t(1_000), size));
        cache.sync();

        // Same size, same mtime: fresh hit
        let hit = cache.lookup("img1.jpg", size, t(1_000)).unwrap();
        assert!(!hit.stale);
        assert_eq!(hit.record.requests_served, 1);

        // Source touched afterwards: still served, flagged stale
        let hit = cache.lookup("img1.jpg", size, t(2_000)).unwrap();
        assert!(hit.stale);
        assert_eq!(hit.record.filename, "abc.jpg");

        // Different requested size: stale as well
        let hit = cache
            .lookup("img1.jpg", PreviewSize::new(200, 200), t(1_000))
            .unwrap();
        assert!(hit.stale);
    }

    #[test]
    fn test_degraded_cache_still_serves() {
        let dir = tempdir().unwrap();
        // Occupy the store path with a directory so the open fails
        let db_dir = dir.path().join("db");
        std::fs::create_dir_all(db_dir.join(PREVIEWS_STORE)).unwrap();

        let registry = StoreRegistry::initialize(&db_dir).unwrap();
        let cache = ImageCacheIndex::open(&registry, CompactionConfig::default());
        assert!(cache.is_degraded());

        let size = PreviewSize::new(64, 64);
        cache.update("img.jpg", CachedPreview::new("x.jpg", t(10), size));
        cache.sync();
        assert!(cache.lookup("img.jpg", size, t(10)).is_some());
    }

    #[test]
    fn test_worker_end_to_end_shutdown() {
        use crate::worker::CacheWorker;
        use lumapix_common::{CacheConfig, CoordinationStatus};

        let dir = tempdir().unwrap();
        let registry = StoreRegistry::initialize(dir.path().join("db")).unwrap();
        let config = CacheConfig::default();
        let cache = Arc::new(ImageCacheIndex::open(&registry, config.compaction.clone()));

        let source = dir.path().join("img1.jpg");
        std::fs::write(&source, b"raw").unwrap();
        let previews = dir.path().join("previews");
        std::fs::create_dir_all(&previews).unwrap();

        let job = PreviewJob::new(
            Arc::clone(&cache),
            &previews,
            |_source: &Path, _size: PreviewSize, target: &Path| std::fs::write(target, b"preview"),
        );
        let worker = CacheWorker::spawn(job, config.sync_backup_step);

        worker.submit(PreviewRequest {
            source: source.clone(),
            requested_size: PreviewSize::new(100, 100),
            recache: false,
        });
        worker.stop();

        // The worker ran its final sync and finalized the cache, so the
        // store has already reported on the barrier
        let status = registry.prepare_to_finalize(Some(config.shutdown_timeout));
        assert_eq!(status, CoordinationStatus::AllDone);

        let key = source.to_string_lossy();
        assert!(previews.join(preview_filename(&key)).exists());
    }

    #[test]
    fn test_import_legacy_twice_matches_once() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::initialize(dir.path().join("db")).unwrap();
        let cache = ImageCacheIndex::open(&registry, CompactionConfig::with_capacity(100));

        let size = PreviewSize::new(32, 32);
        let mut legacy = HashMap::new();
        let mut record = CachedPreview::new("old.jpg", t(5), size);
        record.set_requests_served(7);
        legacy.insert("old-key.jpg".to_string(), record.clone());

        cache.import_legacy(legacy.clone());
        cache.sync();
        cache.import_legacy(legacy);
        cache.sync();

        let found = cache.try_get("old-key.jpg").unwrap();
        assert_eq!(found, record);
    }
}
