//! Video thumbnail cache.
//!
//! Videos get a quick low-cost thumbnail first so the UI has something to
//! show, then a good-quality pass replaces it in the background. Both
//! qualities hash to distinct artifact names so a half-finished good pass
//! never clobbers the quick file being displayed.

use crate::index::{Backing, TieredCacheIndex};
use crate::records::CachedThumbnail;
use crate::worker::CacheJob;
use lumapix_common::CompactionConfig;
use lumapix_store::StoreRegistry;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

pub const THUMBNAILS_STORE: &str = "thumbnails.db";
pub const THUMBNAILS_TABLE: &str = "thumbnails";

/// A cache hit and whether the caller should regenerate
pub struct ThumbnailHit {
    pub record: CachedThumbnail,
    pub stale: bool,
}

/// Tiered index of generated video thumbnails
pub struct VideoCacheIndex {
    index: TieredCacheIndex<CachedThumbnail>,
}

impl VideoCacheIndex {
    pub fn open(registry: &StoreRegistry, config: CompactionConfig) -> Self {
        let backing = Backing::open(registry, THUMBNAILS_STORE, THUMBNAILS_TABLE);
        if backing.is_some() {
            info!("video cache initialized");
        }
        Self {
            index: TieredCacheIndex::new(backing, config),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.index.is_degraded()
    }

    pub fn try_get(&self, key: &str) -> Option<CachedThumbnail> {
        self.index.try_get(key)
    }

    /// Look up a thumbnail and classify it against the source's mtime
    pub fn lookup(&self, key: &str, source_modified: SystemTime) -> Option<ThumbnailHit> {
        let record = self.index.try_get(key)?;
        let stale = record.is_stale(source_modified);
        Some(ThumbnailHit { record, stale })
    }

    /// Record a (re)generated thumbnail, carrying the service counter over
    pub fn update(&self, key: &str, record: CachedThumbnail) {
        self.index.update(key, record);
    }

    pub fn sync(&self) {
        self.index.sync();
    }

    pub fn finalize(&self) {
        self.index.finalize();
    }
}

/// Name of the thumbnail artifact for a source path. Good-quality
/// thumbnails get their own name so the two passes never collide.
pub fn thumbnail_filename(source_path: &str, quick: bool) -> String {
    let digest = Sha256::digest(source_path.as_bytes());
    if quick {
        format!("{digest:x}.jpg")
    } else {
        format!("{digest:x}s.jpg")
    }
}

/// Produces the actual thumbnail file; frame extraction lives outside
/// this crate.
pub trait ThumbnailGenerator: Send + 'static {
    fn generate(&mut self, source: &Path, quick: bool, target: &Path) -> std::io::Result<()>;
}

impl<F> ThumbnailGenerator for F
where
    F: FnMut(&Path, bool, &Path) -> std::io::Result<()> + Send + 'static,
{
    fn generate(&mut self, source: &Path, quick: bool, target: &Path) -> std::io::Result<()> {
        self(source, quick, target)
    }
}

pub struct ThumbnailRequest {
    pub source: PathBuf,
    /// Quick pass now, or the good-quality replacement
    pub quick: bool,
    /// Whether a quick pass may schedule the good-quality follow-up
    pub good_quality_allowed: bool,
    pub recache: bool,
}

/// The video cache's side of the worker loop
pub struct ThumbnailJob<G> {
    cache: Arc<VideoCacheIndex>,
    thumbnails_dir: PathBuf,
    generator: G,
}

impl<G: ThumbnailGenerator> ThumbnailJob<G> {
    pub fn new(
        cache: Arc<VideoCacheIndex>,
        thumbnails_dir: impl Into<PathBuf>,
        generator: G,
    ) -> Self {
        Self {
            cache,
            thumbnails_dir: thumbnails_dir.into(),
            generator,
        }
    }
}

fn source_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

impl<G: ThumbnailGenerator> CacheJob for ThumbnailJob<G> {
    type Request = ThumbnailRequest;

    fn is_processed(&mut self, request: &ThumbnailRequest) -> bool {
        if request.recache {
            return false;
        }
        let key = request.source.to_string_lossy();
        let Some(modified) = source_modified(&request.source) else {
            return false;
        };
        match self.cache.lookup(&key, modified) {
            Some(hit) if !hit.stale => self.thumbnails_dir.join(&hit.record.filename).exists(),
            _ => false,
        }
    }

    fn process(&mut self, request: ThumbnailRequest) -> Option<ThumbnailRequest> {
        let key = request.source.to_string_lossy().into_owned();
        let filename = thumbnail_filename(&key, request.quick);
        let target = self.thumbnails_dir.join(&filename);

        match self.generator.generate(&request.source, request.quick, &target) {
            Ok(()) => {
                let modified = source_modified(&request.source).unwrap_or_else(SystemTime::now);
                let record = CachedThumbnail::new(filename, modified, request.quick);
                self.cache.update(&key, record);
            }
            Err(e) => {
                warn!(source = %request.source.display(), error = %e, "thumbnail generation failed");
                return None;
            }
        }

        // A served quick thumbnail schedules its good-quality replacement
        if request.quick && request.good_quality_allowed {
            return Some(ThumbnailRequest {
                source: request.source,
                quick: false,
                good_quality_allowed: false,
                recache: true,
            });
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
