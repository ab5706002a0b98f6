//! Cache record types.
//!
//! Every record carries a `requests_served` counter used both as a
//! frequency proxy for eviction and to merge concurrent updates: a new
//! record takes the previous counter plus one, or one when no prior record
//! existed. Value-format compatibility is each record's own business —
//! the table layer stores opaque bytes.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::SystemTime;

/// Format tag embedded in [`CachedThumbnail`]; rows decoded with a foreign
/// tag are treated as misses.
pub const THUMBNAIL_FORMAT_VERSION: u32 = 1;

/// Behavior every cached record supplies to the tiered index
pub trait CacheRecord:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn requests_served(&self) -> u64;

    fn set_requests_served(&mut self, count: u64);

    /// Reject rows written by an incompatible build. Defaults to accepting
    /// everything; records embedding a version tag override this.
    fn format_current(&self) -> bool {
        true
    }
}

/// Pixel dimensions of a generated preview
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSize {
    pub width: u32,
    pub height: u32,
}

impl PreviewSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_valid(self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// An image preview tracked by the image cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedPreview {
    /// Name of the generated file inside the previews directory
    pub filename: String,
    /// Modification time of the source at generation time
    pub last_modified: SystemTime,
    /// Size the preview was generated at
    pub size: PreviewSize,
    pub requests_served: u64,
    /// Reserved for future demands
    pub extra: HashMap<i32, Vec<u8>>,
}

impl CachedPreview {
    pub fn new(filename: impl Into<String>, last_modified: SystemTime, size: PreviewSize) -> Self {
        Self {
            filename: filename.into(),
            last_modified,
            size,
            requests_served: 0,
            extra: HashMap::new(),
        }
    }

    /// A preview is stale once the source file is newer than the record or
    /// a different output size is being requested.
    pub fn is_stale(&self, source_modified: SystemTime, requested: PreviewSize) -> bool {
        source_modified > self.last_modified || requested != self.size
    }
}

impl CacheRecord for CachedPreview {
    fn requests_served(&self) -> u64 {
        self.requests_served
    }

    fn set_requests_served(&mut self, count: u64) {
        self.requests_served = count;
    }
}

/// A video thumbnail tracked by the video cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedThumbnail {
    pub version: u32,
    pub filename: String,
    pub last_modified: SystemTime,
    pub requests_served: u64,
    /// Quick thumbnails are served first and replaced by a good-quality
    /// pass later
    pub quick_thumbnail: bool,
}

impl CachedThumbnail {
    pub fn new(filename: impl Into<String>, last_modified: SystemTime, quick: bool) -> Self {
        Self {
            version: THUMBNAIL_FORMAT_VERSION,
            filename: filename.into(),
            last_modified,
            requests_served: 0,
            quick_thumbnail: quick,
        }
    }

    pub fn is_stale(&self, source_modified: SystemTime) -> bool {
        source_modified > self.last_modified
    }
}

impl CacheRecord for CachedThumbnail {
    fn requests_served(&self) -> u64 {
        self.requests_served
    }

    fn set_requests_served(&mut self, count: u64) {
        self.requests_served = count;
    }

    fn format_current(&self) -> bool {
        self.version == THUMBNAIL_FORMAT_VERSION
    }
}

/// Previously read title/description/keyword metadata for one artwork
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtwork {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub requests_served: u64,
}

impl CachedArtwork {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        keywords: Vec<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            keywords,
            requests_served: 0,
        }
    }
}

impl CacheRecord for CachedArtwork {
    fn requests_served(&self) -> u64 {
        self.requests_served
    }

    fn set_requests_served(&mut self, count: u64) {
        self.requests_served = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_preview_staleness() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let size = PreviewSize::new(100, 100);
        let preview = CachedPreview::new("abc.jpg", t0, size);

        assert!(!preview.is_stale(t0, size));
        // Source touched after generation
        assert!(preview.is_stale(t0 + Duration::from_secs(1), size));
        // Different output size requested
        assert!(preview.is_stale(t0, PreviewSize::new(200, 200)));
    }

    #[test]
    fn test_thumbnail_foreign_version_rejected() {
        let mut thumb = CachedThumbnail::new("abc.jpg", SystemTime::now(), true);
        assert!(thumb.format_current());

        thumb.version = THUMBNAIL_FORMAT_VERSION + 1;
        assert!(!thumb.format_current());
    }

    #[test]
    fn test_invalid_preview_size() {
        assert!(PreviewSize::new(100, 100).is_valid());
        assert!(!PreviewSize::new(0, 100).is_valid());
    }
}
