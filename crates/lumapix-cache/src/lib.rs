//! Lumapix caching layer
//!
//! Three derived-data caches (image previews, video thumbnails, read-back
//! artwork metadata) sharing one design: a durable key-value table, an
//! in-memory write-ahead log absorbing fresh writes, and a bounded memory
//! index serving reads through a WAL -> memory -> table fallback.
//!
//! Writes into a cache are owned by one background worker thread; reads
//! may come from any thread. All I/O failures are recovered locally: the
//! worst case for a caller is recomputing a derived artifact, never wrong
//! data.

pub mod image;
pub mod index;
pub mod metadata;
pub mod records;
pub mod video;
pub mod wal;
pub mod worker;

pub use image::{ImageCacheIndex, PreviewGenerator, PreviewHit, PreviewJob, PreviewRequest};
pub use index::{Backing, TieredCacheIndex};
pub use metadata::MetadataCache;
pub use records::{
    CacheRecord, CachedArtwork, CachedPreview, CachedThumbnail, PreviewSize,
    THUMBNAIL_FORMAT_VERSION,
};
pub use video::{ThumbnailGenerator, ThumbnailHit, ThumbnailJob, ThumbnailRequest, VideoCacheIndex};
pub use wal::{FlushPolicy, WriteAheadLog};
pub use worker::{CacheJob, CacheWorker};
