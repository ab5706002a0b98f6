//! Cache configuration.

use std::time::Duration;

/// Default memory-index capacity. Debug builds keep this tiny so eviction
/// paths are exercised constantly during development.
const MAX_MEMORY_ITEMS: usize = if cfg!(debug_assertions) { 10 } else { 10_000 };

/// Tuning knobs for the memory-index eviction cascade.
///
/// The divisors and the escape fraction are empirically chosen values
/// carried over unchanged; eviction behavior is tuned for parity, not
/// re-derived.
#[derive(Clone, Debug)]
pub struct CompactionConfig {
    /// Memory-index size that triggers compaction
    pub max_memory_items: usize,
    /// First pass removes entries with counter <= watermark / this
    pub primary_divisor: u64,
    /// Second pass removes entries with counter <= watermark / this
    pub secondary_divisor: u64,
    /// A pass freed enough once more than max_memory_items / this entries
    /// are gone; otherwise the cascade continues
    pub escape_fraction: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_memory_items: MAX_MEMORY_ITEMS,
            primary_divisor: 4,
            secondary_divisor: 2,
            escape_fraction: 10,
        }
    }
}

impl CompactionConfig {
    /// Config with a specific capacity, keeping the stock thresholds
    pub fn with_capacity(max_memory_items: usize) -> Self {
        Self {
            max_memory_items,
            ..Self::default()
        }
    }
}

/// Service-level cache settings
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub compaction: CompactionConfig,
    /// The owning worker syncs after this many processed items
    pub sync_backup_step: usize,
    /// How long the registry waits for caches to finalize before closing
    /// stores anyway
    pub shutdown_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compaction: CompactionConfig::default(),
            sync_backup_step: 50,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = CompactionConfig::default();
        assert_eq!(config.primary_divisor, 4);
        assert_eq!(config.secondary_divisor, 2);
        assert_eq!(config.escape_fraction, 10);
    }

    #[test]
    fn test_with_capacity_keeps_thresholds() {
        let config = CompactionConfig::with_capacity(64);
        assert_eq!(config.max_memory_items, 64);
        assert_eq!(config.primary_divisor, 4);
    }
}
