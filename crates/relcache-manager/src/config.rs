//! Cache configuration options

use relcache_columnar::EncoderOptions;
use relcache_exec::RelationConfig;
use relcache_store::StorageLevel;
use std::time::Duration;

/// Configuration for the cache manager and the relations it creates.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Storage level used when callers do not pick one.
    pub default_storage_level: StorageLevel,
    /// Rows per columnar block.
    pub rows_per_block: usize,
    /// Dictionary encoding is only considered below this cardinality.
    pub dictionary_max_cardinality: usize,
    /// Values whose encoded form exceeds this fall back to plain encoding.
    pub value_size_guard: usize,
    /// Bound on the wait for confirmed eviction during blocking uncache.
    pub eviction_wait: Duration,
    /// Poll interval while waiting for eviction confirmation.
    pub eviction_retry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_storage_level: StorageLevel::MEMORY_AND_DISK,
            rows_per_block: 10_000,
            dictionary_max_cardinality: 4096,
            value_size_guard: 1024 * 1024,
            eviction_wait: Duration::from_secs(5),
            eviction_retry: Duration::from_millis(10),
        }
    }
}

impl CacheConfig {
    pub fn with_default_storage_level(mut self, level: StorageLevel) -> Self {
        self.default_storage_level = level;
        self
    }

    pub fn with_rows_per_block(mut self, rows: usize) -> Self {
        self.rows_per_block = rows;
        self
    }

    pub fn with_dictionary_max_cardinality(mut self, cardinality: usize) -> Self {
        self.dictionary_max_cardinality = cardinality;
        self
    }

    pub fn with_value_size_guard(mut self, bytes: usize) -> Self {
        self.value_size_guard = bytes;
        self
    }

    pub fn with_eviction_wait(mut self, wait: Duration) -> Self {
        self.eviction_wait = wait;
        self
    }

    pub(crate) fn relation_config(&self) -> RelationConfig {
        RelationConfig {
            rows_per_block: self.rows_per_block,
            encoder: EncoderOptions {
                dictionary_max_cardinality: self.dictionary_max_cardinality,
                value_size_guard: self.value_size_guard,
            },
            eviction_wait: self.eviction_wait,
            eviction_retry: self.eviction_retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.default_storage_level, StorageLevel::MEMORY_AND_DISK);
        assert_eq!(config.rows_per_block, 10_000);
        assert_eq!(config.eviction_wait, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_pattern() {
        let config = CacheConfig::default()
            .with_default_storage_level(StorageLevel::MEMORY_ONLY)
            .with_rows_per_block(512)
            .with_eviction_wait(Duration::from_millis(100));

        assert_eq!(config.default_storage_level, StorageLevel::MEMORY_ONLY);
        assert_eq!(config.rows_per_block, 512);
        let relation = config.relation_config();
        assert_eq!(relation.rows_per_block, 512);
        assert_eq!(relation.eviction_wait, Duration::from_millis(100));
    }
}
