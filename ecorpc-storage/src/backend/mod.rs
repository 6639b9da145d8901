//! Backing key-value stores for cached envelopes.
//!
//! A backend stores opaque bytes under string keys with a per-entry
//! time-to-live. Eviction beyond TTL expiry is the store's own business.

mod memory;
mod redis;

pub use self::memory::InMemoryCacheBackend;
pub use self::redis::{normalize_address, RedisBackendConfig, RedisCacheBackend, RedisTopology};

use async_trait::async_trait;
use ecorpc_core::CacheResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache backend trait for pluggable stores.
///
/// Implementations must be safe to share between tasks. A `get` returns
/// `None` once the entry's TTL has elapsed. Any failure to reach the store is
/// reported as `CacheError::BackendUnavailable`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the stored bytes for a key, if present and fresh.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store bytes under a key, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Store bytes only when no fresh entry exists. Returns whether the write
    /// happened.
    ///
    /// The default reads then writes and is not atomic; bundled backends
    /// override it.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<bool> {
        if ttl.is_zero() || self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    /// Get cache statistics.
    async fn stats(&self) -> CacheResult<CacheStats>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found a fresh entry.
    pub hits: u64,
    /// Number of reads that found nothing.
    pub misses: u64,
    /// Number of successful writes.
    pub writes: u64,
    /// Entries currently held, when the backend can tell.
    pub entry_count: Option<u64>,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Counters shared by the bundled backends.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl StatCounters {
    pub(crate) fn record_read(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entry_count: Option<u64>) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            entry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = StatCounters::default();
        counters.record_read(true);
        counters.record_read(false);
        counters.record_read(false);
        counters.record_write();
        let stats = counters.snapshot(Some(1));
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.entry_count, Some(1));
    }
}
