//! Process-local backend.

use async_trait::async_trait;
use ecorpc_core::CacheResult;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{CacheBackend, CacheStats, StatCounters};

#[derive(Debug)]
struct StoredEntry {
    value: Vec<u8>,
    /// `None` when the TTL reaches past the clock's range.
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: Vec<u8>, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// In-memory backend with lazy TTL expiry.
///
/// Expired entries are invisible to `get` and are dropped by
/// [`purge_expired`](Self::purge_expired) or when a write finds the map has
/// grown past its purge threshold.
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, StoredEntry>>,
    purge_threshold: usize,
    counters: StatCounters,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::with_purge_threshold(10_000)
    }

    /// Purge expired entries on write once the map holds this many entries.
    pub fn with_purge_threshold(purge_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            purge_threshold: purge_threshold.max(1),
            counters: StatCounters::default(),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        before - entries.len()
    }

    /// Number of entries held, fresh or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn purge_if_full(&self, entries: &mut HashMap<String, StoredEntry>, now: Instant) {
        if entries.len() >= self.purge_threshold {
            entries.retain(|_, entry| entry.is_fresh(now));
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let value = self
            .entries
            .read()
            .await
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone());
        self.counters.record_read(value.is_some());
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        self.purge_if_full(&mut entries, now);
        entries.insert(key.to_string(), StoredEntry::new(value, now, ttl));
        self.counters.record_write();
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<bool> {
        if ttl.is_zero() {
            return Ok(false);
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_fresh(now)) {
            return Ok(false);
        }
        self.purge_if_full(&mut entries, now);
        entries.insert(key.to_string(), StoredEntry::new(value, now, ttl));
        self.counters.record_write();
        Ok(true)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let count = self.entries.read().await.len() as u64;
        Ok(self.counters.snapshot(Some(count)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
