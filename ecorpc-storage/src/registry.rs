//! Per-method cache policy table.

use ecorpc_core::CacheSetting;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type SettingTable = HashMap<String, Arc<CacheSetting>>;

/// Holds the cache setting of every cached method.
///
/// The table is published as an immutable snapshot: `configure` swaps in a
/// new table and readers clone the `Arc` of whichever table is current, so a
/// lookup never observes a half-applied configuration.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    table: RwLock<Arc<SettingTable>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry already holding `settings`.
    pub fn with_settings(settings: impl IntoIterator<Item = CacheSetting>) -> Self {
        let registry = Self::new();
        registry.configure(settings);
        registry
    }

    /// Replace the whole table. Later duplicates of a method win.
    pub fn configure(&self, settings: impl IntoIterator<Item = CacheSetting>) {
        let table: SettingTable = settings
            .into_iter()
            .map(|setting| (setting.method().to_string(), Arc::new(setting)))
            .collect();
        let count = table.len();
        match self.table.write() {
            Ok(mut guard) => *guard = Arc::new(table),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(table),
        }
        tracing::debug!(methods = count, "Cache method registry configured");
    }

    /// Setting for a method identifier, if one is registered.
    pub fn lookup(&self, method: &str) -> Option<Arc<CacheSetting>> {
        self.snapshot().get(method).cloned()
    }

    /// Current table.
    pub fn snapshot(&self) -> Arc<SettingTable> {
        match self.table.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecorpc_core::{CacheResult, MethodDescriptor};
    use std::time::Duration;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        note: String,
    }

    const GET: MethodDescriptor<Ping, Ping> = MethodDescriptor::new("/shop.Catalog/Get");
    const LIST: MethodDescriptor<Ping, Ping> = MethodDescriptor::new("/shop.Catalog/List");

    #[test]
    fn test_lookup_after_configure() -> CacheResult<()> {
        let registry = MethodRegistry::with_settings([
            CacheSetting::new(GET, Duration::from_secs(10))?,
            CacheSetting::new(LIST, Duration::from_secs(30))?,
        ]);
        assert_eq!(registry.len(), 2);
        let setting = registry.lookup("Catalog.List");
        assert_eq!(setting.map(|s| s.ttl()), Some(Duration::from_secs(30)));
        assert!(registry.lookup("Catalog.Delete").is_none());
        Ok(())
    }

    #[test]
    fn test_configure_replaces_wholesale() -> CacheResult<()> {
        let registry = MethodRegistry::with_settings([CacheSetting::new(GET, Duration::from_secs(10))?]);
        let before = registry.snapshot();

        registry.configure([CacheSetting::new(LIST, Duration::from_secs(5))?]);
        assert!(registry.lookup("Catalog.Get").is_none());
        assert!(registry.lookup("Catalog.List").is_some());
        // Snapshots taken earlier are unaffected.
        assert!(before.contains_key("Catalog.Get"));
        Ok(())
    }

    #[test]
    fn test_later_duplicate_wins() -> CacheResult<()> {
        let registry = MethodRegistry::with_settings([
            CacheSetting::new(GET, Duration::from_secs(10))?,
            CacheSetting::new(GET, Duration::from_secs(20))?.anonymous_only(),
        ]);
        let setting = registry.lookup("Catalog.Get");
        assert!(setting.is_some_and(|s| s.is_anonymous_only()));
        Ok(())
    }
}
