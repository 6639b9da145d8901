//! ecorpc Storage - Cache Backends and Coalescing
//!
//! Defines the backing-store abstraction, the per-method policy registry and
//! the coalescing cache that guarantees one in-flight execution per key.

pub mod backend;
pub mod coalesce;
pub mod registry;

pub use backend::{
    CacheBackend, CacheStats, InMemoryCacheBackend, RedisBackendConfig, RedisCacheBackend,
    RedisTopology,
};
pub use coalesce::{
    panic_message, CoalescingCache, ComputeFuture, CrashReporter, EntryPolicy, InFlightObserver, Served,
    Source, TimeoutPolicy, TracingCrashReporter,
};
pub use registry::MethodRegistry;
