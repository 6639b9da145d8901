//! The cache service: owned handle over the registry, the coalescing cache
//! and the cache configuration.
//!
//! Server bootstrap constructs one with [`CacheService::connect`], registers
//! method settings with [`CacheService::configure`], hands clones to the
//! interceptor layers, and calls [`CacheService::shutdown`] on exit. Once shut
//! down, cached methods fail with `NotInitialized` instead of silently
//! reaching their handlers. Calls that would bypass the cache anyway still
//! reach them.

use ecorpc_core::{
    encode_message, CacheError, CacheKey, CacheResult, CacheSetting, MethodDescriptor, Outcome,
};
use ecorpc_storage::{
    CacheBackend, CoalescingCache, ComputeFuture, CrashReporter, EntryPolicy, InMemoryCacheBackend,
    MethodRegistry, RedisCacheBackend, Source, TracingCrashReporter,
};
use prost::Message;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

use crate::config::{BackendKind, RpcCacheConfig};
use crate::identity::{CallIdentity, IdentityHeaders};
use crate::interceptor::CacheLayer;
use crate::status::{rpc_error_from_status, ToStatus};
use crate::telemetry::metrics::metrics;

struct Inner {
    config: RpcCacheConfig,
    headers: IdentityHeaders,
    registry: MethodRegistry,
    /// `None` when caching is globally disabled.
    cache: Option<CoalescingCache<dyn CacheBackend>>,
    reporter: Arc<dyn CrashReporter>,
    running: AtomicBool,
}

/// Cheaply cloneable handle to one cache service.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("enabled", &self.is_enabled())
            .field("running", &self.is_running())
            .field("methods", &self.inner.registry.len())
            .finish()
    }
}

impl CacheService {
    /// Build the service described by `config`, connecting to its backend.
    pub async fn connect(config: RpcCacheConfig) -> CacheResult<Self> {
        Self::connect_with_reporter(config, Arc::new(TracingCrashReporter)).await
    }

    pub async fn connect_with_reporter(
        config: RpcCacheConfig,
        reporter: Arc<dyn CrashReporter>,
    ) -> CacheResult<Self> {
        if !config.enabled {
            tracing::info!("RPC cache disabled");
            return Ok(Self::build(config, None, reporter));
        }

        let backend: Arc<dyn CacheBackend> = match config.backend {
            BackendKind::Memory => Arc::new(InMemoryCacheBackend::new()),
            BackendKind::Redis => {
                Arc::new(RedisCacheBackend::connect(config.redis_backend_config()).await?)
            }
        };
        Ok(Self::build(config, Some(backend), reporter))
    }

    /// Build an enabled service over an existing backend.
    pub fn with_backend(
        config: RpcCacheConfig,
        backend: Arc<dyn CacheBackend>,
        reporter: Arc<dyn CrashReporter>,
    ) -> Self {
        Self::build(config, Some(backend), reporter)
    }

    /// A service that bypasses the cache for every call.
    pub fn disabled() -> Self {
        Self::build(RpcCacheConfig::default(), None, Arc::new(TracingCrashReporter))
    }

    fn build(
        config: RpcCacheConfig,
        backend: Option<Arc<dyn CacheBackend>>,
        reporter: Arc<dyn CrashReporter>,
    ) -> Self {
        let cache = backend.map(|backend| {
            tracing::info!(
                backend = backend.name(),
                timeout_policy = ?config.timeout_policy,
                "RPC cache enabled"
            );
            CoalescingCache::new(backend)
                .with_timeout_policy(config.timeout_policy.into())
                .with_crash_reporter(Arc::clone(&reporter))
                .with_in_flight_observer(Arc::new(|count: usize| {
                    if let Some(metrics) = metrics() {
                        metrics.set_in_flight(count);
                    }
                }))
        });
        let headers = IdentityHeaders {
            user_id: config.user_id_header.clone(),
            platform: config.platform_header.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                headers,
                registry: MethodRegistry::new(),
                cache,
                reporter,
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Replace the registered method settings.
    pub fn configure(&self, settings: impl IntoIterator<Item = CacheSetting>) -> CacheResult<()> {
        self.ensure_running()?;
        self.inner.registry.configure(settings);
        Ok(())
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &RpcCacheConfig {
        &self.inner.config
    }

    pub fn crash_reporter(&self) -> Arc<dyn CrashReporter> {
        Arc::clone(&self.inner.reporter)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.cache.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Executions currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.inner.cache.as_ref().map_or(0, CoalescingCache::in_flight_len)
    }

    /// Backend statistics, when caching is enabled.
    pub async fn stats(&self) -> CacheResult<Option<ecorpc_storage::CacheStats>> {
        match &self.inner.cache {
            Some(cache) => cache.backend().stats().await.map(Some),
            None => Ok(None),
        }
    }

    /// Stop serving from the cache. Later calls to cached methods fail with
    /// `NotInitialized`.
    pub fn shutdown(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            tracing::info!(in_flight = self.in_flight_len(), "RPC cache shut down");
        }
    }

    /// Interceptor layer for one typed method.
    pub fn layer<Req, Resp>(&self, descriptor: MethodDescriptor<Req, Resp>) -> CacheLayer<Req, Resp> {
        CacheLayer::new(self.clone(), descriptor)
    }

    fn ensure_running(&self) -> CacheResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    /// Serve one call, from the cache when the method's setting allows it.
    ///
    /// The call goes straight to `next` when the method has no usable
    /// identifier, caching is disabled, the method has no active setting, or
    /// the setting is anonymous-only and the caller is authenticated. Those
    /// calls are unaffected by [`shutdown`](Self::shutdown). Cache failures
    /// are returned to the caller; they never fall back to `next`.
    pub async fn serve<Req, Resp, F, Fut>(
        &self,
        descriptor: MethodDescriptor<Req, Resp>,
        request: Request<Req>,
        next: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Message + Send + 'static,
        Resp: Message + Default + Send + 'static,
        F: FnOnce(Request<Req>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Response<Resp>, Status>> + Send + 'static,
    {
        let Some(method) = descriptor.identifier() else {
            return next(request).await;
        };
        let Some(cache) = self.inner.cache.as_ref() else {
            return next(request).await;
        };
        let setting = match self.inner.registry.lookup(&method) {
            Some(setting) if setting.is_active() => setting,
            _ => {
                record_lookup(&method, "bypass");
                return next(request).await;
            }
        };

        let identity = CallIdentity::from_request(&request, &self.inner.headers);
        if setting.is_anonymous_only() && identity.is_authenticated() {
            record_lookup(&method, "bypass");
            return next(request).await;
        }

        self.ensure_running().map_err(|e| {
            record_lookup(&method, "error");
            e.to_status()
        })?;

        let key = CacheKey::for_message(&method, request.get_ref(), &identity.platform).map_err(|e| {
            record_lookup(&method, "error");
            tracing::warn!(method = %method, error = %e, "Cache key derivation failed");
            e.to_status()
        })?;

        let compute = move || -> ComputeFuture {
            Box::pin(async move {
                match next(request).await {
                    Ok(response) => match encode_message(response.get_ref()) {
                        Ok(payload) => Outcome::Payload(payload),
                        Err(e) => Outcome::Error(e.to_rpc_error()),
                    },
                    Err(status) => Outcome::Error(rpc_error_from_status(&status)),
                }
            })
        };

        let policy = EntryPolicy::new(setting.ttl()).with_cache_errors(setting.caches_errors());
        let started = Instant::now();
        let served = cache.get(&method, &key, policy, compute).await.map_err(|e| {
            record_lookup(&method, "error");
            tracing::warn!(
                method = %method,
                key = %key.fingerprint(),
                error = %e,
                "Cached call failed"
            );
            e.to_status()
        })?;

        record_lookup(&method, served.source.as_str());
        if served.source == Source::Leader {
            if let Some(metrics) = metrics() {
                metrics.record_compute(&method, started.elapsed().as_secs_f64());
            }
        }
        tracing::debug!(
            method = %method,
            key = %key.fingerprint(),
            source = served.source.as_str(),
            "Cached call served"
        );

        match served.outcome {
            Outcome::Payload(payload) => {
                let decoded = setting.response().decode(&payload).map_err(|e| e.to_status())?;
                let response = decoded.downcast::<Resp>().map_err(|_| {
                    CacheError::internal(format!(
                        "{} is registered with response type {}",
                        method,
                        setting.response().type_name()
                    ))
                    .to_status()
                })?;
                Ok(Response::new(*response))
            }
            Outcome::Error(err) => Err(err.to_status()),
        }
    }
}

fn record_lookup(method: &str, result: &str) {
    if let Some(metrics) = metrics() {
        metrics.record_lookup(method, result);
    }
}
