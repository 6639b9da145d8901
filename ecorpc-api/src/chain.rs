//! Fixed interceptor chain for unary methods.
//!
//! Order, outermost first: panic recovery, telemetry, cache, handler. A panic
//! raised by the handler while it runs outside a coalesced execution is
//! caught by the recovery layer; one raised inside an execution is contained
//! by the coalescing cache and reaches the caller as `Internal`.

use ecorpc_core::MethodDescriptor;
use ecorpc_storage::CrashReporter;
use prost::Message;
use std::future::Future;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tower::{service_fn, ServiceBuilder, ServiceExt};

use crate::recovery::RecoveryLayer;
use crate::service::CacheService;
use crate::telemetry::{TelemetryConfig, TelemetryLayer};

/// Runs unary calls through recovery, telemetry and the cache.
#[derive(Clone)]
pub struct InterceptorChain {
    cache: CacheService,
    reporter: Arc<dyn CrashReporter>,
    record_metrics: bool,
}

impl InterceptorChain {
    /// Chain sharing the cache service's crash reporter.
    pub fn new(cache: CacheService) -> Self {
        let reporter = cache.crash_reporter();
        Self {
            cache,
            reporter,
            record_metrics: true,
        }
    }

    pub fn with_crash_reporter(mut self, reporter: Arc<dyn CrashReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_telemetry(mut self, config: &TelemetryConfig) -> Self {
        self.record_metrics = config.metrics_enabled;
        self
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    /// Serve one call of `descriptor` through the chain.
    pub async fn unary<Req, Resp, H, Fut>(
        &self,
        descriptor: MethodDescriptor<Req, Resp>,
        request: Request<Req>,
        handler: H,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Message + Send + 'static,
        Resp: Message + Default + Send + 'static,
        H: Fn(Request<Req>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Response<Resp>, Status>> + Send + 'static,
    {
        let method = descriptor.path();
        ServiceBuilder::new()
            .layer(RecoveryLayer::new(method, Arc::clone(&self.reporter)))
            .layer(TelemetryLayer::new(method).with_metrics(self.record_metrics))
            .layer(self.cache.layer(descriptor))
            .service(service_fn(handler))
            .oneshot(request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecorpc_core::CacheSetting;
    use ecorpc_storage::InMemoryCacheBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::RpcCacheConfig;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint64, tag = "1")]
        id: u64,
    }

    const PING: MethodDescriptor<Ping, Ping> = MethodDescriptor::new("/ops.v1.Health/Ping");

    #[derive(Default)]
    struct Silent(AtomicUsize);

    impl CrashReporter for Silent {
        fn report(&self, _method: &str, _detail: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_uncached_panic_recovered() {
        let reporter = Arc::new(Silent::default());
        let chain = InterceptorChain::new(CacheService::disabled()).with_crash_reporter(reporter.clone());

        let status = chain
            .unary(PING, Request::new(Ping { id: 1 }), |_request: Request<Ping>| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, Status>(Response::new(Ping::default()))
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(reporter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_panic_contained() {
        let reporter = Arc::new(Silent::default());
        let cache = CacheService::with_backend(
            RpcCacheConfig::in_memory(),
            Arc::new(InMemoryCacheBackend::new()),
            reporter.clone(),
        );
        cache
            .configure([CacheSetting::new(PING, Duration::from_secs(30)).unwrap()])
            .unwrap();
        let chain = InterceptorChain::new(cache);

        let status = chain
            .unary(PING, Request::new(Ping { id: 2 }), |_request: Request<Ping>| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, Status>(Response::new(Ping::default()))
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(reporter.0.load(Ordering::SeqCst), 1);
    }
}
