//! Tower layer placing the cache in front of one typed unary method.

use ecorpc_core::MethodDescriptor;
use futures_util::future::BoxFuture;
use prost::Message;
use std::fmt;
use std::task::{Context, Poll};
use tonic::{Request, Response, Status};
use tower::{Layer, Service};

use crate::service::CacheService;

/// Layer producing [`CacheInterceptor`] services.
pub struct CacheLayer<Req, Resp> {
    service: CacheService,
    descriptor: MethodDescriptor<Req, Resp>,
}

impl<Req, Resp> CacheLayer<Req, Resp> {
    pub fn new(service: CacheService, descriptor: MethodDescriptor<Req, Resp>) -> Self {
        Self {
            service,
            descriptor,
        }
    }
}

impl<Req, Resp> Clone for CacheLayer<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            descriptor: self.descriptor,
        }
    }
}

impl<Req, Resp> fmt::Debug for CacheLayer<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("method", &self.descriptor.path())
            .finish()
    }
}

impl<S, Req, Resp> Layer<S> for CacheLayer<Req, Resp> {
    type Service = CacheInterceptor<S, Req, Resp>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheInterceptor {
            inner,
            service: self.service.clone(),
            descriptor: self.descriptor,
        }
    }
}

/// Serves one method through a [`CacheService`], calling `inner` on a miss.
pub struct CacheInterceptor<S, Req, Resp> {
    inner: S,
    service: CacheService,
    descriptor: MethodDescriptor<Req, Resp>,
}

impl<S: Clone, Req, Resp> Clone for CacheInterceptor<S, Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            service: self.service.clone(),
            descriptor: self.descriptor,
        }
    }
}

impl<S, Req, Resp> Service<Request<Req>> for CacheInterceptor<S, Req, Resp>
where
    S: Service<Request<Req>, Response = Response<Resp>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Message + Send + 'static,
    Resp: Message + Default + Send + 'static,
{
    type Response = Response<Resp>;
    type Error = Status;
    type Future = BoxFuture<'static, Result<Response<Resp>, Status>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let service = self.service.clone();
        let descriptor = self.descriptor;

        Box::pin(async move {
            service
                .serve(descriptor, request, move |request| inner.call(request))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecorpc_core::CacheSetting;
    use ecorpc_storage::{InMemoryCacheBackend, TracingCrashReporter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    use crate::config::RpcCacheConfig;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Query {
        #[prost(string, tag = "1")]
        term: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Answer {
        #[prost(uint32, tag = "1")]
        hits: u32,
    }

    const SEARCH: MethodDescriptor<Query, Answer> = MethodDescriptor::new("/shop.v1.Search/Find");

    fn service() -> CacheService {
        CacheService::with_backend(
            RpcCacheConfig::in_memory(),
            Arc::new(InMemoryCacheBackend::new()),
            Arc::new(TracingCrashReporter),
        )
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() -> Result<(), Status> {
        let cache = service();
        cache
            .configure([CacheSetting::new(SEARCH, Duration::from_secs(60))
                .map_err(|e| Status::internal(e.to_string()))?])
            .map_err(|e| Status::internal(e.to_string()))?;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = service_fn(move |request: Request<Query>| {
            let counter = counter.clone();
            async move {
                let hits = counter.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                Ok::<_, Status>(Response::new(Answer {
                    hits: hits * request.get_ref().term.len() as u32,
                }))
            }
        });
        let interceptor = cache.layer(SEARCH).layer(handler);

        let request = || Request::new(Query { term: "lamp".into() });
        let first = interceptor.clone().oneshot(request()).await?;
        let second = interceptor.oneshot(request()).await?;

        assert_eq!(first.get_ref(), second.get_ref());
        assert_eq!(first.get_ref().hits, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unregistered_method_reaches_handler() -> Result<(), Status> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let interceptor = service().layer(SEARCH).layer(service_fn(move |_request: Request<Query>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Status>(Response::new(Answer { hits: 1 })) }
        }));

        for _ in 0..3 {
            interceptor
                .clone()
                .oneshot(Request::new(Query::default()))
                .await?;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }
}
