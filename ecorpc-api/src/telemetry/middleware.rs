//! Tower Middleware for RPC Tracing and Metrics
//!
//! Wraps every call with:
//! - a `tracing` span carrying the method path
//! - Prometheus request metrics
//! - a completion log line

use futures_util::future::BoxFuture;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::{Request, Status};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::metrics::metrics;
use crate::status::rpc_error_from_status;
use ecorpc_core::ErrorCode;

/// Layer producing [`Telemetry`] services for one method.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryLayer {
    method: &'static str,
    record_metrics: bool,
}

impl TelemetryLayer {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            record_metrics: true,
        }
    }

    pub fn with_metrics(mut self, record_metrics: bool) -> Self {
        self.record_metrics = record_metrics;
        self
    }
}

impl<S> Layer<S> for TelemetryLayer {
    type Service = Telemetry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Telemetry {
            inner,
            method: self.method,
            record_metrics: self.record_metrics,
        }
    }
}

/// Observability middleware for one unary method.
#[derive(Debug, Clone)]
pub struct Telemetry<S> {
    inner: S,
    method: &'static str,
    record_metrics: bool,
}

impl<S, Req> Service<Request<Req>> for Telemetry<S>
where
    S: Service<Request<Req>, Error = Status>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<'static, Result<S::Response, Status>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        let start = Instant::now();
        let method = self.method;
        let record_metrics = self.record_metrics;
        let span = info_span!("rpc_request", rpc.method = %method, otel.kind = "server");
        let future = self.inner.call(request);

        Box::pin(
            async move {
                let result = future.await;
                let duration = start.elapsed();
                let code = match &result {
                    Ok(_) => ErrorCode::Ok.as_i32(),
                    Err(status) => rpc_error_from_status(status).code,
                };

                if record_metrics {
                    if let Some(metrics) = metrics() {
                        metrics.record_rpc(method, code, duration.as_secs_f64());
                    }
                }

                tracing::info!(
                    method = %method,
                    code,
                    duration_ms = duration.as_millis() as u64,
                    "Request completed"
                );
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::{service_fn, ServiceExt};

    #[tokio::test]
    async fn test_passes_result_through() -> Result<(), Status> {
        let service = TelemetryLayer::new("/shop.Catalog/Get")
            .layer(service_fn(|request: Request<u32>| async move {
                Ok::<_, Status>(request.into_inner() * 2)
            }));
        assert_eq!(service.oneshot(Request::new(21)).await?, 42);
        Ok(())
    }

    #[tokio::test]
    async fn test_passes_error_through() {
        let service = TelemetryLayer::new("/shop.Catalog/Get")
            .with_metrics(false)
            .layer(service_fn(|_request: Request<u32>| async move {
                Err::<u32, _>(Status::not_found("nothing here"))
            }));
        let status = service.oneshot(Request::new(1)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
