//! Panic recovery for unary handlers.
//!
//! A panic anywhere below this layer, whether while building the response
//! future or while polling it, is reported to the [`CrashReporter`] and turned
//! into an `Internal` status instead of tearing down the connection task.

use ecorpc_core::{ErrorCode, RpcError};
use ecorpc_storage::{panic_message, CrashReporter};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::{Request, Status};
use tower::{Layer, Service};

use crate::status::ToStatus;

/// Layer producing [`Recovery`] services.
#[derive(Clone)]
pub struct RecoveryLayer {
    method: &'static str,
    reporter: Arc<dyn CrashReporter>,
}

impl RecoveryLayer {
    pub fn new(method: &'static str, reporter: Arc<dyn CrashReporter>) -> Self {
        Self { method, reporter }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Recovery {
            inner,
            method: self.method,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

#[derive(Clone)]
pub struct Recovery<S> {
    inner: S,
    method: &'static str,
    reporter: Arc<dyn CrashReporter>,
}

fn recovered(method: &str, reporter: &dyn CrashReporter, payload: &(dyn Any + Send)) -> Status {
    reporter.report(method, &panic_message(payload));
    RpcError::from_code(ErrorCode::Internal).to_status()
}

impl<S, Req> Service<Request<Req>> for Recovery<S>
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
        let method = self.method;
        let reporter = Arc::clone(&self.reporter);

        let future = match catch_unwind(AssertUnwindSafe(|| self.inner.call(request))) {
            Ok(future) => future,
            Err(payload) => {
                let status = recovered(method, reporter.as_ref(), payload.as_ref());
                return Box::pin(async move { Err(status) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(recovered(method, reporter.as_ref(), payload.as_ref())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tower::{service_fn, ServiceExt};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl CrashReporter for Recorder {
        fn report(&self, method: &str, detail: &str) {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(format!("{method}: {detail}"));
            }
        }
    }

    fn explode(_request: Request<()>) -> std::future::Ready<Result<(), Status>> {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_future_panic_becomes_internal() {
        let recorder = Arc::new(Recorder::default());
        let service = RecoveryLayer::new("/shop.Catalog/Get", recorder.clone()).layer(service_fn(
            |_request: Request<()>| async move {
                if true {
                    panic!("poll exploded");
                }
                Ok::<(), Status>(())
            },
        ));

        let status = service.oneshot(Request::new(())).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            ["/shop.Catalog/Get: poll exploded".to_string()]
        );
    }

    #[tokio::test]
    async fn test_call_panic_becomes_internal() {
        let recorder = Arc::new(Recorder::default());
        let service = RecoveryLayer::new("/shop.Catalog/Get", recorder.clone()).layer(service_fn(explode));

        let status = service.oneshot(Request::new(())).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_success_untouched() -> Result<(), Status> {
        let service = RecoveryLayer::new("/shop.Catalog/Get", Arc::new(Recorder::default()))
            .layer(service_fn(|_request: Request<()>| async { Ok::<_, Status>(5u8) }));
        assert_eq!(service.oneshot(Request::new(())).await?, 5);
        Ok(())
    }
}
