//! ecorpc Test Utilities
//!
//! Shared test infrastructure for the ecorpc workspace:
//! - Fixture protobuf messages and method descriptors
//! - A counting article handler with configurable latency
//! - Mock crash reporter and a switchable failing backend
//! - Proptest generators for keys, errors and outcomes
//! - Assertions on statuses carrying business errors

pub use ecorpc_core::{
    CacheError, CacheKey, CacheResult, CacheSetting, ErrorCode, MethodDescriptor, Outcome, RpcError,
};
pub use ecorpc_storage::{CacheBackend, CacheStats, CrashReporter, InMemoryCacheBackend};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::{Code, Request, Response, Status};

// ============================================================================
// FIXTURE MESSAGES
// ============================================================================

pub mod messages {
    //! Hand-written prost messages standing in for generated service types.

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetArticleRequest {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(string, tag = "2")]
        pub locale: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Article {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(string, tag = "2")]
        pub title: String,
        /// Number of handler executions when this response was produced.
        #[prost(uint32, tag = "3")]
        pub revision: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListArticlesRequest {
        #[prost(uint32, tag = "1")]
        pub page: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ArticlePage {
        #[prost(message, repeated, tag = "1")]
        pub articles: Vec<Article>,
    }
}

use messages::{Article, ArticlePage, GetArticleRequest, ListArticlesRequest};

/// `shop.v1.Catalog/GetArticle`, identified as `v1.Catalog.GetArticle`.
pub const GET_ARTICLE: MethodDescriptor<GetArticleRequest, Article> =
    MethodDescriptor::new("/shop.v1.Catalog/GetArticle");

pub const LIST_ARTICLES: MethodDescriptor<ListArticlesRequest, ArticlePage> =
    MethodDescriptor::new("/shop.v1.Catalog/ListArticles");

/// A path that yields no method identifier.
pub const MALFORMED_METHOD: MethodDescriptor<GetArticleRequest, Article> =
    MethodDescriptor::new("GetArticle");

/// Article id the handler answers with a business `NotFound` error.
pub const MISSING_ARTICLE_ID: u64 = 404;

/// Article id the handler answers with a plain `Unavailable` status.
pub const UNSTABLE_ARTICLE_ID: u64 = 503;

// ============================================================================
// HANDLERS
// ============================================================================

/// Article handler counting its executions.
///
/// Responds after `delay` with an [`Article`] whose `revision` is the
/// execution count, so repeated executions are observable in responses.
#[derive(Debug, Clone, Default)]
pub struct ArticleHandler {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl ArticleHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn handle(
        &self,
        request: Request<GetArticleRequest>,
    ) -> impl std::future::Future<Output = Result<Response<Article>, Status>> + Send + 'static {
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        async move {
            let revision = calls.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let GetArticleRequest { id, locale } = request.into_inner();
            match id {
                MISSING_ARTICLE_ID => Err(business_status(RpcError::with_message(
                    ErrorCode::NotFound,
                    format!("article {id} not found"),
                ))),
                UNSTABLE_ARTICLE_ID => Err(Status::unavailable("catalog replica unreachable")),
                _ => Ok(Response::new(Article {
                    id,
                    title: format!("article-{id}-{locale}"),
                    revision,
                })),
            }
        }
    }
}

/// Status carrying a business error the way the service layer encodes it.
pub fn business_status(err: RpcError) -> Status {
    let code = match err.http_class() {
        404 => Code::NotFound,
        429 => Code::ResourceExhausted,
        _ => Code::Internal,
    };
    Status::new(code, err.to_wire_message())
}

// ============================================================================
// MOCKS
// ============================================================================

/// Crash reporter remembering every report.
#[derive(Debug, Default)]
pub struct RecordingCrashReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingCrashReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(method, detail)` pairs in report order.
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl CrashReporter for RecordingCrashReporter {
    fn report(&self, method: &str, detail: &str) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push((method.to_string(), detail.to_string()));
        }
    }
}

/// In-memory backend whose reads and writes can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: InMemoryCacheBackend,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryCacheBackend::new(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryCacheBackend {
        &self.inner
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::backend("connection refused"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::backend("connection refused"));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ecorpc types.

    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    /// Method identifiers in `pkg.Service.Method` form.
    pub fn arb_method() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,6}\\.[A-Z][A-Za-z]{0,8}\\.[A-Z][A-Za-z]{0,8}"
    }

    /// Client platforms, including the empty "unknown" platform.
    pub fn arb_platform() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("ios".to_string()),
            Just("android".to_string()),
            "[a-z:/ -]{1,12}",
        ]
    }

    pub fn arb_request_bytes() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..64)
    }

    /// Errors in the business range.
    pub fn arb_business_error() -> impl Strategy<Value = RpcError> {
        (40000i32..50000, "[ -~]{0,32}").prop_map(|(code, message)| RpcError::new(code, message))
    }

    pub fn arb_outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..128)
                .prop_map(|payload| Outcome::Payload(Bytes::from(payload))),
            arb_business_error().prop_map(Outcome::Error),
        ]
    }

    pub fn arb_get_article_request() -> impl Strategy<Value = GetArticleRequest> {
        (1u64..10_000, "[a-z]{2}").prop_map(|(id, locale)| GetArticleRequest { id, locale })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on call results.

    use super::*;

    /// Assert that `status` carries the business error `code`.
    #[track_caller]
    pub fn assert_business_error(status: &Status, code: ErrorCode) {
        let err = RpcError::from_wire_message(status.message());
        assert!(
            err.is(code),
            "Expected business error {:?}, got {:?} (status {:?})",
            code,
            err,
            status.code()
        );
    }

    /// Assert the gRPC code of a failed call.
    #[track_caller]
    pub fn assert_status_code<T: std::fmt::Debug>(result: &Result<T, Status>, expected: Code) {
        match result {
            Err(status) => assert_eq!(status.code(), expected, "Unexpected status: {:?}", status),
            Ok(value) => panic!("Expected {:?} status, got Ok: {:?}", expected, value),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
