//! Typed method descriptors and per-method cache settings.

use prost::Message;
use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::envelope::decode_message;
use crate::error::{CacheError, CacheResult};

/// Derive the method identifier from a gRPC path.
///
/// `/shop.v1.Catalog/Get` becomes `v1.Catalog.Get`: everything up to and
/// including the first `.` is dropped and the `/` before the method name
/// becomes a `.`. Returns `None` for paths with no package separator or no
/// method segment.
pub fn method_identifier_from_path(path: &str) -> Option<String> {
    let (_, rest) = path.split_once('.')?;
    let (service, method) = rest.split_once('/')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some(format!("{service}.{method}"))
}

// ============================================================================
// METHOD DESCRIPTOR
// ============================================================================

/// Compile-time description of a unary method: its gRPC path plus request
/// and response message types.
pub struct MethodDescriptor<Req, Resp> {
    path: &'static str,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    pub const fn new(path: &'static str) -> Self {
        Self {
            path,
            _types: PhantomData,
        }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn identifier(&self) -> Option<String> {
        method_identifier_from_path(self.path)
    }
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for MethodDescriptor<Req, Resp> {}

impl<Req, Resp> fmt::Debug for MethodDescriptor<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("path", &self.path)
            .field("request", &type_name::<Req>())
            .field("response", &type_name::<Resp>())
            .finish()
    }
}

// ============================================================================
// RESPONSE FACTORY
// ============================================================================

/// A decoded response whose concrete type is known only to the descriptor.
pub type DecodedResponse = Box<dyn Any + Send>;

type DecodeFn = fn(&[u8]) -> CacheResult<DecodedResponse>;

/// Produces fresh response objects of one message type from cached payloads.
#[derive(Clone, Copy)]
pub struct ResponseFactory {
    type_name: &'static str,
    decode: DecodeFn,
}

impl ResponseFactory {
    pub fn of<M>() -> Self
    where
        M: Message + Default + Send + 'static,
    {
        Self {
            type_name: type_name::<M>(),
            decode: decode_boxed::<M>,
        }
    }

    /// Decode a cached payload into a new response object.
    pub fn decode(&self, payload: &[u8]) -> CacheResult<DecodedResponse> {
        (self.decode)(payload)
    }

    /// An empty response object.
    pub fn empty(&self) -> CacheResult<DecodedResponse> {
        (self.decode)(&[])
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for ResponseFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResponseFactory").field(&self.type_name).finish()
    }
}

fn decode_boxed<M>(payload: &[u8]) -> CacheResult<DecodedResponse>
where
    M: Message + Default + Send + 'static,
{
    decode_message::<M>(payload).map(|message| Box::new(message) as DecodedResponse)
}

// ============================================================================
// CACHE SETTING
// ============================================================================

/// Cache policy for one method. Immutable once registered.
#[derive(Debug, Clone)]
pub struct CacheSetting {
    method: String,
    ttl: Duration,
    anonymous_only: bool,
    cache_errors: bool,
    response: ResponseFactory,
}

impl CacheSetting {
    /// Build a setting for a typed method.
    ///
    /// Fails if the descriptor's path does not yield a usable identifier.
    pub fn new<Req, Resp>(descriptor: MethodDescriptor<Req, Resp>, ttl: Duration) -> CacheResult<Self>
    where
        Resp: Message + Default + Send + 'static,
    {
        let method = descriptor.identifier().ok_or_else(|| {
            CacheError::key_derivation(descriptor.path(), "path has no package.Service/Method form")
        })?;
        if method.contains(':') {
            return Err(CacheError::key_derivation(
                method,
                "method identifier contains the ':' key separator",
            ));
        }
        Ok(Self {
            method,
            ttl,
            anonymous_only: false,
            cache_errors: true,
            response: ResponseFactory::of::<Resp>(),
        })
    }

    /// Only cache calls made without an authenticated identity.
    pub fn anonymous_only(mut self) -> Self {
        self.anonymous_only = true;
        self
    }

    /// Whether business errors are stored like successful responses.
    pub fn cache_errors(mut self, cache_errors: bool) -> Self {
        self.cache_errors = cache_errors;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_anonymous_only(&self) -> bool {
        self.anonymous_only
    }

    pub fn caches_errors(&self) -> bool {
        self.cache_errors
    }

    pub fn response(&self) -> &ResponseFactory {
        &self.response
    }

    /// A zero TTL disables caching for the method.
    pub fn is_active(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// How long a single execution may run before waiters give up.
    pub fn compute_timeout(&self) -> Duration {
        self.ttl / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::encode_message;

    #[derive(Clone, PartialEq, prost::Message)]
    struct GetRequest {
        #[prost(uint64, tag = "1")]
        id: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct GetResponse {
        #[prost(string, tag = "1")]
        title: String,
    }

    const GET: MethodDescriptor<GetRequest, GetResponse> =
        MethodDescriptor::new("/shop.v1.Catalog/Get");

    #[test]
    fn test_identifier_from_path() {
        assert_eq!(
            method_identifier_from_path("/shop.v1.Catalog/Get").as_deref(),
            Some("v1.Catalog.Get")
        );
        assert_eq!(
            method_identifier_from_path("/shop.Catalog/List").as_deref(),
            Some("Catalog.List")
        );
        assert_eq!(method_identifier_from_path("/Catalog/Get"), None);
        assert_eq!(method_identifier_from_path("/shop.Catalog"), None);
        assert_eq!(method_identifier_from_path("/shop.Catalog/"), None);
    }

    #[test]
    fn test_setting_from_descriptor() -> CacheResult<()> {
        let setting = CacheSetting::new(GET, Duration::from_secs(10))?.anonymous_only();
        assert_eq!(setting.method(), "v1.Catalog.Get");
        assert!(setting.is_anonymous_only());
        assert!(setting.caches_errors());
        assert_eq!(setting.compute_timeout(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_zero_ttl_is_inactive() -> CacheResult<()> {
        let setting = CacheSetting::new(GET, Duration::ZERO)?;
        assert!(!setting.is_active());
        Ok(())
    }

    #[test]
    fn test_unusable_path_is_rejected() {
        let bad: MethodDescriptor<GetRequest, GetResponse> = MethodDescriptor::new("/Catalog/Get");
        assert!(matches!(
            CacheSetting::new(bad, Duration::from_secs(1)),
            Err(CacheError::KeyDerivation { .. })
        ));
    }

    #[test]
    fn test_response_factory_decodes_fresh_objects() -> CacheResult<()> {
        let setting = CacheSetting::new(GET, Duration::from_secs(10))?;
        let payload = encode_message(&GetResponse {
            title: "hello".to_string(),
        })?;

        let decoded = setting.response().decode(&payload)?;
        let response = decoded
            .downcast::<GetResponse>()
            .map_err(|_| CacheError::internal("type mismatch"))?;
        assert_eq!(response.title, "hello");

        let empty = setting.response().empty()?;
        assert!(empty.downcast_ref::<GetResponse>().is_some_and(|r| r.title.is_empty()));
        Ok(())
    }
}
