//! Cache key derivation.
//!
//! Keys have the shape `rpc:<method>:<request>:<platform>` where `<request>`
//! is the URL-safe, unpadded base64 of the request's protobuf encoding. The
//! base64 alphabet never contains `:`, and method identifiers are rejected if
//! they do, so the first and last separators are unambiguous and distinct
//! inputs always yield distinct keys.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use prost::Message;
use std::fmt;

use crate::error::{CacheError, CacheResult};

/// Prefix shared by every key this crate produces.
pub const KEY_PREFIX: &str = "rpc";

const SEPARATOR: char = ':';

/// Deterministic cache key for one (method, request, platform) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from already-serialized request bytes.
    pub fn derive(method: &str, request: &[u8], platform: &str) -> CacheResult<Self> {
        validate_method(method)?;
        let encoded = URL_SAFE_NO_PAD.encode(request);
        Ok(Self(format!(
            "{KEY_PREFIX}{SEPARATOR}{method}{SEPARATOR}{encoded}{SEPARATOR}{platform}"
        )))
    }

    /// Derive a key from a request message.
    pub fn for_message<M: Message>(method: &str, request: &M, platform: &str) -> CacheResult<Self> {
        validate_method(method)?;
        let mut buf = Vec::with_capacity(request.encoded_len());
        request
            .encode(&mut buf)
            .map_err(|e| CacheError::key_derivation(method, e.to_string()))?;
        Self::derive(method, &buf, platform)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Short prefix of the request segment, suitable for log fields.
    pub fn fingerprint(&self) -> &str {
        let request = self.0.splitn(4, SEPARATOR).nth(2).unwrap_or_default();
        let end = request.len().min(12);
        &request[..end]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_method(method: &str) -> CacheResult<()> {
    if method.is_empty() {
        return Err(CacheError::key_derivation(method, "empty method identifier"));
    }
    if method.contains(SEPARATOR) {
        return Err(CacheError::key_derivation(
            method,
            "method identifier contains the ':' key separator",
        ));
    }
    Ok(())
}
