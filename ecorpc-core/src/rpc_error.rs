//! Structured business errors carried across the RPC boundary.
//!
//! Handlers report application failures as an [`RpcError`]: a numeric code
//! plus a human-readable message. Codes follow an HTTP-flavoured layout: the
//! first three digits name the closest HTTP status class and the last two
//! digits enumerate errors within that class (`40400` is "not found",
//! `50015` is "rpc cache timeout"). Codes below [`MIN_BUSINESS_CODE`] are
//! never produced by handlers and are treated as unstructured failures.
//!
//! On the wire a business error travels as the JSON object
//! `{"code":40400,"message":"..."}`, which is what [`RpcError::to_wire_message`]
//! produces and [`RpcError::from_wire_message`] parses back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest code that counts as a structured business error.
pub const MIN_BUSINESS_CODE: i32 = 10_000;

// ============================================================================
// ERROR CODE CATALOGUE
// ============================================================================

/// Well-known error codes shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    NotFound,
    TooManyRequests,
    BanIp,
    Internal,
    /// An error that could not be parsed as a structured error.
    InternalFromString,
    Database,
    IllegalJson,
    Params,
    RpcCache,
    RpcCacheMarshal,
    RpcCacheUnmarshal,
    IllegalToken,
    NotImplemented,
    NoData,
    Duplicate,
    OtherClientSignIn,
    UserBan,
    TokenExpired,
    RpcCacheTimeout,
    ServerTooBusy,
}

impl ErrorCode {
    /// Every catalogued code, in numeric order.
    pub const ALL: [ErrorCode; 21] = [
        ErrorCode::Ok,
        ErrorCode::NotFound,
        ErrorCode::TooManyRequests,
        ErrorCode::BanIp,
        ErrorCode::Internal,
        ErrorCode::InternalFromString,
        ErrorCode::Database,
        ErrorCode::IllegalJson,
        ErrorCode::Params,
        ErrorCode::RpcCache,
        ErrorCode::RpcCacheMarshal,
        ErrorCode::RpcCacheUnmarshal,
        ErrorCode::IllegalToken,
        ErrorCode::NotImplemented,
        ErrorCode::NoData,
        ErrorCode::Duplicate,
        ErrorCode::OtherClientSignIn,
        ErrorCode::UserBan,
        ErrorCode::TokenExpired,
        ErrorCode::RpcCacheTimeout,
        ErrorCode::ServerTooBusy,
    ];

    /// Numeric value of this code.
    pub const fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Ok => 20000,
            ErrorCode::NotFound => 40400,
            ErrorCode::TooManyRequests => 42900,
            ErrorCode::BanIp => 42901,
            ErrorCode::Internal => 50000,
            ErrorCode::InternalFromString => 50001,
            ErrorCode::Database => 50002,
            ErrorCode::IllegalJson => 50003,
            ErrorCode::Params => 50004,
            ErrorCode::RpcCache => 50005,
            ErrorCode::RpcCacheMarshal => 50006,
            ErrorCode::RpcCacheUnmarshal => 50007,
            ErrorCode::IllegalToken => 50008,
            ErrorCode::NotImplemented => 50009,
            ErrorCode::NoData => 50010,
            ErrorCode::Duplicate => 50011,
            ErrorCode::OtherClientSignIn => 50012,
            ErrorCode::UserBan => 50013,
            ErrorCode::TokenExpired => 50014,
            ErrorCode::RpcCacheTimeout => 50015,
            ErrorCode::ServerTooBusy => 50016,
        }
    }

    /// Look up a catalogued code by its numeric value.
    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_i32() == code)
    }

    /// Default message for this code.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::NotFound => "The requested resource does not exist",
            ErrorCode::TooManyRequests => "Too many requests, please retry later",
            ErrorCode::BanIp => "IP address is blocked",
            ErrorCode::Internal => "Internal error",
            ErrorCode::InternalFromString => "[Should never be returned]",
            ErrorCode::Database => "Database operation failed",
            ErrorCode::IllegalJson => "Malformed JSON",
            ErrorCode::Params => "Invalid parameters",
            ErrorCode::RpcCache => "RPC cache error",
            ErrorCode::RpcCacheMarshal => "RPC cache marshal error",
            ErrorCode::RpcCacheUnmarshal => "RPC cache unmarshal error",
            ErrorCode::IllegalToken => "Illegal token",
            ErrorCode::NotImplemented => "Not implemented",
            ErrorCode::NoData => "No data",
            ErrorCode::Duplicate => "Record already exists",
            ErrorCode::OtherClientSignIn => "Signed in from another client",
            ErrorCode::UserBan => "User is banned",
            ErrorCode::TokenExpired => "Token expired",
            ErrorCode::RpcCacheTimeout => "RPC cache timeout",
            ErrorCode::ServerTooBusy => "Server is busy, please retry later",
        }
    }

    /// Codes raised by the cache machinery itself rather than by a handler.
    ///
    /// These never describe the outcome of a call and are never stored.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            ErrorCode::InternalFromString
                | ErrorCode::RpcCache
                | ErrorCode::RpcCacheMarshal
                | ErrorCode::RpcCacheUnmarshal
                | ErrorCode::RpcCacheTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

// ============================================================================
// RPC ERROR
// ============================================================================

/// A structured error: numeric code and message.
///
/// Two errors are the same error when code and message match;
/// `transport_code` only remembers the gRPC status code of an unstructured
/// failure so it can be returned to the caller unchanged. It is never
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip)]
    pub transport_code: Option<i32>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            transport_code: None,
        }
    }

    /// Build an error from a catalogued code using its default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code.as_i32(), code.default_message())
    }

    /// Build an error from a catalogued code with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.as_i32(), message)
    }

    /// Wrap a free-form failure that is not a structured error.
    pub fn unstructured(message: impl Into<String>, transport_code: Option<i32>) -> Self {
        Self {
            code: ErrorCode::InternalFromString.as_i32(),
            message: message.into(),
            transport_code,
        }
    }

    /// The catalogued code, if this error uses one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.code)
    }

    /// Whether this error carries the given catalogued code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.as_i32()
    }

    /// HTTP-like status class (`40400` → `404`).
    pub fn http_class(&self) -> i32 {
        self.code / 100
    }

    /// Whether this is an application error a handler deliberately returned.
    ///
    /// Only business errors are eligible for caching.
    pub fn is_business(&self) -> bool {
        self.code >= MIN_BUSINESS_CODE
            && !self.error_code().is_some_and(ErrorCode::is_infrastructure)
    }

    /// JSON representation placed in the status message on the wire.
    pub fn to_wire_message(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"message":"{}"}}"#, self.code, self.message.escape_default())
        })
    }

    /// Parse a wire message back into a structured error.
    ///
    /// Anything that is not a JSON object with a business-range code becomes
    /// an `InternalFromString` error whose message is the raw input.
    pub fn from_wire_message(raw: &str) -> Self {
        match serde_json::from_str::<RpcError>(raw) {
            Ok(err) if err.code >= MIN_BUSINESS_CODE => err,
            _ => Self::unstructured(raw, None),
        }
    }
}

impl From<ErrorCode> for RpcError {
    fn from(code: ErrorCode) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_codes_are_unique() {
        let codes: HashSet<i32> = ErrorCode::ALL.iter().map(|c| c.as_i32()).collect();
        assert_eq!(codes.len(), ErrorCode::ALL.len());
    }

    #[test]
    fn test_from_i32_round_trips_catalogue() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(12345), None);
    }

    #[test]
    fn test_wire_message_round_trip() {
        let err = RpcError::with_message(ErrorCode::NotFound, "article 7 not found");
        let wire = err.to_wire_message();
        assert!(wire.contains("40400"));
        assert_eq!(RpcError::from_wire_message(&wire), err);
    }

    #[test]
    fn test_wire_message_skips_transport_code() {
        let err = RpcError::unstructured("boom", Some(5));
        assert!(!err.to_wire_message().contains("transport"));
    }

    #[test]
    fn test_unparseable_message_is_unstructured() {
        let err = RpcError::from_wire_message("connection reset by peer");
        assert!(err.is(ErrorCode::InternalFromString));
        assert_eq!(err.message, "connection reset by peer");
        assert!(!err.is_business());
    }

    #[test]
    fn test_low_code_is_unstructured() {
        let err = RpcError::from_wire_message(r#"{"code":404,"message":"nope"}"#);
        assert!(err.is(ErrorCode::InternalFromString));
    }

    #[test]
    fn test_business_classification() {
        assert!(RpcError::from_code(ErrorCode::NotFound).is_business());
        assert!(RpcError::from_code(ErrorCode::Internal).is_business());
        assert!(RpcError::new(60201, "custom").is_business());
        assert!(!RpcError::from_code(ErrorCode::RpcCacheTimeout).is_business());
        assert!(!RpcError::from_code(ErrorCode::RpcCacheMarshal).is_business());
        assert!(!RpcError::new(500, "too small").is_business());
    }

    #[test]
    fn test_http_class() {
        assert_eq!(RpcError::from_code(ErrorCode::NotFound).http_class(), 404);
        assert_eq!(RpcError::from_code(ErrorCode::BanIp).http_class(), 429);
    }
}
