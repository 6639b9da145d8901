//! Error types for cache operations

use std::time::Duration;
use thiserror::Error;

use crate::rpc_error::{ErrorCode, RpcError};

/// Failures of the cache path itself, as opposed to business outcomes.
///
/// Every variant is `Clone` because one resolution is delivered to every
/// caller waiting on the same in-flight execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache key derivation failed for {method}: {reason}")]
    KeyDerivation { method: String, reason: String },

    #[error("Call {method} did not finish within {waited:?}")]
    Timeout { method: String, waited: Duration },

    #[error("Cache backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Failed to marshal cached outcome: {reason}")]
    Marshal { reason: String },

    #[error("Failed to unmarshal cached outcome: {reason}")]
    Unmarshal { reason: String },

    #[error("Cache service is not running")]
    NotInitialized,

    #[error("Cache internal error: {reason}")]
    Internal { reason: String },
}

impl CacheError {
    pub fn key_derivation(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyDerivation {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn marshal(reason: impl Into<String>) -> Self {
        Self::Marshal {
            reason: reason.into(),
        }
    }

    pub fn unmarshal(reason: impl Into<String>) -> Self {
        Self::Unmarshal {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Catalogued code reported to callers for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CacheError::KeyDerivation { .. } | CacheError::Marshal { .. } => {
                ErrorCode::RpcCacheMarshal
            }
            CacheError::Timeout { .. } => ErrorCode::RpcCacheTimeout,
            CacheError::Unmarshal { .. } => ErrorCode::RpcCacheUnmarshal,
            CacheError::BackendUnavailable { .. }
            | CacheError::NotInitialized
            | CacheError::Internal { .. } => ErrorCode::RpcCache,
        }
    }

    /// Structured error handed to the caller. Internal details stay in logs.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::from_code(self.error_code())
    }
}

/// Configuration errors raised while loading or validating settings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Unrecognized config file type: {path}")]
    UnsupportedFormat { path: String },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_timeout_code() {
        let err = CacheError::Timeout {
            method: "Catalog.Get".to_string(),
            waited: Duration::from_millis(2500),
        };
        assert_eq!(err.error_code(), ErrorCode::RpcCacheTimeout);
        assert!(err.to_string().contains("Catalog.Get"));
    }

    #[test]
    fn test_rpc_error_hides_reason() {
        let err = CacheError::backend("connection refused (os error 111)");
        let rpc = err.to_rpc_error();
        assert!(rpc.is(ErrorCode::RpcCache));
        assert!(!rpc.message.contains("111"));
    }

    #[test]
    fn test_key_derivation_code() {
        let err = CacheError::key_derivation("", "empty method identifier");
        assert_eq!(err.error_code(), ErrorCode::RpcCacheMarshal);
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "redis_type".to_string(),
            value: "mesh".to_string(),
            reason: "expected cluster or ring".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("redis_type"));
        assert!(msg.contains("mesh"));
    }
}
