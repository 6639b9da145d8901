//! Conversions between structured errors and `tonic::Status`.
//!
//! A business error travels as a status whose message is the error's JSON
//! form and whose gRPC code is picked from the HTTP-like class in the first
//! three digits of the error code. Anything else coming back from a handler
//! is an unstructured failure and keeps its original gRPC code.

use ecorpc_core::{CacheError, ErrorCode, RpcError};
use tonic::{Code, Status};

// ============================================================================
// CONVERSION HELPERS
// ============================================================================

/// Convert a value into the status returned to the caller.
pub trait ToStatus {
    fn to_status(&self) -> Status;
}

impl ToStatus for RpcError {
    fn to_status(&self) -> Status {
        if self.is(ErrorCode::InternalFromString) {
            let code = self.transport_code.map(Code::from).unwrap_or(Code::Unknown);
            return Status::new(code, self.message.clone());
        }
        Status::new(grpc_code_for(self), self.to_wire_message())
    }
}

impl ToStatus for CacheError {
    fn to_status(&self) -> Status {
        let code = match self {
            CacheError::KeyDerivation { .. } => Code::InvalidArgument,
            CacheError::Timeout { .. } => Code::DeadlineExceeded,
            CacheError::BackendUnavailable { .. } => Code::Unavailable,
            CacheError::Marshal { .. }
            | CacheError::Unmarshal { .. }
            | CacheError::NotInitialized
            | CacheError::Internal { .. } => Code::Internal,
        };
        Status::new(code, self.to_rpc_error().to_wire_message())
    }
}

/// gRPC code for a structured error, from its HTTP-like class.
pub fn grpc_code_for(err: &RpcError) -> Code {
    match err.http_class() {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::AlreadyExists,
        412 => Code::FailedPrecondition,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        500 => Code::Internal,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        _ => Code::Unknown,
    }
}

/// Recover the structured error carried by a status.
///
/// Statuses that do not carry one become `InternalFromString` errors that
/// remember the original gRPC code.
pub fn rpc_error_from_status(status: &Status) -> RpcError {
    let err = RpcError::from_wire_message(status.message());
    if err.is(ErrorCode::InternalFromString) {
        RpcError::unstructured(status.message(), Some(status.code() as i32))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_business_error_round_trip() {
        let err = RpcError::with_message(ErrorCode::NotFound, "article 7 not found");
        let status = err.to_status();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(rpc_error_from_status(&status), err);
    }

    #[test]
    fn test_code_classes() {
        assert_eq!(grpc_code_for(&RpcError::from_code(ErrorCode::TooManyRequests)), Code::ResourceExhausted);
        assert_eq!(grpc_code_for(&RpcError::from_code(ErrorCode::Params)), Code::Internal);
        assert_eq!(grpc_code_for(&RpcError::new(40100, "login first")), Code::Unauthenticated);
        assert_eq!(grpc_code_for(&RpcError::new(70000, "odd")), Code::Unknown);
    }

    #[test]
    fn test_plain_status_keeps_code_and_message() {
        let status = Status::unavailable("upstream connection reset");
        let err = rpc_error_from_status(&status);
        assert!(err.is(ErrorCode::InternalFromString));
        assert!(!err.is_business());

        let back = err.to_status();
        assert_eq!(back.code(), Code::Unavailable);
        assert_eq!(back.message(), "upstream connection reset");
    }

    #[test]
    fn test_cache_error_status() {
        let timeout = CacheError::Timeout {
            method: "Catalog.Get".to_string(),
            waited: Duration::from_secs(1),
        };
        let status = timeout.to_status();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(rpc_error_from_status(&status).is(ErrorCode::RpcCacheTimeout));

        let down = CacheError::backend("connection refused").to_status();
        assert_eq!(down.code(), Code::Unavailable);
        assert!(rpc_error_from_status(&down).is(ErrorCode::RpcCache));

        let bad_key = CacheError::key_derivation("a:b", "separator").to_status();
        assert_eq!(bad_key.code(), Code::InvalidArgument);
        assert!(rpc_error_from_status(&bad_key).is(ErrorCode::RpcCacheMarshal));

        assert_eq!(CacheError::NotInitialized.to_status().code(), Code::Internal);
    }
}
