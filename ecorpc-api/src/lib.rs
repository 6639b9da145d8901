//! ecorpc API - tonic/tower Integration for the RPC Response Cache
//!
//! Wires the coalescing cache into unary gRPC methods:
//! - [`CacheService`]: owned cache handle built from [`RpcCacheConfig`]
//! - [`CacheLayer`]: tower layer caching one typed method
//! - [`InterceptorChain`]: recovery, telemetry and cache in a fixed order
//! - [`ToStatus`]: mapping of business and cache errors onto `tonic::Status`

pub mod chain;
pub mod config;
pub mod identity;
pub mod interceptor;
pub mod recovery;
pub mod service;
pub mod status;
pub mod telemetry;

pub use chain::InterceptorChain;
pub use config::{
    config_file_for_env, BackendKind, RedisType, RpcCacheConfig, TimeoutPolicyKind, CONFIG_ENV_VAR,
};
pub use identity::{AuthenticatedUser, CallIdentity, ClientPlatform, IdentityHeaders};
pub use interceptor::{CacheInterceptor, CacheLayer};
pub use recovery::{Recovery, RecoveryLayer};
pub use service::CacheService;
pub use status::{grpc_code_for, rpc_error_from_status, ToStatus};
pub use telemetry::{init_tracing, render_metrics, LogFormat, TelemetryConfig, TelemetryError};

pub use ecorpc_core::{
    CacheError, CacheKey, CacheResult, CacheSetting, ConfigError, ErrorCode, MethodDescriptor,
    RpcError,
};
pub use ecorpc_storage::{CrashReporter, TimeoutPolicy};
