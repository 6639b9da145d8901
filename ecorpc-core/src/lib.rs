//! ecorpc Core - Shared Types for the RPC Response Cache
//!
//! Pure data types and codecs used by the storage and API crates:
//! the business error catalogue, cache errors, the envelope codec,
//! cache key derivation and typed method settings.

pub mod envelope;
pub mod error;
pub mod key;
pub mod method;
pub mod rpc_error;

pub use envelope::{decode_message, decode_outcome, encode_message, encode_outcome, Envelope, Outcome};
pub use error::{CacheError, CacheResult, ConfigError};
pub use key::{CacheKey, KEY_PREFIX};
pub use method::{
    method_identifier_from_path, CacheSetting, DecodedResponse, MethodDescriptor, ResponseFactory,
};
pub use rpc_error::{ErrorCode, RpcError, MIN_BUSINESS_CODE};
