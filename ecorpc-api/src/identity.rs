//! Caller identity as seen by the cache.
//!
//! Authentication happens upstream. An auth interceptor that has verified
//! the caller inserts [`AuthenticatedUser`] (and optionally
//! [`ClientPlatform`]) into the request extensions; otherwise the values are
//! read from metadata headers.

use tonic::Request;

/// Extension inserted by an upstream auth interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub u64);

/// Extension naming the caller's client platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPlatform(pub String);

/// Metadata keys consulted when the extensions are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHeaders {
    pub user_id: String,
    pub platform: String,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        Self {
            user_id: "x-user-id".to_string(),
            platform: "x-platform".to_string(),
        }
    }
}

/// Who is calling, for cache bypass and key derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallIdentity {
    pub user_id: Option<u64>,
    /// Empty when unknown.
    pub platform: String,
}

impl CallIdentity {
    pub fn from_request<T>(request: &Request<T>, headers: &IdentityHeaders) -> Self {
        let metadata_str = |name: &str| {
            request
                .metadata()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        };

        let user_id = match request.extensions().get::<AuthenticatedUser>() {
            Some(AuthenticatedUser(id)) => Some(*id),
            None => metadata_str(&headers.user_id).and_then(|raw| raw.parse().ok()),
        };

        let platform = match request.extensions().get::<ClientPlatform>() {
            Some(ClientPlatform(platform)) => platform.clone(),
            None => metadata_str(&headers.platform).unwrap_or_default().to_string(),
        };

        Self { user_id, platform }
    }

    /// A caller is authenticated when it carries a positive user id.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some_and(|id| id > 0)
    }
}
