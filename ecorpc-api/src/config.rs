//! Cache Configuration Module
//!
//! `RpcCacheConfig` is loaded either from a JSON or YAML file (picked by
//! extension) or from `ECORPC_*` environment variables, with defaults that
//! leave the cache switched off.

use ecorpc_core::ConfigError;
use ecorpc_storage::{RedisBackendConfig, RedisTopology, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tonic::metadata::AsciiMetadataKey;

/// Environment variable naming the deployment environment for config files.
pub const CONFIG_ENV_VAR: &str = "CONFIGOR_ENV";

// ============================================================================
// ENUMS
// ============================================================================

/// Which store backs the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redis,
    Memory,
}

/// Redis deployment shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisType {
    Cluster,
    #[default]
    Ring,
}

impl From<RedisType> for RedisTopology {
    fn from(kind: RedisType) -> Self {
        match kind {
            RedisType::Cluster => RedisTopology::Cluster,
            RedisType::Ring => RedisTopology::Ring,
        }
    }
}

/// What to do with a compute that outlives its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicyKind {
    #[default]
    Detach,
    DetachAndStore,
    Abort,
}

impl From<TimeoutPolicyKind> for TimeoutPolicy {
    fn from(kind: TimeoutPolicyKind) -> Self {
        match kind {
            TimeoutPolicyKind::Detach => TimeoutPolicy::Detach,
            TimeoutPolicyKind::DetachAndStore => TimeoutPolicy::DetachAndStore,
            TimeoutPolicyKind::Abort => TimeoutPolicy::Abort,
        }
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(field: &str, raw: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase())).map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        }
    })
}

// ============================================================================
// RPC CACHE CONFIGURATION
// ============================================================================

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcCacheConfig {
    /// Global switch. When off, every call goes straight to its handler.
    pub enabled: bool,

    pub backend: BackendKind,

    pub redis_type: RedisType,

    /// Shard name to `host:port` (or full `redis://` URL).
    pub addrs: BTreeMap<String, String>,

    pub password: Option<String>,

    /// Bound on each backend GET/SET in milliseconds.
    pub operation_timeout_ms: u64,

    /// Bound on establishing backend connections in milliseconds.
    pub connect_timeout_ms: u64,

    pub timeout_policy: TimeoutPolicyKind,

    /// Metadata key carrying the caller's user id.
    pub user_id_header: String,

    /// Metadata key carrying the caller's platform.
    pub platform_header: String,
}

impl Default for RpcCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendKind::Redis,
            redis_type: RedisType::Ring,
            addrs: BTreeMap::new(),
            password: None,
            operation_timeout_ms: 500,
            connect_timeout_ms: 5_000,
            timeout_policy: TimeoutPolicyKind::Detach,
            user_id_header: "x-user-id".to_string(),
            platform_header: "x-platform".to_string(),
        }
    }
}

impl RpcCacheConfig {
    /// In-memory cache, enabled. Handy for tests and single-node setups.
    pub fn in_memory() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }

    /// Create RpcCacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `ECORPC_CACHE_ENABLED`: "true" or "false" (default: false)
    /// - `ECORPC_CACHE_BACKEND`: "redis" or "memory" (default: redis)
    /// - `ECORPC_REDIS_TYPE`: "cluster" or "ring" (default: ring)
    /// - `ECORPC_REDIS_ADDRS`: comma-separated `name=host:port` entries;
    ///   unnamed entries become `shard<N>`
    /// - `ECORPC_REDIS_PASSWORD`: optional password
    /// - `ECORPC_CACHE_OPERATION_TIMEOUT_MS`: per-operation bound (default: 500)
    /// - `ECORPC_CACHE_CONNECT_TIMEOUT_MS`: connect bound (default: 5000)
    /// - `ECORPC_CACHE_TIMEOUT_POLICY`: "detach", "detach_and_store" or "abort"
    /// - `ECORPC_USER_ID_HEADER`, `ECORPC_PLATFORM_HEADER`: metadata keys
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let enabled = lookup("ECORPC_CACHE_ENABLED")
            .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(defaults.enabled);

        let backend = match lookup("ECORPC_CACHE_BACKEND") {
            Some(raw) => parse_enum("backend", &raw)?,
            None => defaults.backend,
        };

        let redis_type = match lookup("ECORPC_REDIS_TYPE") {
            Some(raw) => parse_enum("redis_type", &raw)?,
            None => defaults.redis_type,
        };

        let timeout_policy = match lookup("ECORPC_CACHE_TIMEOUT_POLICY") {
            Some(raw) => parse_enum("timeout_policy", &raw)?,
            None => defaults.timeout_policy,
        };

        let addrs = lookup("ECORPC_REDIS_ADDRS")
            .map(|raw| parse_addrs(&raw))
            .unwrap_or_default();

        let operation_timeout_ms = match lookup("ECORPC_CACHE_OPERATION_TIMEOUT_MS") {
            Some(raw) => parse_millis("operation_timeout_ms", &raw)?,
            None => defaults.operation_timeout_ms,
        };

        let connect_timeout_ms = match lookup("ECORPC_CACHE_CONNECT_TIMEOUT_MS") {
            Some(raw) => parse_millis("connect_timeout_ms", &raw)?,
            None => defaults.connect_timeout_ms,
        };

        let config = Self {
            enabled,
            backend,
            redis_type,
            addrs,
            password: lookup("ECORPC_REDIS_PASSWORD").filter(|p| !p.is_empty()),
            operation_timeout_ms,
            connect_timeout_ms,
            timeout_policy,
            user_id_header: lookup("ECORPC_USER_ID_HEADER").unwrap_or(defaults.user_id_header),
            platform_header: lookup("ECORPC_PLATFORM_HEADER").unwrap_or(defaults.platform_header),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: display.clone(),
            reason: e.to_string(),
        })?;

        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?,
            _ => return Err(ConfigError::UnsupportedFormat { path: display }),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the file for the environment named by `CONFIGOR_ENV`.
    pub fn load_for_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let env = std::env::var(CONFIG_ENV_VAR).unwrap_or_default();
        Self::load(config_file_for_env(path, &env))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.backend == BackendKind::Redis && self.addrs.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "addrs".to_string(),
                value: String::new(),
                reason: "redis backend needs at least one address".to_string(),
            });
        }
        for (field, value) in [
            ("user_id_header", &self.user_id_header),
            ("platform_header", &self.platform_header),
        ] {
            if AsciiMetadataKey::from_bytes(value.as_bytes()).is_err() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.clone(),
                    reason: "not a valid metadata key".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn redis_backend_config(&self) -> RedisBackendConfig {
        RedisBackendConfig {
            topology: self.redis_type.into(),
            addrs: self.addrs.clone(),
            password: self.password.clone(),
            operation_timeout: self.operation_timeout(),
            connect_timeout: self.connect_timeout(),
        }
    }
}

/// `cache.yaml` becomes `cache.<env>.yaml`, unless `env` is empty or `local`.
pub fn config_file_for_env(path: impl AsRef<Path>, env: &str) -> PathBuf {
    let path = path.as_ref();
    let env = env.trim();
    if env.is_empty() || env.eq_ignore_ascii_case("local") {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let file_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.{env}.{ext}"),
        None => format!("{stem}.{env}"),
    };
    path.with_file_name(file_name)
}

fn parse_addrs(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(index, entry)| match entry.split_once('=') {
            Some((name, addr)) => (name.trim().to_string(), addr.trim().to_string()),
            None => (format!("shard{}", index + 1), entry.to_string()),
        })
        .collect()
}

fn parse_millis(field: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: "expected a whole number of milliseconds".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RpcCacheConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.redis_type, RedisType::Ring);
        assert_eq!(config.operation_timeout(), Duration::from_millis(500));
        assert_eq!(config.timeout_policy, TimeoutPolicyKind::Detach);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() -> Result<(), ConfigError> {
        let config = RpcCacheConfig::from_lookup(lookup(&[
            ("ECORPC_CACHE_ENABLED", "true"),
            ("ECORPC_REDIS_TYPE", "Cluster"),
            ("ECORPC_REDIS_ADDRS", "a=10.0.0.1:6379, 10.0.0.2:6379"),
            ("ECORPC_CACHE_TIMEOUT_POLICY", "detach_and_store"),
            ("ECORPC_CACHE_OPERATION_TIMEOUT_MS", "250"),
        ]))?;
        assert!(config.enabled);
        assert_eq!(config.redis_type, RedisType::Cluster);
        assert_eq!(config.addrs.get("a").map(String::as_str), Some("10.0.0.1:6379"));
        assert_eq!(config.addrs.get("shard2").map(String::as_str), Some("10.0.0.2:6379"));
        assert_eq!(config.timeout_policy, TimeoutPolicyKind::DetachAndStore);
        assert_eq!(config.operation_timeout_ms, 250);
        Ok(())
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = RpcCacheConfig::from_lookup(lookup(&[("ECORPC_REDIS_TYPE", "mesh")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "redis_type"));

        let err = RpcCacheConfig::from_lookup(lookup(&[("ECORPC_CACHE_OPERATION_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_enabled_redis_needs_addresses() {
        let err = RpcCacheConfig::from_lookup(lookup(&[("ECORPC_CACHE_ENABLED", "1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "addrs"));

        let memory = RpcCacheConfig::from_lookup(lookup(&[
            ("ECORPC_CACHE_ENABLED", "1"),
            ("ECORPC_CACHE_BACKEND", "memory"),
        ]));
        assert!(memory.is_ok());
    }

    #[test]
    fn test_invalid_header_name() {
        let config = RpcCacheConfig {
            platform_header: "X Platform".to_string(),
            ..RpcCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_for_env() {
        assert_eq!(
            config_file_for_env("conf/cache.yaml", "prod"),
            PathBuf::from("conf/cache.prod.yaml")
        );
        assert_eq!(config_file_for_env("cache.json", ""), PathBuf::from("cache.json"));
        assert_eq!(config_file_for_env("cache.json", "local"), PathBuf::from("cache.json"));
        assert_eq!(config_file_for_env("cache", "test"), PathBuf::from("cache.test"));
    }

    #[test]
    fn test_load_yaml_and_json() -> Result<(), ConfigError> {
        let dir = std::env::temp_dir().join(format!("ecorpc-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let yaml = dir.join("cache.yaml");
        let json = dir.join("cache.json");
        let toml = dir.join("cache.toml");
        let write = |path: &Path, body: &str| {
            std::fs::write(path, body).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        };
        write(
            &yaml,
            "enabled: true\nredis_type: cluster\naddrs:\n  node1: 10.0.0.1:6379\ntimeout_policy: abort\n",
        )?;
        write(&json, r#"{"enabled": true, "backend": "memory"}"#)?;
        write(&toml, "enabled = true")?;

        let from_yaml = RpcCacheConfig::load(&yaml)?;
        assert_eq!(from_yaml.redis_type, RedisType::Cluster);
        assert_eq!(from_yaml.timeout_policy, TimeoutPolicyKind::Abort);
        assert_eq!(from_yaml.platform_header, "x-platform");

        let from_json = RpcCacheConfig::load(&json)?;
        assert_eq!(from_json.backend, BackendKind::Memory);

        assert!(matches!(
            RpcCacheConfig::load(&toml),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            RpcCacheConfig::load(dir.join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_redis_backend_config() {
        let mut config = RpcCacheConfig::default();
        config.redis_type = RedisType::Cluster;
        config.password = Some("secret".to_string());
        let redis = config.redis_backend_config();
        assert_eq!(redis.topology, RedisTopology::Cluster);
        assert_eq!(redis.password.as_deref(), Some("secret"));
        assert_eq!(redis.operation_timeout, Duration::from_millis(500));
    }
}
