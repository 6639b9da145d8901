//! Redis backend, either a Redis Cluster or a client-side sharded ring of
//! independent servers.

use ::redis::aio::MultiplexedConnection;
use ::redis::cluster::ClusterClient;
use ::redis::cluster_async::ClusterConnection;
use ::redis::{AsyncCommands, Client, IntoConnectionInfo, RedisResult};
use async_trait::async_trait;
use ecorpc_core::{CacheError, CacheResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use super::{CacheBackend, CacheStats, StatCounters};

/// How the configured addresses are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedisTopology {
    /// Addresses are seed nodes of one Redis Cluster.
    Cluster,
    /// Each address is an independent shard; keys are spread by rendezvous
    /// hashing over shard names.
    #[default]
    Ring,
}

/// Connection settings for [`RedisCacheBackend`].
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    pub topology: RedisTopology,
    /// Shard name to address. Cluster mode only uses the addresses.
    pub addrs: BTreeMap<String, String>,
    pub password: Option<String>,
    /// Upper bound on a single GET or SET.
    pub operation_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            topology: RedisTopology::Ring,
            addrs: BTreeMap::new(),
            password: None,
            operation_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct RingShard {
    name: String,
    conn: MultiplexedConnection,
}

enum Connections {
    Cluster(ClusterConnection),
    Ring(Vec<RingShard>),
}

/// Redis-backed cache store.
pub struct RedisCacheBackend {
    connections: Connections,
    operation_timeout: Duration,
    counters: StatCounters,
}

impl std::fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = match &self.connections {
            Connections::Cluster(_) => "cluster".to_string(),
            Connections::Ring(shards) => format!("ring({} shards)", shards.len()),
        };
        f.debug_struct("RedisCacheBackend")
            .field("topology", &topology)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisCacheBackend {
    /// Connect to every configured address.
    pub async fn connect(config: RedisBackendConfig) -> CacheResult<Self> {
        if config.addrs.is_empty() {
            return Err(CacheError::backend("no redis addresses configured"));
        }

        let connections = match config.topology {
            RedisTopology::Cluster => {
                let nodes: Vec<String> = config.addrs.values().map(|a| normalize_address(a)).collect();
                let mut builder = ClusterClient::builder(nodes);
                if let Some(password) = &config.password {
                    builder = builder.password(password.clone());
                }
                let client = builder
                    .build()
                    .map_err(|e| CacheError::backend(format!("invalid cluster config: {e}")))?;
                let conn = bounded(config.connect_timeout, "cluster connect", client.get_async_connection()).await?;
                Connections::Cluster(conn)
            }
            RedisTopology::Ring => {
                let mut shards = Vec::with_capacity(config.addrs.len());
                for (name, addr) in &config.addrs {
                    let mut info = normalize_address(addr)
                        .into_connection_info()
                        .map_err(|e| CacheError::backend(format!("invalid address for shard {name}: {e}")))?;
                    if config.password.is_some() {
                        info.redis.password = config.password.clone();
                    }
                    let client = Client::open(info)
                        .map_err(|e| CacheError::backend(format!("invalid address for shard {name}: {e}")))?;
                    let conn = bounded(
                        config.connect_timeout,
                        "ring connect",
                        client.get_multiplexed_async_connection(),
                    )
                    .await?;
                    shards.push(RingShard {
                        name: name.clone(),
                        conn,
                    });
                }
                Connections::Ring(shards)
            }
        };

        tracing::info!(
            topology = ?config.topology,
            nodes = config.addrs.len(),
            "Connected to redis cache"
        );

        Ok(Self {
            connections,
            operation_timeout: config.operation_timeout,
            counters: StatCounters::default(),
        })
    }

    fn ring_shard(shards: &[RingShard], key: &str) -> CacheResult<MultiplexedConnection> {
        let names: Vec<&str> = shards.iter().map(|s| s.name.as_str()).collect();
        pick_shard(&names, key)
            .map(|index| shards[index].conn.clone())
            .ok_or_else(|| CacheError::backend("redis ring has no shards"))
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = match &self.connections {
            Connections::Cluster(conn) => {
                let mut conn = conn.clone();
                bounded(self.operation_timeout, "GET", async move { conn.get(key).await }).await?
            }
            Connections::Ring(shards) => {
                let mut conn = Self::ring_shard(shards, key)?;
                bounded(self.operation_timeout, "GET", async move { conn.get(key).await }).await?
            }
        };
        self.counters.record_read(value.is_some());
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Ok(());
        }
        match &self.connections {
            Connections::Cluster(conn) => {
                let mut conn = conn.clone();
                let _: () = bounded(self.operation_timeout, "SET", async move {
                    ::redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(millis)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            }
            Connections::Ring(shards) => {
                let mut conn = Self::ring_shard(shards, key)?;
                let _: () = bounded(self.operation_timeout, "SET", async move {
                    ::redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(millis)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            }
        }
        self.counters.record_write();
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<bool> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Ok(false);
        }
        // SET .. NX replies nil when the key already exists.
        let reply: Option<String> = match &self.connections {
            Connections::Cluster(conn) => {
                let mut conn = conn.clone();
                bounded(self.operation_timeout, "SET NX", async move {
                    ::redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(millis)
                        .arg("NX")
                        .query_async(&mut conn)
                        .await
                })
                .await?
            }
            Connections::Ring(shards) => {
                let mut conn = Self::ring_shard(shards, key)?;
                bounded(self.operation_timeout, "SET NX", async move {
                    ::redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(millis)
                        .arg("NX")
                        .query_async(&mut conn)
                        .await
                })
                .await?
            }
        };
        let written = reply.is_some();
        if written {
            self.counters.record_write();
        }
        Ok(written)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(self.counters.snapshot(None))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Run a redis future under a deadline, mapping every failure to
/// `BackendUnavailable`.
async fn bounded<T, F>(limit: Duration, op: &'static str, fut: F) -> CacheResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CacheError::backend(format!("redis {op} failed: {e}"))),
        Err(_) => Err(CacheError::backend(format!(
            "redis {op} timed out after {limit:?}"
        ))),
    }
}

/// Prefix bare `host:port` addresses with the `redis://` scheme.
pub fn normalize_address(addr: &str) -> String {
    let addr = addr.trim();
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}

/// Rendezvous hashing: the shard with the highest score for a key owns it.
///
/// Removing a shard only moves the keys that shard owned.
pub(crate) fn pick_shard(names: &[&str], key: &str) -> Option<usize> {
    names
        .iter()
        .enumerate()
        .max_by_key(|(_, name)| rendezvous_score(name, key))
        .map(|(index, _)| index)
}

fn rendezvous_score(shard: &str, key: &str) -> u64 {
    let digest = Sha256::new()
        .chain_update(shard.as_bytes())
        .chain_update([0u8])
        .chain_update(key.as_bytes())
        .finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("10.0.0.1:6379"), "redis://10.0.0.1:6379");
        assert_eq!(normalize_address(" redis://cache:6379 "), "redis://cache:6379");
        assert_eq!(normalize_address("rediss://cache:6380"), "rediss://cache:6380");
    }

    #[test]
    fn test_pick_shard_is_stable() {
        let names = ["shard-a", "shard-b", "shard-c"];
        for i in 0..100 {
            let key = format!("rpc:Catalog.Get:{i}:ios");
            assert_eq!(pick_shard(&names, &key), pick_shard(&names, &key));
        }
        assert_eq!(pick_shard(&[], "any"), None);
    }

    #[test]
    fn test_pick_shard_spreads_keys() {
        let names = ["shard-a", "shard-b", "shard-c"];
        let mut counts = [0usize; 3];
        for i in 0..3000 {
            let key = format!("rpc:Catalog.Get:{i}:web");
            if let Some(index) = pick_shard(&names, &key) {
                counts[index] += 1;
            }
        }
        for count in counts {
            assert!(count > 700, "uneven spread: {counts:?}");
        }
    }

    #[test]
    fn test_removing_shard_only_moves_its_keys() {
        let all = ["shard-a", "shard-b", "shard-c"];
        let remaining = ["shard-a", "shard-c"];
        for i in 0..500 {
            let key = format!("rpc:Feed.List:{i}:");
            let before = pick_shard(&all, &key).map(|idx| all[idx]);
            let after = pick_shard(&remaining, &key).map(|idx| remaining[idx]);
            if before != Some("shard-b") {
                assert_eq!(before, after);
            }
        }
    }

    #[tokio::test]
    async fn test_connect_without_addresses_fails() {
        let err = RedisCacheBackend::connect(RedisBackendConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::BackendUnavailable { .. }));
    }
}
