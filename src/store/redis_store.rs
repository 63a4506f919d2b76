//! Redis-backed counter store.
//!
//! # Responsibilities
//! - Resolve the write endpoint (fixed URL, or ask Sentinel for the master)
//! - Keep one shared multiplexed connection to that endpoint
//! - Map Redis errors onto `StoreError::Transient`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::timeout;

use crate::config::{StoreConfig, StoreTopology};
use crate::store::{CounterConnection, Endpoint, StoreBackend, StoreError, StoreResult};

const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_SENTINEL_TIMEOUT: Duration = Duration::from_millis(250);

/// INCR, then arm the expiry if this call created the key or it lost its TTL.
static WINDOW_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        local ttl = redis.call('TTL', KEYS[1])
        if count == 1 or ttl == -1 then
            redis.call('EXPIRE', KEYS[1], ARGV[1])
            ttl = tonumber(ARGV[1])
        end
        return {count, ttl}
        ",
    )
});

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Transient(e.to_string())
    }
}

#[derive(Debug, Clone)]
enum Discovery {
    Fixed(Endpoint),
    Sentinel {
        nodes: Vec<String>,
        master_name: String,
    },
}

struct CachedConnection {
    endpoint: Endpoint,
    conn: MultiplexedConnection,
}

/// Connection factory for a Redis (or Redis-wire compatible) store.
///
/// One multiplexed connection per resolved endpoint is opened and shared;
/// `connect` hands out clones of it until `invalidate` drops it.
pub struct RedisBackend {
    discovery: Discovery,
    /// Scheme, credentials and database; host and port come from the endpoint.
    base_url: url::Url,
    sentinel_timeout: Duration,
    /// Index of the sentinel that answered last; discovery starts there.
    preferred_sentinel: AtomicUsize,
    cached: Mutex<Option<CachedConnection>>,
    connecting: tokio::sync::Mutex<()>,
}

impl RedisBackend {
    fn with_discovery(discovery: Discovery, base_url: url::Url) -> Self {
        Self {
            discovery,
            base_url,
            sentinel_timeout: DEFAULT_SENTINEL_TIMEOUT,
            preferred_sentinel: AtomicUsize::new(0),
            cached: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a backend for a single node addressed by `redis://` URL.
    pub fn from_url(raw: &str) -> StoreResult<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| StoreError::Unavailable(format!("invalid store url '{}': {}", raw, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| StoreError::Unavailable(format!("store url '{}' has no host", raw)))?;
        let port = url.port().unwrap_or(DEFAULT_REDIS_PORT);
        let endpoint = Endpoint::new(host, port);

        Ok(Self::with_discovery(Discovery::Fixed(endpoint), url))
    }

    /// Build a backend that discovers the current master through Sentinel.
    pub fn sentinel(
        nodes: Vec<String>,
        master_name: String,
        password: Option<&str>,
        db: i64,
    ) -> StoreResult<Self> {
        let mut base_url = url::Url::parse(&format!("redis://localhost/{}", db))
            .map_err(|e| StoreError::Unavailable(format!("invalid database index {}: {}", db, e)))?;
        if let Some(password) = password {
            base_url
                .set_password(Some(password))
                .map_err(|_| StoreError::Unavailable("store password cannot be encoded".to_string()))?;
        }
        Ok(Self::with_discovery(
            Discovery::Sentinel { nodes, master_name },
            base_url,
        ))
    }

    /// Per-node deadline for Sentinel queries.
    pub fn with_sentinel_timeout(mut self, timeout: Duration) -> Self {
        self.sentinel_timeout = timeout;
        self
    }

    /// Build the backend described by the store configuration.
    ///
    /// Returns `None` for the memory topology.
    pub fn from_config(config: &StoreConfig) -> StoreResult<Option<Self>> {
        match &config.topology {
            StoreTopology::Memory => Ok(None),
            StoreTopology::Redis { url } => Self::from_url(url).map(Some),
            StoreTopology::Sentinel { nodes, master_name } => Self::sentinel(
                nodes.clone(),
                master_name.clone(),
                config.password.as_deref(),
                config.db,
            )
            .map(|backend| {
                Some(backend.with_sentinel_timeout(Duration::from_millis(config.sentinel_timeout_ms)))
            }),
        }
    }

    fn connection_url(&self, endpoint: &Endpoint) -> StoreResult<String> {
        let mut url = self.base_url.clone();
        let host = if endpoint.host.contains(':') && !endpoint.host.starts_with('[') {
            format!("[{}]", endpoint.host)
        } else {
            endpoint.host.clone()
        };
        url.set_host(Some(&host))
            .map_err(|e| StoreError::Unavailable(format!("invalid store host '{}': {}", endpoint.host, e)))?;
        url.set_port(Some(endpoint.port))
            .map_err(|_| StoreError::Unavailable(format!("cannot set store port {}", endpoint.port)))?;
        Ok(url.to_string())
    }

    fn cached_connection(&self, endpoint: &Endpoint) -> Option<MultiplexedConnection> {
        self.cached
            .lock()
            .expect("redis connection cache mutex poisoned")
            .as_ref()
            .filter(|cached| cached.endpoint == *endpoint)
            .map(|cached| cached.conn.clone())
    }

    async fn open_shared(&self, endpoint: &Endpoint) -> StoreResult<MultiplexedConnection> {
        if let Some(conn) = self.cached_connection(endpoint) {
            return Ok(conn);
        }

        // One opener at a time; the rest pick up its connection.
        let _opening = self.connecting.lock().await;
        if let Some(conn) = self.cached_connection(endpoint) {
            return Ok(conn);
        }

        let client = redis::Client::open(self.connection_url(endpoint)?)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(endpoint = %endpoint, "Opened counter store connection");

        *self.cached.lock().expect("redis connection cache mutex poisoned") = Some(CachedConnection {
            endpoint: endpoint.clone(),
            conn: conn.clone(),
        });
        Ok(conn)
    }

    async fn ask_sentinel(node: &str, master_name: &str) -> StoreResult<Endpoint> {
        let client = redis::Client::open(format!("redis://{}", node))?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let addr: Option<(String, u16)> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name)
            .query_async(&mut conn)
            .await?;

        addr.map(|(host, port)| Endpoint::new(host, port)).ok_or_else(|| {
            StoreError::Transient(format!("sentinel {} does not know master '{}'", node, master_name))
        })
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn resolve_endpoint(&self) -> StoreResult<Endpoint> {
        let (nodes, master_name) = match &self.discovery {
            Discovery::Fixed(endpoint) => return Ok(endpoint.clone()),
            Discovery::Sentinel { nodes, master_name } => (nodes, master_name),
        };
        if nodes.is_empty() {
            return Err(StoreError::Unavailable("no sentinel nodes configured".to_string()));
        }

        let first = self.preferred_sentinel.load(Ordering::Relaxed) % nodes.len();
        for offset in 0..nodes.len() {
            let i = (first + offset) % nodes.len();
            let node = &nodes[i];
            match timeout(self.sentinel_timeout, Self::ask_sentinel(node, master_name)).await {
                Ok(Ok(endpoint)) => {
                    self.preferred_sentinel.store(i, Ordering::Relaxed);
                    tracing::debug!(sentinel_idx = i, sentinel = %node, master = %endpoint, "Resolved store master");
                    return Ok(endpoint);
                }
                Ok(Err(e)) => {
                    tracing::warn!(sentinel_idx = i, sentinel = %node, error = %e, "Sentinel query failed, trying next node");
                }
                Err(_) => {
                    tracing::warn!(
                        sentinel_idx = i,
                        sentinel = %node,
                        timeout_ms = self.sentinel_timeout.as_millis() as u64,
                        "Sentinel query timed out, trying next node"
                    );
                }
            }
        }
        Err(StoreError::Transient(format!(
            "no sentinel could resolve master '{}'",
            master_name
        )))
    }

    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Box<dyn CounterConnection>> {
        let conn = self.open_shared(endpoint).await?;
        Ok(Box::new(RedisConnection { conn }))
    }

    fn invalidate(&self) {
        let dropped = self
            .cached
            .lock()
            .expect("redis connection cache mutex poisoned")
            .take();
        if let Some(cached) = dropped {
            tracing::debug!(endpoint = %cached.endpoint, "Dropped cached counter store connection");
        }
    }
}

/// A multiplexed connection to the resolved master.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl CounterConnection for RedisConnection {
    async fn ping(&mut self) -> StoreResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> StoreResult<Option<u64>> {
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut self.conn).await?;
        Ok(value)
    }

    async fn ttl(&mut self, key: &str) -> StoreResult<i64> {
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut self.conn).await?;
        Ok(ttl)
    }

    async fn set_with_expiry(&mut self, key: &str, value: u64, seconds: u64) -> StoreResult<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn incr(&mut self, key: &str) -> StoreResult<u64> {
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut self.conn).await?;
        Ok(count)
    }

    async fn expire(&mut self, key: &str, seconds: u64) -> StoreResult<()> {
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn incr_with_expiry(&mut self, key: &str, seconds: u64) -> StoreResult<(u64, i64)> {
        let result: (u64, i64) = WINDOW_SCRIPT
            .key(key)
            .arg(seconds)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(result)
    }
}
