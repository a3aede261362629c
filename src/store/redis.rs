//! Redis-backed counter store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisError, RedisResult, Script};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{delta, CounterStore, StoreError, WindowCount};
use crate::config::RedisStoreConfig;
use crate::retry::{with_timeout_retry, RetryPolicy};

/// Open a fixed window on the first hit; return the count and the
/// remaining lifetime of the window in milliseconds.
const WINDOW_HIT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Decrement without going below zero and delete the key at zero.
const CLAMPED_DECR_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
    redis.call('DEL', KEYS[1])
    return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// Bounds for the pause between background reconnection rounds.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Counters shared across processes through Redis.
///
/// Until a connection exists every operation fails with
/// [`StoreError::Connection`], which callers treat as a store outage.
pub struct RedisStore {
    /// Multiplexed connection with automatic reconnection, set once
    connection: Arc<OnceCell<ConnectionManager>>,
    /// Prefix applied to every key
    key_prefix: String,
    /// Upper bound for a single command
    response_timeout: Duration,
    window_hit: Script,
    clamped_decr: Script,
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

impl RedisStore {
    /// Connect to Redis, retrying under the configured policy.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = open_client(config)?;
        let connection = establish(&client, &config.connect_retry).await?;

        info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");
        Ok(Self::with_connection(config, OnceCell::new_with(Some(connection))))
    }

    /// Return a store immediately and keep connecting in the background.
    ///
    /// Operations fail with a connection error until the first connection
    /// succeeds. Must be called within a tokio runtime.
    pub fn connect_in_background(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = open_client(config)?;
        let store = Self::with_connection(config, OnceCell::new());

        let connection = Arc::clone(&store.connection);
        let policy = config.connect_retry;
        tokio::spawn(async move {
            let mut rounds: u32 = 0;
            loop {
                match establish(&client, &policy).await {
                    Ok(manager) => {
                        if connection.set(manager).is_ok() {
                            info!("Connected to Redis counter store");
                        }
                        return;
                    }
                    Err(e) => {
                        rounds = rounds.saturating_add(1);
                        let delay = policy
                            .backoff(rounds)
                            .clamp(MIN_RECONNECT_DELAY, MAX_RECONNECT_DELAY);
                        warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Redis unreachable, counters fail open until it connects"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        Ok(store)
    }

    fn with_connection(config: &RedisStoreConfig, connection: OnceCell<ConnectionManager>) -> Self {
        Self {
            connection: Arc::new(connection),
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout(),
            window_hit: Script::new(WINDOW_HIT_SCRIPT),
            clamped_decr: Script::new(CLAMPED_DECR_SCRIPT),
        }
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection
            .get()
            .cloned()
            .ok_or_else(|| StoreError::Connection("not connected to Redis yet".to_string()))
    }

    /// Await a command, treating a missing reply as a connection failure.
    async fn bounded<T>(
        &self,
        command: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.response_timeout, command).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(StoreError::Connection(format!(
                "no reply from Redis within {:?}",
                self.response_timeout
            ))),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        namespaced_key(&self.key_prefix, key)
    }
}

fn open_client(config: &RedisStoreConfig) -> Result<Client, StoreError> {
    Client::open(config.url.as_str())
        .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {e}")))
}

async fn establish(client: &Client, policy: &RetryPolicy) -> Result<ConnectionManager, StoreError> {
    with_timeout_retry(policy, || {
        let client = client.clone();
        async move {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = ::redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, RedisError>(connection)
        }
    })
    .await
    .map_err(|e| StoreError::Connection(format!("failed to connect to Redis: {e}")))
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let key = self.namespaced(key);
        let mut connection = self.connection()?;

        let (count, ttl_ms): (u64, i64) = self
            .bounded(
                self.window_hit
                    .key(&key)
                    .arg(millis(window))
                    .invoke_async(&mut connection),
            )
            .await?;

        let remaining = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0));
        Ok(WindowCount {
            count,
            reset_at: Utc::now() + delta(remaining),
        })
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let key = self.namespaced(key);
        let mut connection = self.connection()?;

        let (count,): (u64,) = self
            .bounded(
                ::redis::pipe()
                    .atomic()
                    .incr(&key, 1u64)
                    .pexpire(&key, millis(ttl))
                    .ignore()
                    .query_async(&mut connection),
            )
            .await?;
        Ok(count)
    }

    async fn decr(&self, key: &str) -> Result<u64, StoreError> {
        let key = self.namespaced(key);
        let mut connection = self.connection()?;

        let remaining: i64 = self
            .bounded(self.clamped_decr.key(&key).invoke_async(&mut connection))
            .await?;
        Ok(u64::try_from(remaining).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let key = self.namespaced(key);
        let mut connection = self.connection()?;

        let value: Option<u64> = self
            .bounded(::redis::cmd("GET").arg(&key).query_async(&mut connection))
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection()?;
        let pong: String = self
            .bounded(::redis::cmd("PING").query_async(&mut connection))
            .await?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitPolicy, RateLimiter};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn quick_config(url: String) -> RedisStoreConfig {
        RedisStoreConfig {
            url,
            response_timeout_ms: 200,
            connect_retry: RetryPolicy {
                timeout_ms: 1_000,
                max_retries: 0,
                backoff_ms: 10,
            },
            ..RedisStoreConfig::default()
        }
    }

    /// Split one RESP command off the front of `buf`, returning its encoded
    /// length and upper-cased name.
    fn next_command(buf: &[u8]) -> Option<(usize, String)> {
        let (argc, mut pos) = resp_header(buf, 0, b'*')?;
        let mut name = String::new();
        for i in 0..argc {
            let (len, start) = resp_header(buf, pos, b'$')?;
            let end = start + len;
            if buf.len() < end + 2 {
                return None;
            }
            if i == 0 {
                name = String::from_utf8_lossy(&buf[start..end]).to_ascii_uppercase();
            }
            pos = end + 2;
        }
        Some((pos, name))
    }

    fn resp_header(buf: &[u8], pos: usize, marker: u8) -> Option<(usize, usize)> {
        if *buf.get(pos)? != marker {
            return None;
        }
        let line_end = pos + buf[pos..].windows(2).position(|w| w == b"\r\n")?;
        let value = std::str::from_utf8(&buf[pos + 1..line_end]).ok()?.parse().ok()?;
        Some((value, line_end + 2))
    }

    /// A server that completes the connection handshake and then never
    /// answers a script call, like a Redis that stalled mid-flight.
    async fn stalled_redis() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                        while let Some((len, name)) = next_command(&buf) {
                            buf.drain(..len);
                            if name.starts_with("EVAL") {
                                continue;
                            }
                            if socket.write_all(b"+PONG\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(namespaced_key("pixelift:", "rl:api:1.2.3.4"), "pixelift:rl:api:1.2.3.4");
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(60)), 60_000);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let config = RedisStoreConfig {
            url: "not a url".to_string(),
            ..RedisStoreConfig::default()
        };

        let result = RedisStore::connect(&config).await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert!(RedisStore::connect_in_background(&config).is_err());
    }

    #[tokio::test]
    async fn test_stalled_server_fails_open() {
        let addr = stalled_redis().await;
        let store = RedisStore::connect(&quick_config(format!("redis://{addr}")))
            .await
            .unwrap();
        assert!(store.is_connected());

        let policy = LimitPolicy::new(Duration::from_secs(60), 5).unwrap();
        let limiter = RateLimiter::new("api", policy, Arc::new(store));

        let decision = tokio::time::timeout(Duration::from_secs(5), limiter.check("1.2.3.4"))
            .await
            .expect("check must not wait on a silent store");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_unreachable_at_startup_fails_fast() {
        // Nothing listens on the discard port.
        let store = RedisStore::connect_in_background(&quick_config(
            "redis://127.0.0.1:9".to_string(),
        ))
        .unwrap();
        assert!(!store.is_connected());

        assert!(matches!(store.get("cc:key_1").await, Err(StoreError::Connection(_))));
        assert!(matches!(store.ping().await, Err(StoreError::Connection(_))));

        let policy = LimitPolicy::new(Duration::from_secs(60), 1).unwrap();
        let limiter = RateLimiter::new("auth", policy, Arc::new(store));
        for _ in 0..3 {
            assert!(limiter.check("1.2.3.4").await.allowed);
        }
    }

    /// Store against a live server named by `PIXELIFT_TEST_REDIS_URL`, with
    /// a key prefix unique to the calling test. `None` skips the test.
    async fn live_store() -> Option<RedisStore> {
        let url = std::env::var("PIXELIFT_TEST_REDIS_URL").ok()?;
        let config = RedisStoreConfig {
            url,
            key_prefix: format!("pixelift_test_{}:", Uuid::new_v4().simple()),
            ..RedisStoreConfig::default()
        };
        Some(RedisStore::connect(&config).await.unwrap())
    }

    #[tokio::test]
    async fn test_live_window_counts_and_resets() {
        let Some(store) = live_store().await else {
            return;
        };
        let window = Duration::from_millis(300);

        let first = store.hit("rl:api:1.2.3.4", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert!(first.reset_at > Utc::now());
        assert_eq!(store.hit("rl:api:1.2.3.4", window).await.unwrap().count, 2);
        assert_eq!(store.hit("rl:api:1.2.3.4", window).await.unwrap().count, 3);
        assert_eq!(store.hit("rl:api:5.6.7.8", window).await.unwrap().count, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.hit("rl:api:1.2.3.4", window).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_live_decrement_clamps_and_deletes() {
        let Some(store) = live_store().await else {
            return;
        };
        let ttl = Duration::from_secs(60);

        assert_eq!(store.decr("cc:absent").await.unwrap(), 0);
        assert_eq!(store.get("cc:absent").await.unwrap(), 0);

        assert_eq!(store.incr("cc:key_1", ttl).await.unwrap(), 1);
        assert_eq!(store.incr("cc:key_1", ttl).await.unwrap(), 2);
        assert_eq!(store.decr("cc:key_1").await.unwrap(), 1);
        assert_eq!(store.decr("cc:key_1").await.unwrap(), 0);
        assert_eq!(store.decr("cc:key_1").await.unwrap(), 0);
        assert_eq!(store.get("cc:key_1").await.unwrap(), 0);

        assert_eq!(store.incr("cc:key_1", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_live_counter_expires_unless_refreshed() {
        let Some(store) = live_store().await else {
            return;
        };
        let ttl = Duration::from_millis(500);

        store.incr("cc:leaked", ttl).await.unwrap();
        store.incr("cc:active", ttl).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.incr("cc:active", ttl).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get("cc:leaked").await.unwrap(), 0);
        assert_eq!(store.get("cc:active").await.unwrap(), 2);
        store.ping().await.unwrap();
    }
}
