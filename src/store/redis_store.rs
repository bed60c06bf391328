//! Redis-backed store.
//!
//! Regular commands share one `ConnectionManager`, which multiplexes and
//! reconnects lazily after a failure. It is built without its own connect
//! retries, so [`RetryPolicy`] is the only retry at start-up.
//!
//! `BRPOP` occupies a connection until it returns, so each blocking pop runs
//! on a dedicated connection instead of stalling the shared one. Those
//! connections are kept in a small idle list and reused by the next pop.
//! The two compound counter operations run as Lua scripts, which Redis
//! executes atomically.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::{AsyncConnectionConfig, Client, IntoConnectionInfo, Script};
use tracing::{debug, info};

use super::retry::RetryPolicy;
use super::{CounterUpdate, KeyValueStore};
use crate::error::Result;

/// INCR, then attach a TTL if the key has none. Returns the new count.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) == -1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// INCR only while below ARGV[1]; TTL handling as above.
/// Returns {admitted (0/1), count}.
const INCR_BELOW_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
local admitted = 0
if count < limit then
  count = redis.call('INCR', KEYS[1])
  admitted = 1
end
if count > 0 and redis.call('PTTL', KEYS[1]) == -1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {admitted, count}
"#;

/// Upper bound on a single TCP connect plus handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis implementation of [`KeyValueStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    /// Connections for `BRPOP` that are not currently blocked
    idle_blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    incr_with_expiry: Script,
    incr_below: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis once and verify the connection with a PING.
    ///
    /// Accepts a URL or a [`redis::ConnectionInfo`].
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the server cannot be reached, or
    /// `Store` if the URL is invalid.
    pub async fn connect<T: IntoConnectionInfo>(info: T) -> Result<Self> {
        let client = Client::open(info)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(CONNECT_TIMEOUT);
        let connection = ConnectionManager::new_with_config(client.clone(), manager_config).await?;

        let store = Self {
            client,
            connection,
            idle_blocking: Arc::new(Mutex::new(Vec::new())),
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY_SCRIPT),
            incr_below: Script::new(INCR_BELOW_SCRIPT),
        };
        store.ping().await?;

        info!(store = ?store, "Connected to Redis");
        Ok(store)
    }

    /// Connect, retrying according to `policy`.
    pub async fn connect_with_retry<T: IntoConnectionInfo>(
        info: T,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        let info = info.into_connection_info()?;
        policy
            .run("redis connect", || Self::connect(info.clone()))
            .await
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// An idle blocking connection, or a new one if none is free.
    async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        let idle = self.idle_blocking.lock().pop();
        if let Some(conn) = idle {
            return Ok(conn);
        }

        let config = AsyncConnectionConfig::new().set_connection_timeout(CONNECT_TIMEOUT);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        debug!("Opened blocking connection");
        Ok(conn)
    }

    #[cfg(test)]
    fn idle_blocking_connections(&self) -> usize {
        self.idle_blocking.lock().len()
    }
}

/// Milliseconds for PEXPIRE; Redis rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection();
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let set: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection();
        // -2: no such key, -1: no expiry
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>> {
        let mut conn = self.connection();
        let (value, millis): (Option<String>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|v| (v, u64::try_from(millis).ok().map(Duration::from_millis))))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.connection();
        let count: u64 = self
            .incr_with_expiry
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn incr_below(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterUpdate> {
        let mut conn = self.connection();
        let (admitted, count): (u8, u64) = self
            .incr_below
            .key(key)
            .arg(limit)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(CounterUpdate {
            admitted: admitted == 1,
            count,
        })
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<u64> {
        let mut conn = self.connection();
        let len: u64 = redis::cmd("LPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        // A connection that errored, or whose pop was dropped mid-flight,
        // is not returned to the idle list.
        let mut conn = self.blocking_connection().await?;

        debug!(list, timeout_secs = timeout.as_secs_f64(), "Blocking pop");
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(list)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        self.idle_blocking.lock().push(conn);
        Ok(popped.map(|(_, value)| value))
    }

    async fn llen(&self, list: &str) -> Result<u64> {
        let mut conn = self.connection();
        let len: u64 = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }
}
