//! Key-value store clients.
//!
//! Every component receives its store as an explicitly constructed handle
//! (`Arc<S>` where `S: KeyValueStore`) rather than reaching for a global
//! connection. `RedisStore` is the production backend; `MemoryStore` is an
//! in-process stand-in with a controllable clock.

mod clock;
mod memory;
mod redis_store;
mod retry;

pub use self::clock::{Clock, MockClock, SystemClock};
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::retry::RetryPolicy;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of an atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Whether the counter was below the limit and got incremented
    pub admitted: bool,
    /// Counter value after the operation
    pub count: u64,
}

/// The store primitives the rate limiter and the queue are built on.
///
/// Lists behave as FIFO queues when values are pushed with [`lpush`] and
/// taken with [`brpop`].
///
/// [`lpush`]: KeyValueStore::lpush
/// [`brpop`]: KeyValueStore::brpop
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Round trip to verify the store is reachable.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically increment, creating the key at 1 if absent.
    async fn incr(&self, key: &str) -> Result<u64>;

    /// Set a TTL on an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining lifetime of a key; `None` if absent or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Read a value together with its remaining lifetime in one atomic
    /// step, so the two always describe the same key state.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically increment and, when the key has no TTL yet (always the
    /// case on the 0 -> 1 transition), set one. An existing TTL is never
    /// refreshed.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Atomically increment only while the counter is below `limit`.
    ///
    /// The TTL follows the same rule as [`incr_with_expiry`]. A counter at
    /// or above the limit is left unchanged.
    ///
    /// [`incr_with_expiry`]: KeyValueStore::incr_with_expiry
    async fn incr_below(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterUpdate>;

    /// Push onto the head of a list, returning the new length.
    async fn lpush(&self, list: &str, value: &str) -> Result<u64>;

    /// Pop from the tail of a list, waiting up to `timeout` for a value.
    /// A zero timeout waits indefinitely.
    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>>;

    async fn llen(&self, list: &str) -> Result<u64>;
}
