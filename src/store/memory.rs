//! In-process store with Redis-like semantics.
//!
//! Counters live in a `DashMap`, so every read-modify-write on one key runs
//! under that key's shard lock and is atomic with respect to other callers.
//! Key expiry is evaluated lazily against an injectable [`Clock`], which lets
//! tests elapse a rate limit window without sleeping. Blocking pops wait on a
//! `Notify` and use tokio time for their timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::{CounterUpdate, KeyValueStore};
use crate::error::{KvflowError, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    data: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn counter(count: u64, expires_at: Option<Instant>) -> Self {
        Self {
            data: count.to_string(),
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn as_counter(&self, key: &str) -> Result<u64> {
        self.data.parse().map_err(|_| {
            KvflowError::Store(format!("value at {} is not an integer", key))
        })
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug)]
pub struct MemoryStore {
    values: DashMap<String, StoredValue>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            lists: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable` (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvflowError::StoreUnavailable(
                "memory store is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop `key` if its TTL has elapsed.
    fn purge_expired(&self, key: &str) -> Instant {
        let now = self.clock.now();
        self.values.remove_if(key, |_, value| value.is_expired(now));
        now
    }

    fn pop_back(&self, list: &str) -> Option<String> {
        let mut lists = self.lists.lock();
        let values = lists.get_mut(list)?;
        let value = values.pop_back();
        if values.is_empty() {
            lists.remove(list);
        }
        value
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        self.purge_expired(key);
        Ok(self.values.get(key).map(|v| v.data.clone()))
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        self.ensure_available()?;
        self.purge_expired(key);

        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get().as_counter(key)? + 1;
                entry.get_mut().data = count.to_string();
                Ok(count)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::counter(1, None));
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let now = self.purge_expired(key);

        match self.values.get_mut(key) {
            Some(mut value) => {
                value.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_available()?;
        let now = self.purge_expired(key);

        Ok(self
            .values
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, Option<Duration>)>> {
        self.ensure_available()?;
        let now = self.clock.now();

        Ok(self
            .values
            .get(key)
            .filter(|v| !v.is_expired(now))
            .map(|v| {
                let ttl = v.expires_at.map(|at| at.saturating_duration_since(now));
                (v.data.clone(), ttl)
            }))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        self.purge_expired(key);
        Ok(self.values.remove(key).is_some())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.ensure_available()?;
        let now = self.purge_expired(key);

        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get().as_counter(key)? + 1;
                let value = entry.get_mut();
                value.data = count.to_string();
                if value.expires_at.is_none() {
                    value.expires_at = Some(now + ttl);
                }
                Ok(count)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::counter(1, Some(now + ttl)));
                Ok(1)
            }
        }
    }

    async fn incr_below(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterUpdate> {
        self.ensure_available()?;
        let now = self.purge_expired(key);

        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().as_counter(key)?;
                let value = entry.get_mut();
                if value.expires_at.is_none() {
                    value.expires_at = Some(now + ttl);
                }
                if current >= limit {
                    return Ok(CounterUpdate {
                        admitted: false,
                        count: current,
                    });
                }
                value.data = (current + 1).to_string();
                Ok(CounterUpdate {
                    admitted: true,
                    count: current + 1,
                })
            }
            Entry::Vacant(_) if limit == 0 => Ok(CounterUpdate {
                admitted: false,
                count: 0,
            }),
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::counter(1, Some(now + ttl)));
                Ok(CounterUpdate {
                    admitted: true,
                    count: 1,
                })
            }
        }
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<u64> {
        self.ensure_available()?;

        let len = {
            let mut lists = self.lists.lock();
            let values = lists.entry(list.to_string()).or_default();
            values.push_front(value.to_string());
            values.len() as u64
        };
        self.pushed.notify_waiters();

        trace!(list, len, "Pushed value");
        Ok(len)
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            self.ensure_available()?;

            // Register interest before looking, so a push between the check
            // and the wait still wakes us.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_back(list) {
                return Ok(Some(value));
            }

            if timeout.is_zero() {
                notified.await;
            } else if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn llen(&self, list: &str) -> Result<u64> {
        self.ensure_available()?;
        let lists = self.lists.lock();
        Ok(lists.get(list).map_or(0, |values| values.len() as u64))
    }
}
