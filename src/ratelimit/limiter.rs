//! Fixed window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, trace};

use super::counter::{RateCounter, RateLimitStatus};
use super::identity::RequestIdentity;
use crate::config::RateLimitingConfig;
use crate::error::{KvflowError, Result};
use crate::store::KeyValueStore;

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Allowed,
    Denied,
}

impl AdmissionResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionResult::Allowed)
    }
}

/// Admits at most `max_requests` requests per identity per window.
///
/// The window opens with an identity's first admitted request and closes
/// when its counter key expires; later requests never extend it. All state
/// lives in the store, so any number of limiter instances sharing a store
/// enforce one limit.
pub struct RateLimiter<S: KeyValueStore> {
    store: Arc<S>,
    max_requests: u64,
    window: Duration,
    key_prefix: String,
}

impl<S: KeyValueStore> RateLimiter<S> {
    /// Create a limiter, rejecting an invalid configuration.
    pub fn new(store: Arc<S>, config: &RateLimitingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            max_requests: config.max_requests,
            window: config.window(),
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn key(&self, identity: &RequestIdentity) -> String {
        identity.counter_key(&self.key_prefix)
    }

    async fn current_count(&self, key: &str) -> Result<Option<u64>> {
        self.store
            .get(key)
            .await?
            .map(|raw| parse_count(key, &raw))
            .transpose()
    }

    /// Count and remaining lifetime, read in one atomic step.
    async fn current_window(&self, key: &str) -> Result<Option<(u64, Option<Duration>)>> {
        match self.store.get_with_ttl(key).await? {
            Some((raw, ttl)) => Ok(Some((parse_count(key, &raw)?, ttl))),
            None => Ok(None),
        }
    }

    /// Read the counter without changing it.
    ///
    /// Returns `(is_blocked, current_count)`; an absent counter is `(false, 0)`.
    pub async fn check(&self, identity: &RequestIdentity) -> Result<(bool, u64)> {
        let count = self.current_count(&self.key(identity)).await?.unwrap_or(0);
        Ok((count >= self.max_requests, count))
    }

    /// Count one request for `identity`, as observed by an earlier `check`.
    ///
    /// The increment and the TTL are applied in one atomic step. A counter
    /// that already has a TTL keeps it, and a counter created by this call
    /// gets a full window. That includes the case where the window expired
    /// after `check` returned, however `observed_count` reads. Returns the
    /// new count.
    pub async fn record(&self, identity: &RequestIdentity, observed_count: u64) -> Result<u64> {
        let count = self
            .store
            .incr_with_expiry(&self.key(identity), self.window)
            .await?;
        if count <= observed_count {
            debug!(
                identity = %identity,
                observed_count,
                count,
                "Window expired between check and record"
            );
        }
        Ok(count)
    }

    /// Decide whether to admit a request from `identity`, counting it if so.
    ///
    /// The decision and the increment happen in one atomic store operation;
    /// concurrent callers for the same identity can never push the admitted
    /// total past `max_requests`. Denied requests do not touch the counter.
    #[instrument(skip_all, fields(identity = %identity))]
    pub async fn admit(&self, identity: &RequestIdentity) -> Result<AdmissionResult> {
        let update = self
            .store
            .incr_below(&self.key(identity), self.max_requests, self.window)
            .await?;

        if update.admitted {
            trace!(count = update.count, "Request admitted");
            Ok(AdmissionResult::Allowed)
        } else {
            debug!(
                count = update.count,
                limit = self.max_requests,
                "Rate limit exceeded"
            );
            Ok(AdmissionResult::Denied)
        }
    }

    /// Where `identity` stands against its limit right now.
    pub async fn status(&self, identity: &RequestIdentity) -> Result<RateLimitStatus> {
        let (count, reset_after) = self
            .current_window(&self.key(identity))
            .await?
            .unwrap_or((0, None));

        Ok(RateLimitStatus {
            count,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            reset_after,
        })
    }

    /// The stored counter for `identity`, if a window is open.
    pub async fn counter(&self, identity: &RequestIdentity) -> Result<Option<RateCounter>> {
        let Some((count, expires_in)) = self.current_window(&self.key(identity)).await? else {
            return Ok(None);
        };

        Ok(Some(RateCounter::new(
            identity.clone(),
            count,
            self.window,
            expires_in,
            Utc::now(),
        )))
    }

    /// Close the identity's window early. Returns whether a counter existed.
    pub async fn reset(&self, identity: &RequestIdentity) -> Result<bool> {
        let removed = self.store.del(&self.key(identity)).await?;
        debug!(identity = %identity, removed, "Counter reset");
        Ok(removed)
    }
}

fn parse_count(key: &str, raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| KvflowError::Store(format!("counter {} holds {:?}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockClock};

    fn config(max_requests: u64, window_seconds: u64) -> RateLimitingConfig {
        RateLimitingConfig {
            max_requests,
            window_seconds,
            ..RateLimitingConfig::default()
        }
    }

    fn limiter_with_clock(
        max_requests: u64,
        window_seconds: u64,
    ) -> (RateLimiter<MemoryStore>, Arc<MemoryStore>, MockClock) {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(Arc::clone(&store), &config(max_requests, window_seconds))
            .unwrap();
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_five_requests_against_limit_of_three() {
        let (limiter, _, _) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(limiter.admit(&identity).await.unwrap());
        }

        use AdmissionResult::{Allowed, Denied};
        assert_eq!(results, vec![Allowed, Allowed, Allowed, Denied, Denied]);
    }

    #[tokio::test]
    async fn test_requests_within_limit_all_admitted() {
        let (limiter, _, _) = limiter_with_clock(10, 15);
        let identity = RequestIdentity::new("client");

        for n in 1..=10 {
            assert!(limiter.admit(&identity).await.unwrap().is_allowed(), "request {}", n);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(RateLimiter::new(store, &config(3, 15)).unwrap());
        let identity = RequestIdentity::new("1.2.3.4");

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let identity = identity.clone();
                tokio::spawn(async move { limiter.admit(&identity).await.unwrap() })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let allowed = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(AdmissionResult::is_allowed)
            .count();

        assert_eq!(allowed, 3);
        assert_eq!(limiter.check(&identity).await.unwrap(), (true, 3));
    }

    #[tokio::test]
    async fn test_window_expiry_readmits() {
        let (limiter, _, clock) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        for _ in 0..3 {
            limiter.admit(&identity).await.unwrap();
        }
        assert_eq!(limiter.admit(&identity).await.unwrap(), AdmissionResult::Denied);

        clock.advance(Duration::from_secs(14));
        assert_eq!(limiter.admit(&identity).await.unwrap(), AdmissionResult::Denied);

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.admit(&identity).await.unwrap(), AdmissionResult::Allowed);
        assert_eq!(limiter.check(&identity).await.unwrap(), (false, 1));
    }

    #[tokio::test]
    async fn test_window_is_not_extended_by_later_requests() {
        let (limiter, _, clock) = limiter_with_clock(5, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        limiter.admit(&identity).await.unwrap();
        clock.advance(Duration::from_secs(10));
        limiter.admit(&identity).await.unwrap();

        let status = limiter.status(&identity).await.unwrap();
        assert_eq!(status.count, 2);
        assert_eq!(status.reset_after, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let (limiter, _, _) = limiter_with_clock(1, 15);
        let a = RequestIdentity::new("10.0.0.1");
        let b = RequestIdentity::new("10.0.0.2");

        assert!(limiter.admit(&a).await.unwrap().is_allowed());
        assert!(!limiter.admit(&a).await.unwrap().is_allowed());
        assert!(limiter.admit(&b).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_check_is_read_only() {
        let (limiter, _, _) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        assert_eq!(limiter.check(&identity).await.unwrap(), (false, 0));
        assert_eq!(limiter.check(&identity).await.unwrap(), (false, 0));

        limiter.admit(&identity).await.unwrap();
        assert_eq!(limiter.check(&identity).await.unwrap(), (false, 1));
        assert_eq!(limiter.check(&identity).await.unwrap(), (false, 1));
    }

    #[tokio::test]
    async fn test_check_then_record_sets_ttl_once() {
        let (limiter, store, clock) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");
        let key = identity.counter_key("rate_limit:");

        let (blocked, count) = limiter.check(&identity).await.unwrap();
        assert!(!blocked);
        assert_eq!(limiter.record(&identity, count).await.unwrap(), 1);
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(15)));

        clock.advance(Duration::from_secs(5));
        let (_, count) = limiter.check(&identity).await.unwrap();
        assert_eq!(limiter.record(&identity, count).await.unwrap(), 2);
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(10)));

        let (_, count) = limiter.check(&identity).await.unwrap();
        limiter.record(&identity, count).await.unwrap();
        assert_eq!(limiter.check(&identity).await.unwrap(), (true, 3));
    }

    #[tokio::test]
    async fn test_record_after_window_expired_opens_new_window() {
        let (limiter, store, clock) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");
        let key = identity.counter_key("rate_limit:");

        let (_, count) = limiter.check(&identity).await.unwrap();
        limiter.record(&identity, count).await.unwrap();

        // The window lapses between this check and the matching record.
        let (_, count) = limiter.check(&identity).await.unwrap();
        assert_eq!(count, 1);
        clock.advance(Duration::from_secs(15));
        assert_eq!(limiter.record(&identity, count).await.unwrap(), 1);
        assert_eq!(store.ttl(&key).await.unwrap(), Some(Duration::from_secs(15)));

        for _ in 0..2 {
            let (_, count) = limiter.check(&identity).await.unwrap();
            limiter.record(&identity, count).await.unwrap();
        }
        assert_eq!(limiter.check(&identity).await.unwrap(), (true, 3));

        clock.advance(Duration::from_secs(15));
        assert_eq!(limiter.check(&identity).await.unwrap(), (false, 0));
    }

    #[tokio::test]
    async fn test_status_after_expiry_is_empty() {
        let (limiter, _, clock) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        limiter.admit(&identity).await.unwrap();
        clock.advance(Duration::from_secs(15));

        let status = limiter.status(&identity).await.unwrap();
        assert_eq!(status.count, 0);
        assert_eq!(status.reset_after, None);
        assert!(limiter.counter(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_an_admission() {
        let (limiter, store, _) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");
        store.set_unavailable(true);

        let err = limiter.admit(&identity).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(limiter.check(&identity).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_counter_snapshot_and_reset() {
        let (limiter, _, clock) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        assert!(limiter.counter(&identity).await.unwrap().is_none());

        limiter.admit(&identity).await.unwrap();
        clock.advance(Duration::from_secs(3));
        limiter.admit(&identity).await.unwrap();

        let counter = limiter.counter(&identity).await.unwrap().unwrap();
        assert_eq!(counter.count, 2);
        assert_eq!(counter.ttl, Duration::from_secs(15));
        assert_eq!(counter.expires_in, Some(Duration::from_secs(12)));
        assert!(counter.window_started_at.is_some());

        assert!(limiter.reset(&identity).await.unwrap());
        assert!(limiter.counter(&identity).await.unwrap().is_none());
        assert!(!limiter.reset(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reports_remaining() {
        let (limiter, _, _) = limiter_with_clock(3, 15);
        let identity = RequestIdentity::new("1.2.3.4");

        let status = limiter.status(&identity).await.unwrap();
        assert_eq!(status.remaining, 3);
        assert_eq!(status.reset_after, None);

        limiter.admit(&identity).await.unwrap();
        let status = limiter.status(&identity).await.unwrap();
        assert_eq!(status.count, 1);
        assert_eq!(status.remaining, 2);
        assert!(!status.is_blocked());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result = RateLimiter::new(store, &config(0, 15));
        assert!(matches!(result, Err(KvflowError::Config(_))));
    }
}
