//! Snapshots of an identity's counter.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::identity::RequestIdentity;

/// The stored counter for one identity within its current window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateCounter {
    pub identity: RequestIdentity,
    /// Requests admitted in the current window
    pub count: u64,
    /// Window length the counter was created with
    pub ttl: Duration,
    /// Time left until the counter expires; `None` if it has no expiry
    pub expires_in: Option<Duration>,
    /// When the first request of this window was admitted
    pub window_started_at: Option<DateTime<Utc>>,
}

impl RateCounter {
    /// Build a snapshot, deriving the window start from the remaining TTL.
    pub fn new(
        identity: RequestIdentity,
        count: u64,
        ttl: Duration,
        expires_in: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let window_started_at = expires_in.and_then(|remaining| {
            let elapsed = ttl.saturating_sub(remaining);
            chrono::Duration::from_std(elapsed).ok().map(|e| now - e)
        });

        Self {
            identity,
            count,
            ttl,
            expires_in,
            window_started_at,
        }
    }

    /// When the counter expires and the identity starts a fresh window.
    pub fn resets_at(&self) -> Option<DateTime<Utc>> {
        let start = self.window_started_at?;
        chrono::Duration::from_std(self.ttl).ok().map(|ttl| start + ttl)
    }
}

/// Read-only view of where an identity stands against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets; `None` when no window is open
    pub reset_after: Option<Duration>,
}

impl RateLimitStatus {
    pub fn is_blocked(&self) -> bool {
        self.count >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_from_remaining_ttl() {
        let now = Utc::now();
        let counter = RateCounter::new(
            RequestIdentity::new("1.2.3.4"),
            2,
            Duration::from_secs(15),
            Some(Duration::from_secs(10)),
            now,
        );

        assert_eq!(counter.window_started_at, Some(now - chrono::Duration::seconds(5)));
        assert_eq!(counter.resets_at(), Some(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_no_expiry_has_no_window_start() {
        let counter = RateCounter::new(
            RequestIdentity::new("1.2.3.4"),
            1,
            Duration::from_secs(15),
            None,
            Utc::now(),
        );
        assert_eq!(counter.window_started_at, None);
        assert_eq!(counter.resets_at(), None);
    }

    #[test]
    fn test_status_blocked_at_limit() {
        let status = RateLimitStatus {
            count: 3,
            limit: 3,
            remaining: 0,
            reset_after: Some(Duration::from_secs(4)),
        };
        assert!(status.is_blocked());

        let status = RateLimitStatus { count: 2, remaining: 1, ..status };
        assert!(!status.is_blocked());
    }
}
