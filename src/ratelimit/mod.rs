//! Fixed-window rate limiting on top of a key-value store.

mod counter;
mod identity;
mod limiter;

pub use counter::{RateCounter, RateLimitStatus};
pub use identity::RequestIdentity;
pub use limiter::{AdmissionResult, RateLimiter};
