//! Kvflow - rate limiting and work queues on a shared key-value store
//!
//! This crate provides two components that coordinate only through the
//! store: a fixed-window rate limiter that admits or rejects requests per
//! identity, and an at-most-once work queue drained by a pool of blocking
//! consumers. Both receive their store handle explicitly, so Redis can be
//! swapped for the in-memory store in tests.

pub mod config;
pub mod error;
pub mod queue;
pub mod ratelimit;
pub mod store;
