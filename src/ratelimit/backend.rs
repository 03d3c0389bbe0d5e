//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::decision::{BucketStatus, LimiterStats, RateLimitDecision};
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the local `LocalRateLimiter` and the
/// `DistributedRateLimiter` so the admission middleware and the management
/// API can work with either. Errors are reported, never folded into a
/// decision; what to do about them is the caller's policy.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Consume `tokens` from the bucket for `key` if available.
    async fn check_rate_limit(&self, key: &str, tokens: u64) -> Result<RateLimitDecision>;

    /// Return `tokens` to the bucket for `key`, saturating at capacity.
    async fn refund(&self, key: &str, tokens: u64) -> Result<()>;

    /// Current state of the bucket for `key`. Unknown keys report a full bucket.
    async fn status(&self, key: &str) -> Result<BucketStatus>;

    /// Forget all state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Aggregate counts and configuration.
    async fn stats(&self) -> Result<LimiterStats>;

    /// The time this limiter evaluates buckets at.
    fn now(&self) -> DateTime<Utc>;
}
