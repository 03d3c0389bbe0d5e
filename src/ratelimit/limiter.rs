//! In-process rate limiter that owns one token bucket per client key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::bucket::{BucketParams, TokenBucket};
use super::clock::{Clock, SystemClock};
use super::decision::{BucketStatus, LimiterStats, RateLimitDecision};
use super::window::TimeWindow;
use crate::error::Result;

/// Default bound on the number of buckets held in memory.
pub const DEFAULT_MAX_BUCKETS: usize = 10_000;

const EVICTION_BATCH_DIVISOR: usize = 10;

/// The local rate limiter that manages per-key token buckets.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Buckets are created full on first use. The map is bounded: buckets that
/// have refilled to capacity are swept, and if that is not enough the least
/// recently used bucket is evicted.
pub struct LocalRateLimiter {
    /// Token buckets indexed by client key
    buckets: DashMap<String, Arc<TokenBucket>>,
    /// Shape of every bucket this limiter creates
    params: BucketParams,
    /// Advertised accounting window
    window: TimeWindow,
    /// Upper bound on `buckets.len()`
    max_buckets: usize,
    clock: Arc<dyn Clock>,
}

impl LocalRateLimiter {
    /// Create a new rate limiter using the system clock.
    pub fn new(params: BucketParams, window: TimeWindow) -> Self {
        Self::with_clock(params, window, Arc::new(SystemClock))
    }

    /// Create a new rate limiter driven by the given clock.
    pub fn with_clock(params: BucketParams, window: TimeWindow, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            params,
            window,
            max_buckets: DEFAULT_MAX_BUCKETS,
            clock,
        }
    }

    /// Bound the number of buckets kept in memory.
    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets.max(1);
        self
    }

    /// Get the bucket for `key`, creating a full one on first use.
    ///
    /// Every caller with the same key gets the same bucket instance until the
    /// bucket is swept or evicted.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }
        self.make_room();
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| self.new_bucket(key))
            .clone()
    }

    /// Consume `tokens` for `key` and describe the result.
    pub fn check(&self, key: &str, tokens: u64) -> RateLimitDecision {
        trace!(key = %key, tokens = tokens, "Checking local rate limit");

        // Consume while holding the map guard so a concurrent sweep cannot
        // drop the bucket between lookup and consume.
        let decision = if let Some(bucket) = self.buckets.get(key) {
            bucket.check_rate_limit(tokens)
        } else {
            self.make_room();
            let bucket = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| self.new_bucket(key));
            bucket.check_rate_limit(tokens)
        };

        if !decision.allowed {
            debug!(key = %key, retry_after = ?decision.retry_after, "Rate limit exceeded");
        }
        decision
    }

    /// Status for `key` without creating a bucket.
    pub fn bucket_status(&self, key: &str) -> BucketStatus {
        match self.buckets.get(key) {
            Some(bucket) => bucket.status(),
            None => BucketStatus::full(self.params.capacity(), self.params.refill_rate()),
        }
    }

    /// Return tokens to an existing bucket. Missing buckets are already full.
    pub fn give_back(&self, key: &str, tokens: u64) {
        if let Some(bucket) = self.buckets.get(key) {
            bucket.refund(tokens);
        }
    }

    /// Drop the bucket for `key`; the next access starts from a full bucket.
    pub fn remove(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Remove every bucket that has refilled to capacity.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full());
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.buckets.len(), "Swept idle buckets");
        }
        removed
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket shape used by this limiter.
    pub fn params(&self) -> BucketParams {
        self.params
    }

    fn new_bucket(&self, key: &str) -> Arc<TokenBucket> {
        debug!(
            key = %key,
            capacity = self.params.capacity(),
            refill_rate = self.params.refill_rate(),
            "Creating new token bucket"
        );
        Arc::new(TokenBucket::new(self.params, self.clock.clone()))
    }

    /// Keep the map under `max_buckets` before inserting a new key.
    ///
    /// At the cap, one sweep plus one scan frees a batch of slots
    /// (a tenth of the cap) so the next inserts do no map-wide work.
    fn make_room(&self) {
        if self.buckets.len() < self.max_buckets {
            return;
        }
        self.sweep();

        let target = self.max_buckets - self.eviction_batch();
        let excess = self.buckets.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .buckets
            .iter()
            .map(|entry| (entry.value().last_seen(), entry.key().clone()))
            .collect();
        if excess < by_age.len() {
            by_age.select_nth_unstable_by_key(excess, |(seen, _)| *seen);
            by_age.truncate(excess);
        }

        for (_, key) in &by_age {
            self.buckets.remove(key);
        }
        debug!(
            evicted = by_age.len(),
            remaining = self.buckets.len(),
            "Evicted least recently used buckets"
        );
    }

    fn eviction_batch(&self) -> usize {
        (self.max_buckets / EVICTION_BATCH_DIVISOR).max(1)
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    async fn check_rate_limit(&self, key: &str, tokens: u64) -> Result<RateLimitDecision> {
        Ok(self.check(key, tokens))
    }

    async fn refund(&self, key: &str, tokens: u64) -> Result<()> {
        self.give_back(key, tokens);
        Ok(())
    }

    async fn status(&self, key: &str) -> Result<BucketStatus> {
        Ok(self.bucket_status(key))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn stats(&self) -> Result<LimiterStats> {
        Ok(LimiterStats {
            backend: "local".to_string(),
            tracked_keys: self.buckets.len() as u64,
            capacity: self.params.capacity(),
            refill_rate: self.params.refill_rate(),
            window: self.window,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
