//! Results of limiter evaluations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::window::TimeWindow;

/// Outcome of a single rate limit evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the requested tokens were consumed
    pub allowed: bool,
    /// Bucket capacity the decision was made against
    pub limit: u64,
    /// Tokens left after this evaluation
    pub remaining: u64,
    /// Allowed: when the bucket would be full again. Denied: when enough tokens will exist.
    pub reset_time: DateTime<Utc>,
    /// Zero unless denied
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Build a decision from the post-consumption balance.
    ///
    /// Both the local bucket and the distributed limiter funnel through here so
    /// reset and retry values agree regardless of backend.
    pub fn evaluate(
        allowed: bool,
        remaining: u64,
        requested: u64,
        capacity: u64,
        refill_rate: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let (reset_time, retry_after) = if allowed {
            let secs_to_full = secs_to_accumulate(capacity.saturating_sub(remaining), refill_rate);
            (add_secs(now, secs_to_full), Duration::ZERO)
        } else {
            let needed = requested.saturating_sub(remaining);
            let wait = secs_to_accumulate(needed, refill_rate).max(1);
            (add_secs(now, wait), Duration::from_secs(wait))
        };

        Self {
            allowed,
            limit: capacity,
            remaining,
            reset_time,
            retry_after,
        }
    }

    /// Retry-After value in whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs()
    }
}

/// Whole seconds needed to accumulate `tokens` at `refill_rate` tokens per second.
fn secs_to_accumulate(tokens: u64, refill_rate: u64) -> u64 {
    if tokens == 0 {
        return 0;
    }
    if refill_rate == 0 {
        return u64::from(u32::MAX);
    }
    tokens.div_ceil(refill_rate)
}

fn add_secs(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Non-mutating projection of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub tokens: u64,
    pub capacity: u64,
    pub refill_rate: u64,
}

impl BucketStatus {
    /// Status of a bucket that has never seen traffic.
    pub fn full(capacity: u64, refill_rate: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
        }
    }

    /// What a request for `requested` tokens would get right now, without consuming.
    pub fn project(&self, requested: u64, now: DateTime<Utc>) -> RateLimitDecision {
        let allowed = self.tokens >= requested;
        let remaining = if allowed {
            self.tokens - requested
        } else {
            self.tokens
        };
        RateLimitDecision::evaluate(
            allowed,
            remaining,
            requested,
            self.capacity,
            self.refill_rate,
            now,
        )
    }
}

/// Aggregate view of a limiter for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStats {
    /// "local" or "distributed"
    pub backend: String,
    /// Number of keys currently holding state
    pub tracked_keys: u64,
    pub capacity: u64,
    pub refill_rate: u64,
    pub window: TimeWindow,
}
