//! Token bucket implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::clock::Clock;
use super::decision::{BucketStatus, RateLimitDecision};
use crate::error::{AdmissionError, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Immutable shape of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    capacity: u64,
    refill_rate: u64,
}

impl BucketParams {
    /// Create bucket parameters. Both values must be non-zero.
    pub fn new(capacity: u64, refill_rate: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(AdmissionError::Config("capacity must be greater than zero".into()));
        }
        if refill_rate == 0 {
            return Err(AdmissionError::Config("refill_rate must be greater than zero".into()));
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens granted per second.
    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }
}

/// Apply elapsed-time refill to a balance.
///
/// Returns the new balance and the new `last_refill`. `last_refill` only moves
/// forward by the time that paid for whole tokens, so sub-token remainders
/// carry into the next call. A saturated bucket pins `last_refill` to `now`.
/// A clock that went backwards adds nothing.
pub fn refill(
    tokens: u64,
    last_refill: DateTime<Utc>,
    now: DateTime<Utc>,
    params: BucketParams,
) -> (u64, DateTime<Utc>) {
    if tokens >= params.capacity {
        return (params.capacity, now.max(last_refill));
    }

    let elapsed = match (now - last_refill).to_std() {
        Ok(elapsed) => elapsed,
        Err(_) => return (tokens, last_refill),
    };

    let rate = u128::from(params.refill_rate);
    let added = elapsed.as_nanos() * rate / NANOS_PER_SEC;
    if added == 0 {
        return (tokens, last_refill);
    }

    let room = u128::from(params.capacity - tokens);
    if added >= room {
        return (params.capacity, now);
    }

    let spent = added * NANOS_PER_SEC / rate;
    let last_refill = match i64::try_from(spent) {
        Ok(nanos) => last_refill + chrono::Duration::nanoseconds(nanos),
        Err(_) => now,
    };

    // added < room <= u64::MAX
    (tokens + added as u64, last_refill)
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// A single-key token bucket.
///
/// Refill is computed lazily from elapsed time on every access, inside the
/// same critical section as the consume, so concurrent callers always observe
/// some sequential interleaving.
pub struct TokenBucket {
    params: BucketParams,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("params", &self.params)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl TokenBucket {
    /// Create a bucket seeded at full capacity.
    pub fn new(params: BucketParams, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            params,
            state: Mutex::new(BucketState {
                tokens: params.capacity,
                last_refill: now,
                last_seen: now,
            }),
            clock,
        }
    }

    /// Refill, then take `n` tokens if they are all available.
    pub fn try_consume(&self, n: u64) -> bool {
        self.consume(n).0
    }

    /// Refill, take `n` tokens if possible, and describe the result.
    pub fn check_rate_limit(&self, n: u64) -> RateLimitDecision {
        let (allowed, remaining, now) = self.consume(n);
        RateLimitDecision::evaluate(
            allowed,
            remaining,
            n,
            self.params.capacity,
            self.params.refill_rate,
            now,
        )
    }

    fn consume(&self, n: u64) -> (bool, u64, DateTime<Utc>) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let (tokens, last_refill) = refill(state.tokens, state.last_refill, now, self.params);
        state.tokens = tokens;
        state.last_refill = last_refill;
        state.last_seen = now;

        let allowed = state.tokens >= n;
        if allowed {
            state.tokens -= n;
        }
        (allowed, state.tokens, now)
    }

    /// Current balance with refill applied virtually. Does not mutate the bucket.
    pub fn current_tokens(&self) -> u64 {
        let now = self.clock.now();
        let state = self.state.lock();
        refill(state.tokens, state.last_refill, now, self.params).0
    }

    /// Give back `n` tokens, never exceeding capacity.
    pub fn refund(&self, n: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let (tokens, last_refill) = refill(state.tokens, state.last_refill, now, self.params);
        state.tokens = tokens.saturating_add(n).min(self.params.capacity);
        state.last_refill = if state.tokens == self.params.capacity {
            now.max(last_refill)
        } else {
            last_refill
        };
    }

    /// Snapshot of tokens, capacity and refill rate.
    pub fn status(&self) -> BucketStatus {
        BucketStatus {
            tokens: self.current_tokens(),
            capacity: self.params.capacity,
            refill_rate: self.params.refill_rate,
        }
    }

    /// Whether the bucket has refilled to capacity. A full bucket carries no
    /// information and can be dropped and recreated.
    pub fn is_full(&self) -> bool {
        self.current_tokens() >= self.params.capacity
    }

    /// Last time a caller consumed from this bucket.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.state.lock().last_seen
    }

    /// Get the bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.params.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_rate(&self) -> u64 {
        self.params.refill_rate
    }
}
