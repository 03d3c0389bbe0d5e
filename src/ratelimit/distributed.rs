//! Distributed rate limiter backed by Redis.
//!
//! Each call runs refill, compare and subtract inside one server-side Lua
//! script, so every process sharing the Redis instance sees one consistent
//! bucket per key. This limiter holds no mutable bucket state of its own.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::{refill, BucketParams};
use super::clock::{Clock, SystemClock};
use super::decision::{BucketStatus, LimiterStats, RateLimitDecision};
use super::window::TimeWindow;
use crate::config::RedisConfig;
use crate::error::{AdmissionError, Result};

/// Refill-then-consume, atomically. Mirrors [`refill`] in Lua.
///
/// KEYS[1] bucket key
/// ARGV: capacity, refill_rate, requested, now_ms, ttl_secs
/// Returns {allowed (0/1), tokens}
const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
    tokens = capacity
    last = now
end

if tokens >= capacity then
    tokens = capacity
    if now > last then last = now end
elseif now > last then
    local added = math.floor((now - last) * rate / 1000)
    if added >= capacity - tokens then
        tokens = capacity
        last = now
    elseif added > 0 then
        tokens = tokens + added
        last = last + math.floor(added * 1000 / rate)
    end
end

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last)
redis.call('EXPIRE', key, ttl)
return {allowed, tokens}
"#;

/// Return tokens to an existing bucket, capped at capacity.
///
/// KEYS[1] bucket key
/// ARGV: capacity, amount, ttl_secs
const REFUND_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local amount = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local tokens = tonumber(redis.call('HGET', key, 'tokens'))
if tokens == nil then
    return capacity
end
tokens = math.min(capacity, tokens + amount)
redis.call('HSET', key, 'tokens', tokens)
redis.call('EXPIRE', key, ttl)
return tokens
"#;

/// A distributed rate limiter backed by a shared Redis instance.
pub struct DistributedRateLimiter {
    client: Client,
    /// Lazily connected, multiplexed connections used round-robin.
    pool: Vec<OnceCell<ConnectionManager>>,
    next: AtomicUsize,
    consume: Script,
    refund: Script,
    params: BucketParams,
    window: TimeWindow,
    key_prefix: String,
    ttl: Duration,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("params", &self.params)
            .field("key_prefix", &self.key_prefix)
            .field("pool_size", &self.pool.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DistributedRateLimiter {
    /// Create a limiter without touching the network.
    ///
    /// Connections are opened on first use; an unreachable server surfaces
    /// as an error from each call.
    pub fn new(config: &RedisConfig, params: BucketParams, window: TimeWindow) -> Result<Self> {
        let client = Client::open(config.connection_url())?;
        let pool = (0..config.pool_size.max(1)).map(|_| OnceCell::new()).collect();

        Ok(Self {
            client,
            pool,
            next: AtomicUsize::new(0),
            consume: Script::new(CONSUME_SCRIPT),
            refund: Script::new(REFUND_SCRIPT),
            params,
            window,
            key_prefix: config.key_prefix.clone(),
            ttl: Duration::from_secs(config.ttl_secs.max(1)),
            timeout: Duration::from_millis(config.timeout_ms),
            clock: Arc::new(SystemClock),
        })
    }

    /// Create a limiter and verify the server answers a PING.
    ///
    /// Failure here is a configuration error: distributed mode was asked for
    /// and cannot be honoured.
    pub async fn connect(config: &RedisConfig, params: BucketParams, window: TimeWindow) -> Result<Self> {
        let limiter = Self::new(config, params, window)?;
        limiter.ping().await.map_err(|e| {
            AdmissionError::Config(format!(
                "failed to connect to Redis at {}:{}: {}",
                config.host, config.port, e
            ))
        })?;

        info!(
            host = %config.host,
            port = config.port,
            pool_size = limiter.pool.len(),
            "Connected to Redis for distributed rate limiting"
        );
        Ok(limiter)
    }

    /// Replace the clock used to timestamp bucket updates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Round-trip a PING to the server.
    pub async fn ping(&self) -> Result<()> {
        self.bounded(self.send_ping()).await
    }

    async fn send_ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Redis key holding the bucket for a client key.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let conn = self.pool[slot]
            .get_or_try_init(|| async {
                debug!(slot = slot, "Opening Redis connection");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run a backend operation under the configured deadline.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Redis operation timed out");
                Err(AdmissionError::Timeout(self.timeout))
            }
        }
    }

    async fn run_consume(&self, storage_key: &str, tokens: u64, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .consume
            .key(storage_key)
            .arg(self.params.capacity())
            .arg(self.params.refill_rate())
            .arg(tokens)
            .arg(now.timestamp_millis())
            .arg(self.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn run_refund(&self, storage_key: &str, tokens: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = self
            .refund
            .key(storage_key)
            .arg(self.params.capacity())
            .arg(tokens)
            .arg(self.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fetch_state(&self, storage_key: &str) -> Result<(Option<i64>, Option<i64>)> {
        let mut conn = self.connection().await?;
        let stored: (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(storage_key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await?;
        Ok(stored)
    }

    async fn delete_key(&self, storage_key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL").arg(storage_key).query_async(&mut conn).await?;
        Ok(())
    }

    /// Count keys under our prefix with a cursor-based SCAN.
    async fn count_keys(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut total: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            total += keys.len() as u64;
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }
}

/// Interpret the `{allowed, tokens}` reply of the consume script.
fn parse_consume_reply(reply: &[i64]) -> Result<(bool, u64)> {
    match reply {
        [allowed, tokens] if *tokens >= 0 => Ok((*allowed == 1, *tokens as u64)),
        other => Err(AdmissionError::UnexpectedReply(format!(
            "consume script returned {:?}",
            other
        ))),
    }
}

/// Project stored state forward to `now` without writing it back.
fn project_status(
    stored: (Option<i64>, Option<i64>),
    now: DateTime<Utc>,
    params: BucketParams,
) -> BucketStatus {
    let (tokens, last_refill) = match stored {
        (Some(tokens), Some(last_ms)) => (tokens, last_ms),
        _ => return BucketStatus::full(params.capacity(), params.refill_rate()),
    };

    let tokens = u64::try_from(tokens).unwrap_or(0).min(params.capacity());
    let last_refill = DateTime::from_timestamp_millis(last_refill).unwrap_or(now);
    let (tokens, _) = refill(tokens, last_refill, now, params);

    BucketStatus {
        tokens,
        capacity: params.capacity(),
        refill_rate: params.refill_rate(),
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check_rate_limit(&self, key: &str, tokens: u64) -> Result<RateLimitDecision> {
        let storage_key = self.storage_key(key);
        let now = self.clock.now();

        trace!(key = %storage_key, tokens = tokens, "Checking distributed rate limit");

        let reply = self.bounded(self.run_consume(&storage_key, tokens, now)).await?;

        let (allowed, remaining) = parse_consume_reply(&reply)?;
        if !allowed {
            debug!(key = %storage_key, remaining = remaining, "Distributed rate limit exceeded");
        }

        Ok(RateLimitDecision::evaluate(
            allowed,
            remaining,
            tokens,
            self.params.capacity(),
            self.params.refill_rate(),
            now,
        ))
    }

    async fn refund(&self, key: &str, tokens: u64) -> Result<()> {
        let storage_key = self.storage_key(key);
        self.bounded(self.run_refund(&storage_key, tokens)).await
    }

    async fn status(&self, key: &str) -> Result<BucketStatus> {
        let storage_key = self.storage_key(key);
        let stored = self.bounded(self.fetch_state(&storage_key)).await?;

        Ok(project_status(stored, self.clock.now(), self.params))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key);
        self.bounded(self.delete_key(&storage_key)).await?;

        debug!(key = %storage_key, "Reset distributed bucket");
        Ok(())
    }

    async fn stats(&self) -> Result<LimiterStats> {
        let tracked_keys = self.bounded(self.count_keys()).await?;
        Ok(LimiterStats {
            backend: "distributed".to_string(),
            tracked_keys,
            capacity: self.params.capacity(),
            refill_rate: self.params.refill_rate(),
            window: self.window,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
