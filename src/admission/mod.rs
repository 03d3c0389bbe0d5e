//! HTTP admission control.
//!
//! [`AdmissionControl`] ties together client identification, the configured
//! limiter backend and response shaping. Install it on a router with
//! [`AdmissionControl::protect`] ahead of any authentication layers so that
//! anonymous traffic is limited too.

mod credentials;
mod key;
mod middleware;
mod response;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BackendMode, IdentifierMode, RateLimitingConfig};
use crate::error::Result;
use crate::ratelimit::{
    DistributedRateLimiter, LimiterStats, LocalRateLimiter, RateLimiterBackend, TimeWindow,
};

pub use credentials::{api_key, bearer_token, API_KEY_HEADER};
pub use key::{client_ip, KeyDeriver, KeyFn, UNKNOWN_PREFIX};
pub use middleware::admit;
pub use response::{
    apply_headers, rejection, RejectionBody, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER,
};

/// Settings echoed back by the stats endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSettings {
    pub identifier: IdentifierMode,
    pub capacity: u64,
    pub refill_rate: u64,
    pub window: TimeWindow,
    pub backend: BackendMode,
    pub skip_successful: bool,
    pub skip_failed: bool,
}

impl From<&RateLimitingConfig> for AdmissionSettings {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            identifier: config.identifier,
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            window: config.window,
            backend: config.backend,
            skip_successful: config.skip_successful,
            skip_failed: config.skip_failed,
        }
    }
}

/// Configuration summary plus whatever the backend could report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub config: AdmissionSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiter: Option<LimiterStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiter_error: Option<String>,
}

/// Shared state of the admission layer.
pub struct AdmissionControl {
    limiter: Arc<dyn RateLimiterBackend>,
    keys: KeyDeriver,
    settings: AdmissionSettings,
    /// Set when the backend is in-process, so idle buckets can be swept
    local: Option<Arc<LocalRateLimiter>>,
}

impl AdmissionControl {
    /// Admission control over an arbitrary backend.
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, config: &RateLimitingConfig) -> Self {
        Self {
            limiter,
            keys: KeyDeriver::new(config.identifier),
            settings: AdmissionSettings::from(config),
            local: None,
        }
    }

    /// Admission control over an in-process limiter.
    pub fn with_local(limiter: Arc<LocalRateLimiter>, config: &RateLimitingConfig) -> Self {
        let mut control = Self::new(limiter.clone(), config);
        control.local = Some(limiter);
        control
    }

    /// Derive client keys with `key_fn` first.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.keys = self.keys.with_custom(key_fn);
        self
    }

    /// Build the configured backend.
    ///
    /// The distributed backend is contacted once here; an unreachable server is
    /// a configuration error.
    pub async fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let params = config.bucket_params()?;

        match config.backend {
            BackendMode::Local => {
                let limiter = LocalRateLimiter::new(params, config.window)
                    .with_max_buckets(config.max_local_buckets);
                info!(
                    capacity = params.capacity(),
                    refill_rate = params.refill_rate(),
                    max_buckets = config.max_local_buckets,
                    "Using local rate limiter"
                );
                Ok(Self::with_local(Arc::new(limiter), config))
            }
            BackendMode::Distributed => {
                let limiter =
                    DistributedRateLimiter::connect(&config.redis, params, config.window).await?;
                info!(
                    capacity = params.capacity(),
                    refill_rate = params.refill_rate(),
                    key_prefix = %config.redis.key_prefix,
                    "Using distributed rate limiter"
                );
                Ok(Self::new(Arc::new(limiter), config))
            }
        }
    }

    /// Key the request's quota is tracked under.
    pub fn client_key(&self, request: &Request) -> String {
        self.keys.derive(request)
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiterBackend> {
        &self.limiter
    }

    /// Whether the token spent on a response with `status` goes back.
    pub fn should_refund(&self, status: StatusCode) -> bool {
        (self.settings.skip_successful && status.is_success())
            || (self.settings.skip_failed && (status.is_client_error() || status.is_server_error()))
    }

    /// Configuration summary and backend counters. Backend failures are
    /// reported in the result rather than returned.
    pub async fn stats(&self) -> AdmissionStats {
        let (limiter, limiter_error) = match self.limiter.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(e) => {
                warn!(error = %e, "Failed to collect limiter stats");
                (None, Some(e.to_string()))
            }
        };

        AdmissionStats {
            config: self.settings.clone(),
            limiter,
            limiter_error,
        }
    }

    /// Wrap every route of `router` in the admission layer.
    pub fn protect<S>(self: &Arc<Self>, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(axum::middleware::from_fn_with_state(self.clone(), admit))
    }

    /// Periodically drop idle local buckets. Does nothing for a shared backend.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        let local = self.local.clone()?;
        if every.is_zero() {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = local.sweep();
                debug!(removed = removed, tracked = local.bucket_count(), "Bucket sweep finished");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BucketParams;

    fn config() -> RateLimitingConfig {
        RateLimitingConfig {
            capacity: 3,
            refill_rate: 1,
            ..RateLimitingConfig::default()
        }
    }

    #[test]
    fn test_should_refund() {
        let neither = AdmissionControl::new(
            Arc::new(LocalRateLimiter::new(BucketParams::new(3, 1).unwrap(), TimeWindow::Minute)),
            &config(),
        );
        assert!(!neither.should_refund(StatusCode::OK));
        assert!(!neither.should_refund(StatusCode::BAD_GATEWAY));

        let both = RateLimitingConfig {
            skip_successful: true,
            skip_failed: true,
            ..config()
        };
        let control = AdmissionControl::new(
            Arc::new(LocalRateLimiter::new(BucketParams::new(3, 1).unwrap(), TimeWindow::Minute)),
            &both,
        );
        assert!(control.should_refund(StatusCode::CREATED));
        assert!(control.should_refund(StatusCode::NOT_FOUND));
        assert!(control.should_refund(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!control.should_refund(StatusCode::MOVED_PERMANENTLY));
    }

    #[tokio::test]
    async fn test_from_config_local() {
        let control = AdmissionControl::from_config(&config()).await.unwrap();
        let stats = control.stats().await;
        assert_eq!(stats.config.capacity, 3);
        assert_eq!(stats.config.backend, BackendMode::Local);
        let limiter = stats.limiter.unwrap();
        assert_eq!(limiter.backend, "local");
        assert_eq!(limiter.tracked_keys, 0);
        assert!(stats.limiter_error.is_none());
    }

    #[tokio::test]
    async fn test_from_config_unreachable_redis_is_fatal() {
        let mut config = config();
        config.backend = BackendMode::Distributed;
        config.redis.port = 1;
        config.redis.timeout_ms = 500;

        let result = AdmissionControl::from_config(&config).await;
        assert!(matches!(result, Err(crate::error::AdmissionError::Config(_))));
    }

    #[tokio::test]
    async fn test_sweeper_only_for_local() {
        let control = Arc::new(AdmissionControl::from_config(&config()).await.unwrap());
        let handle = control.spawn_sweeper(Duration::from_secs(60));
        assert!(handle.is_some());
        if let Some(handle) = handle {
            handle.abort();
        }
        assert!(control.spawn_sweeper(Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_full_buckets() {
        let limiter = Arc::new(LocalRateLimiter::new(
            BucketParams::new(3, 1).unwrap(),
            TimeWindow::Minute,
        ));
        let control = Arc::new(AdmissionControl::with_local(limiter.clone(), &config()));

        // A bucket that is still full is removed on the next sweep
        limiter.check("client", 0);
        assert_eq!(limiter.bucket_count(), 1);

        let handle = control.spawn_sweeper(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter.bucket_count(), 0);
        handle.abort();
    }
}
