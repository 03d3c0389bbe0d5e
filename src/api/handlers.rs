//! Management endpoints for inspecting and resetting client quotas.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::admission::{AdmissionControl, AdmissionStats};
use crate::error::{AdmissionError, Result};
use crate::ratelimit::{BucketStatus, RateLimitDecision};

/// Routes served under `/api/ratelimit`.
pub fn routes() -> Router<Arc<AdmissionControl>> {
    Router::new()
        .route("/stats", get(stats))
        .route("/status", get(status))
        .route("/test", post(test))
        .route("/reset", post(reset))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: AdmissionStats,
}

/// What a client would get if it asked now. Never consumes tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionResponse {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: String,
    pub retry_after: u64,
    pub limit: u64,
}

impl From<RateLimitDecision> for ProjectionResponse {
    fn from(decision: RateLimitDecision) -> Self {
        Self {
            allowed: decision.allowed,
            remaining: decision.remaining,
            reset_time: decision
                .reset_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            retry_after: decision.retry_after_secs(),
            limit: decision.limit,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub message: String,
    pub key: String,
}

fn require_key(key: Option<String>, what: &str) -> Result<String> {
    match key.map(|k| k.trim().to_string()) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(AdmissionError::MissingKey(format!("{} is required", what))),
    }
}

fn query_param(
    query: std::result::Result<Query<KeyQuery>, QueryRejection>,
) -> Result<Option<String>> {
    query
        .map(|Query(query)| query.key)
        .map_err(|rejection| AdmissionError::InvalidInput(rejection.body_text()))
}

/// Current balance of a key as a decision for one token.
fn current(status: BucketStatus, now: DateTime<Utc>) -> RateLimitDecision {
    RateLimitDecision::evaluate(
        status.tokens >= 1,
        status.tokens,
        1,
        status.capacity,
        status.refill_rate,
        now,
    )
}

/// GET /stats
pub async fn stats(State(control): State<Arc<AdmissionControl>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: control.stats().await,
    })
}

/// GET /status?key=K
#[instrument(skip_all)]
pub async fn status(
    State(control): State<Arc<AdmissionControl>>,
    query: std::result::Result<Query<KeyQuery>, QueryRejection>,
) -> Result<Json<ProjectionResponse>> {
    let key = require_key(query_param(query)?, "key query parameter")?;
    let limiter = control.limiter();
    let status = limiter.status(&key).await?;
    Ok(Json(current(status, limiter.now()).into()))
}

/// POST /test with `{"key": K, "count": N}`
#[instrument(skip_all)]
pub async fn test(
    State(control): State<Arc<AdmissionControl>>,
    request: std::result::Result<Json<TestRequest>, JsonRejection>,
) -> Result<Json<ProjectionResponse>> {
    let Json(request) =
        request.map_err(|rejection| AdmissionError::InvalidInput(rejection.body_text()))?;
    let key = require_key(Some(request.key), "key")?;
    let count = request.count.max(1);
    let limiter = control.limiter();
    let status = limiter.status(&key).await?;
    Ok(Json(status.project(count, limiter.now()).into()))
}

/// POST /reset?key=K
#[instrument(skip_all)]
pub async fn reset(
    State(control): State<Arc<AdmissionControl>>,
    query: std::result::Result<Query<KeyQuery>, QueryRejection>,
) -> Result<Json<ResetResponse>> {
    let key = require_key(query_param(query)?, "key query parameter")?;
    control.limiter().reset(&key).await?;
    info!(key = %key, "Rate limit reset");
    Ok(Json(ResetResponse {
        message: "Rate limit reset successfully".to_string(),
        key,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{self, header::CONTENT_TYPE, StatusCode};
    use axum::response::Response;
    use tokio_test::{assert_err, assert_ok};
    use tower::ServiceExt;

    use crate::config::RateLimitingConfig;
    use crate::ratelimit::{LocalRateLimiter, ManualClock};

    fn control() -> Arc<AdmissionControl> {
        let config = RateLimitingConfig {
            capacity: 5,
            refill_rate: 1,
            ..RateLimitingConfig::default()
        };
        let limiter = LocalRateLimiter::new(config.bucket_params().unwrap(), config.window);
        Arc::new(AdmissionControl::with_local(Arc::new(limiter), &config))
    }

    fn app(control: &Arc<AdmissionControl>) -> Router {
        routes().with_state(control.clone())
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> http::Request<Body> {
        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> http::Request<Body> {
        http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_require_key() {
        assert_ok!(require_key(Some("client".into()), "key"));
        assert_err!(require_key(Some("  ".into()), "key"));
        assert_err!(require_key(None, "key"));
    }

    #[tokio::test]
    async fn test_status_of_fresh_key() {
        let control = control();
        let response = app(&control).oneshot(get("/status?key=10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 5);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["retry_after"], 0);
    }

    #[tokio::test]
    async fn test_status_reflects_consumption_without_consuming() {
        let control = control();
        control.limiter().check_rate_limit("client", 5).await.unwrap();

        for _ in 0..2 {
            let response = app(&control).oneshot(get("/status?key=client")).await.unwrap();
            let body = json(response).await;
            assert_eq!(body["allowed"], false);
            assert_eq!(body["remaining"], 0);
            assert_eq!(body["retry_after"], 1);
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_bad_request() {
        let control = control();

        let response = app(&control).oneshot(get("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "Missing key");

        let response = app(&control)
            .oneshot(post_json("/test", r#"{"count": 2}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(&control)
            .oneshot(post_json("/reset?key=", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_body_is_structured_bad_request() {
        let control = control();

        for body in [r#"{"key": 5}"#, "not json", r#"{"key": "client", "count": -1}"#] {
            let response = app(&control).oneshot(post_json("/test", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
            assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
            let body = json(response).await;
            assert_eq!(body["error"], "Invalid request");
            assert!(body["details"].as_str().unwrap().starts_with("Invalid input"));
        }

        // Missing content type is also a client error, reported the same way
        let request = http::Request::builder()
            .method("POST")
            .uri("/test")
            .body(Body::from(r#"{"key": "client"}"#))
            .unwrap();
        let response = app(&control).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "Invalid request");
    }

    #[tokio::test]
    async fn test_malformed_query_is_structured_bad_request() {
        let control = control();
        // `key` appears as a sequence, which a single string cannot hold
        let response = app(&control)
            .oneshot(get("/status?key=a&key=b"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "Invalid request");
    }

    #[tokio::test]
    async fn test_projection_uses_limiter_clock() {
        let start = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let config = RateLimitingConfig {
            capacity: 10,
            refill_rate: 2,
            ..RateLimitingConfig::default()
        };
        let limiter = LocalRateLimiter::with_clock(
            config.bucket_params().unwrap(),
            config.window,
            clock.clone(),
        );
        let control = Arc::new(AdmissionControl::with_local(Arc::new(limiter), &config));
        control.limiter().check_rate_limit("client", 10).await.unwrap();

        let response = app(&control).oneshot(get("/status?key=client")).await.unwrap();
        let body = json(response).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["retry_after"], 1);
        assert_eq!(body["reset_time"], "2023-11-14T22:13:21Z");

        clock.advance(std::time::Duration::from_secs(2));
        let response = app(&control)
            .oneshot(post_json("/test", r#"{"key": "client", "count": 4}"#))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 0);
        // Empty again after the projection, 10 tokens at 2/s
        assert_eq!(body["reset_time"], "2023-11-14T22:13:27Z");
    }

    #[tokio::test]
    async fn test_projection_for_count() {
        let control = control();
        control.limiter().check_rate_limit("client", 3).await.unwrap();

        let response = app(&control)
            .oneshot(post_json("/test", r#"{"key": "client", "count": 3}"#))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["remaining"], 2);
        assert_eq!(body["retry_after"], 1);

        // Count defaults to one and nothing was consumed
        let response = app(&control)
            .oneshot(post_json("/test", r#"{"key": "client"}"#))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 1);
    }

    #[tokio::test]
    async fn test_reset_restores_full_bucket() {
        let control = control();
        control.limiter().check_rate_limit("client", 5).await.unwrap();

        let response = app(&control)
            .oneshot(post_json("/reset?key=client", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["message"], "Rate limit reset successfully");
        assert_eq!(body["key"], "client");

        assert_eq!(control.limiter().status("client").await.unwrap().tokens, 5);
    }

    #[tokio::test]
    async fn test_stats_payload() {
        let control = control();
        control.limiter().check_rate_limit("a", 1).await.unwrap();
        control.limiter().check_rate_limit("b", 1).await.unwrap();

        let response = app(&control).oneshot(get("/stats")).await.unwrap();
        let body = json(response).await;
        assert_eq!(body["stats"]["config"]["capacity"], 5);
        assert_eq!(body["stats"]["config"]["backend"], "local");
        assert_eq!(body["stats"]["limiter"]["tracked_keys"], 2);
        assert!(body["stats"].get("limiter_error").is_none());
    }
}
