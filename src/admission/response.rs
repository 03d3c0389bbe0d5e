//! Rate limit response headers and the rejection body.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitDecision;

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    /// Seconds until the request could succeed
    pub retry_after: u64,
    /// RFC 3339 timestamp matching `X-RateLimit-Reset`
    pub reset_time: String,
    pub limit: u64,
    pub remaining: u64,
}

impl From<&RateLimitDecision> for RejectionBody {
    fn from(decision: &RateLimitDecision) -> Self {
        Self {
            error: "Rate limit exceeded".to_string(),
            message: "Too many requests".to_string(),
            retry_after: decision.retry_after_secs(),
            reset_time: decision
                .reset_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            limit: decision.limit,
            remaining: decision.remaining,
        }
    }
}

/// Write the `X-RateLimit-*` headers, plus `Retry-After` on denial.
pub fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_time.timestamp()));

    if !decision.allowed {
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
    }
}

/// The response sent instead of calling the handler.
pub fn rejection(decision: &RateLimitDecision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RejectionBody::from(decision)),
    )
        .into_response();
    apply_headers(response.headers_mut(), decision);
    response
}
