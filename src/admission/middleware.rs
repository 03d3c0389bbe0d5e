//! The admission layer itself.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use super::response::{apply_headers, rejection};
use super::AdmissionControl;

/// Admit or reject one request.
///
/// Meant for `axum::middleware::from_fn_with_state`. Consumes one token for
/// the derived client key. A denied request never reaches `next`. If the
/// limiter cannot be consulted the request is forwarded without rate limit
/// headers.
pub async fn admit(
    State(control): State<Arc<AdmissionControl>>,
    request: Request,
    next: Next,
) -> Response {
    let key = control.client_key(&request);

    let mut decision = match control.limiter().check_rate_limit(&key, 1).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!(key = %key, error = %e, "Rate limiter unavailable, admitting request");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        debug!(
            key = %key,
            retry_after = decision.retry_after_secs(),
            "Rejecting request"
        );
        return rejection(&decision);
    }

    let mut response = next.run(request).await;

    if control.should_refund(response.status()) {
        match control.limiter().refund(&key, 1).await {
            Ok(()) => decision.remaining = (decision.remaining + 1).min(decision.limit),
            Err(e) => warn!(key = %key, error = %e, "Failed to refund token"),
        }
    }

    apply_headers(response.headers_mut(), &decision);
    response
}
