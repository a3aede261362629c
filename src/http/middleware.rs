//! Rate limit middleware for routes served by the web tier.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::response::RateLimitResponse;
use super::service::peer_ip;
use crate::ratelimit::{ClientIdentifier, RateLimiter};

/// Count the request against `limiter` and short-circuit with 429 when the
/// client is over budget.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/login", post(login))
///     .layer(axum::middleware::from_fn_with_state(auth_limiter, enforce_rate_limit));
/// ```
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let identifier =
        ClientIdentifier::from_headers(request.headers(), peer_ip(request.extensions()));
    let decision = limiter.check_client(&identifier).await;

    let shaped = RateLimitResponse {
        limiter: limiter.name(),
        limit: limiter.policy().max_requests,
        decision,
    };
    if !decision.allowed {
        return shaped.rejection();
    }

    let headers = shaped.headers();
    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    response
}
