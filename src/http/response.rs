//! Response shapes for the guard endpoints.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::concurrency::ConcurrencyDecision;
use crate::ratelimit::RateLimitDecision;

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedBody<'a> {
    error: &'static str,
    limiter: &'a str,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    reset_at: DateTime<Utc>,
    retry_after_secs: u64,
}

/// A rate limit decision rendered as HTTP.
///
/// Allowed decisions become 200 with the decision as JSON; rejected ones
/// become 429 with the reset time in the body and a `Retry-After` header.
/// Both carry `X-RateLimit-*` headers.
pub struct RateLimitResponse<'a> {
    pub limiter: &'a str,
    pub limit: u64,
    pub decision: RateLimitDecision,
}

impl RateLimitResponse<'_> {
    /// Headers describing the window, also used by the middleware on
    /// admitted requests.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(self.decision.remaining));
        headers.insert(
            RATE_LIMIT_RESET,
            HeaderValue::from(self.decision.reset_at.timestamp().max(0)),
        );
        headers
    }

    fn retry_after_secs(&self) -> u64 {
        let retry_after = self.decision.retry_after(Utc::now());
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        secs.max(1)
    }

    /// The 429 response for a rejected decision.
    pub fn rejection(&self) -> Response {
        let retry_after = self.retry_after_secs();
        let mut headers = self.headers();
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));

        let body = RateLimitedBody {
            error: "Too many requests",
            limiter: self.limiter,
            reset_at: self.decision.reset_at,
            retry_after_secs: retry_after,
        };

        (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
    }
}

impl IntoResponse for RateLimitResponse<'_> {
    fn into_response(self) -> Response {
        if !self.decision.allowed {
            return self.rejection();
        }
        (StatusCode::OK, self.headers(), Json(self.decision)).into_response()
    }
}

impl IntoResponse for ConcurrencyDecision {
    fn into_response(self) -> Response {
        let status = if self.allowed {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        };
        (status, Json(self)).into_response()
    }
}

/// A JSON error body with a status code.
pub struct ErrorResponse {
    pub status: StatusCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
