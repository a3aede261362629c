//! Guard service routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::response::{ErrorResponse, RateLimitResponse};
use crate::apikey::ApiKeyValidator;
use crate::concurrency::ConcurrencyGuard;
use crate::ratelimit::{ClientIdentifier, LimiterRegistry};
use crate::store::CounterStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct GuardState {
    pub limiters: Arc<LimiterRegistry>,
    pub concurrency: Arc<ConcurrencyGuard>,
    pub api_keys: Arc<ApiKeyValidator>,
    pub store: Arc<dyn CounterStore>,
}

/// Build the guard router.
pub fn router(state: GuardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ratelimit/{limiter}", post(check_rate_limit))
        .route("/v1/concurrency/{key}", get(concurrency_status))
        .route("/v1/concurrency/{key}/acquire", post(acquire_slot))
        .route("/v1/concurrency/{key}/release", post(release_slot))
        .route("/v1/api-keys/validate", post(validate_api_key))
        .with_state(state)
}

async fn health(State(state): State<GuardState>) -> Response {
    let store = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!(error = %e, "Counter store health check failed");
            "degraded"
        }
    };

    Json(serde_json::json!({ "status": "ok", "store": store })).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct CheckRequest {
    identifier: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AcquireRequest {
    limit: Option<u64>,
}

/// Parse an optional JSON body; an empty body means defaults.
fn optional_json<T>(body: &Bytes) -> Result<T, ErrorResponse>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ErrorResponse::new(StatusCode::BAD_REQUEST, format!("invalid request body: {e}"))
    })
}

/// Peer address recorded by the server, absent when serving without
/// connection info.
pub(crate) fn peer_ip(extensions: &Extensions) -> Option<std::net::IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

#[instrument(skip_all, fields(limiter = %name))]
async fn check_rate_limit(
    State(state): State<GuardState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let Some(limiter) = state.limiters.get(&name) else {
        return ErrorResponse::new(StatusCode::NOT_FOUND, format!("unknown limiter: {name}"))
            .into_response();
    };

    let request: CheckRequest = match optional_json(&body) {
        Ok(request) => request,
        Err(rejection) => return rejection.into_response(),
    };

    let identifier = match request.identifier {
        Some(raw) => ClientIdentifier::new(&raw),
        None => ClientIdentifier::from_headers(&headers, peer_ip(&extensions)),
    };

    let decision = limiter.check_client(&identifier).await;

    debug!(
        identifier = %identifier,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    RateLimitResponse {
        limiter: limiter.name(),
        limit: limiter.policy().max_requests,
        decision,
    }
    .into_response()
}

#[instrument(skip_all, fields(key = %key))]
async fn concurrency_status(State(state): State<GuardState>, Path(key): Path<String>) -> Response {
    let decision = state.concurrency.check(&key).await;
    (StatusCode::OK, Json(decision)).into_response()
}

#[instrument(skip_all, fields(key = %key))]
async fn acquire_slot(
    State(state): State<GuardState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let request: AcquireRequest = match optional_json(&body) {
        Ok(request) => request,
        Err(rejection) => return rejection.into_response(),
    };

    state
        .concurrency
        .try_acquire(&key, request.limit)
        .await
        .into_response()
}

#[instrument(skip_all, fields(key = %key))]
async fn release_slot(State(state): State<GuardState>, Path(key): Path<String>) -> StatusCode {
    state.concurrency.decrement(&key).await;
    StatusCode::NO_CONTENT
}

/// The presented key from `Authorization: Bearer` or `X-API-Key`.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    bearer.or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
}

#[instrument(skip_all)]
async fn validate_api_key(State(state): State<GuardState>, headers: HeaderMap) -> Response {
    let Some(presented) = presented_key(&headers) else {
        return ErrorResponse::new(StatusCode::UNAUTHORIZED, "missing API key").into_response();
    };

    match state.api_keys.validate(presented).await {
        Some(metadata) => {
            info!(key_id = %metadata.id, "API key accepted");
            (StatusCode::OK, Json(metadata)).into_response()
        }
        None => ErrorResponse::new(StatusCode::UNAUTHORIZED, "invalid API key").into_response(),
    }
}
