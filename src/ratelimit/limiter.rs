//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::identifier::ClientIdentifier;
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{GuardError, Result};
use crate::store::{delta, CounterStore};

/// Window length and request budget of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    /// Length of each fixed window
    pub window: Duration,
    /// Requests admitted per window
    pub max_requests: u64,
}

impl LimitPolicy {
    /// Create a policy, rejecting an empty window or a zero budget.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        if window.is_zero() {
            return Err(GuardError::Config("window must be longer than zero".to_string()));
        }
        if max_requests == 0 {
            return Err(GuardError::Config("max_requests must be at least 1".to_string()));
        }
        Ok(Self {
            window,
            max_requests,
        })
    }

    /// Authentication-sensitive endpoints: 5 requests per 15 minutes.
    pub fn auth() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 5,
        }
    }

    /// General API endpoints: 60 requests per minute.
    pub fn api() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 60,
        }
    }

    /// Job status polling: 120 requests per minute.
    pub fn polling() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 120,
        }
    }
}

impl TryFrom<LimiterConfig> for LimitPolicy {
    type Error = GuardError;

    fn try_from(config: LimiterConfig) -> Result<Self> {
        Self::new(Duration::from_millis(config.window_ms), config.max_requests)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends (epoch milliseconds on the wire)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Time until the window resets, measured from `now`.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A named fixed-window rate limiter.
///
/// Counters are namespaced by limiter name, so limiters sharing a store
/// never see each other's hits.
pub struct RateLimiter {
    /// Name used to namespace counters and in logs
    name: String,
    /// Window and budget, fixed at construction
    policy: LimitPolicy,
    /// Where the counters live
    store: Arc<dyn CounterStore>,
    /// Time source for fail-open decisions
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over the given store.
    pub fn new(name: impl Into<String>, policy: LimitPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(name, policy, store, Arc::new(SystemClock))
    }

    /// Create a limiter that reads the time from `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        policy: LimitPolicy,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            store,
            clock,
        }
    }

    /// Count a request from `identifier` and decide whether it may proceed.
    ///
    /// Malformed identifiers are counted in the shared `"unknown"` bucket.
    /// If the store fails the request is allowed.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        self.check_client(&ClientIdentifier::new(identifier)).await
    }

    /// Like [`check`](Self::check) for an already derived identifier.
    pub async fn check_client(&self, identifier: &ClientIdentifier) -> RateLimitDecision {
        let key = self.counter_key(identifier);

        trace!(
            limiter = %self.name,
            identifier = %identifier,
            "Checking rate limit"
        );

        let window = match self.store.hit(&key, self.policy.window).await {
            Ok(window) => window,
            Err(e) => {
                warn!(
                    limiter = %self.name,
                    identifier = %identifier,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return RateLimitDecision {
                    allowed: true,
                    remaining: self.policy.max_requests,
                    reset_at: self.clock.now() + delta(self.policy.window),
                };
            }
        };

        let allowed = window.count <= self.policy.max_requests;
        if !allowed {
            debug!(
                limiter = %self.name,
                identifier = %identifier,
                count = window.count,
                limit = self.policy.max_requests,
                "Rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            remaining: self.policy.max_requests.saturating_sub(window.count),
            reset_at: window.reset_at,
        }
    }

    /// Get the limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the limiter policy.
    pub fn policy(&self) -> LimitPolicy {
        self.policy
    }

    fn counter_key(&self, identifier: &ClientIdentifier) -> String {
        format!("rl:{}:{}", self.name, identifier)
    }
}
