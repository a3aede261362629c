//! Per-key cap on simultaneous in-flight jobs.
//!
//! The guard is best-effort: store failures on [`ConcurrencyGuard::check_limit`]
//! report the key as allowed, and failed increments or decrements are logged
//! and dropped. Every increment refreshes a safety expiry so a counter whose
//! decrement was lost (crashed worker, dropped connection) heals itself.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ConcurrencyConfig;
use crate::store::CounterStore;

/// Outcome of a concurrency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyDecision {
    /// Whether another job may start
    pub allowed: bool,
    /// Jobs currently in flight
    pub current: u64,
    /// Cap applied to this key
    pub limit: u64,
}

/// Tracks in-flight jobs per API key or user.
pub struct ConcurrencyGuard {
    /// Where the counters live
    store: Arc<dyn CounterStore>,
    /// Cap used when the caller has no per-key limit
    default_limit: u64,
    /// Expiry refreshed on every increment
    safety_ttl: Duration,
}

impl ConcurrencyGuard {
    /// Create a guard over `store`.
    pub fn new(store: Arc<dyn CounterStore>, default_limit: u64, safety_ttl: Duration) -> Self {
        Self {
            store,
            default_limit,
            safety_ttl,
        }
    }

    /// Create a guard from configuration.
    pub fn from_config(config: &ConcurrencyConfig, store: Arc<dyn CounterStore>) -> Self {
        Self::new(
            store,
            config.max_in_flight,
            Duration::from_secs(config.safety_ttl_secs),
        )
    }

    /// Record a job starting for `key`.
    pub async fn increment(&self, key: &str) {
        match self.store.incr(&counter_key(key), self.safety_ttl).await {
            Ok(current) => debug!(key = %key, current = current, "Job started"),
            Err(e) => warn!(key = %key, error = %e, "Failed to increment concurrency counter"),
        }
    }

    /// Record a job finishing for `key`.
    pub async fn decrement(&self, key: &str) {
        match self.store.decr(&counter_key(key)).await {
            Ok(current) => debug!(key = %key, current = current, "Job finished"),
            Err(e) => warn!(key = %key, error = %e, "Failed to decrement concurrency counter"),
        }
    }

    /// Whether `key` is below `limit` in-flight jobs.
    pub async fn check_limit(&self, key: &str, limit: u64) -> ConcurrencyDecision {
        match self.store.get(&counter_key(key)).await {
            Ok(current) => ConcurrencyDecision {
                allowed: current < limit,
                current,
                limit,
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Concurrency store unavailable, allowing job");
                ConcurrencyDecision {
                    allowed: true,
                    current: 0,
                    limit,
                }
            }
        }
    }

    /// [`check_limit`](Self::check_limit) against the default cap.
    pub async fn check(&self, key: &str) -> ConcurrencyDecision {
        self.check_limit(key, self.default_limit).await
    }

    /// Check the cap and, when allowed, count the job as started.
    ///
    /// The returned decision reflects the count before this job.
    pub async fn try_acquire(&self, key: &str, limit: Option<u64>) -> ConcurrencyDecision {
        let decision = self
            .check_limit(key, limit.unwrap_or(self.default_limit))
            .await;
        if decision.allowed {
            self.increment(key).await;
        } else {
            debug!(
                key = %key,
                current = decision.current,
                limit = decision.limit,
                "Concurrency limit reached"
            );
        }
        decision
    }

    /// Get the default cap.
    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }
}

fn counter_key(key: &str) -> String {
    format!("cc:{key}")
}
