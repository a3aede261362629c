//! Named limiter instances.
//!
//! Each call site owns its own limiter: a strict one for
//! authentication-sensitive endpoints, a looser one for the general API and
//! one for job status polling. Configuration may override the presets or add
//! further names.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::limiter::{LimitPolicy, RateLimiter};
use crate::config::RateLimitingConfig;
use crate::error::{GuardError, Result};
use crate::store::CounterStore;

/// Limiter for login, signup and password reset.
pub const AUTH_LIMITER: &str = "auth";
/// Limiter for general API endpoints.
pub const API_LIMITER: &str = "api";
/// Limiter for job status polling.
pub const POLLING_LIMITER: &str = "polling";

/// The limiters known to the service, indexed by name.
pub struct LimiterRegistry {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    /// Build the preset limiters over `store`.
    pub fn with_presets(store: Arc<dyn CounterStore>) -> Self {
        let mut limiters = BTreeMap::new();
        for (name, policy) in presets() {
            limiters.insert(
                name.to_string(),
                Arc::new(RateLimiter::new(name, policy, Arc::clone(&store))),
            );
        }
        Self { limiters }
    }

    /// Build the presets plus every configured limiter. Configured entries
    /// replace presets of the same name.
    pub fn from_config(config: &RateLimitingConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let mut registry = Self::with_presets(Arc::clone(&store));

        for (name, limiter_config) in &config.limiters {
            if name.is_empty() || name.contains(':') {
                return Err(GuardError::Config(format!("invalid limiter name: {name:?}")));
            }

            let policy = LimitPolicy::try_from(*limiter_config)
                .map_err(|e| GuardError::Config(format!("limiter {name}: {e}")))?;

            info!(
                limiter = %name,
                window_ms = limiter_config.window_ms,
                max_requests = limiter_config.max_requests,
                "Configured rate limiter"
            );

            registry.limiters.insert(
                name.clone(),
                Arc::new(RateLimiter::new(name.as_str(), policy, Arc::clone(&store))),
            );
        }

        Ok(registry)
    }

    /// Look up a limiter by name.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// Names of all registered limiters.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }
}

fn presets() -> [(&'static str, LimitPolicy); 3] {
    [
        (AUTH_LIMITER, LimitPolicy::auth()),
        (API_LIMITER, LimitPolicy::api()),
        (POLLING_LIMITER, LimitPolicy::polling()),
    ]
}
