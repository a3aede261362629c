//! Backing stores for rate limit windows and concurrency counters.
//!
//! Every limiter and guard receives its store at construction time, so the
//! in-process map and the Redis-backed store are interchangeable and tests
//! can inject an isolated or failing store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors raised by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A command was rejected or returned something unexpected.
    #[error("query failed: {0}")]
    Query(String),
}

/// Snapshot of a fixed window after a hit has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Hits recorded in the current window, including this one
    pub count: u64,
    /// When the current window expires
    pub reset_at: DateTime<Utc>,
}

/// Counter storage shared by every limiter and guard in the process.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one hit in the fixed window for `key`.
    ///
    /// Creates the window on the first hit or when the previous one has
    /// expired.
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Increment a plain counter and refresh its expiry to `ttl` from now.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Decrement a plain counter. Clamps at zero and removes the entry once
    /// it reaches zero.
    async fn decr(&self, key: &str) -> Result<u64, StoreError>;

    /// Current value of a plain counter, zero when absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Convert a std duration into a chrono delta for timestamp arithmetic.
pub(crate) fn delta(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(millis)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose every operation fails, as if the cache were down.
    pub struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn hit(&self, _key: &str, _window: Duration) -> Result<WindowCount, StoreError> {
            Err(StoreError::Connection("store is down".to_string()))
        }

        async fn incr(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Connection("store is down".to_string()))
        }

        async fn decr(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Connection("store is down".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Connection("store is down".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Connection("store is down".to_string()))
        }
    }
}
