//! In-process counter store backed by a concurrent map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{CounterStore, StoreError, WindowCount};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::RateWindowCounter;

/// Counters held in this process only.
///
/// Expired entries are replaced lazily on access; call
/// [`purge_expired`](Self::purge_expired) periodically to bound memory.
pub struct MemoryStore {
    /// Counters indexed by namespaced key
    counters: DashMap<String, RateWindowCounter>,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store reading the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with a custom time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        let removed = before.saturating_sub(self.counters.len());

        if removed > 0 {
            debug!(removed = removed, "Purged expired counters");
        }
        removed
    }

    /// Number of counters currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = self.clock.now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| RateWindowCounter::new(now, window));

        let snapshot = counter.hit(now, window);
        trace!(key = %key, count = snapshot.count, "Recorded window hit");
        Ok(snapshot)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| RateWindowCounter::new(now, ttl));

        Ok(counter.increment(now, ttl))
    }

    async fn decr(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let remaining = match self.counters.get_mut(key) {
            Some(mut counter) => counter.decrement(now),
            None => return Ok(0),
        };

        if remaining == 0 {
            self.counters
                .remove_if(key, |_, counter| counter.current(now) == 0);
        }
        Ok(remaining)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .map(|counter| counter.current(now))
            .unwrap_or(0))
    }
}
