//! Shared round-robin counter for fair cross-worker assignment.
//!
//! The counter lives in the coordination store so fairness survives any one
//! worker's crash or restart. When the store is unreachable each worker
//! falls back to a process-local counter, so fairness holds per worker
//! instead of fleet-wide, which matches best-effort single-worker mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::store::CoordStore;

#[derive(Clone)]
pub struct RoundRobinCounter {
    store: CoordStore,
    fallback: Arc<DashMap<String, AtomicU64>>,
}

impl RoundRobinCounter {
    #[must_use]
    pub fn new(store: CoordStore) -> Self {
        Self {
            store,
            fallback: Arc::new(DashMap::new()),
        }
    }

    /// Next counter value for `pool_key`, starting at 1
    pub async fn next(&self, pool_key: &str) -> u64 {
        if let Some(value) = self.store.increment(pool_key).await {
            return value;
        }

        let entry = self
            .fallback
            .entry(pool_key.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        entry.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Index into a slate of `len` candidates for the next assignment
    pub async fn next_index(&self, pool_key: &str, len: usize) -> usize {
        debug_assert!(len > 0);
        let value = self.next(pool_key).await;
        (value % len as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_is_sequential() {
        let counter = RoundRobinCounter::new(CoordStore::in_memory());
        assert_eq!(counter.next("dispatch_rr:operators").await, 1);
        assert_eq!(counter.next("dispatch_rr:operators").await, 2);
        assert_eq!(counter.next("dispatch_rr:escalation").await, 1);
    }

    #[tokio::test]
    async fn test_fallback_counter_when_store_down() {
        let counter = RoundRobinCounter::new(CoordStore::unavailable());
        assert_eq!(counter.next("dispatch_rr:operators").await, 1);
        assert_eq!(counter.next("dispatch_rr:operators").await, 2);
        assert_eq!(counter.next("dispatch_rr:operators").await, 3);
    }

    #[tokio::test]
    async fn test_index_cycles_through_candidates() {
        let counter = RoundRobinCounter::new(CoordStore::in_memory());
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(counter.next_index("rr", 3).await);
        }
        // counter runs 1..=6, so indexes cycle 1,2,0,1,2,0
        assert_eq!(seen, vec![1, 2, 0, 1, 2, 0]);
    }
}
