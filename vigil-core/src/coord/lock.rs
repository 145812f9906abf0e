//! Distributed lock on top of the coordination store.
//!
//! Acquisition is `SET NX EX` retried at a fixed cadence until a wait
//! deadline; release is the store's owner-checked delete. The hold TTL
//! bounds how long a crashed holder can block others; absence of refresh
//! is cancellation.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::store::{CoordStore, LockAcquisition};

/// Retry cadence while waiting for a contended lock
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Scoped distributed lock guard.
///
/// Callers should `release()` explicitly; a guard dropped while still
/// holding the lock spawns a best-effort release so the key does not linger
/// for the full hold TTL.
#[must_use = "check acquisition() and release() the lock when done"]
pub struct DistributedLock {
    store: CoordStore,
    key: String,
    token: String,
    acquisition: LockAcquisition,
    released: bool,
}

impl DistributedLock {
    /// Try to acquire `key`, retrying up to `wait_timeout`.
    ///
    /// `StoreUnavailable` is returned immediately without retrying: waiting
    /// cannot make an unreachable store reachable, and the caller must
    /// decide whether to proceed single-worker.
    pub async fn acquire(
        store: &CoordStore,
        key: &str,
        hold_ttl: Duration,
        wait_timeout: Duration,
    ) -> Self {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait_timeout;

        loop {
            match store.acquire(key, &token, hold_ttl).await {
                LockAcquisition::Acquired => {
                    tracing::debug!(key, "Acquired distributed lock");
                    return Self {
                        store: store.clone(),
                        key: key.to_string(),
                        token,
                        acquisition: LockAcquisition::Acquired,
                        released: false,
                    };
                }
                LockAcquisition::StoreUnavailable => {
                    tracing::warn!(key, "Coordination store unavailable for lock");
                    return Self::unheld(store, key, LockAcquisition::StoreUnavailable);
                }
                LockAcquisition::Contended => {
                    if Instant::now() + RETRY_INTERVAL > deadline {
                        tracing::warn!(
                            key,
                            wait_ms = wait_timeout.as_millis() as u64,
                            "Failed to acquire distributed lock within wait timeout"
                        );
                        return Self::unheld(store, key, LockAcquisition::Contended);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    fn unheld(store: &CoordStore, key: &str, acquisition: LockAcquisition) -> Self {
        Self {
            store: store.clone(),
            key: key.to_string(),
            token: String::new(),
            acquisition,
            released: true,
        }
    }

    #[must_use]
    pub fn acquisition(&self) -> LockAcquisition {
        self.acquisition
    }

    #[must_use]
    pub fn is_acquired(&self) -> bool {
        self.acquisition.is_acquired()
    }

    /// Release the lock if still owned. No-op for unacquired guards.
    pub async fn release(mut self) {
        if self.acquisition.is_acquired() && !self.released {
            self.released = true;
            if self.store.release(&self.key, &self.token).await {
                tracing::debug!(key = %self.key, "Released distributed lock");
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.acquisition.is_acquired() && !self.released {
            let store = self.store.clone();
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    store.release(&key, &token).await;
                });
            }
        }
    }
}
