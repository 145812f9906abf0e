//! Viewer reference counting with a stop grace period.
//!
//! Viewers are logical UI sessions tracked by identity in a TTL'd hash, so
//! they survive brief reconnects (navigation, tab refocus). A stream may
//! stop only once the set is empty AND a grace deadline has elapsed. The
//! grace period absorbs reconnect cycles that would otherwise thrash the
//! encoder with stop/start pairs.

use std::time::Duration;

use chrono::Utc;

use vigil_core::CoordStore;

use crate::keys;

/// Deadline keys outlive the grace period so a slow monitor tick still sees
/// them; they are deleted explicitly once consumed.
const MIN_DEADLINE_TTL: Duration = Duration::from_secs(60);

pub struct ViewerCounter {
    primary: CoordStore,
    /// Per-worker fallback engaged when the shared store is not configured
    fallback: CoordStore,
    registration_ttl: Duration,
    grace: Duration,
}

impl ViewerCounter {
    #[must_use]
    pub fn new(store: CoordStore, registration_ttl: Duration, grace: Duration) -> Self {
        Self {
            primary: store,
            fallback: CoordStore::in_memory(),
            registration_ttl,
            grace,
        }
    }

    fn store(&self) -> &CoordStore {
        if self.primary.is_available() {
            &self.primary
        } else {
            &self.fallback
        }
    }

    fn deadline_ttl(&self) -> Duration {
        MIN_DEADLINE_TTL.max(self.grace * 2)
    }

    /// Register or refresh a viewer; returns the current count.
    ///
    /// Clears any pending stop deadline: a returning viewer cancels the
    /// countdown.
    pub async fn add_viewer(&self, camera_id: i64, viewer_id: &str) -> u64 {
        let store = self.store();
        let viewers_key = keys::viewers(camera_id);

        let last_seen = Utc::now().timestamp_millis().to_string();
        store.hash_set(&viewers_key, viewer_id, &last_seen).await;
        store.expire(&viewers_key, self.registration_ttl).await;
        store.delete(&keys::stop_at(camera_id)).await;

        let count = store.hash_len(&viewers_key).await.unwrap_or(1);
        tracing::info!(camera_id, viewer_id, count, "Viewer registered");
        count
    }

    /// Remove a viewer; returns the remaining count.
    ///
    /// The last viewer leaving starts the grace countdown rather than
    /// stopping the stream outright.
    pub async fn remove_viewer(&self, camera_id: i64, viewer_id: &str) -> u64 {
        let store = self.store();
        let viewers_key = keys::viewers(camera_id);

        store.hash_delete(&viewers_key, viewer_id).await;
        let count = store.hash_len(&viewers_key).await.unwrap_or(0);

        if count == 0 {
            let stop_at = Utc::now().timestamp_millis() + self.grace.as_millis() as i64;
            store
                .set_with_ttl(&keys::stop_at(camera_id), &stop_at.to_string(), self.deadline_ttl())
                .await;
            tracing::info!(
                camera_id,
                grace_secs = self.grace.as_secs_f64(),
                "Last viewer left, stream stops after grace period"
            );
        }

        tracing::info!(camera_id, viewer_id, count, "Viewer removed");
        count
    }

    pub async fn viewer_count(&self, camera_id: i64) -> u64 {
        self.store()
            .hash_len(&keys::viewers(camera_id))
            .await
            .unwrap_or(0)
    }

    /// Whether the stream should stop now.
    ///
    /// True only when no viewers remain AND a stop deadline exists AND it
    /// has elapsed. With no deadline on record one is established here, so
    /// every caller gets the grace period without having to set it up.
    pub async fn should_stop(&self, camera_id: i64) -> bool {
        let store = self.store();

        let Some(count) = store.hash_len(&keys::viewers(camera_id)).await else {
            // Store answers are unavailable; never stop on missing data
            return false;
        };
        if count > 0 {
            store.delete(&keys::stop_at(camera_id)).await;
            return false;
        }

        let stop_key = keys::stop_at(camera_id);
        match store.get(&stop_key).await {
            None => {
                let stop_at = Utc::now().timestamp_millis() + self.grace.as_millis() as i64;
                store
                    .set_with_ttl(&stop_key, &stop_at.to_string(), self.deadline_ttl())
                    .await;
                tracing::debug!(camera_id, "No viewers, starting stop grace period");
                false
            }
            Some(raw) => {
                let Ok(stop_at) = raw.parse::<i64>() else {
                    store.delete(&stop_key).await;
                    return false;
                };
                if Utc::now().timestamp_millis() >= stop_at {
                    store.delete(&stop_key).await;
                    tracing::info!(camera_id, "Stop grace period expired");
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(grace: Duration) -> ViewerCounter {
        ViewerCounter::new(CoordStore::in_memory(), Duration::from_secs(300), grace)
    }

    #[tokio::test]
    async fn test_counts_track_registrations() {
        let viewers = counter(Duration::from_secs(30));
        assert_eq!(viewers.add_viewer(1, "session-a").await, 1);
        assert_eq!(viewers.add_viewer(1, "session-b").await, 2);
        // Re-registering refreshes, never double-counts
        assert_eq!(viewers.add_viewer(1, "session-a").await, 2);
        assert_eq!(viewers.remove_viewer(1, "session-a").await, 1);
        assert_eq!(viewers.viewer_count(1).await, 1);
    }

    #[tokio::test]
    async fn test_never_stops_before_grace_elapses() {
        let viewers = counter(Duration::from_millis(150));

        viewers.add_viewer(1, "session-a").await;
        assert_eq!(viewers.remove_viewer(1, "session-a").await, 0);

        // Immediately after the last viewer leaves: inside the grace period
        assert!(!viewers.should_stop(1).await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(viewers.should_stop(1).await);
    }

    #[tokio::test]
    async fn test_returning_viewer_cancels_countdown() {
        let viewers = counter(Duration::from_millis(100));

        viewers.add_viewer(1, "session-a").await;
        viewers.remove_viewer(1, "session-a").await;

        // Reconnect before the deadline fires
        viewers.add_viewer(1, "session-a").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!viewers.should_stop(1).await);
    }

    #[tokio::test]
    async fn test_should_stop_self_establishes_grace() {
        let viewers = counter(Duration::from_millis(100));

        // Zero viewers and no deadline on record: the first call starts the
        // countdown instead of stopping.
        assert!(!viewers.should_stop(1).await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(viewers.should_stop(1).await);

        // The consumed deadline does not linger; the next call starts over
        assert!(!viewers.should_stop(1).await);
    }

    #[tokio::test]
    async fn test_falls_back_in_memory_without_store() {
        let viewers = ViewerCounter::new(
            CoordStore::unavailable(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        );
        assert_eq!(viewers.add_viewer(1, "session-a").await, 1);
        assert_eq!(viewers.add_viewer(1, "session-b").await, 2);
        assert_eq!(viewers.viewer_count(1).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registrations_expire_without_refresh() {
        let viewers = ViewerCounter::new(
            CoordStore::in_memory(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        );
        viewers.add_viewer(1, "session-a").await;
        assert_eq!(viewers.viewer_count(1).await, 1);

        // Absence of refresh is departure
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(viewers.viewer_count(1).await, 0);
    }
}
