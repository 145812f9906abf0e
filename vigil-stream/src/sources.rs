//! Camera source resolution seam.
//!
//! The durable camera catalogue lives with the relational-store
//! collaborator; the health monitor only needs to ask "is this camera still
//! configured, and with what source URL" when it finds orphaned output.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

#[async_trait]
pub trait CameraSources: Send + Sync {
    /// Source URL for a camera, or `None` if it is no longer configured
    async fn source_url(&self, camera_id: i64) -> Option<String>;
}

/// In-process source table, for tests and fixed deployments
#[derive(Default)]
pub struct StaticSources {
    cameras: RwLock<HashMap<i64, String>>,
}

impl StaticSources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, camera_id: i64, source_url: impl Into<String>) {
        self.cameras.write().insert(camera_id, source_url.into());
    }

    pub fn remove(&self, camera_id: i64) {
        self.cameras.write().remove(&camera_id);
    }
}

#[async_trait]
impl CameraSources for StaticSources {
    async fn source_url(&self, camera_id: i64) -> Option<String> {
        self.cameras.read().get(&camera_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_sources() {
        let sources = StaticSources::new();
        sources.insert(1, "rtsp://cam/1");
        assert_eq!(sources.source_url(1).await.as_deref(), Some("rtsp://cam/1"));

        sources.remove(1);
        assert_eq!(sources.source_url(1).await, None);
    }
}
