//! Coordination-store key layout for stream state.
//!
//! These keys are the only cross-worker surface of the streaming half:
//! other workers learn about a stream's existence through them, never
//! through the owning worker's process table.

pub(crate) fn active(camera_id: i64) -> String {
    format!("stream_active:{camera_id}")
}

pub(crate) fn stats(camera_id: i64) -> String {
    format!("stream_stats:{camera_id}")
}

pub(crate) fn viewers(camera_id: i64) -> String {
    format!("stream_viewers:{camera_id}")
}

pub(crate) fn stop_at(camera_id: i64) -> String {
    format!("stream_stop_at:{camera_id}")
}
