//! Resource statistics for supervised encoder processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::quality::SEGMENT_PREFIX;

/// Snapshot of one stream's process and output state.
///
/// Recorded by the health monitor into the coordination store so any worker
/// can inspect resource usage fleet-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub active: bool,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub segment_count: usize,
    /// Seconds since the most recent media chunk was written
    pub last_segment_age_secs: Option<f64>,
    pub healthy: bool,
}

/// CPU% and memory for a pid. Two refreshes bracket the minimum CPU update
/// interval so the usage figure is meaningful.
pub(crate) async fn sample_process(pid: u32) -> Option<(f32, u64)> {
    tokio::task::spawn_blocking(move || {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid)?;
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = sys.process(pid)?;
        Some((process.cpu_usage(), process.memory()))
    })
    .await
    .ok()
    .flatten()
}

/// Media chunk files in a camera output directory
pub(crate) fn segment_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "ts")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SEGMENT_PREFIX))
        })
        .collect()
}

/// Age of the most recently written media chunk, if any exist
pub(crate) fn last_segment_age(dir: &Path) -> Option<Duration> {
    segment_files(dir)
        .iter()
        .filter_map(|p| p.metadata().and_then(|m| m.modified()).ok())
        .max()
        .and_then(|mtime| mtime.elapsed().ok())
}

/// Age of a file's last modification, if it exists
pub(crate) fn file_age(path: &Path) -> Option<Duration> {
    path.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_files_filters_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("segment_00001.ts"), b"x").expect("write");
        std::fs::write(dir.path().join("segment_00002.ts"), b"x").expect("write");
        std::fs::write(dir.path().join("playlist.m3u8"), b"#EXTM3U").expect("write");
        std::fs::write(dir.path().join("other.ts"), b"x").expect("write");

        let segments = segment_files(dir.path());
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_last_segment_age_none_when_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(last_segment_age(dir.path()).is_none());
    }

    #[test]
    fn test_last_segment_age_fresh_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("segment_00001.ts"), b"x").expect("write");
        let age = last_segment_age(dir.path()).expect("age");
        assert!(age < Duration::from_secs(5));
    }
}
