//! Stream process supervision.
//!
//! One supervisor instance per worker owns every encoder subprocess that
//! worker has started: at most one live encoder per camera. Other workers
//! learn about a stream only through the coordination store and the shared
//! output filesystem; process ownership never transfers.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use vigil_core::config::StreamsConfig;
use vigil_core::CoordStore;

use crate::error::{Error, Result};
use crate::keys;
use crate::quality::{StreamQuality, MANIFEST_NAME};
use crate::source::validate_source_url;
use crate::stats::{self, StreamStats};

/// TTL on the cross-worker "this stream is live" marker; the health monitor
/// refreshes it every tick.
const ALIVE_MARKER_TTL: Duration = Duration::from_secs(60);

/// A manifest younger than this counts as an active stream when judging by
/// the shared filesystem alone.
const MANIFEST_FRESH_WINDOW: Duration = Duration::from_secs(30);

/// Default most-recent-segment age beyond which a stream counts as stalled
const DEFAULT_STALL_AGE: Duration = Duration::from_secs(10);

/// Time a fresh encoder gets to produce its first segment
const FIRST_SEGMENT_GRACE: Duration = Duration::from_secs(30);

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

const STDERR_TAIL_LINES: usize = 30;

/// Result of an idempotent start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A live encoder already existed; nothing was spawned
    AlreadyRunning,
}

/// Handle to one supervised encoder subprocess
#[derive(Clone)]
pub struct StreamHandle {
    pub camera_id: i64,
    pub pid: u32,
    pub source_url: String,
    pub quality: StreamQuality,
    pub started_at: Instant,
    child: Arc<Mutex<Option<Child>>>,
    stderr_tail: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl StreamHandle {
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Last captured stderr lines, newest last
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().clone()
    }

    /// Graceful terminate with bounded wait, then force kill. Always reaps.
    async fn terminate(&self, grace: Duration) {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else { return };

        if matches!(child.try_wait(), Ok(Some(_))) {
            *guard = None;
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let deadline = Instant::now() + grace;
        loop {
            if matches!(child.try_wait(), Ok(Some(_))) {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    camera_id = self.camera_id,
                    "Encoder did not terminate gracefully, killing"
                );
                let _ = child.kill().await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = child.wait().await;
        *guard = None;
    }
}

/// Per-worker encoder supervisor
pub struct StreamSupervisor {
    config: StreamsConfig,
    store: CoordStore,
    root: PathBuf,
    streams: DashMap<i64, StreamHandle>,
    creation_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl StreamSupervisor {
    #[must_use]
    pub fn new(config: StreamsConfig, store: CoordStore) -> Self {
        let root = PathBuf::from(&config.directory);
        Self {
            config,
            store,
            root,
            streams: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn streams_root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn camera_dir(&self, camera_id: i64) -> PathBuf {
        self.root.join(camera_id.to_string())
    }

    fn manifest_path(&self, camera_id: i64) -> PathBuf {
        self.camera_dir(camera_id).join(MANIFEST_NAME)
    }

    fn creation_lock(&self, camera_id: i64) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(camera_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn live_handle(&self, camera_id: i64) -> Option<StreamHandle> {
        let handle = self.streams.get(&camera_id).map(|entry| entry.value().clone())?;
        if handle.is_running().await {
            Some(handle)
        } else {
            None
        }
    }

    /// Start an encoder for `camera_id`.
    ///
    /// Idempotent: a live encoder short-circuits to `AlreadyRunning`. The
    /// per-camera creation lock guarantees two concurrent calls never spawn
    /// two processes: the loser observes the winner's handle. Readiness is
    /// asynchronous; poll [`is_ready`](Self::is_ready) for the manifest.
    pub async fn start(
        &self,
        camera_id: i64,
        source_url: &str,
        quality: StreamQuality,
    ) -> Result<StartOutcome> {
        let source = validate_source_url(source_url)?;

        if self.live_handle(camera_id).await.is_some() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let lock = self.creation_lock(camera_id);
        let _guard = lock.lock_owned().await;

        // Double-check under the lock
        if self.live_handle(camera_id).await.is_some() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        // A handle whose process already died gets reaped here
        self.reap_dead(camera_id).await;

        let dir = self.camera_dir(camera_id);
        tokio::fs::create_dir_all(&dir).await?;

        let args =
            quality.encoder_args(&source, self.config.segment_seconds, self.config.playlist_size);
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.config.ffmpeg_path)))?;

        let Some(pid) = child.id() else {
            return Err(Error::Spawn("encoder exited before pid capture".to_string()));
        };

        let tail = Arc::new(parking_lot::Mutex::new(Vec::new()));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_monitor(camera_id, stderr, tail.clone());
        }

        // Immediate-failure window: a bad URL or missing encoder dies here
        tokio::time::sleep(Duration::from_millis(self.config.immediate_failure_ms)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let captured = tail.lock().join("\n");
            tracing::error!(
                camera_id,
                code = status.code(),
                "Encoder exited immediately: {captured}"
            );
            let _ = cleanup_stream_files(&dir);
            return Err(Error::EncoderExited { code: status.code() });
        }

        let handle = StreamHandle {
            camera_id,
            pid,
            source_url: source,
            quality,
            started_at: Instant::now(),
            child: Arc::new(Mutex::new(Some(child))),
            stderr_tail: tail,
        };
        self.streams.insert(camera_id, handle);

        // Advertise to other workers; the health monitor keeps this fresh
        self.store
            .set_with_ttl(&keys::active(camera_id), "1", ALIVE_MARKER_TTL)
            .await;

        tracing::info!(camera_id, pid, quality = %quality, "Encoder started");
        Ok(StartOutcome::Started)
    }

    /// Stop the encoder for `camera_id`.
    ///
    /// Idempotent: returns `false` when nothing was running. Always removes
    /// the handle and deletes output files so a later start cannot serve
    /// stale chunks.
    pub async fn stop(&self, camera_id: i64) -> bool {
        let lock = self.creation_lock(camera_id);
        let _guard = lock.lock_owned().await;

        let Some((_, handle)) = self.streams.remove(&camera_id) else {
            return false;
        };

        handle
            .terminate(Duration::from_secs(self.config.stop_grace_seconds))
            .await;
        self.store.delete(&keys::active(camera_id)).await;

        if let Err(e) = cleanup_stream_files(&self.camera_dir(camera_id)) {
            tracing::warn!(camera_id, "Failed to clean stream files: {e}");
        }

        tracing::info!(camera_id, "Stream stopped");
        true
    }

    /// Stop (if running), clean output, and start fresh.
    ///
    /// Used on credential/URL change and on failed health checks.
    pub async fn force_restart(
        &self,
        camera_id: i64,
        source_url: &str,
        quality: StreamQuality,
    ) -> Result<StartOutcome> {
        self.stop(camera_id).await;
        let _ = cleanup_stream_files(&self.camera_dir(camera_id));
        self.start(camera_id, source_url, quality).await
    }

    /// True once the output manifest exists
    pub async fn is_ready(&self, camera_id: i64) -> bool {
        tokio::fs::try_exists(self.manifest_path(camera_id))
            .await
            .unwrap_or(false)
    }

    /// Whether a stream is live anywhere: this worker's process table, the
    /// coordination store (another worker), or a fresh manifest on the
    /// shared filesystem as the last resort.
    pub async fn is_active(&self, camera_id: i64) -> bool {
        if let Some(handle) = self.streams.get(&camera_id).map(|entry| entry.value().clone()) {
            if handle.is_running().await {
                return true;
            }
            tracing::info!(camera_id, "Encoder process has ended");
            self.streams.remove(&camera_id);
            self.store.delete(&keys::active(camera_id)).await;
        }

        if self.store.exists(&keys::active(camera_id)).await {
            return true;
        }

        stats::file_age(&self.manifest_path(camera_id))
            .is_some_and(|age| age < MANIFEST_FRESH_WINDOW)
    }

    /// Playable manifest URL once the stream is up and ready
    pub async fn stream_url(&self, camera_id: i64) -> Option<String> {
        if self.live_handle(camera_id).await.is_some() && self.is_ready(camera_id).await {
            Some(format!("/streams/{camera_id}/{MANIFEST_NAME}"))
        } else {
            None
        }
    }

    /// Process alive and segments recent. A stream with no segments yet is
    /// healthy while inside `startup_grace`.
    pub async fn is_healthy(
        &self,
        camera_id: i64,
        max_segment_age: Duration,
        startup_grace: Duration,
    ) -> bool {
        let Some(handle) = self.live_handle(camera_id).await else {
            return false;
        };
        match stats::last_segment_age(&self.camera_dir(camera_id)) {
            Some(age) => age <= max_segment_age,
            None => handle.started_at.elapsed() < startup_grace,
        }
    }

    /// Resource and output snapshot for a locally-owned live stream
    pub async fn stats(&self, camera_id: i64) -> Option<StreamStats> {
        let handle = self.live_handle(camera_id).await?;
        let (cpu_percent, memory_bytes) =
            stats::sample_process(handle.pid).await.unwrap_or((0.0, 0));

        let dir = self.camera_dir(camera_id);
        let segment_count = stats::segment_files(&dir).len();
        let last_segment_age = stats::last_segment_age(&dir);
        let healthy = match last_segment_age {
            Some(age) => age <= DEFAULT_STALL_AGE,
            None => handle.started_at.elapsed() < FIRST_SEGMENT_GRACE,
        };

        Some(StreamStats {
            active: true,
            pid: handle.pid,
            cpu_percent,
            memory_bytes,
            segment_count,
            last_segment_age_secs: last_segment_age.map(|d| d.as_secs_f64()),
            healthy,
        })
    }

    /// Delete media chunks old enough to have rotated out of the playlist
    pub fn prune_segments(&self, camera_id: i64, max_age: Duration) {
        let dir = self.camera_dir(camera_id);
        for segment in stats::segment_files(&dir) {
            if stats::file_age(&segment).is_some_and(|age| age > max_age) {
                let _ = std::fs::remove_file(&segment);
            }
        }
    }

    /// Grab a single frame from the source as a JPEG
    pub async fn capture_snapshot(&self, camera_id: i64, source_url: &str) -> Result<PathBuf> {
        let source = validate_source_url(source_url)?;

        let dir = self.root.join("snapshots");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("camera_{camera_id}_snapshot.jpg"));

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(["-rtsp_transport", "tcp", "-i"])
            .arg(&source)
            .args(["-frames:v", "1", "-q:v", "2", "-y"])
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(SNAPSHOT_TIMEOUT, command.output())
            .await
            .map_err(|_| Error::Snapshot("capture timed out".to_string()))?
            .map_err(|e| Error::Snapshot(e.to_string()))?;

        if output.status.success() && path.exists() {
            tracing::info!(camera_id, "Snapshot captured");
            Ok(path)
        } else {
            Err(Error::Snapshot(format!(
                "encoder exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Drop a handle whose process already died: reap the zombie, delete the
    /// cross-worker marker. No restart: no viewers implies no demand.
    pub async fn reap_dead(&self, camera_id: i64) -> bool {
        if self.live_handle(camera_id).await.is_some() {
            return false;
        }
        let Some((_, handle)) = self.streams.remove(&camera_id) else {
            return false;
        };
        let mut guard = handle.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.try_wait();
        }
        *guard = None;
        drop(guard);
        self.store.delete(&keys::active(camera_id)).await;
        tracing::info!(camera_id, "Reaped dead encoder handle");
        true
    }

    /// Cameras with a handle in this worker
    #[must_use]
    pub fn tracked_cameras(&self) -> Vec<i64> {
        self.streams.iter().map(|entry| *entry.key()).collect()
    }

    #[must_use]
    pub fn handle(&self, camera_id: i64) -> Option<StreamHandle> {
        self.streams.get(&camera_id).map(|entry| entry.value().clone())
    }

    /// Pids of every encoder this worker owns
    #[must_use]
    pub fn owned_pids(&self) -> Vec<u32> {
        self.streams.iter().map(|entry| entry.pid).collect()
    }

    /// Stop every stream this worker owns (shutdown path)
    pub async fn stop_all(&self) {
        for camera_id in self.tracked_cameras() {
            self.stop(camera_id).await;
        }
    }
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("root", &self.root)
            .field("tracked", &self.streams.len())
            .finish()
    }
}

/// Remove manifest, media chunks, and temp files from a camera directory
pub(crate) fn cleanup_stream_files(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for segment in stats::segment_files(dir) {
        let _ = std::fs::remove_file(segment);
    }
    let manifest = dir.join(MANIFEST_NAME);
    if manifest.exists() {
        let _ = std::fs::remove_file(manifest);
    }
    for entry in std::fs::read_dir(dir)?.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            let _ = std::fs::remove_file(path);
        }
    }
    Ok(())
}

fn spawn_stderr_monitor(
    camera_id: i64,
    stderr: ChildStderr,
    tail: Arc<parking_lot::Mutex<Vec<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let lower = line.to_lowercase();
            if lower.contains("error") || lower.contains("failed") {
                tracing::error!(camera_id, "encoder: {line}");
            } else if lower.contains("warning") {
                tracing::warn!(camera_id, "encoder: {line}");
            } else {
                tracing::debug!(camera_id, "encoder: {line}");
            }

            let mut tail = tail.lock();
            if tail.len() >= STDERR_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line);
        }
    });
}

/// Materialize a stand-in encoder executable in `dir` and return its path.
///
/// `"yes"` yields a process that ignores ffmpeg's arguments and blocks until
/// signalled; `"false"` yields one that exits immediately with a nonzero
/// status. A script is used rather than the `yes`/`false` binaries directly
/// because GNU `yes` option-parses the dashed encoder arguments and aborts.
#[cfg(all(test, unix))]
pub(crate) fn encoder_stub(dir: &Path, kind: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let body = match kind {
        "yes" => "#!/bin/sh\nexec sleep 2147483647\n",
        "false" => "#!/bin/sh\nexit 1\n",
        other => panic!("unknown encoder stub kind: {other}"),
    };
    let path = dir.join(format!("encoder-{kind}.sh"));
    std::fs::write(&path, body).expect("write encoder stub");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod encoder stub");
    path.to_string_lossy().into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    // `encoder_stub` stands in for ffmpeg: the "yes" stub runs until signalled
    // and the "false" stub exits immediately, without needing ffmpeg on the
    // test host.
    fn supervisor_with(dir: &Path, encoder: &str) -> StreamSupervisor {
        let config = StreamsConfig {
            directory: dir.to_string_lossy().into_owned(),
            ffmpeg_path: encoder_stub(dir, encoder),
            immediate_failure_ms: 50,
            stop_grace_seconds: 1,
            segment_seconds: 2,
            playlist_size: 10,
        };
        StreamSupervisor::new(config, CoordStore::in_memory())
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "yes");

        let first = sup.start(1, "rtsp://cam/1", StreamQuality::Low).await.expect("start");
        assert_eq!(first, StartOutcome::Started);

        let second = sup.start(1, "rtsp://cam/1", StreamQuality::Low).await.expect("start");
        assert_eq!(second, StartOutcome::AlreadyRunning);
        assert_eq!(sup.owned_pids().len(), 1);

        assert!(sup.stop(1).await);
        assert!(!sup.stop(1).await);
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_one_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = std::sync::Arc::new(supervisor_with(dir.path(), "yes"));

        let (a, b) = tokio::join!(
            sup.start(7, "rtsp://cam/7", StreamQuality::Low),
            sup.start(7, "rtsp://cam/7", StreamQuality::Low),
        );

        let outcomes = [a.expect("start"), b.expect("start")];
        let started = outcomes
            .iter()
            .filter(|o| **o == StartOutcome::Started)
            .count();
        assert_eq!(started, 1, "exactly one caller spawns");
        assert_eq!(sup.owned_pids().len(), 1);

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_immediate_exit_is_a_start_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "false");

        let err = sup
            .start(2, "rtsp://cam/2", StreamQuality::Low)
            .await
            .expect_err("encoder that dies at once fails the start");
        assert!(matches!(err, Error::EncoderExited { .. }));
        assert!(sup.handle(2).is_none());
    }

    #[tokio::test]
    async fn test_invalid_source_rejected_before_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "yes");

        let err = sup
            .start(3, "rtsp://cam/3;reboot", StreamQuality::Low)
            .await
            .expect_err("metacharacters rejected");
        assert!(matches!(err, Error::InvalidSource(_)));
        assert!(sup.handle(3).is_none());
    }

    #[tokio::test]
    async fn test_readiness_follows_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "yes");

        sup.start(4, "rtsp://cam/4", StreamQuality::Medium).await.expect("start");
        assert!(!sup.is_ready(4).await);
        assert!(sup.stream_url(4).await.is_none());

        std::fs::write(sup.camera_dir(4).join(MANIFEST_NAME), b"#EXTM3U").expect("write");
        assert!(sup.is_ready(4).await);
        assert_eq!(
            sup.stream_url(4).await.as_deref(),
            Some("/streams/4/playlist.m3u8")
        );

        sup.stop(4).await;
    }

    #[tokio::test]
    async fn test_stop_cleans_output_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "yes");

        sup.start(5, "rtsp://cam/5", StreamQuality::Low).await.expect("start");
        let camera_dir = sup.camera_dir(5);
        std::fs::write(camera_dir.join(MANIFEST_NAME), b"#EXTM3U").expect("write");
        std::fs::write(camera_dir.join("segment_00001.ts"), b"x").expect("write");

        assert!(sup.stop(5).await);
        assert!(!camera_dir.join(MANIFEST_NAME).exists());
        assert!(!camera_dir.join("segment_00001.ts").exists());
    }

    #[tokio::test]
    async fn test_other_worker_sees_readiness_via_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Worker A wrote a manifest moments ago; worker B shares the
        // filesystem but holds no handle and no store connection.
        let camera_dir = dir.path().join("7");
        std::fs::create_dir_all(&camera_dir).expect("mkdir");
        std::fs::write(camera_dir.join(MANIFEST_NAME), b"#EXTM3U").expect("write");

        let config = StreamsConfig {
            directory: dir.path().to_string_lossy().into_owned(),
            ..StreamsConfig::default()
        };
        let worker_b = StreamSupervisor::new(config, CoordStore::unavailable());

        assert!(worker_b.is_ready(7).await);
        assert!(worker_b.is_active(7).await);
    }

    #[tokio::test]
    async fn test_force_restart_replaces_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "yes");

        sup.start(6, "rtsp://cam/6", StreamQuality::Low).await.expect("start");
        let first_pid = sup.handle(6).expect("handle").pid;

        let outcome = sup
            .force_restart(6, "rtsp://cam/6-rotated", StreamQuality::Low)
            .await
            .expect("restart");
        assert_eq!(outcome, StartOutcome::Started);

        let handle = sup.handle(6).expect("handle");
        assert_ne!(handle.pid, first_pid);
        assert_eq!(handle.source_url, "rtsp://cam/6-rotated");

        sup.stop(6).await;
    }

    #[tokio::test]
    async fn test_prune_segments_keeps_fresh_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor_with(dir.path(), "yes");
        let camera_dir = sup.camera_dir(8);
        std::fs::create_dir_all(&camera_dir).expect("mkdir");
        std::fs::write(camera_dir.join("segment_00001.ts"), b"x").expect("write");

        // Fresh segments survive a prune with a generous age bound
        sup.prune_segments(8, Duration::from_secs(30));
        assert!(camera_dir.join("segment_00001.ts").exists());

        // Everything goes with a zero age bound
        sup.prune_segments(8, Duration::from_secs(0));
        assert!(!camera_dir.join("segment_00001.ts").exists());
    }
}
