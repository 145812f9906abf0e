//! Background stream health monitoring.
//!
//! A single periodic task per worker walks the supervisor's process table,
//! restarts stalled encoders, reconciles on-disk leftovers from crashed
//! workers, keeps cross-worker liveness markers fresh, stops viewer-less
//! streams, and terminates orphaned encoder processes. Requests never drive
//! any of this; the loop runs on its own clock.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use vigil_core::config::MonitorConfig;
use vigil_core::CoordStore;

use crate::error::Result;
use crate::keys;
use crate::quality::{StreamQuality, MANIFEST_NAME};
use crate::sources::CameraSources;
use crate::stats;
use crate::supervisor::{cleanup_stream_files, StreamSupervisor};
use crate::viewers::ViewerCounter;

#[derive(Clone)]
pub struct HealthMonitor {
    supervisor: Arc<StreamSupervisor>,
    viewers: Arc<ViewerCounter>,
    sources: Arc<dyn CameraSources>,
    store: CoordStore,
    config: MonitorConfig,
    cancel_token: CancellationToken,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        supervisor: Arc<StreamSupervisor>,
        viewers: Arc<ViewerCounter>,
        sources: Arc<dyn CameraSources>,
        store: CoordStore,
        config: MonitorConfig,
    ) -> Self {
        Self {
            supervisor,
            viewers,
            sources,
            store,
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Start the monitoring loop.
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task
    /// completion. Use `shutdown()` to stop the loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(Duration::from_secs(self.config.tick_seconds));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Stream health monitor shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        monitor.run_tick().await;
                    }
                }
            }
        })
    }

    /// Gracefully stop the monitoring loop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// One monitoring pass. Per-camera failures are isolated: a camera that
    /// errors is logged and never aborts the tick for the others.
    pub async fn run_tick(&self) {
        for camera_id in self.supervisor.tracked_cameras() {
            if let Err(e) = self.check_camera(camera_id).await {
                tracing::warn!(camera_id, "Stream health check failed: {e}");
            }
        }

        if let Err(e) = self.reconcile_output_dirs().await {
            tracing::warn!("Output directory reconcile failed: {e}");
        }

        self.sweep_orphan_processes().await;
    }

    async fn check_camera(&self, camera_id: i64) -> Result<()> {
        let Some(handle) = self.supervisor.handle(camera_id) else {
            return Ok(());
        };

        // Dead process: drop the handle, no auto-restart. No viewers asked
        // for it since it died, so there is no demand to serve.
        if !handle.is_running().await {
            self.supervisor.reap_dead(camera_id).await;
            return Ok(());
        }

        let healthy = self
            .supervisor
            .is_healthy(
                camera_id,
                Duration::from_secs(self.config.stall_threshold_seconds),
                Duration::from_secs(self.config.startup_grace_seconds),
            )
            .await;
        if !healthy {
            tracing::warn!(camera_id, "Stream output stalled, forcing restart");
            self.supervisor
                .force_restart(camera_id, &handle.source_url, handle.quality)
                .await?;
            return Ok(());
        }

        // Healthy: refresh the cross-worker liveness marker and record a
        // resource snapshot for fleet-wide inspection.
        let alive_ttl = Duration::from_secs(self.config.alive_ttl_seconds);
        self.store
            .set_with_ttl(&keys::active(camera_id), "1", alive_ttl)
            .await;
        if let Some(snapshot) = self.supervisor.stats(camera_id).await {
            self.store
                .set_json_with_ttl(&keys::stats(camera_id), &snapshot, alive_ttl)
                .await;
        }

        if self.viewers.should_stop(camera_id).await
            && self.viewers.viewer_count(camera_id).await == 0
        {
            tracing::info!(camera_id, "No viewers remain, stopping stream");
            self.supervisor.stop(camera_id).await;
        }

        Ok(())
    }

    /// Find per-camera output directories whose manifest is stale and that
    /// no handle owns, i.e. leftovers of a worker that crashed without cleanup.
    /// Restart the stream if the camera is still configured, otherwise
    /// delete the stale files.
    async fn reconcile_output_dirs(&self) -> Result<()> {
        let root = self.supervisor.streams_root().to_path_buf();
        if !root.exists() {
            return Ok(());
        }

        let fresh_window = Duration::from_secs(self.config.alive_ttl_seconds);

        for entry in std::fs::read_dir(&root)?.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(camera_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };

            if self.supervisor.handle(camera_id).is_some() {
                continue;
            }
            let Some(age) = stats::file_age(&path.join(MANIFEST_NAME)) else {
                continue;
            };
            if age < fresh_window {
                // Fresh output with no local handle: another worker owns it
                continue;
            }

            match self.sources.source_url(camera_id).await {
                Some(url) => {
                    tracing::warn!(camera_id, "Stale output with no handle, restarting stream");
                    if let Err(e) = self
                        .supervisor
                        .start(camera_id, &url, StreamQuality::default())
                        .await
                    {
                        tracing::warn!(camera_id, "Failed to restart stale stream: {e}");
                    }
                }
                None => {
                    tracing::info!(camera_id, "Removing stale output of unconfigured camera");
                    let _ = cleanup_stream_files(&path);
                }
            }
        }

        Ok(())
    }

    /// Terminate encoder processes working under our streams root that no
    /// handle owns (left behind by a crashed worker on this host).
    async fn sweep_orphan_processes(&self) {
        let root = self.supervisor.streams_root().to_path_buf();
        let owned = self.supervisor.owned_pids();

        let killed = tokio::task::spawn_blocking(move || {
            let mut sys = System::new();
            sys.refresh_processes(ProcessesToUpdate::All, true);

            let mut killed = 0u32;
            for (pid, process) in sys.processes() {
                let name = process.name().to_string_lossy().to_lowercase();
                if !name.contains("ffmpeg") {
                    continue;
                }
                let Some(cwd) = process.cwd() else { continue };
                if !cwd.starts_with(&root) {
                    continue;
                }
                if owned.contains(&pid.as_u32()) {
                    continue;
                }
                tracing::warn!(pid = pid.as_u32(), "Terminating orphaned encoder process");
                if process.kill_with(sysinfo::Signal::Term).is_none() {
                    process.kill();
                }
                killed += 1;
            }
            killed
        })
        .await
        .unwrap_or(0);

        if killed > 0 {
            tracing::info!(killed, "Orphaned encoder sweep complete");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sources::StaticSources;
    use crate::supervisor::StartOutcome;
    use vigil_core::config::StreamsConfig;

    fn fixtures(dir: &std::path::Path) -> (Arc<StreamSupervisor>, Arc<ViewerCounter>, CoordStore) {
        let store = CoordStore::in_memory();
        let config = StreamsConfig {
            directory: dir.to_string_lossy().into_owned(),
            ffmpeg_path: crate::supervisor::encoder_stub(dir, "yes"),
            immediate_failure_ms: 20,
            stop_grace_seconds: 1,
            segment_seconds: 2,
            playlist_size: 10,
        };
        let supervisor = Arc::new(StreamSupervisor::new(config, store.clone()));
        let viewers = Arc::new(ViewerCounter::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_millis(0),
        ));
        (supervisor, viewers, store)
    }

    fn monitor_with(
        supervisor: Arc<StreamSupervisor>,
        viewers: Arc<ViewerCounter>,
        sources: Arc<dyn CameraSources>,
        store: CoordStore,
    ) -> HealthMonitor {
        let config = MonitorConfig {
            tick_seconds: 1,
            stall_threshold_seconds: 10,
            startup_grace_seconds: 30,
            // Zero freshness window: any unowned manifest counts as stale
            alive_ttl_seconds: 0,
        };
        HealthMonitor::new(supervisor, viewers, sources, store, config)
    }

    #[tokio::test]
    async fn test_dead_handle_is_reaped_without_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, viewers, store) = fixtures(dir.path());

        supervisor
            .start(1, "rtsp://cam/1", StreamQuality::Low)
            .await
            .expect("start");
        let pid = supervisor.handle(1).expect("handle").pid;

        // Simulate an encoder crash
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("kill");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let monitor = monitor_with(
            supervisor.clone(),
            viewers,
            Arc::new(StaticSources::new()),
            store,
        );
        monitor.run_tick().await;

        assert!(supervisor.handle(1).is_none(), "dead handle dropped");
    }

    #[tokio::test]
    async fn test_stale_output_restarted_when_configured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, viewers, store) = fixtures(dir.path());

        // Leftovers of a crashed worker: manifest but no handle
        let camera_dir = dir.path().join("9");
        std::fs::create_dir_all(&camera_dir).expect("mkdir");
        std::fs::write(camera_dir.join(MANIFEST_NAME), b"#EXTM3U").expect("write");

        let sources = Arc::new(StaticSources::new());
        sources.insert(9, "rtsp://cam/9");

        let monitor = monitor_with(supervisor.clone(), viewers, sources, store);
        monitor.run_tick().await;

        assert!(supervisor.handle(9).is_some(), "configured camera restarted");
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_stale_output_of_unconfigured_camera_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, viewers, store) = fixtures(dir.path());

        let camera_dir = dir.path().join("11");
        std::fs::create_dir_all(&camera_dir).expect("mkdir");
        std::fs::write(camera_dir.join(MANIFEST_NAME), b"#EXTM3U").expect("write");
        std::fs::write(camera_dir.join("segment_00001.ts"), b"x").expect("write");

        let monitor = monitor_with(
            supervisor.clone(),
            viewers,
            Arc::new(StaticSources::new()),
            store,
        );
        monitor.run_tick().await;

        assert!(supervisor.handle(11).is_none());
        assert!(!camera_dir.join(MANIFEST_NAME).exists());
        assert!(!camera_dir.join("segment_00001.ts").exists());
    }

    #[tokio::test]
    async fn test_viewerless_stream_stopped_after_grace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, viewers, store) = fixtures(dir.path());

        let outcome = supervisor
            .start(5, "rtsp://cam/5", StreamQuality::Low)
            .await
            .expect("start");
        assert_eq!(outcome, StartOutcome::Started);

        // A viewer came and went; the zero-length test grace elapses at once
        viewers.add_viewer(5, "session-a").await;
        viewers.remove_viewer(5, "session-a").await;

        let monitor = monitor_with(
            supervisor.clone(),
            viewers,
            Arc::new(StaticSources::new()),
            store,
        );
        monitor.run_tick().await;

        assert!(supervisor.handle(5).is_none(), "stream stopped");
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, viewers, store) = fixtures(dir.path());

        let monitor = monitor_with(
            supervisor,
            viewers,
            Arc::new(StaticSources::new()),
            store,
        );
        let handle = monitor.start();
        monitor.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits after shutdown")
            .expect("no panic");
    }
}
