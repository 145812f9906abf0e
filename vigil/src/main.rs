use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use vigil_core::config::load_config;
use vigil_core::{logging, CoordStore};
use vigil_stream::{HealthMonitor, StaticSources, StreamSupervisor, ViewerCounter};

/// Generate a unique node ID for this worker instance
fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = nanoid::nanoid!(6);
    format!("{host}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = load_config()?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!(%node_id, "Vigil worker starting");

    // 3. Connect the coordination store; an unreachable store degrades to
    // single-worker best-effort rather than refusing to start
    let store = CoordStore::connect(&config.redis).await;
    if !store.is_available() {
        warn!("Running without a coordination store: cross-worker coordination disabled");
    }

    // 4. Per-worker supervisor and viewer counter, injected everywhere
    // rather than living as globals
    let supervisor = Arc::new(StreamSupervisor::new(config.streams.clone(), store.clone()));
    let viewers = Arc::new(ViewerCounter::new(
        store.clone(),
        Duration::from_secs(config.viewers.registration_ttl_seconds),
        Duration::from_secs(config.viewers.stop_grace_seconds),
    ));

    // Camera catalogue is owned by the ingestion/HTTP collaborator; the
    // worker starts with an empty table until cameras are registered.
    let sources = Arc::new(StaticSources::new());

    // 5. Background stream health monitor
    let monitor = HealthMonitor::new(
        supervisor.clone(),
        viewers,
        sources,
        store.clone(),
        config.monitor.clone(),
    );
    let monitor_handle = monitor.start();
    info!(
        tick_seconds = config.monitor.tick_seconds,
        "Stream health monitor started"
    );

    // 6. Run until signalled
    shutdown_signal().await;
    info!("Shutdown signal received");

    monitor.shutdown();
    supervisor.stop_all().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), monitor_handle).await;

    info!("Vigil worker stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
