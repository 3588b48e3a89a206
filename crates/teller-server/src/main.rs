//! Main entry point of the Teller registry and config server.
//!
//! Starts the REST surface, the heartbeat monitor and the config
//! compaction task, then waits for Ctrl+C or SIGTERM.

use std::sync::Arc;

use teller_common::wait_for_shutdown_signal;
use teller_config::{ConfigSnapshotProvider, FileBundleStore};
use teller_registry::{HeartbeatConfig, HeartbeatMonitor, RegistryStore};
use teller_server::{
    AppState, Configuration,
    service::compaction::{CompactionConfig, CompactionTask},
    startup,
};
use tracing::{error, info};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    let server_address = configuration.server_address();
    let server_port = configuration.server_port();

    let registry = Arc::new(RegistryStore::new());

    let provider = match configuration.config_storage_dir() {
        Some(dir) => {
            info!(dir = %dir.display(), "Config bundles persisted to disk");
            Arc::new(ConfigSnapshotProvider::new(Arc::new(FileBundleStore::new(dir))))
        }
        None => {
            info!("Config bundles kept in memory only");
            Arc::new(ConfigSnapshotProvider::in_memory())
        }
    };
    provider.restore().await?;

    let shutdown = wait_for_shutdown_signal();

    let heartbeat = Arc::new(HeartbeatMonitor::new(
        registry.clone(),
        HeartbeatConfig {
            enabled: configuration.heartbeat_enabled(),
            ..HeartbeatConfig::default()
        }
        .with_check_interval(configuration.heartbeat_interval())
        .with_eviction_grace(configuration.eviction_grace()),
    ));
    let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown.clone()));

    let compaction = Arc::new(CompactionTask::new(
        registry.clone(),
        provider.clone(),
        CompactionConfig {
            enabled: configuration.compaction_enabled(),
            interval: configuration.compaction_interval(),
            keep_latest: configuration.compaction_keep_latest(),
        },
    ));
    let compaction_handle = tokio::spawn(compaction.run(shutdown.clone()));

    let app_state = Arc::new(
        AppState::new(registry, provider)
            .with_lease_duration(configuration.lease_duration_secs())
            .with_max_wait(configuration.config_max_wait()),
    );

    info!("Starting Teller server on {}:{}", server_address, server_port);
    let server = startup::main_server(app_state, server_address, server_port)?;
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
            shutdown.shutdown();
        }
        _ = shutdown.wait() => {
            info!("Stopping HTTP server...");
            server_handle.stop(true).await;
        }
    }

    let _ = tokio::join!(heartbeat_handle, compaction_handle);

    info!("Teller server shutdown complete");
    Ok(())
}
