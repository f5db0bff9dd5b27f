//! Backup server daemon for the Archivist storage network
//!
//! Mirrors folders published by source peers: polls each peer's manifest
//! server, downloads new manifests and their files through the local
//! archivist-node, and applies deletions. See [`services::BackupDaemon`].

pub mod commands;
pub mod error;
pub mod node_api;
pub mod services;
pub mod state;

pub use error::{ArchivistError, Result};
pub use state::AppState;

use anyhow::Context;
use services::{trigger_server, ConfigService};
use tokio_util::sync::CancellationToken;

/// Run the daemon headless until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    let config_service = ConfigService::new().context("Failed to load configuration")?;
    let app_config = config_service.get();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&app_config.node.log_level),
    )
    .init();
    log::info!("Configuration loaded from {:?}", config_service.path());

    let (state, ticker) =
        AppState::new(config_service).context("Failed to initialize backup daemon")?;
    let daemon = state.backup_daemon.clone();

    if !daemon.is_enabled() {
        log::info!("Backup daemon is disabled in configuration; waiting for enable");
    }

    let shutdown = CancellationToken::new();
    let (_, server) = trigger_server::bind(
        daemon.clone(),
        state.trigger.clone(),
        ([0, 0, 0, 0], app_config.backup_server.trigger_port),
        shutdown.clone(),
    )?;
    let server = tokio::spawn(server);
    let poll_loop = tokio::spawn(daemon.clone().run(ticker));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Ctrl-C received, stopping backup daemon");

    daemon.shutdown();
    shutdown.cancel();
    if let Err(e) = poll_loop.await {
        log::error!("Poll loop ended abnormally: {}", e);
    }
    if let Err(e) = server.await {
        log::error!("Trigger server ended abnormally: {}", e);
    }

    Ok(())
}
