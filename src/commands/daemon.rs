use serde::Serialize;

use crate::error::{ArchivistError, Result};
use crate::services::backup_daemon::RetryDisposition;
use crate::services::config::SourcePeerConfig;
use crate::services::daemon_state::DaemonState;
use crate::services::events::DaemonStatus;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDaemonStatus {
    pub status: DaemonStatus,
    pub source_peer_count: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub failed: usize,
    pub processed: usize,
}

pub async fn get_backup_daemon_state(state: &AppState) -> Result<DaemonState> {
    Ok(state.backup_daemon.get_state().await)
}

pub async fn get_backup_daemon_status(state: &AppState) -> Result<BackupDaemonStatus> {
    let daemon = &state.backup_daemon;
    let snapshot = daemon.get_state().await;
    Ok(BackupDaemonStatus {
        status: daemon.status(),
        source_peer_count: daemon.source_peers().await.len(),
        in_progress: snapshot.in_progress_manifests.len(),
        pending: snapshot.pending_manifests.len(),
        failed: snapshot.failed_manifests.len(),
        processed: snapshot.processed_manifests.len(),
    })
}

/// Persist enabled=true and start polling right away
pub async fn enable_backup_daemon(state: &AppState) -> Result<()> {
    let mut config = state.config.write().await;
    config.get().backup_server.validate()?;
    config.set_backup_enabled(true)?;
    drop(config);

    state.backup_daemon.enable();
    state.trigger.trigger();
    Ok(())
}

/// Persist enabled=false. In-progress work stays in state for the next enable.
pub async fn disable_backup_daemon(state: &AppState) -> Result<()> {
    let mut config = state.config.write().await;
    config.set_backup_enabled(false)?;
    drop(config);

    state.backup_daemon.disable();
    Ok(())
}

pub async fn pause_backup_daemon(state: &AppState) -> Result<()> {
    state.backup_daemon.pause();
    Ok(())
}

pub async fn resume_backup_daemon(state: &AppState) -> Result<()> {
    state.backup_daemon.resume();
    state.trigger.trigger();
    Ok(())
}

pub async fn retry_failed_manifest(
    state: &AppState,
    manifest_cid: String,
) -> Result<RetryDisposition> {
    let disposition = state
        .backup_daemon
        .retry_failed_manifest(&manifest_cid)
        .await?;
    if disposition == RetryDisposition::Queued {
        state.trigger.trigger();
    }
    Ok(disposition)
}

/// Replace the source peer list in config and reconcile daemon state with it
pub async fn update_source_peers(state: &AppState, peers: Vec<SourcePeerConfig>) -> Result<()> {
    let mut config = state.config.write().await;
    config.set_source_peers(peers.clone())?;
    drop(config);

    state.backup_daemon.set_source_peers(peers).await
}

/// Poll now, as if a source peer had hit the trigger endpoint
pub async fn trigger_backup_poll(state: &AppState) -> Result<bool> {
    if !state.backup_daemon.is_enabled() {
        return Err(ArchivistError::DaemonDisabled);
    }
    Ok(state.trigger.trigger())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::tests::source_peer;
    use crate::services::config::ConfigService;
    use tempfile::TempDir;

    fn app_state(tmp: &TempDir) -> AppState {
        let mut config = ConfigService::with_path(tmp.path().join("config.toml")).unwrap();
        let mut app_config = config.get();
        app_config.backup_server.backup_root =
            tmp.path().join("backups").to_string_lossy().to_string();
        app_config.backup_server.state_file = Some(
            tmp.path()
                .join("backup-daemon-state.json")
                .to_string_lossy()
                .to_string(),
        );
        app_config.backup_server.source_peers = vec![source_peer("p1", "docs")];
        config.update(app_config).unwrap();

        let (state, _ticker) = AppState::new(config).unwrap();
        state
    }

    #[tokio::test]
    async fn test_enable_and_disable_persist_to_config() {
        let tmp = TempDir::new().unwrap();
        let state = app_state(&tmp);

        enable_backup_daemon(&state).await.unwrap();
        assert!(state.backup_daemon.is_enabled());
        let reloaded = ConfigService::with_path(tmp.path().join("config.toml")).unwrap();
        assert!(reloaded.get().backup_server.enabled);

        disable_backup_daemon(&state).await.unwrap();
        assert!(!state.backup_daemon.is_enabled());
        let reloaded = ConfigService::with_path(tmp.path().join("config.toml")).unwrap();
        assert!(!reloaded.get().backup_server.enabled);
    }

    #[tokio::test]
    async fn test_pause_is_not_persisted() {
        let tmp = TempDir::new().unwrap();
        let state = app_state(&tmp);
        enable_backup_daemon(&state).await.unwrap();

        pause_backup_daemon(&state).await.unwrap();
        let status = get_backup_daemon_status(&state).await.unwrap();
        assert_eq!(status.status, DaemonStatus::Paused);
        assert_eq!(status.source_peer_count, 1);

        let reloaded = ConfigService::with_path(tmp.path().join("config.toml")).unwrap();
        assert!(reloaded.get().backup_server.enabled);

        resume_backup_daemon(&state).await.unwrap();
        let status = get_backup_daemon_status(&state).await.unwrap();
        assert_eq!(status.status, DaemonStatus::Running);
    }

    #[tokio::test]
    async fn test_trigger_requires_enabled_daemon() {
        let tmp = TempDir::new().unwrap();
        let state = app_state(&tmp);

        let err = trigger_backup_poll(&state).await.unwrap_err();
        assert!(matches!(err, ArchivistError::DaemonDisabled));

        // Enabled, but no poll loop owns the ticker here
        enable_backup_daemon(&state).await.unwrap();
        assert!(!trigger_backup_poll(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_unknown_manifest_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let state = app_state(&tmp);

        let err = retry_failed_manifest(&state, "missing".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchivistError::ManifestNotFound(_)));
        // Serializes to its message for the UI
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            "Manifest not found: missing"
        );
    }

    #[tokio::test]
    async fn test_update_source_peers_reaches_daemon_and_config() {
        let tmp = TempDir::new().unwrap();
        let state = app_state(&tmp);

        update_source_peers(&state, vec![source_peer("p2", "photos")])
            .await
            .unwrap();
        let peers = state.backup_daemon.source_peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "p2");

        let reloaded = ConfigService::with_path(tmp.path().join("config.toml")).unwrap();
        assert_eq!(reloaded.get().backup_server.source_peers[0].folder_id, "photos");

        let duplicate = vec![source_peer("p2", "photos"), source_peer("p2", "photos")];
        assert!(update_source_peers(&state, duplicate).await.is_err());
        assert_eq!(state.backup_daemon.source_peers().await.len(), 1);
    }
}
