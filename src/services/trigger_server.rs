//! HTTP endpoint that source peers hit after publishing a new manifest
//!
//! `POST /trigger` wakes the poll loop immediately instead of waiting for the
//! next interval. `GET /health` and `GET /state` are for local tooling.

use crate::error::{ArchivistError, Result};
use crate::services::backup_daemon::BackupDaemon;
use crate::services::scheduler::TriggerHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warp::Filter;

pub fn routes(
    daemon: Arc<BackupDaemon>,
    trigger: TriggerHandle,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // POST /trigger - triggers immediate poll
    let trigger_route = warp::path("trigger")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_daemon(daemon.clone()))
        .map(move |daemon: Arc<BackupDaemon>| {
            if !daemon.is_enabled() {
                log::debug!("Trigger received while backup daemon is disabled");
                return warp::reply::json(&serde_json::json!({
                    "status": "disabled",
                    "message": "Backup daemon is disabled"
                }));
            }

            if trigger.trigger() {
                log::info!("Trigger request received, polling now");
                warp::reply::json(&serde_json::json!({
                    "status": "ok",
                    "message": "Poll triggered"
                }))
            } else {
                warp::reply::json(&serde_json::json!({
                    "status": "error",
                    "message": "Poll loop is not running"
                }))
            }
        });

    // GET /health - health check
    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({"status": "ok"})));

    // GET /state - current daemon state
    let state_route = warp::path("state")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_daemon(daemon))
        .then(|daemon: Arc<BackupDaemon>| async move {
            warp::reply::json(&daemon.get_state().await)
        });

    trigger_route.or(health_route).or(state_route)
}

fn with_daemon(
    daemon: Arc<BackupDaemon>,
) -> impl Filter<Extract = (Arc<BackupDaemon>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || daemon.clone())
}

/// Bind the trigger server and serve until `shutdown` fires
///
/// Returns the bound address and the server future, which the caller spawns.
pub fn bind(
    daemon: Arc<BackupDaemon>,
    trigger: TriggerHandle,
    addr: impl Into<SocketAddr>,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, impl std::future::Future<Output = ()>)> {
    let addr = addr.into();
    let (bound, server) = warp::serve(routes(daemon, trigger))
        .try_bind_with_graceful_shutdown(addr, async move {
            shutdown.cancelled().await;
            log::info!("Trigger server shutting down");
        })
        .map_err(|e| {
            ArchivistError::ConfigError(format!("Failed to bind trigger server on {}: {}", addr, e))
        })?;

    log::info!("Backup daemon trigger server listening on {}", bound);
    Ok((bound, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_api::{ContentFetcher, FetchError, SpaceInfo};
    use crate::services::backup_daemon::DaemonSettings;
    use crate::services::config::tests::source_peer;
    use crate::services::daemon_state::StateStore;
    use crate::services::discovery::{DiscoveryError, MockManifestDiscovery};
    use crate::services::events::LogSink;
    use crate::services::scheduler::{IntervalTicker, Tick, TickSource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::time::Duration;

    struct NoContent;

    #[async_trait]
    impl ContentFetcher for NoContent {
        async fn fetch(&self, cid: &str) -> std::result::Result<Bytes, FetchError> {
            Err(FetchError::NotFound(cid.to_string()))
        }

        async fn space(&self) -> std::result::Result<SpaceInfo, FetchError> {
            Err(FetchError::NotFound("space".to_string()))
        }
    }

    fn daemon(tmp: &TempDir, enabled: bool) -> Arc<BackupDaemon> {
        let mut discovery = MockManifestDiscovery::new();
        discovery
            .expect_poll()
            .returning(|peer| Err(DiscoveryError::NoManifest(peer.folder_id.clone())));

        let settings = DaemonSettings {
            enabled,
            poll_interval: Duration::from_secs(30),
            max_concurrent_downloads: 3,
            max_retries: 3,
            auto_delete_tombstones: true,
            retry_backoff: Duration::ZERO,
            backup_root: tmp.path().join("backups"),
        };
        Arc::new(
            BackupDaemon::new(
                Arc::new(NoContent),
                Arc::new(discovery),
                StateStore::new(tmp.path().join("state.json")),
                settings,
                vec![source_peer("p1", "docs")],
                Arc::new(LogSink),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_trigger_wakes_ticker() {
        let tmp = TempDir::new().unwrap();
        let (mut ticker, trigger) = IntervalTicker::new(Duration::from_secs(3600));
        ticker.next_tick().await;
        let filter = routes(daemon(&tmp, true), trigger);

        let res = warp::test::request()
            .method("POST")
            .path("/trigger")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["status"], "ok");

        let tick = tokio::time::timeout(Duration::from_millis(100), ticker.next_tick()).await;
        assert_eq!(tokio_test::assert_ok!(tick), Some(Tick::Triggered));
    }

    #[tokio::test]
    async fn test_trigger_while_disabled_is_reported() {
        let tmp = TempDir::new().unwrap();
        let (_ticker, trigger) = IntervalTicker::new(Duration::from_secs(3600));
        let filter = routes(daemon(&tmp, false), trigger);

        let res = warp::test::request()
            .method("POST")
            .path("/trigger")
            .reply(&filter)
            .await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["status"], "disabled");
    }

    #[tokio::test]
    async fn test_health_and_state() {
        let tmp = TempDir::new().unwrap();
        let (_ticker, trigger) = IntervalTicker::new(Duration::from_secs(3600));
        let filter = routes(daemon(&tmp, true), trigger);

        let res = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);

        let res = warp::test::request()
            .method("GET")
            .path("/state")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert!(body["processed_manifests"].as_object().unwrap().is_empty());
        assert_eq!(body["stats"]["total_manifests_processed"], 0);
    }

    #[tokio::test]
    async fn test_get_on_trigger_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_ticker, trigger) = IntervalTicker::new(Duration::from_secs(3600));
        let filter = routes(daemon(&tmp, true), trigger);

        let res = warp::test::request()
            .method("GET")
            .path("/trigger")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 405);
    }

    #[tokio::test]
    async fn test_bound_server_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let (_ticker, trigger) = IntervalTicker::new(Duration::from_secs(3600));
        let shutdown = CancellationToken::new();

        let (addr, server) = bind(
            daemon(&tmp, true),
            trigger,
            ([127, 0, 0, 1], 0),
            shutdown.clone(),
        )
        .unwrap();
        let handle = tokio::spawn(server);

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
