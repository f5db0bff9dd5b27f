// End-to-end tests: the daemon runs against a fake archivist-node and a fake
// source peer manifest server, both served over HTTP.

use archivist_backup::node_api::NodeApiClient;
use archivist_backup::services::trigger_server;
use archivist_backup::services::{
    BackupDaemon, ChannelSink, DaemonEvent, DaemonSettings, IntervalTicker, ManifestClient,
    ManualTicker, SourcePeerConfig, StateStore,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::Filter;

const PEER_ID: &str = "16Uiu2HAmSourcePeer";
const FOLDER_ID: &str = "documents";

/// Content held by the fake node plus the listing published by the fake source peer
#[derive(Clone, Default)]
struct Network {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    listing: Arc<Mutex<Option<(String, u64)>>>,
}

impl Network {
    fn store(&self, cid: &str, bytes: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(cid.to_string(), bytes.to_vec());
    }

    /// Upload a manifest and advertise it as the folder's latest
    fn publish(&self, manifest_cid: &str, sequence_number: u64, manifest: serde_json::Value) {
        self.store(manifest_cid, &serde_json::to_vec(&manifest).unwrap());
        *self.listing.lock().unwrap() = Some((manifest_cid.to_string(), sequence_number));
    }

    fn spawn_node(&self) -> SocketAddr {
        let blobs = self.blobs.clone();
        let get_data = warp::path!("api" / "archivist" / "v1" / "data" / String)
            .and(warp::get())
            .map(move |cid: String| match blobs.lock().unwrap().get(&cid) {
                Some(bytes) => warp::reply::with_status(bytes.clone(), StatusCode::OK),
                None => warp::reply::with_status(Vec::new(), StatusCode::NOT_FOUND),
            });

        let post_network = warp::path!("api" / "archivist" / "v1" / "data" / String / "network")
            .and(warp::post())
            .map(|_cid: String| warp::reply::with_status("no providers", StatusCode::NOT_FOUND));

        let space = warp::path!("api" / "archivist" / "v1" / "space")
            .and(warp::get())
            .map(|| {
                warp::reply::json(&json!({
                    "totalBlocks": 100,
                    "quotaMaxBytes": 1_000_000,
                    "quotaUsedBytes": 0,
                    "quotaReservedBytes": 0
                }))
            });

        let (addr, server) =
            warp::serve(get_data.or(post_network).or(space)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn spawn_manifest_server(&self) -> SocketAddr {
        let listing = self.listing.clone();
        let route = warp::path("manifests").and(warp::get()).map(move || {
            let manifests: Vec<_> = listing
                .lock()
                .unwrap()
                .iter()
                .map(|(cid, seq)| {
                    json!({
                        "folderId": FOLDER_ID,
                        "folderPath": "/home/source/Documents",
                        "manifestCid": cid,
                        "sequenceNumber": seq,
                        "updatedAt": "2025-01-02T12:00:00Z",
                        "fileCount": 0,
                        "totalSizeBytes": 0
                    })
                })
                .collect();
            warp::reply::json(&json!({ "peerId": PEER_ID, "manifests": manifests }))
        });

        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }
}

fn manifest(sequence_number: u64, files: &[(&str, &str, u64)], deleted: &[&str]) -> serde_json::Value {
    let files: Vec<_> = files
        .iter()
        .map(|(path, cid, size)| {
            json!({
                "path": path,
                "cid": cid,
                "size_bytes": size,
                "uploaded_at": "2025-01-01T00:00:00Z"
            })
        })
        .collect();
    let deleted: Vec<_> = deleted
        .iter()
        .map(|path| json!({ "path": path, "cid": "", "deleted_at": "2025-01-02T00:00:00Z" }))
        .collect();

    json!({
        "version": "1.0",
        "folder_id": FOLDER_ID,
        "folder_path": "/home/source/Documents",
        "source_peer_id": PEER_ID,
        "sequence_number": sequence_number,
        "last_updated": "2025-01-02T12:00:00Z",
        "files": files,
        "deleted_files": deleted,
        "stats": { "total_files": files.len(), "total_size_bytes": 0 }
    })
}

struct Setup {
    tmp: TempDir,
    network: Network,
    daemon: Arc<BackupDaemon>,
    events: ChannelSink,
}

impl Setup {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let network = Network::default();
        let node_addr = network.spawn_node();
        let manifest_addr = network.spawn_manifest_server();

        let peer = SourcePeerConfig {
            nickname: "laptop".to_string(),
            peer_id: PEER_ID.to_string(),
            host: manifest_addr.ip().to_string(),
            manifest_port: manifest_addr.port(),
            multiaddrs: Vec::new(),
            folder_id: FOLDER_ID.to_string(),
            local_path: None,
            enabled: true,
        };
        let settings = DaemonSettings {
            enabled: true,
            poll_interval: Duration::from_secs(3600),
            max_concurrent_downloads: 2,
            max_retries: 2,
            auto_delete_tombstones: true,
            retry_backoff: Duration::ZERO,
            backup_root: tmp.path().join("backups"),
        };

        let events = ChannelSink::new(64);
        let daemon = BackupDaemon::new(
            Arc::new(NodeApiClient::with_base_url(format!("http://{}", node_addr))),
            Arc::new(ManifestClient::new(Duration::from_secs(2))),
            StateStore::new(tmp.path().join("backup-daemon-state.json")),
            settings,
            vec![peer],
            Arc::new(events.clone()),
        )
        .unwrap();

        Self {
            tmp,
            network,
            daemon: Arc::new(daemon),
            events,
        }
    }

    fn folder(&self) -> std::path::PathBuf {
        self.tmp.path().join("backups").join(PEER_ID).join(FOLDER_ID)
    }

    fn store(&self) -> StateStore {
        StateStore::new(self.tmp.path().join("backup-daemon-state.json"))
    }
}

async fn wait_for_completion(rx: &mut broadcast::Receiver<DaemonEvent>, manifest: &str) -> u64 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let DaemonEvent::ManifestCompleted {
                manifest_cid,
                sequence_number,
                ..
            } = rx.recv().await.unwrap()
            {
                if manifest_cid == manifest {
                    return sequence_number;
                }
            }
        }
    })
    .await
    .expect("manifest did not complete in time")
}

#[tokio::test]
async fn test_folder_is_mirrored_across_manifest_versions() {
    let setup = Setup::new();
    setup.network.store("zCidReport", b"quarterly report");
    setup.network.store("zCidPhoto", b"jpeg");
    setup.network.publish(
        "zManifest1",
        1,
        manifest(
            1,
            &[("report.txt", "zCidReport", 16), ("photos/cat.jpg", "zCidPhoto", 4)],
            &[],
        ),
    );

    let report = setup.daemon.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(
        std::fs::read(setup.folder().join("report.txt")).unwrap(),
        b"quarterly report"
    );
    assert_eq!(
        std::fs::read(setup.folder().join("photos/cat.jpg")).unwrap(),
        b"jpeg"
    );

    // Version 2 edits the report and deletes the photo
    setup.network.store("zCidReport2", b"revised report");
    setup.network.publish(
        "zManifest2",
        2,
        manifest(2, &[("report.txt", "zCidReport2", 14)], &["photos/cat.jpg"]),
    );

    let report = setup.daemon.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(
        std::fs::read(setup.folder().join("report.txt")).unwrap(),
        b"revised report"
    );
    assert!(!setup.folder().join("photos/cat.jpg").exists());

    // Nothing new published: the next poll is a no-op
    let report = setup.daemon.run_cycle().await.unwrap();
    assert_eq!(report.manifests_accepted, 0);

    let persisted = setup.store().load().unwrap();
    assert_eq!(persisted.last_processed_sequence(PEER_ID, FOLDER_ID), Some(2));
    assert_eq!(persisted.stats.total_manifests_processed, 2);
    assert_eq!(persisted.stats.total_files_downloaded, 3);
    assert_eq!(persisted.stats.total_files_deleted, 1);
    assert!(persisted.in_progress_manifests.is_empty());
    assert!(persisted.failed_manifests.is_empty());
}

#[tokio::test]
async fn test_unpublished_manifest_fails_then_succeeds_on_retry() {
    let setup = Setup::new();
    setup.network.store("zCidReport", b"report");
    // Advertised but never uploaded to the node
    *setup.network.listing.lock().unwrap() = Some(("zManifestLate".to_string(), 1));

    let report = setup.daemon.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    let state = setup.daemon.get_state().await;
    assert!(state.is_failed("zManifestLate"));
    assert_eq!(state.failed_manifests[0].retry_count, 2);

    // Failed manifests stay failed across polls until retried explicitly
    setup.network.publish(
        "zManifestLate",
        1,
        manifest(1, &[("report.txt", "zCidReport", 6)], &[]),
    );
    let report = setup.daemon.run_cycle().await.unwrap();
    assert_eq!(report.manifests_accepted, 0);

    setup
        .daemon
        .retry_failed_manifest("zManifestLate")
        .await
        .unwrap();
    let report = setup.daemon.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(std::fs::read(setup.folder().join("report.txt")).unwrap(), b"report");
    assert!(setup.daemon.get_state().await.failed_manifests.is_empty());
}

#[tokio::test]
async fn test_run_loop_processes_manual_ticks() {
    let setup = Setup::new();
    let mut rx = setup.events.subscribe();
    setup.network.store("zCidNotes", b"notes");
    setup.network.publish(
        "zManifest1",
        1,
        manifest(1, &[("notes.md", "zCidNotes", 5)], &[]),
    );

    let (ticker, ticks) = ManualTicker::new();
    let handle = tokio::spawn(setup.daemon.clone().run(ticker));

    ticks.tick();
    assert_eq!(wait_for_completion(&mut rx, "zManifest1").await, 1);

    drop(ticks);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(setup.folder().join("notes.md").exists());
}

#[tokio::test]
async fn test_trigger_endpoint_wakes_the_daemon() {
    let setup = Setup::new();
    let mut rx = setup.events.subscribe();
    let shutdown = CancellationToken::new();

    let (ticker, trigger) = IntervalTicker::new(Duration::from_secs(3600));
    let (addr, server) = trigger_server::bind(
        setup.daemon.clone(),
        trigger,
        ([127, 0, 0, 1], 0),
        shutdown.clone(),
    )
    .unwrap();
    let server = tokio::spawn(server);
    let daemon_loop = tokio::spawn(setup.daemon.clone().run(ticker));

    // The startup tick finds nothing; the publish is announced via /trigger
    setup.network.store("zCidNotes", b"notes");
    setup.network.publish(
        "zManifest1",
        1,
        manifest(1, &[("notes.md", "zCidNotes", 5)], &[]),
    );
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{}/trigger", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    assert_eq!(wait_for_completion(&mut rx, "zManifest1").await, 1);
    assert_eq!(std::fs::read(setup.folder().join("notes.md")).unwrap(), b"notes");

    setup.daemon.shutdown();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), async {
        daemon_loop.await.unwrap();
        server.await.unwrap();
    })
    .await
    .unwrap();
}
