//! Manifest discovery client
//!
//! Source peers run a small HTTP server that lists the latest manifest CID
//! for each watched folder. Only whitelisted IPs may query it. The backup
//! daemon polls it on every cycle, so requests use a short timeout.

use crate::services::config::SourcePeerConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Peer offline or network failure
    #[error("Manifest server unreachable: {0}")]
    Unreachable(String),

    /// Our IP is not on the peer's allow-list (it may be added later)
    #[error("Not authorized by manifest server: {0}")]
    Unauthorized(String),

    #[error("Malformed discovery response: {0}")]
    MalformedResponse(String),

    /// The peer answered but does not publish this folder (yet)
    #[error("No manifest published for folder {0}")]
    NoManifest(String),
}

/// Information about a manifest for a watched folder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub folder_id: String,
    #[serde(default)]
    pub folder_path: String,
    pub manifest_cid: String,
    pub sequence_number: u64,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub file_count: u32,
    #[serde(default)]
    pub total_size_bytes: u64,
}

/// Response from the manifest discovery endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDiscoveryResponse {
    pub peer_id: String,
    pub manifests: Vec<ManifestInfo>,
    #[serde(default)]
    pub timestamp: String,
}

/// Current manifest pointer for one source folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPointer {
    pub manifest_cid: String,
    pub sequence_number: u64,
    pub folder_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestDiscovery: Send + Sync {
    /// Ask a source peer for the latest manifest of its configured folder
    async fn poll(&self, peer: &SourcePeerConfig) -> Result<ManifestPointer, DiscoveryError>;
}

/// Client for querying a remote manifest server
pub struct ManifestClient {
    client: reqwest::Client,
}

impl ManifestClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self { client }
    }

    /// Fetch the full manifest listing from a remote peer's manifest server
    pub async fn fetch_manifests(
        &self,
        peer: &SourcePeerConfig,
    ) -> Result<ManifestDiscoveryResponse, DiscoveryError> {
        let url = format!("{}/manifests", peer.manifest_server_url());

        log::debug!("Fetching manifests from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DiscoveryError::Unauthorized(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        if !status.is_success() {
            return Err(DiscoveryError::Unreachable(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        response
            .json::<ManifestDiscoveryResponse>()
            .await
            .map_err(|e| DiscoveryError::MalformedResponse(format!("{}: {}", url, e)))
    }
}

impl Default for ManifestClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ManifestDiscovery for ManifestClient {
    async fn poll(&self, peer: &SourcePeerConfig) -> Result<ManifestPointer, DiscoveryError> {
        let response = self.fetch_manifests(peer).await?;

        if response.peer_id != peer.peer_id {
            return Err(DiscoveryError::MalformedResponse(format!(
                "expected peer {}, server identifies as {}",
                peer.peer_id, response.peer_id
            )));
        }

        response
            .manifests
            .into_iter()
            .find(|m| m.folder_id == peer.folder_id)
            .map(|m| ManifestPointer {
                manifest_cid: m.manifest_cid,
                sequence_number: m.sequence_number,
                folder_id: m.folder_id,
            })
            .ok_or_else(|| DiscoveryError::NoManifest(peer.folder_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::tests::source_peer;
    use std::net::SocketAddr;
    use warp::http::StatusCode as WarpStatus;
    use warp::Filter;

    fn spawn_manifest_server(body: serde_json::Value) -> SocketAddr {
        let route = warp::path("manifests")
            .and(warp::get())
            .map(move || warp::reply::json(&body));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn peer_at(addr: SocketAddr, folder_id: &str) -> SourcePeerConfig {
        let mut peer = source_peer("16Uiu2HAmSource", folder_id);
        peer.host = addr.ip().to_string();
        peer.manifest_port = addr.port();
        peer
    }

    fn listing() -> serde_json::Value {
        serde_json::json!({
            "peerId": "16Uiu2HAmSource",
            "manifests": [
                {
                    "folderId": "docs",
                    "folderPath": "/home/a/docs",
                    "manifestCid": "zDvManifestDocs",
                    "sequenceNumber": 12,
                    "updatedAt": "2025-01-01T00:00:00Z",
                    "fileCount": 3,
                    "totalSizeBytes": 300
                },
                {
                    "folderId": "photos",
                    "folderPath": "/home/a/photos",
                    "manifestCid": "zDvManifestPhotos",
                    "sequenceNumber": 4,
                    "updatedAt": "2025-01-01T00:00:00Z",
                    "fileCount": 1,
                    "totalSizeBytes": 10
                }
            ],
            "timestamp": "2025-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_poll_selects_configured_folder() {
        let addr = spawn_manifest_server(listing());
        let client = ManifestClient::default();

        let pointer = client.poll(&peer_at(addr, "photos")).await.unwrap();
        assert_eq!(
            pointer,
            ManifestPointer {
                manifest_cid: "zDvManifestPhotos".to_string(),
                sequence_number: 4,
                folder_id: "photos".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_poll_unpublished_folder() {
        let addr = spawn_manifest_server(listing());
        let client = ManifestClient::default();

        let err = client.poll(&peer_at(addr, "music")).await.unwrap_err();
        assert_eq!(err, DiscoveryError::NoManifest("music".to_string()));
    }

    #[tokio::test]
    async fn test_poll_rejects_peer_id_mismatch() {
        let mut body = listing();
        body["peerId"] = serde_json::json!("16Uiu2HAmImpostor");
        let addr = spawn_manifest_server(body);

        let err = ManifestClient::default()
            .poll(&peer_at(addr, "docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_poll_malformed_body() {
        let addr = spawn_manifest_server(serde_json::json!({ "unexpected": true }));

        let err = ManifestClient::default()
            .poll(&peer_at(addr, "docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_poll_forbidden_is_unauthorized() {
        let route = warp::path("manifests")
            .map(|| warp::reply::with_status("denied", WarpStatus::FORBIDDEN));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let err = ManifestClient::default()
            .poll(&peer_at(addr, "docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_poll_offline_peer_is_unreachable() {
        let mut peer = source_peer("16Uiu2HAmSource", "docs");
        peer.manifest_port = 9;

        let err = ManifestClient::new(Duration::from_secs(2))
            .poll(&peer)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Unreachable(_)));
    }
}
