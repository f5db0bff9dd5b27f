//! HTTP client for the local archivist-node storage API
//!
//! The daemon only needs two things from the node: the bytes behind a CID
//! and the storage quota. Both are exposed through the [`ContentFetcher`]
//! trait so the orchestrator can be exercised without a running node.

use crate::services::manifest::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures of a single fetch. The client never retries on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Malformed content: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Malformed content will not get better by fetching it again
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Malformed(_))
    }

    fn from_reqwest(context: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(format!("{}: {}", context, e))
        } else {
            FetchError::NetworkError(format!("{}: {}", context, e))
        }
    }
}

/// Response from GET /api/archivist/v1/space
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub total_blocks: u64,
    pub quota_max_bytes: u64,
    pub quota_used_bytes: u64,
    pub quota_reserved_bytes: u64,
}

impl SpaceInfo {
    pub fn available_bytes(&self) -> u64 {
        self.quota_max_bytes
            .saturating_sub(self.quota_used_bytes)
            .saturating_sub(self.quota_reserved_bytes)
    }
}

/// Content-addressed retrieval as seen by the backup daemon
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch the raw bytes for a CID
    async fn fetch(&self, cid: &str) -> Result<Bytes, FetchError>;

    /// Query free/used space on the storage node
    async fn space(&self) -> Result<SpaceInfo, FetchError>;

    /// Fetch a manifest blob and parse it
    async fn fetch_manifest(&self, cid: &str) -> Result<Manifest, FetchError> {
        let bytes = self.fetch(cid).await?;
        Manifest::from_bytes(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

/// HTTP client for the archivist-node API
#[derive(Clone)]
pub struct NodeApiClient {
    client: Client,
    base_url: String,
    fetch_timeout: Duration,
}

impl NodeApiClient {
    /// Create a new API client for a node listening on localhost
    pub fn new(api_port: u16) -> Self {
        Self::with_base_url(format!("http://127.0.0.1:{}", api_port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetch_timeout: Duration::from_secs(300),
        }
    }

    /// Timeout applied to each content download
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Download a CID from local storage. `Ok(None)` means the node does not hold it.
    async fn download_local(&self, cid: &str) -> Result<Option<Bytes>, FetchError> {
        let url = format!("{}/api/archivist/v1/data/{}", self.base_url, cid);

        let response = self
            .client
            .get(&url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest("Download failed", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(FetchError::NetworkError(format!(
                "Download failed: HTTP {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(Some)
            .map_err(|e| FetchError::from_reqwest("Failed to read download", e))
    }

    /// Ask the node to retrieve a CID from connected peers into local storage
    async fn request_network_download(&self, cid: &str) -> Result<(), FetchError> {
        let url = format!("{}/api/archivist/v1/data/{}/network", self.base_url, cid);

        let response = self
            .client
            .post(&url)
            .timeout(self.fetch_timeout * 2)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest("Network download request failed", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(cid.to_string()));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::NetworkError(format!(
                "Network download failed: HTTP {} - {}",
                status, body
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ContentFetcher for NodeApiClient {
    async fn fetch(&self, cid: &str) -> Result<Bytes, FetchError> {
        if let Some(bytes) = self.download_local(cid).await? {
            log::debug!("Content {} served from local storage", cid);
            return Ok(bytes);
        }

        log::debug!("Content {} not in local storage, fetching from network", cid);
        self.request_network_download(cid).await?;

        self.download_local(cid)
            .await?
            .ok_or_else(|| FetchError::NotFound(cid.to_string()))
    }

    async fn space(&self) -> Result<SpaceInfo, FetchError> {
        let url = format!("{}/api/archivist/v1/space", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest("Failed to get space info", e))?;

        if !response.status().is_success() {
            return Err(FetchError::NetworkError(format!(
                "Failed to get space info: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<SpaceInfo>()
            .await
            .map_err(|e| FetchError::Malformed(format!("Failed to parse space info: {}", e)))
    }
}

impl Default for NodeApiClient {
    fn default() -> Self {
        Self::new(8080)
    }
}
