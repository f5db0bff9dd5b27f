use serde::Serialize;
use thiserror::Error;

use crate::node_api::FetchError;
use crate::services::discovery::DiscoveryError;

#[derive(Error, Debug)]
pub enum ArchivistError {
    #[error("Backup daemon is disabled")]
    DaemonDisabled,

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Daemon state error: {0}")]
    StateError(String),

    #[error("File operation failed: {0}")]
    FileOperationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

// Control commands hand errors to whatever UI sits on top, which only needs the message
impl Serialize for ArchivistError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArchivistError>;
