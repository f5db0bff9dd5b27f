//! Persistent bookkeeping for the backup daemon
//!
//! Everything the daemon has finished, is working on, or gave up on lives in
//! one [`DaemonState`] document (backup-daemon-state.json). The daemon is its
//! only writer; [`StateStore`] replaces the file atomically so a crash during
//! a save leaves the previous version intact.

use crate::error::{ArchivistError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistent state for backup daemon (stored in backup-daemon-state.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    /// Manifests that have been fully processed
    pub processed_manifests: HashMap<String, ProcessedManifest>,

    /// Manifests currently being processed (in-flight)
    pub in_progress_manifests: HashMap<String, InProgressManifest>,

    /// Manifests that failed processing (need an explicit retry)
    pub failed_manifests: Vec<FailedManifest>,

    /// Failed manifests re-queued by the operator, picked up on the next cycle
    #[serde(default)]
    pub pending_manifests: Vec<PendingManifest>,

    /// Last time we polled for new manifests
    pub last_poll_time: DateTime<Utc>,

    /// Statistics
    pub stats: DaemonStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedManifest {
    pub manifest_cid: String,
    pub source_peer_id: String,
    pub sequence_number: u64,
    pub folder_id: String,
    pub processed_at: DateTime<Utc>,
    pub file_count: u32,
    pub total_size_bytes: u64,
    pub deleted_count: u32,
    /// Files that exhausted their retries; the manifest still completed
    #[serde(default)]
    pub files_failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    FetchingManifest,
    Downloading,
    ApplyingTombstones,
    /// Stopped between files by disable or shutdown, resumed on the next cycle
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressManifest {
    pub manifest_cid: String,
    pub source_peer_id: String,
    #[serde(default)]
    pub folder_id: String,
    pub sequence_number: u64,
    pub started_at: DateTime<Utc>,
    pub total_files: u32,
    pub files_downloaded: u32,
    pub files_failed: u32,
    pub current_status: ManifestStatus,
    /// Manifest fetch attempts made so far, including earlier rounds
    #[serde(default)]
    pub attempts: u32,
    /// Relative path -> CID of files this manifest already wrote to disk
    #[serde(default)]
    pub materialized: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedManifest {
    pub manifest_cid: String,
    pub source_peer_id: String,
    #[serde(default)]
    pub folder_id: String,
    #[serde(default)]
    pub sequence_number: u64,
    pub failed_at: DateTime<Utc>,
    pub error_message: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingManifest {
    pub manifest_cid: String,
    pub source_peer_id: String,
    pub folder_id: String,
    pub sequence_number: u64,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DaemonStats {
    pub total_manifests_processed: u64,
    pub total_files_downloaded: u64,
    pub total_bytes_downloaded: u64,
    pub total_files_deleted: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self {
            processed_manifests: HashMap::new(),
            in_progress_manifests: HashMap::new(),
            failed_manifests: Vec::new(),
            pending_manifests: Vec::new(),
            last_poll_time: Utc::now(),
            stats: DaemonStats::default(),
        }
    }
}

impl DaemonState {
    /// Highest sequence number processed for one source folder
    pub fn last_processed_sequence(&self, peer_id: &str, folder_id: &str) -> Option<u64> {
        self.processed_manifests
            .values()
            .filter(|m| m.source_peer_id == peer_id && m.folder_id == folder_id)
            .map(|m| m.sequence_number)
            .max()
    }

    pub fn in_progress_for(&self, peer_id: &str, folder_id: &str) -> Option<&InProgressManifest> {
        self.in_progress_manifests
            .values()
            .find(|m| m.source_peer_id == peer_id && m.folder_id == folder_id)
    }

    pub fn pending_for(&self, peer_id: &str, folder_id: &str) -> Option<&PendingManifest> {
        self.pending_manifests
            .iter()
            .find(|m| m.source_peer_id == peer_id && m.folder_id == folder_id)
    }

    pub fn is_failed(&self, manifest_cid: &str) -> bool {
        self.failed_manifests
            .iter()
            .any(|m| m.manifest_cid == manifest_cid)
    }
}

/// Loads and atomically saves [`DaemonState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state from disk. A missing file is a first run; a corrupt one is an error.
    pub fn load(&self) -> Result<DaemonState> {
        if !self.path.exists() {
            log::info!("No existing daemon state found, starting fresh");
            return Ok(DaemonState::default());
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            ArchivistError::StateError(format!(
                "Failed to read daemon state {:?}: {}",
                self.path, e
            ))
        })?;

        let state: DaemonState = serde_json::from_str(&contents).map_err(|e| {
            ArchivistError::StateError(format!(
                "Daemon state {:?} is corrupt: {}",
                self.path, e
            ))
        })?;

        log::info!(
            "Loaded daemon state: {} processed, {} in-progress, {} failed, {} pending",
            state.processed_manifests.len(),
            state.in_progress_manifests.len(),
            state.failed_manifests.len(),
            state.pending_manifests.len()
        );

        Ok(state)
    }

    /// Write to a temp file in the same directory, fsync, then rename over the old state
    pub fn save(&self, state: &DaemonState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        std::fs::create_dir_all(&dir).map_err(|e| {
            ArchivistError::FileOperationFailed(format!("Failed to create state directory: {}", e))
        })?;

        let json = serde_json::to_vec_pretty(state)?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
            ArchivistError::FileOperationFailed(format!(
                "Failed to create temp file in {}: {}",
                dir.display(),
                e
            ))
        })?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| {
            ArchivistError::FileOperationFailed(format!(
                "Failed to persist daemon state to {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}
