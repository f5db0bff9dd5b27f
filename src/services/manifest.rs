//! Folder manifests published by source peers
//!
//! A source peer uploads a JSON manifest describing the desired state of one
//! watched folder. This module parses that blob and normalizes it into a flat
//! list of [`FileEntry`] values, with deletions expressed as tombstones.

use crate::error::{ArchivistError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

/// Manifest file structure (JSON) - must match the source peer's sync service output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub version: String,
    pub folder_id: String,
    #[serde(default)]
    pub folder_path: String,
    pub source_peer_id: String,
    pub sequence_number: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub manifest_cid: Option<String>,
    #[serde(default)]
    pub files: Vec<ManifestFileEntry>,
    #[serde(default)]
    pub deleted_files: Vec<ManifestDeletedEntry>,
    #[serde(default)]
    pub stats: ManifestStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFileEntry {
    pub path: String,
    pub cid: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDeletedEntry {
    pub path: String,
    #[serde(default)]
    pub cid: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestStats {
    pub total_files: u32,
    pub total_size_bytes: u64,
}

/// One path in a manifest, either live content or a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub relative_path: String,
    pub cid: String,
    pub size_bytes: u64,
    pub tombstone: bool,
}

/// Parsed and validated manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub folder_id: String,
    pub source_peer_id: String,
    pub sequence_number: u64,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<FileEntry>,
}

impl Manifest {
    /// Parse a raw manifest blob as fetched from the storage node
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let json = std::str::from_utf8(bytes).map_err(|e| {
            ArchivistError::InvalidManifest(format!("Invalid UTF-8 in manifest: {}", e))
        })?;
        let file: ManifestFile = serde_json::from_str(json)
            .map_err(|e| ArchivistError::InvalidManifest(format!("Malformed manifest: {}", e)))?;
        Self::try_from(file)
    }

    /// Entries that must be downloaded
    pub fn live_entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| !e.tombstone)
    }

    /// Entries that must be deleted locally
    pub fn tombstones(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| e.tombstone)
    }

    pub fn live_size_bytes(&self) -> u64 {
        self.live_entries().map(|e| e.size_bytes).sum()
    }
}

impl TryFrom<ManifestFile> for Manifest {
    type Error = ArchivistError;

    fn try_from(file: ManifestFile) -> Result<Self> {
        if file.folder_id.trim().is_empty() {
            return Err(ArchivistError::InvalidManifest(
                "Manifest has an empty folder_id".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(file.files.len() + file.deleted_files.len());

        for f in file.files {
            let path = normalize_relative_path(&f.path)?;
            if f.cid.trim().is_empty() {
                return Err(ArchivistError::InvalidManifest(format!(
                    "File {} has an empty CID",
                    f.path
                )));
            }
            if !seen.insert(path.clone()) {
                return Err(ArchivistError::InvalidManifest(format!(
                    "Duplicate path in manifest: {}",
                    f.path
                )));
            }
            entries.push(FileEntry {
                relative_path: path,
                cid: f.cid,
                size_bytes: f.size_bytes,
                tombstone: false,
            });
        }

        for d in file.deleted_files {
            let path = normalize_relative_path(&d.path)?;
            if !seen.insert(path.clone()) {
                return Err(ArchivistError::InvalidManifest(format!(
                    "Path is both present and deleted: {}",
                    d.path
                )));
            }
            entries.push(FileEntry {
                relative_path: path,
                cid: d.cid,
                size_bytes: 0,
                tombstone: true,
            });
        }

        Ok(Self {
            folder_id: file.folder_id,
            source_peer_id: file.source_peer_id,
            sequence_number: file.sequence_number,
            generated_at: file.last_updated,
            entries,
        })
    }
}

/// Reject paths that could escape the folder's local root and return the
/// canonical spelling (`./a//b.txt` becomes `a/b.txt`), so aliases collide
fn normalize_relative_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(ArchivistError::InvalidManifest(
            "Manifest entry has an empty path".to_string(),
        ));
    }

    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(name) => parts.push(name.to_string_lossy()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchivistError::InvalidManifest(format!(
                    "Unsafe path in manifest: {}",
                    path
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(ArchivistError::InvalidManifest(format!(
            "Manifest entry does not name a file: {}",
            path
        )));
    }

    Ok(parts.join("/"))
}
