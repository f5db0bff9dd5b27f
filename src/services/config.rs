use crate::error::{ArchivistError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    // Storage node settings
    #[serde(default)]
    pub node: NodeSettings,

    // Backup server settings (Machine B - receives backups)
    #[serde(default)]
    pub backup_server: BackupServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub api_host: String,
    pub api_port: u16,
    pub log_level: String, // Log level: trace, debug, info, warn, error
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8080, // Default archivist-node API port
            log_level: "info".to_string(),
        }
    }
}

impl NodeSettings {
    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}", self.api_host, self.api_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupServerSettings {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub max_concurrent_downloads: u32,
    pub max_retries: u32,
    pub auto_delete_tombstones: bool,
    /// Port for receiving trigger notifications from source peers (default: 8086)
    #[serde(default = "default_trigger_port")]
    pub trigger_port: u16,
    /// Base delay between retries, doubled on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Directory under which each source folder is materialized
    #[serde(default = "default_backup_root")]
    pub backup_root: String,
    /// Overrides the default location of backup-daemon-state.json
    #[serde(default)]
    pub state_file: Option<String>,
    /// Source peers to poll for manifests
    #[serde(default)]
    pub source_peers: Vec<SourcePeerConfig>,
}

fn default_trigger_port() -> u16 {
    8086
}

fn default_manifest_port() -> u16 {
    8085
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_discovery_timeout_secs() -> u64 {
    5
}

fn default_fetch_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn archivist_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("archivist"))
        .unwrap_or_else(|| PathBuf::from(".archivist"))
}

fn default_backup_root() -> String {
    archivist_data_dir()
        .join("backups")
        .to_string_lossy()
        .to_string()
}

impl Default for BackupServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 30,
            max_concurrent_downloads: 3,
            max_retries: 3,
            auto_delete_tombstones: true,
            trigger_port: default_trigger_port(),
            retry_backoff_ms: default_retry_backoff_ms(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            backup_root: default_backup_root(),
            state_file: None,
            source_peers: Vec::new(),
        }
    }
}

impl BackupServerSettings {
    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| archivist_data_dir().join("backup-daemon-state.json"))
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(ArchivistError::ConfigError(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(ArchivistError::ConfigError(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ArchivistError::ConfigError(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.backup_root.trim().is_empty() {
            return Err(ArchivistError::ConfigError(
                "backup_root must not be empty".to_string(),
            ));
        }
        validate_source_peers(&self.source_peers, Path::new(&self.backup_root))
    }
}

/// Configuration for a source peer to poll for manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePeerConfig {
    /// Human-friendly name for this peer
    pub nickname: String,
    /// Peer ID of the source node; manifests are recorded under it
    pub peer_id: String,
    /// Host/IP address of the peer's manifest server
    pub host: String,
    /// Port of the manifest server (default: 8085)
    #[serde(default = "default_manifest_port")]
    pub manifest_port: u16,
    /// Multiaddrs for P2P connections (for fetching actual data)
    #[serde(default)]
    pub multiaddrs: Vec<String>,
    /// Watched folder on the source peer that this entry mirrors
    pub folder_id: String,
    /// Local directory for this folder, defaults to `<backup_root>/<peer_id>/<folder_id>`
    #[serde(default)]
    pub local_path: Option<String>,
    /// Whether this source is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourcePeerConfig {
    pub fn manifest_server_url(&self) -> String {
        format!("http://{}:{}", self.host, self.manifest_port)
    }

    /// Where this folder's files are materialized
    pub fn local_root(&self, backup_root: &Path) -> PathBuf {
        match &self.local_path {
            Some(path) => PathBuf::from(path),
            None => backup_root.join(&self.peer_id).join(&self.folder_id),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ArchivistError::ConfigError(format!(
                "Source peer {} has no host",
                self.nickname
            )));
        }
        if self.manifest_port == 0 {
            return Err(ArchivistError::ConfigError(format!(
                "Source peer {} has an invalid manifest port",
                self.nickname
            )));
        }
        check_path_component("peer_id", &self.nickname, &self.peer_id)?;
        check_path_component("folder_id", &self.nickname, &self.folder_id)?;
        Ok(())
    }
}

// Ids end up as directory names under backup_root
fn check_path_component(field: &str, nickname: &str, value: &str) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || value.contains('/')
        || value.contains('\\')
    {
        return Err(ArchivistError::ConfigError(format!(
            "Source peer {} has an invalid {}: {:?}",
            nickname, field, value
        )));
    }
    Ok(())
}

pub fn validate_source_peers(peers: &[SourcePeerConfig], backup_root: &Path) -> Result<()> {
    let mut seen = HashSet::new();
    let mut roots: Vec<(&SourcePeerConfig, PathBuf)> = Vec::with_capacity(peers.len());
    for peer in peers {
        peer.validate()?;
        if !seen.insert((peer.peer_id.as_str(), peer.folder_id.as_str())) {
            return Err(ArchivistError::ConfigError(format!(
                "Duplicate source peer entry for peer {} folder {}",
                peer.peer_id, peer.folder_id
            )));
        }
        if let Some(local_path) = &peer.local_path {
            let path = Path::new(local_path);
            if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
                return Err(ArchivistError::ConfigError(format!(
                    "Source peer {} needs an absolute local_path without '..': {:?}",
                    peer.nickname, local_path
                )));
            }
        }

        // Tombstones of one folder must never reach files of another
        let root = peer.local_root(backup_root);
        if let Some((other, _)) = roots
            .iter()
            .find(|(_, r)| r.starts_with(&root) || root.starts_with(r))
        {
            return Err(ArchivistError::ConfigError(format!(
                "Local folders of source peers {} and {} overlap",
                other.nickname, peer.nickname
            )));
        }
        roots.push((peer, root));
    }
    Ok(())
}

pub struct ConfigService {
    config: AppConfig,
    config_path: PathBuf,
}

impl ConfigService {
    /// Load configuration from the default location
    pub fn new() -> Result<Self> {
        let config_path = dirs::config_dir()
            .map(|p| p.join("archivist").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        Self::with_path(config_path)
    }

    /// Load configuration from an explicit path. A missing file yields defaults.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = Self::load_from_file(&config_path)?;

        Ok(Self {
            config,
            config_path,
        })
    }

    fn load_from_file(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            log::info!("No configuration at {:?}, using defaults", path);
            return Ok(AppConfig::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ArchivistError::ConfigError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ArchivistError::ConfigError(e.to_string()))
    }

    pub fn get(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&mut self, config: AppConfig) -> Result<()> {
        config.backup_server.validate()?;
        self.config = config;
        self.save()
    }

    /// Persist the backup daemon's on/off switch
    pub fn set_backup_enabled(&mut self, enabled: bool) -> Result<()> {
        self.config.backup_server.enabled = enabled;
        self.save()
    }

    pub fn set_source_peers(&mut self, peers: Vec<SourcePeerConfig>) -> Result<()> {
        validate_source_peers(&peers, Path::new(&self.config.backup_server.backup_root))?;
        self.config.backup_server.source_peers = peers;
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ArchivistError::ConfigError(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(&self.config)
            .map_err(|e| ArchivistError::ConfigError(e.to_string()))?;

        std::fs::write(&self.config_path, contents)
            .map_err(|e| ArchivistError::ConfigError(e.to_string()))?;

        log::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    pub fn reset_to_defaults(&mut self) -> Result<()> {
        self.config = AppConfig::default();
        self.save()
    }
}
