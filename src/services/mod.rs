// Service layer - trait-based seams so the daemon can run against fakes

pub mod backup_daemon;
pub mod config;
pub mod daemon_state;
pub mod discovery;
pub mod events;
pub mod manifest;
pub mod scheduler;
pub mod trigger_server;

pub use backup_daemon::{BackupDaemon, CycleReport, DaemonSettings, PeerKey, RetryDisposition};
pub use config::{AppConfig, BackupServerSettings, ConfigService, SourcePeerConfig};
pub use daemon_state::{DaemonState, StateStore};
pub use discovery::{DiscoveryError, ManifestClient, ManifestDiscovery, ManifestPointer};
pub use events::{ChannelSink, DaemonEvent, DaemonStatus, EventSink, LogSink, MultiSink};
pub use manifest::{FileEntry, Manifest};
pub use scheduler::{IntervalTicker, ManualTickHandle, ManualTicker, Tick, TickSource, TriggerHandle};
