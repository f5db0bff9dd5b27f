use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::node_api::NodeApiClient;
use crate::services::{
    BackupDaemon, ChannelSink, ConfigService, DaemonSettings, EventSink, IntervalTicker,
    LogSink, ManifestClient, MultiSink, StateStore, TriggerHandle,
};

/// Capacity of the broadcast channel UIs subscribe to
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared application state handed to the control commands
pub struct AppState {
    pub config: Arc<RwLock<ConfigService>>,
    pub backup_daemon: Arc<BackupDaemon>,
    pub trigger: TriggerHandle,
    pub events: ChannelSink,
}

impl AppState {
    /// Wire the daemon from configuration. The returned ticker drives the poll loop.
    pub fn new(config_service: ConfigService) -> Result<(Self, IntervalTicker)> {
        let app_config = config_service.get();
        let backup = &app_config.backup_server;
        backup.validate()?;

        log::info!(
            "Initializing backup daemon: node API {}, {} source peers, backup root {}",
            app_config.node.api_base_url(),
            backup.source_peers.len(),
            backup.backup_root
        );

        let fetcher = NodeApiClient::with_base_url(app_config.node.api_base_url())
            .with_fetch_timeout(Duration::from_secs(backup.fetch_timeout_secs));
        let discovery = ManifestClient::new(Duration::from_secs(backup.discovery_timeout_secs));

        let events = ChannelSink::new(EVENT_CHANNEL_CAPACITY);
        let sink: Arc<dyn EventSink> = Arc::new(
            MultiSink::new()
                .with(Arc::new(LogSink))
                .with(Arc::new(events.clone())),
        );

        let backup_daemon = BackupDaemon::new(
            Arc::new(fetcher),
            Arc::new(discovery),
            StateStore::new(backup.state_file_path()),
            DaemonSettings::from(backup),
            backup.source_peers.clone(),
            sink,
        )?;

        let (ticker, trigger) = IntervalTicker::new(Duration::from_secs(backup.poll_interval_secs));

        let state = Self {
            config: Arc::new(RwLock::new(config_service)),
            backup_daemon: Arc::new(backup_daemon),
            trigger,
            events,
        };
        Ok((state, ticker))
    }
}
