//! Notifications emitted by the backup daemon
//!
//! The daemon reports lifecycle changes through an [`EventSink`] handed to it
//! at construction. Sinks are synchronous and cannot fail, so a slow or absent
//! observer never holds up a state transition.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Disabled,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    StatusChanged {
        status: DaemonStatus,
    },
    PeerUnreachable {
        source_peer_id: String,
        error: String,
    },
    ManifestAccepted {
        manifest_cid: String,
        source_peer_id: String,
        folder_id: String,
        sequence_number: u64,
    },
    FileProgress {
        manifest_cid: String,
        relative_path: String,
        files_downloaded: u32,
        files_failed: u32,
        total_files: u32,
    },
    FileFailed {
        manifest_cid: String,
        relative_path: String,
        error: String,
    },
    TombstonesApplied {
        manifest_cid: String,
        deleted: u32,
        not_found: u32,
        failed: u32,
    },
    TombstonesDeferred {
        manifest_cid: String,
        count: u32,
    },
    ManifestCompleted {
        manifest_cid: String,
        sequence_number: u64,
        file_count: u32,
        files_failed: u32,
        deleted_count: u32,
    },
    ManifestFailed {
        manifest_cid: String,
        error_message: String,
        retry_count: u32,
    },
    ManifestInterrupted {
        manifest_cid: String,
    },
    CycleCompleted {
        peers_polled: u32,
        manifests_processed: u32,
    },
}

/// Observer of daemon events
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &DaemonEvent);
}

/// Writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn notify(&self, event: &DaemonEvent) {
        match event {
            DaemonEvent::FileProgress { .. } | DaemonEvent::CycleCompleted { .. } => {
                log::debug!("Daemon event: {:?}", event)
            }
            DaemonEvent::ManifestFailed { .. } | DaemonEvent::FileFailed { .. } => {
                log::warn!("Daemon event: {:?}", event)
            }
            _ => log::info!("Daemon event: {:?}", event),
        }
    }
}

/// Publishes events on a broadcast channel for UIs and tests
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<DaemonEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: &DaemonEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
    }
}

/// Delivers every event to several sinks
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MultiSink {
    fn notify(&self, event: &DaemonEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}
