//! Backup server daemon for automatic manifest processing
//!
//! On every cycle the daemon:
//! - Resumes manifests left in progress by a crash, disable or shutdown
//! - Starts manifests an operator re-queued after a failure
//! - Polls each enabled source peer for its folder's latest manifest pointer
//! - Fetches accepted manifests and their files through the storage node,
//!   never running more than `max_concurrent_downloads` fetches at once
//! - Applies tombstones once a manifest's downloads are done
//!
//! Every state change is persisted before the daemon moves on, so a restart
//! picks up exactly where the previous process stopped.

use crate::error::{ArchivistError, Result};
use crate::node_api::ContentFetcher;
use crate::services::config::{validate_source_peers, BackupServerSettings, SourcePeerConfig};
use crate::services::daemon_state::{
    DaemonState, FailedManifest, InProgressManifest, ManifestStatus, PendingManifest,
    ProcessedManifest, StateStore,
};
use crate::services::discovery::{DiscoveryError, ManifestDiscovery, ManifestPointer};
use crate::services::events::{DaemonEvent, DaemonStatus, EventSink};
use crate::services::manifest::{FileEntry, Manifest};
use crate::services::scheduler::TickSource;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound for the exponential backoff between fetch attempts
const MAX_BACKOFF: Duration = Duration::from_secs(60);

const ORPHANED_MESSAGE: &str = "Source peer is no longer configured";
const SUPERSEDED_MESSAGE: &str = "Superseded by a newer processed manifest";

/// Runtime knobs, usually derived from [`BackupServerSettings`]
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub max_concurrent_downloads: usize,
    pub max_retries: u32,
    pub auto_delete_tombstones: bool,
    /// Base delay before the second attempt, doubled for every further attempt
    pub retry_backoff: Duration,
    pub backup_root: PathBuf,
}

impl From<&BackupServerSettings> for DaemonSettings {
    fn from(settings: &BackupServerSettings) -> Self {
        Self {
            enabled: settings.enabled,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_concurrent_downloads: settings.max_concurrent_downloads.max(1) as usize,
            max_retries: settings.max_retries.max(1),
            auto_delete_tombstones: settings.auto_delete_tombstones,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            backup_root: PathBuf::from(&settings.backup_root),
        }
    }
}

/// Identifies one mirrored folder: sequence numbers are only comparable within a key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub peer_id: String,
    pub folder_id: String,
}

impl PeerKey {
    pub fn new(peer_id: impl Into<String>, folder_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            folder_id: folder_id.into(),
        }
    }
}

impl From<&SourcePeerConfig> for PeerKey {
    fn from(peer: &SourcePeerConfig) -> Self {
        Self::new(&peer.peer_id, &peer.folder_id)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer_id, self.folder_id)
    }
}

/// What an explicit retry did with a failed manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    /// Picked up on the next cycle
    Queued,
    /// A newer manifest for the same folder was already processed; the entry was dropped
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    Completed,
    Failed,
    Interrupted,
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub peers_polled: u32,
    pub manifests_accepted: u32,
    pub completed: u32,
    pub failed: u32,
    pub interrupted: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    New,
    Retry,
    Resume,
}

#[derive(Debug, Clone)]
struct ManifestWork {
    manifest_cid: String,
    key: PeerKey,
    sequence_number: u64,
    kind: WorkKind,
    local_root: PathBuf,
}

enum ManifestFetch {
    Fetched(Manifest),
    Failed(String),
    Interrupted,
}

#[derive(Debug)]
enum FileResult {
    Downloaded { bytes: u64 },
    AlreadyPresent,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct FileReport {
    relative_path: String,
    cid: String,
    result: FileResult,
}

#[derive(Debug, Default)]
struct DownloadSummary {
    downloaded: u32,
    already_present: u32,
    failed: u32,
    cancelled: u32,
    bytes: u64,
}

impl DownloadSummary {
    fn completed(&self) -> u32 {
        self.downloaded + self.already_present
    }
}

#[derive(Debug, Default)]
struct TombstoneSummary {
    deleted: u32,
    not_found: u32,
    failed: u32,
}

/// Everything a spawned download worker needs
#[derive(Clone)]
struct WorkerContext {
    fetcher: Arc<dyn ContentFetcher>,
    slots: Arc<Semaphore>,
    enabled: Arc<AtomicBool>,
    shutdown: CancellationToken,
    max_retries: u32,
    retry_backoff: Duration,
}

impl WorkerContext {
    fn should_stop(&self) -> bool {
        !self.enabled.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    /// Wait for a global download slot. `None` on shutdown.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.ok(),
            _ = self.shutdown.cancelled() => None,
        }
    }

    /// Sleep before the next attempt. Returns false if the daemon is stopping.
    async fn backoff(&self, attempt: u32) -> bool {
        let delay = backoff_delay(self.retry_backoff, attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return false,
            }
        }
        !self.should_stop()
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.checked_mul(factor)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

type ActiveSet = std::sync::Mutex<HashSet<PeerKey>>;

fn lock_active(active: &ActiveSet) -> std::sync::MutexGuard<'_, HashSet<PeerKey>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a folder as being processed until dropped
struct ActiveGuard<'a> {
    active: &'a ActiveSet,
    key: PeerKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock_active(self.active).remove(&self.key);
    }
}

pub struct BackupDaemon {
    fetcher: Arc<dyn ContentFetcher>,
    discovery: Arc<dyn ManifestDiscovery>,
    store: StateStore,
    /// Single source of truth; every mutation is saved while the write lock is held
    state: RwLock<DaemonState>,
    settings: DaemonSettings,
    source_peers: RwLock<Vec<SourcePeerConfig>>,
    enabled: Arc<AtomicBool>,
    paused: AtomicBool,
    /// Shared by manifest and file fetches across all peers
    download_slots: Arc<Semaphore>,
    active: ActiveSet,
    shutdown: CancellationToken,
    events: Arc<dyn EventSink>,
}

impl BackupDaemon {
    /// Create a daemon over persisted state. Refuses to start on a corrupt state file.
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        discovery: Arc<dyn ManifestDiscovery>,
        store: StateStore,
        settings: DaemonSettings,
        source_peers: Vec<SourcePeerConfig>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        validate_source_peers(&source_peers, &settings.backup_root)?;

        let mut state = store.load()?;
        let orphaned = fail_orphaned(&mut state, &source_peers, &HashSet::new());
        if orphaned > 0 {
            log::warn!(
                "{} manifests belong to source peers that are no longer configured, marked failed",
                orphaned
            );
            store.save(&state)?;
        }
        if !state.in_progress_manifests.is_empty() {
            log::info!(
                "{} interrupted manifests will resume on the next cycle",
                state.in_progress_manifests.len()
            );
        }

        log::info!(
            "Backup daemon ready: {} source peers, state at {}",
            source_peers.len(),
            store.path().display()
        );

        Ok(Self {
            fetcher,
            discovery,
            store,
            state: RwLock::new(state),
            enabled: Arc::new(AtomicBool::new(settings.enabled)),
            paused: AtomicBool::new(false),
            download_slots: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
            settings,
            source_peers: RwLock::new(source_peers),
            active: std::sync::Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            events,
        })
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Replace the configured source peers
    ///
    /// In-progress and queued manifests of peers that disappear are moved to
    /// the failed list so nothing is silently dropped. Manifests currently
    /// being processed are left to finish.
    pub async fn set_source_peers(&self, peers: Vec<SourcePeerConfig>) -> Result<()> {
        validate_source_peers(&peers, &self.settings.backup_root)?;

        let mut source_peers = self.source_peers.write().await;
        {
            let active = lock_active(&self.active).clone();
            let mut state = self.state.write().await;
            let orphaned = fail_orphaned(&mut state, &peers, &active);
            if orphaned > 0 {
                log::warn!(
                    "{} manifests of removed source peers marked failed",
                    orphaned
                );
                self.store.save(&state)?;
            }
        }
        *source_peers = peers;
        log::info!("Updated source peers: {} configured", source_peers.len());
        Ok(())
    }

    pub async fn source_peers(&self) -> Vec<SourcePeerConfig> {
        self.source_peers.read().await.clone()
    }

    /// Snapshot of the persisted state
    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            log::info!("Backup daemon enabled");
            self.emit_status();
        }
    }

    /// Stop between files. In-progress manifests resume once re-enabled.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            log::info!("Backup daemon disabled");
            self.emit_status();
        }
    }

    /// Let running manifests finish but start no new cycle
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            log::info!("Backup daemon paused");
            self.emit_status();
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            log::info!("Backup daemon resumed");
            self.emit_status();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DaemonStatus {
        if !self.is_enabled() {
            DaemonStatus::Disabled
        } else if self.is_paused() {
            DaemonStatus::Paused
        } else {
            DaemonStatus::Running
        }
    }

    /// Stop the poll loop and all workers at the next safe point
    pub fn shutdown(&self) {
        log::info!("Backup daemon shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Re-queue a failed manifest for the next cycle
    pub async fn retry_failed_manifest(&self, manifest_cid: &str) -> Result<RetryDisposition> {
        log::info!("Manual retry requested for manifest: {}", manifest_cid);

        let mut state = self.state.write().await;
        let index = state
            .failed_manifests
            .iter()
            .position(|m| m.manifest_cid == manifest_cid)
            .ok_or_else(|| ArchivistError::ManifestNotFound(manifest_cid.to_string()))?;
        let failed = state.failed_manifests.remove(index);

        let superseded = state
            .last_processed_sequence(&failed.source_peer_id, &failed.folder_id)
            .is_some_and(|last| last >= failed.sequence_number);

        let disposition = if superseded {
            log::info!(
                "Manifest {} (seq {}) is superseded by a newer processed manifest, dropping it",
                failed.manifest_cid,
                failed.sequence_number
            );
            RetryDisposition::Superseded
        } else {
            state
                .pending_manifests
                .retain(|p| p.manifest_cid != failed.manifest_cid);
            state.pending_manifests.push(PendingManifest {
                manifest_cid: failed.manifest_cid.clone(),
                source_peer_id: failed.source_peer_id,
                folder_id: failed.folder_id,
                sequence_number: failed.sequence_number,
                queued_at: Utc::now(),
                retry_count: failed.retry_count,
            });
            log::info!(
                "Manifest {} queued for retry on the next cycle",
                failed.manifest_cid
            );
            RetryDisposition::Queued
        };

        self.store.save(&state)?;
        Ok(disposition)
    }

    /// Run the poll loop until the tick source ends or the daemon shuts down
    pub async fn run<T: TickSource>(self: Arc<Self>, mut ticks: T) {
        log::info!(
            "Starting backup daemon (poll interval: {}s, max concurrent downloads: {}, enabled: {})",
            self.settings.poll_interval.as_secs(),
            self.settings.max_concurrent_downloads,
            self.is_enabled()
        );

        loop {
            let tick = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                tick = ticks.next_tick() => tick,
            };
            let Some(tick) = tick else {
                log::debug!("Tick source closed");
                break;
            };

            if !self.is_enabled() {
                log::debug!("Backup daemon disabled, ignoring {:?} tick", tick);
                continue;
            }
            if self.is_paused() {
                log::debug!("Backup daemon paused, ignoring {:?} tick", tick);
                continue;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    if report.manifests_accepted > 0 {
                        log::info!(
                            "Cycle done: {} completed, {} failed, {} interrupted",
                            report.completed,
                            report.failed,
                            report.interrupted
                        );
                    }
                }
                Err(e) => {
                    log::error!("Daemon cycle error: {}", e);
                }
            }
        }

        log::info!("Backup daemon stopped");
    }

    /// Run one processing cycle
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let peers = self.source_peers.read().await.clone();
        let mut report = CycleReport::default();
        let mut scheduled: Vec<(ManifestWork, ActiveGuard<'_>)> = Vec::new();

        // 1. Manifests interrupted by a crash, disable or shutdown
        for work in self.collect_resumable(&peers).await? {
            if let Some(guard) = self.claim(&work.key) {
                log::info!(
                    "Resuming manifest {} for {} (seq {})",
                    work.manifest_cid,
                    work.key,
                    work.sequence_number
                );
                scheduled.push((work, guard));
            }
        }

        // 2. Failed manifests an operator re-queued
        for (pending, local_root) in self.collect_pending(&peers).await? {
            let key = PeerKey::new(&pending.source_peer_id, &pending.folder_id);
            let Some(guard) = self.claim(&key) else {
                continue;
            };
            if let Some(work) = self.start_pending(pending, local_root).await? {
                scheduled.push((work, guard));
            }
        }

        // 3. Discover new manifests, one peer at a time
        for peer in peers.iter().filter(|p| p.enabled) {
            let key = PeerKey::from(peer);
            let Some(guard) = self.claim(&key) else {
                log::debug!("Skipping poll of {}: a manifest is already scheduled", key);
                continue;
            };

            report.peers_polled += 1;
            match self.discovery.poll(peer).await {
                Ok(pointer) => {
                    if let Some(work) = self.accept_pointer(peer, pointer).await? {
                        scheduled.push((work, guard));
                    }
                }
                Err(DiscoveryError::NoManifest(folder)) => {
                    log::debug!("Peer {} has no manifest for {} yet", peer.nickname, folder);
                }
                Err(e) => {
                    log::warn!(
                        "Failed to poll source peer {} ({}): {}",
                        peer.nickname,
                        peer.peer_id,
                        e
                    );
                    self.emit(DaemonEvent::PeerUnreachable {
                        source_peer_id: peer.peer_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // 4. Different folders progress in parallel, bounded by the download slots
        report.manifests_accepted = scheduled.len() as u32;
        if scheduled.is_empty() {
            log::debug!("No new manifests to process");
        } else {
            log::info!("Processing {} manifests", scheduled.len());
        }

        let results = futures::future::join_all(scheduled.into_iter().map(
            |(work, guard)| async move {
                let outcome = self.process_manifest(&work).await;
                drop(guard);
                (work, outcome)
            },
        ))
        .await;

        for (work, outcome) in results {
            match outcome {
                Ok(ManifestOutcome::Completed) => report.completed += 1,
                Ok(ManifestOutcome::Failed) => report.failed += 1,
                Ok(ManifestOutcome::Interrupted) => report.interrupted += 1,
                Err(e) => {
                    // Record stays in progress and is resumed next cycle
                    log::error!("Failed to process manifest {}: {}", work.manifest_cid, e);
                    report.interrupted += 1;
                }
            }
        }

        // 5. Peers may have been removed while their manifests were running
        {
            let configured = self.source_peers.read().await;
            let mut state = self.state.write().await;
            let active = lock_active(&self.active).clone();
            let orphaned = fail_orphaned(&mut state, &configured, &active);
            if orphaned > 0 {
                log::warn!(
                    "{} manifests of removed source peers marked failed",
                    orphaned
                );
            }
            state.last_poll_time = Utc::now();
            self.store.save(&state)?;
        }

        self.emit(DaemonEvent::CycleCompleted {
            peers_polled: report.peers_polled,
            manifests_processed: report.completed,
        });

        Ok(report)
    }

    fn claim(&self, key: &PeerKey) -> Option<ActiveGuard<'_>> {
        if lock_active(&self.active).insert(key.clone()) {
            Some(ActiveGuard {
                active: &self.active,
                key: key.clone(),
            })
        } else {
            None
        }
    }

    async fn collect_resumable(&self, peers: &[SourcePeerConfig]) -> Result<Vec<ManifestWork>> {
        let mut state = self.state.write().await;
        let mut work = Vec::new();
        let mut superseded = Vec::new();

        let mut entries: Vec<&InProgressManifest> = state.in_progress_manifests.values().collect();
        entries.sort_by_key(|m| m.sequence_number);

        for entry in entries {
            let Some(peer) = find_enabled_peer(peers, &entry.source_peer_id, &entry.folder_id)
            else {
                log::warn!(
                    "Manifest {} for {}/{} waits: its source peer is disabled or being removed",
                    entry.manifest_cid,
                    entry.source_peer_id,
                    entry.folder_id
                );
                continue;
            };
            if state
                .last_processed_sequence(&entry.source_peer_id, &entry.folder_id)
                .is_some_and(|last| last >= entry.sequence_number)
            {
                superseded.push(entry.manifest_cid.clone());
                continue;
            }
            work.push(ManifestWork {
                manifest_cid: entry.manifest_cid.clone(),
                key: PeerKey::new(&entry.source_peer_id, &entry.folder_id),
                sequence_number: entry.sequence_number,
                kind: WorkKind::Resume,
                local_root: peer.local_root(&self.settings.backup_root),
            });
        }

        if !superseded.is_empty() {
            for cid in superseded {
                if let Some(entry) = state.in_progress_manifests.remove(&cid) {
                    log::warn!("Dropping in-progress manifest {}: superseded", cid);
                    let failed = failure_from(entry, SUPERSEDED_MESSAGE);
                    record_failure(&mut state, failed);
                }
            }
            self.store.save(&state)?;
        }

        Ok(work)
    }

    async fn collect_pending(
        &self,
        peers: &[SourcePeerConfig],
    ) -> Result<Vec<(PendingManifest, PathBuf)>> {
        let mut state = self.state.write().await;
        let mut ready = Vec::new();
        let mut superseded = Vec::new();

        for pending in &state.pending_manifests {
            if state
                .last_processed_sequence(&pending.source_peer_id, &pending.folder_id)
                .is_some_and(|last| last >= pending.sequence_number)
            {
                superseded.push(pending.manifest_cid.clone());
                continue;
            }
            if state
                .in_progress_for(&pending.source_peer_id, &pending.folder_id)
                .is_some()
            {
                continue;
            }
            if let Some(peer) =
                find_enabled_peer(peers, &pending.source_peer_id, &pending.folder_id)
            {
                ready.push((
                    pending.clone(),
                    peer.local_root(&self.settings.backup_root),
                ));
            }
        }

        if !superseded.is_empty() {
            log::info!(
                "Dropping {} queued retries superseded by newer manifests",
                superseded.len()
            );
            state
                .pending_manifests
                .retain(|p| !superseded.contains(&p.manifest_cid));
            self.store.save(&state)?;
        }

        Ok(ready)
    }

    async fn start_pending(
        &self,
        pending: PendingManifest,
        local_root: PathBuf,
    ) -> Result<Option<ManifestWork>> {
        let mut state = self.state.write().await;
        if state
            .in_progress_for(&pending.source_peer_id, &pending.folder_id)
            .is_some()
        {
            return Ok(None);
        }
        let Some(index) = state
            .pending_manifests
            .iter()
            .position(|p| p.manifest_cid == pending.manifest_cid)
        else {
            return Ok(None);
        };
        let pending = state.pending_manifests.remove(index);

        state.in_progress_manifests.insert(
            pending.manifest_cid.clone(),
            new_in_progress(
                &pending.manifest_cid,
                &pending.source_peer_id,
                &pending.folder_id,
                pending.sequence_number,
                pending.retry_count,
            ),
        );
        self.store.save(&state)?;
        drop(state);

        log::info!(
            "Retrying manifest {} (seq {}, {} earlier attempts)",
            pending.manifest_cid,
            pending.sequence_number,
            pending.retry_count
        );
        self.emit(DaemonEvent::ManifestAccepted {
            manifest_cid: pending.manifest_cid.clone(),
            source_peer_id: pending.source_peer_id.clone(),
            folder_id: pending.folder_id.clone(),
            sequence_number: pending.sequence_number,
        });

        Ok(Some(ManifestWork {
            manifest_cid: pending.manifest_cid,
            key: PeerKey::new(pending.source_peer_id, pending.folder_id),
            sequence_number: pending.sequence_number,
            kind: WorkKind::Retry,
            local_root,
        }))
    }

    /// Decide whether a discovered pointer starts new work. Only sequence
    /// numbers above the last processed one for the folder are accepted.
    async fn accept_pointer(
        &self,
        peer: &SourcePeerConfig,
        pointer: ManifestPointer,
    ) -> Result<Option<ManifestWork>> {
        if pointer.folder_id != peer.folder_id {
            log::warn!(
                "Peer {} answered for folder {} instead of {}, ignoring",
                peer.nickname,
                pointer.folder_id,
                peer.folder_id
            );
            return Ok(None);
        }

        let mut state = self.state.write().await;
        let last = state.last_processed_sequence(&peer.peer_id, &peer.folder_id);

        if let Some(last) = last {
            if pointer.sequence_number <= last {
                log::debug!(
                    "{}/{} is up to date (seq {})",
                    peer.peer_id,
                    peer.folder_id,
                    last
                );
                return Ok(None);
            }
        }
        if state.in_progress_for(&peer.peer_id, &peer.folder_id).is_some()
            || state.pending_for(&peer.peer_id, &peer.folder_id).is_some()
        {
            return Ok(None);
        }
        if state.processed_manifests.contains_key(&pointer.manifest_cid)
            || state
                .in_progress_manifests
                .contains_key(&pointer.manifest_cid)
        {
            return Ok(None);
        }
        if state.is_failed(&pointer.manifest_cid) {
            log::debug!(
                "Manifest {} failed earlier and waits for an explicit retry",
                pointer.manifest_cid
            );
            return Ok(None);
        }

        if let Some(last) = last {
            let expected = last + 1;
            if pointer.sequence_number > expected {
                log::warn!(
                    "Sequence gap for {}/{}: expected {}, got {} (skipped {} manifests)",
                    peer.peer_id,
                    peer.folder_id,
                    expected,
                    pointer.sequence_number,
                    pointer.sequence_number - expected
                );
            }
        }

        state.in_progress_manifests.insert(
            pointer.manifest_cid.clone(),
            new_in_progress(
                &pointer.manifest_cid,
                &peer.peer_id,
                &peer.folder_id,
                pointer.sequence_number,
                0,
            ),
        );
        self.store.save(&state)?;
        drop(state);

        log::info!(
            "Found new manifest from {} ({}): {} (seq {})",
            peer.nickname,
            peer.folder_id,
            pointer.manifest_cid,
            pointer.sequence_number
        );
        self.emit(DaemonEvent::ManifestAccepted {
            manifest_cid: pointer.manifest_cid.clone(),
            source_peer_id: peer.peer_id.clone(),
            folder_id: peer.folder_id.clone(),
            sequence_number: pointer.sequence_number,
        });

        Ok(Some(ManifestWork {
            manifest_cid: pointer.manifest_cid,
            key: PeerKey::from(peer),
            sequence_number: pointer.sequence_number,
            kind: WorkKind::New,
            local_root: peer.local_root(&self.settings.backup_root),
        }))
    }

    async fn process_manifest(&self, work: &ManifestWork) -> Result<ManifestOutcome> {
        log::info!(
            "Processing manifest {} for {} (seq {}, {:?})",
            work.manifest_cid,
            work.key,
            work.sequence_number,
            work.kind
        );
        let ctx = self.worker_context();

        let manifest = match self.fetch_manifest(work, &ctx).await? {
            ManifestFetch::Fetched(manifest) => manifest,
            ManifestFetch::Failed(message) => return self.fail_manifest(work, message).await,
            ManifestFetch::Interrupted => return self.mark_interrupted(work).await,
        };

        if let Err(message) = check_manifest_matches(work, &manifest) {
            return self.fail_manifest(work, message).await;
        }

        let total_files = manifest.live_entries().count() as u32;
        self.update_in_progress(&work.manifest_cid, |progress| {
            progress.total_files = total_files;
            progress.files_downloaded = 0;
            progress.files_failed = 0;
            progress.current_status = ManifestStatus::Downloading;
        })
        .await?;

        self.check_free_space(work, &manifest).await;

        let downloads = self.download_files(work, &manifest, &ctx).await?;
        if downloads.cancelled > 0 {
            return self.mark_interrupted(work).await;
        }

        let tombstone_count = manifest.tombstones().count() as u32;
        let deleted = if tombstone_count == 0 {
            0
        } else if self.settings.auto_delete_tombstones {
            self.update_in_progress(&work.manifest_cid, |progress| {
                progress.current_status = ManifestStatus::ApplyingTombstones;
            })
            .await?;
            let result = apply_tombstones(&work.local_root, &manifest).await;
            self.emit(DaemonEvent::TombstonesApplied {
                manifest_cid: work.manifest_cid.clone(),
                deleted: result.deleted,
                not_found: result.not_found,
                failed: result.failed,
            });
            result.deleted
        } else {
            log::info!(
                "Auto-delete disabled, leaving {} tombstoned files of manifest {} in place",
                tombstone_count,
                work.manifest_cid
            );
            self.emit(DaemonEvent::TombstonesDeferred {
                manifest_cid: work.manifest_cid.clone(),
                count: tombstone_count,
            });
            0
        };

        self.complete_manifest(work, &manifest, &downloads, deleted)
            .await
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            fetcher: self.fetcher.clone(),
            slots: self.download_slots.clone(),
            enabled: self.enabled.clone(),
            shutdown: self.shutdown.clone(),
            max_retries: self.settings.max_retries,
            retry_backoff: self.settings.retry_backoff,
        }
    }

    async fn fetch_manifest(&self, work: &ManifestWork, ctx: &WorkerContext) -> Result<ManifestFetch> {
        let mut attempt = 0;
        loop {
            if ctx.should_stop() {
                return Ok(ManifestFetch::Interrupted);
            }

            let result = {
                let Some(_permit) = ctx.acquire_slot().await else {
                    return Ok(ManifestFetch::Interrupted);
                };
                attempt += 1;
                self.update_in_progress(&work.manifest_cid, |progress| {
                    progress.attempts += 1;
                    progress.current_status = ManifestStatus::FetchingManifest;
                })
                .await?;
                ctx.fetcher.fetch_manifest(&work.manifest_cid).await
            };

            match result {
                Ok(manifest) => {
                    log::debug!(
                        "Fetched manifest {} ({} entries)",
                        work.manifest_cid,
                        manifest.entries.len()
                    );
                    return Ok(ManifestFetch::Fetched(manifest));
                }
                Err(e) if !e.is_retryable() => {
                    return Ok(ManifestFetch::Failed(e.to_string()));
                }
                Err(e) => {
                    log::warn!(
                        "Failed to fetch manifest {} (attempt {}/{}): {}",
                        work.manifest_cid,
                        attempt,
                        ctx.max_retries,
                        e
                    );
                    if attempt >= ctx.max_retries {
                        return Ok(ManifestFetch::Failed(format!(
                            "{} (gave up after {} attempts)",
                            e, attempt
                        )));
                    }
                    if !ctx.backoff(attempt).await {
                        return Ok(ManifestFetch::Interrupted);
                    }
                }
            }
        }
    }

    async fn update_in_progress(
        &self,
        manifest_cid: &str,
        update: impl FnOnce(&mut InProgressManifest),
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(progress) = state.in_progress_manifests.get_mut(manifest_cid) {
            update(progress);
            self.store.save(&state)?;
        }
        Ok(())
    }

    async fn check_free_space(&self, work: &ManifestWork, manifest: &Manifest) {
        let needed = manifest.live_size_bytes();
        if needed == 0 {
            return;
        }
        match self.fetcher.space().await {
            Ok(space) if space.available_bytes() < needed => {
                log::warn!(
                    "Manifest {} needs {} bytes but the node reports only {} available",
                    work.manifest_cid,
                    needed,
                    space.available_bytes()
                );
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("Could not query node space for {}: {}", work.manifest_cid, e);
            }
        }
    }

    /// Fan out one worker per live file; results come back over a channel and
    /// are recorded here, one at a time.
    async fn download_files(
        &self,
        work: &ManifestWork,
        manifest: &Manifest,
        ctx: &WorkerContext,
    ) -> Result<DownloadSummary> {
        let entries: Vec<FileEntry> = manifest.live_entries().cloned().collect();
        let total_files = entries.len() as u32;
        let mut summary = DownloadSummary::default();
        if entries.is_empty() {
            return Ok(summary);
        }

        log::info!(
            "Downloading {} files from manifest {}",
            total_files,
            work.manifest_cid
        );

        // Only files written for this very manifest may be skipped; a same-sized
        // file from an older version must still be replaced
        let materialized = self
            .state
            .read()
            .await
            .in_progress_manifests
            .get(&work.manifest_cid)
            .map(|progress| progress.materialized.clone())
            .unwrap_or_default();

        let (tx, mut rx) = mpsc::channel(entries.len());
        for entry in entries {
            let tx = tx.clone();
            let ctx = ctx.clone();
            let target = work.local_root.join(&entry.relative_path);
            let written_before = materialized.get(&entry.relative_path) == Some(&entry.cid);
            tokio::spawn(async move {
                let result = download_entry(&ctx, &entry, &target, written_before).await;
                let _ = tx
                    .send(FileReport {
                        relative_path: entry.relative_path,
                        cid: entry.cid,
                        result,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut reported = 0u32;
        while let Some(report) = rx.recv().await {
            reported += 1;
            self.record_file_result(work, report, &mut summary, total_files)
                .await?;
        }

        let missing = total_files.saturating_sub(reported);
        if missing > 0 {
            log::error!(
                "{} download workers for manifest {} exited without reporting",
                missing,
                work.manifest_cid
            );
            summary.failed += missing;
        }

        log::info!(
            "Download complete: {} downloaded, {} already present, {} failed, {} cancelled ({} bytes)",
            summary.downloaded,
            summary.already_present,
            summary.failed,
            summary.cancelled,
            summary.bytes
        );

        Ok(summary)
    }

    async fn record_file_result(
        &self,
        work: &ManifestWork,
        report: FileReport,
        summary: &mut DownloadSummary,
        total_files: u32,
    ) -> Result<()> {
        let mut downloaded_bytes = None;
        let mut failure = None;
        match report.result {
            FileResult::Downloaded { bytes } => {
                summary.downloaded += 1;
                summary.bytes += bytes;
                downloaded_bytes = Some(bytes);
            }
            FileResult::AlreadyPresent => summary.already_present += 1,
            FileResult::Failed(error) => {
                summary.failed += 1;
                failure = Some(error);
            }
            FileResult::Cancelled => {
                summary.cancelled += 1;
                return Ok(());
            }
        }

        {
            let mut state = self.state.write().await;
            if let Some(progress) = state.in_progress_manifests.get_mut(&work.manifest_cid) {
                progress.files_downloaded = summary.completed();
                progress.files_failed = summary.failed;
                if downloaded_bytes.is_some() {
                    progress
                        .materialized
                        .insert(report.relative_path.clone(), report.cid.clone());
                }
            }
            if let Some(bytes) = downloaded_bytes {
                state.stats.total_files_downloaded += 1;
                state.stats.total_bytes_downloaded += bytes;
                state.stats.last_activity_at = Some(Utc::now());
            }
            self.store.save(&state)?;
        }

        match failure {
            Some(error) => {
                log::error!(
                    "Failed to download {} for manifest {}: {}",
                    report.relative_path,
                    work.manifest_cid,
                    error
                );
                self.emit(DaemonEvent::FileFailed {
                    manifest_cid: work.manifest_cid.clone(),
                    relative_path: report.relative_path,
                    error,
                });
            }
            None => {
                self.emit(DaemonEvent::FileProgress {
                    manifest_cid: work.manifest_cid.clone(),
                    relative_path: report.relative_path,
                    files_downloaded: summary.completed(),
                    files_failed: summary.failed,
                    total_files,
                });
            }
        }

        Ok(())
    }

    async fn mark_interrupted(&self, work: &ManifestWork) -> Result<ManifestOutcome> {
        self.update_in_progress(&work.manifest_cid, |progress| {
            progress.current_status = ManifestStatus::Interrupted;
        })
        .await?;

        log::info!(
            "Manifest {} interrupted, will resume on the next cycle",
            work.manifest_cid
        );
        self.emit(DaemonEvent::ManifestInterrupted {
            manifest_cid: work.manifest_cid.clone(),
        });
        Ok(ManifestOutcome::Interrupted)
    }

    async fn fail_manifest(&self, work: &ManifestWork, message: String) -> Result<ManifestOutcome> {
        let mut state = self.state.write().await;
        let retry_count = state
            .in_progress_manifests
            .remove(&work.manifest_cid)
            .map(|progress| progress.attempts)
            .unwrap_or(0);
        record_failure(
            &mut state,
            FailedManifest {
                manifest_cid: work.manifest_cid.clone(),
                source_peer_id: work.key.peer_id.clone(),
                folder_id: work.key.folder_id.clone(),
                sequence_number: work.sequence_number,
                failed_at: Utc::now(),
                error_message: message.clone(),
                retry_count,
            },
        );
        self.store.save(&state)?;
        drop(state);

        log::error!(
            "Manifest processing failed: {} - {}",
            work.manifest_cid,
            message
        );
        self.emit(DaemonEvent::ManifestFailed {
            manifest_cid: work.manifest_cid.clone(),
            error_message: message,
            retry_count,
        });
        Ok(ManifestOutcome::Failed)
    }

    async fn complete_manifest(
        &self,
        work: &ManifestWork,
        manifest: &Manifest,
        downloads: &DownloadSummary,
        deleted_count: u32,
    ) -> Result<ManifestOutcome> {
        let mut state = self.state.write().await;

        if state
            .last_processed_sequence(&work.key.peer_id, &work.key.folder_id)
            .is_some_and(|last| last >= work.sequence_number)
        {
            drop(state);
            return self
                .fail_manifest(work, SUPERSEDED_MESSAGE.to_string())
                .await;
        }

        let now = Utc::now();
        state.in_progress_manifests.remove(&work.manifest_cid);
        state
            .failed_manifests
            .retain(|m| m.manifest_cid != work.manifest_cid);
        state.processed_manifests.insert(
            work.manifest_cid.clone(),
            ProcessedManifest {
                manifest_cid: work.manifest_cid.clone(),
                source_peer_id: work.key.peer_id.clone(),
                sequence_number: work.sequence_number,
                folder_id: work.key.folder_id.clone(),
                processed_at: now,
                file_count: downloads.completed(),
                total_size_bytes: manifest.live_size_bytes(),
                deleted_count,
                files_failed: downloads.failed,
            },
        );
        state.stats.total_manifests_processed += 1;
        state.stats.total_files_deleted += deleted_count as u64;
        state.stats.last_activity_at = Some(now);
        self.store.save(&state)?;
        drop(state);

        log::info!(
            "Manifest {} processed: {} files, {} failed, {} deleted",
            work.manifest_cid,
            downloads.completed(),
            downloads.failed,
            deleted_count
        );
        self.emit(DaemonEvent::ManifestCompleted {
            manifest_cid: work.manifest_cid.clone(),
            sequence_number: work.sequence_number,
            file_count: downloads.completed(),
            files_failed: downloads.failed,
            deleted_count,
        });

        Ok(ManifestOutcome::Completed)
    }

    fn emit(&self, event: DaemonEvent) {
        self.events.notify(&event);
    }

    fn emit_status(&self) {
        self.emit(DaemonEvent::StatusChanged {
            status: self.status(),
        });
    }
}

fn find_enabled_peer<'a>(
    peers: &'a [SourcePeerConfig],
    peer_id: &str,
    folder_id: &str,
) -> Option<&'a SourcePeerConfig> {
    peers
        .iter()
        .find(|p| p.enabled && p.peer_id == peer_id && p.folder_id == folder_id)
}

fn new_in_progress(
    manifest_cid: &str,
    peer_id: &str,
    folder_id: &str,
    sequence_number: u64,
    attempts: u32,
) -> InProgressManifest {
    InProgressManifest {
        manifest_cid: manifest_cid.to_string(),
        source_peer_id: peer_id.to_string(),
        folder_id: folder_id.to_string(),
        sequence_number,
        started_at: Utc::now(),
        total_files: 0,
        files_downloaded: 0,
        files_failed: 0,
        current_status: ManifestStatus::FetchingManifest,
        attempts,
        materialized: HashMap::new(),
    }
}

fn failure_from(entry: InProgressManifest, message: &str) -> FailedManifest {
    FailedManifest {
        manifest_cid: entry.manifest_cid,
        source_peer_id: entry.source_peer_id,
        folder_id: entry.folder_id,
        sequence_number: entry.sequence_number,
        failed_at: Utc::now(),
        error_message: message.to_string(),
        retry_count: entry.attempts,
    }
}

/// At most one failed entry per CID
fn record_failure(state: &mut DaemonState, failed: FailedManifest) {
    state
        .failed_manifests
        .retain(|m| m.manifest_cid != failed.manifest_cid);
    state.failed_manifests.push(failed);
}

/// Move in-progress and queued work of unconfigured folders to the failed list
fn fail_orphaned(
    state: &mut DaemonState,
    peers: &[SourcePeerConfig],
    active: &HashSet<PeerKey>,
) -> usize {
    let configured: HashSet<PeerKey> = peers.iter().map(PeerKey::from).collect();
    let keep = |peer_id: &str, folder_id: &str| {
        let key = PeerKey::new(peer_id, folder_id);
        configured.contains(&key) || active.contains(&key)
    };

    let orphaned: Vec<String> = state
        .in_progress_manifests
        .values()
        .filter(|m| !keep(&m.source_peer_id, &m.folder_id))
        .map(|m| m.manifest_cid.clone())
        .collect();
    let mut count = 0;
    for cid in orphaned {
        if let Some(entry) = state.in_progress_manifests.remove(&cid) {
            record_failure(state, failure_from(entry, ORPHANED_MESSAGE));
            count += 1;
        }
    }

    let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending_manifests)
        .into_iter()
        .partition(|m| keep(&m.source_peer_id, &m.folder_id));
    state.pending_manifests = kept;
    for pending in removed {
        record_failure(
            state,
            FailedManifest {
                manifest_cid: pending.manifest_cid,
                source_peer_id: pending.source_peer_id,
                folder_id: pending.folder_id,
                sequence_number: pending.sequence_number,
                failed_at: Utc::now(),
                error_message: ORPHANED_MESSAGE.to_string(),
                retry_count: pending.retry_count,
            },
        );
        count += 1;
    }

    count
}

fn check_manifest_matches(work: &ManifestWork, manifest: &Manifest) -> std::result::Result<(), String> {
    if manifest.folder_id != work.key.folder_id {
        return Err(format!(
            "Manifest is for folder {} but {} was expected",
            manifest.folder_id, work.key.folder_id
        ));
    }
    if manifest.sequence_number != work.sequence_number {
        return Err(format!(
            "Manifest has sequence {} but the peer announced {}",
            manifest.sequence_number, work.sequence_number
        ));
    }
    if manifest.source_peer_id != work.key.peer_id {
        log::warn!(
            "Manifest {} names source peer {} but was published by {}",
            work.manifest_cid,
            manifest.source_peer_id,
            work.key.peer_id
        );
    }
    Ok(())
}

async fn download_entry(
    ctx: &WorkerContext,
    entry: &FileEntry,
    target: &Path,
    written_before: bool,
) -> FileResult {
    if written_before && has_expected_size(target, entry.size_bytes).await {
        log::debug!(
            "File already present: {} ({})",
            entry.relative_path,
            entry.cid
        );
        return FileResult::AlreadyPresent;
    }

    let mut attempt = 0;
    loop {
        let Some(permit) = ctx.acquire_slot().await else {
            return FileResult::Cancelled;
        };
        if ctx.should_stop() {
            return FileResult::Cancelled;
        }
        attempt += 1;

        let error = match ctx.fetcher.fetch(&entry.cid).await {
            Ok(bytes) if bytes.len() as u64 != entry.size_bytes => format!(
                "Size mismatch: expected {} bytes, got {}",
                entry.size_bytes,
                bytes.len()
            ),
            Ok(bytes) => {
                return match write_atomically(target, &bytes).await {
                    Ok(()) => {
                        log::info!("Downloaded: {} ({})", entry.relative_path, entry.cid);
                        FileResult::Downloaded {
                            bytes: bytes.len() as u64,
                        }
                    }
                    Err(e) => {
                        FileResult::Failed(format!("Failed to write {}: {}", target.display(), e))
                    }
                };
            }
            Err(e) if !e.is_retryable() => return FileResult::Failed(e.to_string()),
            Err(e) => e.to_string(),
        };
        drop(permit);

        if attempt >= ctx.max_retries {
            return FileResult::Failed(format!("{} (gave up after {} attempts)", error, attempt));
        }
        log::warn!(
            "Failed to download {} ({}), attempt {}/{}: {}",
            entry.relative_path,
            entry.cid,
            attempt,
            ctx.max_retries,
            error
        );
        if !ctx.backoff(attempt).await {
            return FileResult::Cancelled;
        }
    }
}

async fn has_expected_size(path: &Path, size: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() == size,
        Err(_) => false,
    }
}

/// Hidden sibling the bytes are written to before the final rename
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.partial", name))
}

/// Readers of the backup folder never see a half-written file
async fn write_atomically(target: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(target);
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    Ok(())
}

async fn apply_tombstones(local_root: &Path, manifest: &Manifest) -> TombstoneSummary {
    let mut result = TombstoneSummary::default();

    for tombstone in manifest.tombstones() {
        let target = local_root.join(&tombstone.relative_path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                log::info!("Deleted: {} ({})", tombstone.relative_path, tombstone.cid);
                result.deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("File not found (already deleted?): {}", tombstone.relative_path);
                result.not_found += 1;
            }
            Err(e) => {
                log::error!("Failed to delete {}: {}", target.display(), e);
                result.failed += 1;
            }
        }
        let _ = tokio::fs::remove_file(partial_path(&target)).await;
    }

    log::info!(
        "Tombstones applied: {} deleted, {} not found, {} failed",
        result.deleted,
        result.not_found,
        result.failed
    );
    result
}
