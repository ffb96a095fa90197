//! Session persistence: bounded snapshot retention, export/import, and the
//! auto-save and cloud-sync timers.
//!
//! The service keeps an in-memory index of what the [`SnapshotStore`] holds,
//! ordered newest first. Every save upserts by id and then trims the index
//! to `max_sessions`, deleting the overflow from the store without telling
//! the caller.

mod export;
mod store;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use termcore_events::{Notification, ObserverHub, ObserverId};
use termcore_protocol::{
    CloudStore, ExportFormat, SNAPSHOT_VERSION, SessionSnapshot, SessionState, SnapshotId,
    SnapshotMetadata, TerminalError, TerminalResult,
};
use termcore_session::SessionStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

pub use export::{parse_text, render_text};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

/// Id every auto-save overwrites.
pub const AUTOSAVE_ID: &str = "autosave";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_sessions: usize,
    pub autosave_interval_secs: u64,
    pub cloud_sync_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            autosave_interval_secs: 30,
            cloud_sync_interval_secs: 60,
        }
    }
}

/// Index row for one retained snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    pub tab_count: usize,
    pub command_count: usize,
}

impl From<&SessionSnapshot> for SnapshotSummary {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            timestamp: snapshot.timestamp,
            name: snapshot.metadata.name.clone(),
            tab_count: snapshot.metadata.tab_count,
            command_count: snapshot.metadata.command_count,
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    summary: SnapshotSummary,
    /// Breaks timestamp ties in favour of the later write.
    seq: u64,
}

fn sort_newest_first(index: &mut [IndexEntry]) {
    index.sort_by(|a, b| {
        b.summary
            .timestamp
            .cmp(&a.summary.timestamp)
            .then(b.seq.cmp(&a.seq))
    });
}

pub fn state_hash(state: &SessionState) -> TerminalResult<String> {
    Ok(hex::encode(Sha256::digest(serde_json::to_vec(state)?)))
}

pub struct PersistenceService {
    config: PersistenceConfig,
    app_version: String,
    store: Arc<dyn SnapshotStore>,
    cloud: Option<Arc<dyn CloudStore>>,
    index: RwLock<Vec<IndexEntry>>,
    sequence: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
    last_autosave_hash: Mutex<Option<String>>,
    autosave_task: Mutex<Option<JoinHandle<()>>>,
    cloud_task: Mutex<Option<JoinHandle<()>>>,
    observers: ObserverHub<SnapshotId>,
}

impl PersistenceService {
    pub fn new(config: PersistenceConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            config,
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            store,
            cloud: None,
            index: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(1),
            write_lock: tokio::sync::Mutex::new(()),
            last_autosave_hash: Mutex::new(None),
            autosave_task: Mutex::new(None),
            cloud_task: Mutex::new(None),
            observers: ObserverHub::new("persistence"),
        }
    }

    pub fn with_cloud_store(mut self, cloud: Arc<dyn CloudStore>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn max_sessions(&self) -> usize {
        self.config.max_sessions.max(1)
    }

    /// Rebuilds the index from whatever the store already holds, trimming it
    /// to `max_sessions`. Returns the number of retained snapshots.
    #[instrument(skip(self))]
    pub async fn init(&self) -> TerminalResult<usize> {
        let _guard = self.write_lock.lock().await;
        let snapshots = self.store.list().await?;
        let overflow = {
            let mut index = self.index.write();
            index.clear();
            index.extend(snapshots.iter().map(|snapshot| IndexEntry {
                summary: SnapshotSummary::from(snapshot),
                seq: 0,
            }));
            sort_newest_first(&mut index);
            let keep = self.max_sessions().min(index.len());
            index.split_off(keep)
        };
        for entry in overflow {
            self.evict(&entry.summary.id).await;
        }
        let retained = self.index.read().len();
        info!(retained, "persistence index hydrated");
        Ok(retained)
    }

    /// Saves under a fresh id.
    pub async fn save(
        &self,
        state: &SessionState,
        name: Option<&str>,
    ) -> TerminalResult<SnapshotId> {
        self.save_as(SnapshotId::generate(), state, name).await
    }

    /// Saves under `id`, overwriting any snapshot already stored there.
    #[instrument(skip(self, state), fields(snapshot_id = %id))]
    pub async fn save_as(
        &self,
        id: SnapshotId,
        state: &SessionState,
        name: Option<&str>,
    ) -> TerminalResult<SnapshotId> {
        let hash = state_hash(state)?;
        let snapshot = self.build_snapshot(id, state.clone(), name.map(str::to_owned), hash);
        self.write(snapshot, "snapshot_saved").await
    }

    fn build_snapshot(
        &self,
        id: SnapshotId,
        state: SessionState,
        name: Option<String>,
        state_hash: String,
    ) -> SessionSnapshot {
        let metadata = SnapshotMetadata {
            name,
            tab_count: state.tabs.len(),
            command_count: state.command_count(),
            state_hash,
            app_version: self.app_version.clone(),
            extra: Default::default(),
        };
        SessionSnapshot {
            id,
            timestamp: Utc::now(),
            version: SNAPSHOT_VERSION.to_owned(),
            state,
            metadata,
        }
    }

    async fn write(&self, snapshot: SessionSnapshot, event: &str) -> TerminalResult<SnapshotId> {
        let _guard = self.write_lock.lock().await;
        self.put_with_eviction(&snapshot).await?;

        let overflow = {
            let mut index = self.index.write();
            index.retain(|entry| entry.summary.id != snapshot.id);
            index.push(IndexEntry {
                summary: SnapshotSummary::from(&snapshot),
                seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            });
            sort_newest_first(&mut index);
            let keep = self.max_sessions().min(index.len());
            index.split_off(keep)
        };
        for entry in overflow {
            self.evict(&entry.summary.id).await;
        }

        info!(
            snapshot_id = %snapshot.id,
            tabs = snapshot.metadata.tab_count,
            commands = snapshot.metadata.command_count,
            "snapshot saved"
        );
        self.observers.notify(&snapshot.id, event);
        Ok(snapshot.id)
    }

    /// Retries a quota rejection after evicting the oldest other snapshot.
    async fn put_with_eviction(&self, snapshot: &SessionSnapshot) -> TerminalResult<()> {
        loop {
            match self.store.put(snapshot).await {
                Err(TerminalError::Quota(message)) => {
                    let victim = self
                        .index
                        .read()
                        .iter()
                        .rev()
                        .find(|entry| entry.summary.id != snapshot.id)
                        .map(|entry| entry.summary.id.clone());
                    let Some(victim) = victim else {
                        return Err(TerminalError::Quota(message));
                    };
                    warn!(
                        snapshot_id = %victim,
                        %message,
                        "snapshot store over quota, evicting oldest"
                    );
                    self.index.write().retain(|entry| entry.summary.id != victim);
                    self.evict(&victim).await;
                }
                other => return other,
            }
        }
    }

    async fn evict(&self, id: &SnapshotId) {
        match self.store.delete(id).await {
            Ok(_) => {
                info!(snapshot_id = %id, "snapshot evicted");
                self.observers.notify(id, "snapshot_evicted");
            }
            Err(error) => warn!(snapshot_id = %id, %error, "failed to evict snapshot"),
        }
    }

    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub async fn load(&self, id: &SnapshotId) -> TerminalResult<SessionSnapshot> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TerminalError::NotFound(format!("snapshot {id} not found")))
    }

    /// False when no snapshot was stored under `id`.
    pub async fn delete_snapshot(&self, id: &SnapshotId) -> TerminalResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.store.delete(id).await?;
        let indexed = {
            let mut index = self.index.write();
            let before = index.len();
            index.retain(|entry| entry.summary.id != *id);
            index.len() != before
        };
        if id.as_str() == AUTOSAVE_ID {
            *self.last_autosave_hash.lock() = None;
        }
        let deleted = removed || indexed;
        if deleted {
            info!(snapshot_id = %id, "snapshot deleted");
            self.observers.notify(id, "snapshot_deleted");
        }
        Ok(deleted)
    }

    /// Retained snapshots, newest first.
    pub fn list(&self) -> Vec<SnapshotSummary> {
        self.index
            .read()
            .iter()
            .map(|entry| entry.summary.clone())
            .collect()
    }

    pub fn latest(&self) -> Option<SnapshotSummary> {
        self.index.read().first().map(|entry| entry.summary.clone())
    }

    pub async fn export(&self, id: &SnapshotId, format: ExportFormat) -> TerminalResult<String> {
        let snapshot = self.load(id).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&snapshot)?),
            ExportFormat::Text => Ok(export::render_text(&snapshot)),
        }
    }

    /// JSON imports keep their id (overwriting a snapshot with the same id);
    /// text imports become a skeleton under a fresh id. Both are stamped with
    /// the import time so they are not the first to be evicted.
    #[instrument(skip(self, data))]
    pub async fn import(&self, data: &str, format: ExportFormat) -> TerminalResult<SnapshotId> {
        let snapshot = match format {
            ExportFormat::Json => {
                let parsed: SessionSnapshot = serde_json::from_str(data)?;
                let id = if parsed.id.as_str().is_empty() {
                    SnapshotId::generate()
                } else {
                    parsed.id
                };
                let hash = state_hash(&parsed.state)?;
                let mut snapshot =
                    self.build_snapshot(id, parsed.state, parsed.metadata.name, hash);
                snapshot.metadata.extra = parsed.metadata.extra;
                snapshot
            }
            ExportFormat::Text => {
                let state = export::parse_text(data)?;
                let hash = state_hash(&state)?;
                self.build_snapshot(
                    SnapshotId::generate(),
                    state,
                    Some("Imported session".to_owned()),
                    hash,
                )
            }
        };
        self.write(snapshot, "snapshot_imported").await
    }

    /// Writes `state` to [`AUTOSAVE_ID`] unless it hashes the same as the
    /// previous auto-save. Returns whether anything was written.
    pub async fn autosave_now(&self, state: &SessionState) -> TerminalResult<bool> {
        let hash = state_hash(state)?;
        if self.last_autosave_hash.lock().as_deref() == Some(hash.as_str()) {
            debug!("auto-save skipped, state unchanged");
            return Ok(false);
        }
        let snapshot = self.build_snapshot(
            SnapshotId::from_string(AUTOSAVE_ID),
            state.clone(),
            Some("Auto-save".to_owned()),
            hash.clone(),
        );
        self.write(snapshot, "autosaved").await?;
        *self.last_autosave_hash.lock() = Some(hash);
        Ok(true)
    }

    /// Starts the auto-save timer over `session`. False if it is already running.
    pub fn enable_autosave(self: &Arc<Self>, session: Arc<SessionStore>) -> bool {
        let mut task = self.autosave_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let interval_secs = self.config.autosave_interval_secs.max(1);
        let period = Duration::from_secs(interval_secs);
        let service = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                let state = session.snapshot();
                if let Err(error) = service.autosave_now(&state).await {
                    warn!(%error, "auto-save failed");
                }
            }
        }));
        info!(interval_secs, "auto-save enabled");
        true
    }

    /// Idempotent. Returns whether a running timer was stopped.
    pub fn disable_autosave(&self) -> bool {
        let Some(handle) = self.autosave_task.lock().take() else {
            return false;
        };
        handle.abort();
        info!("auto-save disabled");
        true
    }

    pub fn is_autosave_enabled(&self) -> bool {
        self.autosave_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Pushes the newest snapshot to the cloud store. `Ok(false)` when there
    /// is no cloud store or nothing to push.
    pub async fn sync_now(&self) -> TerminalResult<bool> {
        let Some(cloud) = self.cloud.clone() else {
            return Ok(false);
        };
        let Some(latest) = self.latest() else {
            return Ok(false);
        };
        let snapshot = self.load(&latest.id).await?;
        cloud.push(&snapshot).await?;
        debug!(snapshot_id = %snapshot.id, "snapshot pushed to cloud store");
        self.observers.notify(&snapshot.id, "cloud_synced");
        Ok(true)
    }

    /// Starts the cloud-sync timer. False without a cloud store or if it is
    /// already running.
    pub fn enable_cloud_sync(self: &Arc<Self>) -> bool {
        if self.cloud.is_none() {
            return false;
        }
        let mut task = self.cloud_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let interval_secs = self.config.cloud_sync_interval_secs.max(1);
        let period = Duration::from_secs(interval_secs);
        let service = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                if let Err(error) = service.sync_now().await {
                    warn!(%error, "cloud sync failed");
                }
            }
        }));
        info!(interval_secs, "cloud sync enabled");
        true
    }

    pub fn disable_cloud_sync(&self) -> bool {
        let Some(handle) = self.cloud_task.lock().take() else {
            return false;
        };
        handle.abort();
        info!("cloud sync disabled");
        true
    }

    /// Stops both timers.
    pub fn stop_timers(&self) {
        self.disable_autosave();
        self.disable_cloud_sync();
    }

    pub fn add_observer(
        &self,
        observer: impl Fn(&SnapshotId, &str) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observers.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification<SnapshotId>> {
        self.observers.subscribe()
    }
}

impl Drop for PersistenceService {
    fn drop(&mut self) {
        if let Some(handle) = self.autosave_task.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.cloud_task.get_mut().take() {
            handle.abort();
        }
    }
}
