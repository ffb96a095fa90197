//! Durable homes for session snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use termcore_protocol::{SessionSnapshot, SnapshotId, TerminalError, TerminalResult};
use tokio::fs;
use tracing::warn;

/// Keyed snapshot storage. `put` upserts by id and may fail with
/// [`TerminalError::Quota`] when the store is over capacity.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, snapshot: &SessionSnapshot) -> TerminalResult<()>;
    async fn get(&self, id: &SnapshotId) -> TerminalResult<Option<SessionSnapshot>>;
    /// False when nothing was stored under `id`.
    async fn delete(&self, id: &SnapshotId) -> TerminalResult<bool>;
    async fn list(&self) -> TerminalResult<Vec<SessionSnapshot>>;
}

fn storage_error(error: anyhow::Error) -> TerminalError {
    TerminalError::Storage(format!("{error:#}"))
}

fn over_quota(used: u64, incoming: u64, quota: u64) -> TerminalResult<()> {
    if used + incoming > quota {
        return Err(TerminalError::Quota(format!(
            "snapshot of {incoming} bytes exceeds quota ({used}/{quota} bytes used)"
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<SnapshotId, (SessionSnapshot, u64)>>,
    quota_bytes: Option<u64>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the summed serialized size of all snapshots.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot: &SessionSnapshot) -> TerminalResult<()> {
        let size = serde_json::to_vec(snapshot)?.len() as u64;
        let mut snapshots = self.snapshots.lock();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = snapshots
                .iter()
                .filter(|(id, _)| **id != snapshot.id)
                .map(|(_, (_, size))| *size)
                .sum();
            over_quota(used, size, quota)?;
        }
        snapshots.insert(snapshot.id.clone(), (snapshot.clone(), size));
        Ok(())
    }

    async fn get(&self, id: &SnapshotId) -> TerminalResult<Option<SessionSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .get(id)
            .map(|(snapshot, _)| snapshot.clone()))
    }

    async fn delete(&self, id: &SnapshotId) -> TerminalResult<bool> {
        Ok(self.snapshots.lock().remove(id).is_some())
    }

    async fn list(&self) -> TerminalResult<Vec<SessionSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .values()
            .map(|(snapshot, _)| snapshot.clone())
            .collect())
    }
}

/// One pretty-printed JSON file per snapshot under `root`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids become file names: bytes outside `[A-Za-z0-9_-]` are written as
    /// `%XX`, so distinct ids never share a file.
    fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        let mut file_name = String::with_capacity(id.as_str().len());
        for byte in id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                file_name.push(char::from(byte));
            } else {
                file_name.push('%');
                file_name.push_str(&hex::encode_upper([byte]));
            }
        }
        self.root.join(format!("{file_name}.json"))
    }

    async fn snapshot_files(&self) -> Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed listing snapshot root {:?}", self.root))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn used_bytes(&self, excluding: &Path) -> Result<u64> {
        let mut used = 0;
        for path in self.snapshot_files().await? {
            if path == excluding {
                continue;
            }
            used += fs::metadata(&path)
                .await
                .with_context(|| format!("failed reading metadata for {path:?}"))?
                .len();
        }
        Ok(used)
    }

    async fn read_snapshot(path: &Path) -> Result<SessionSnapshot> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading snapshot file {path:?}"))?;
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing snapshot file {path:?}"))?;
        Ok(snapshot)
    }

    async fn write_pretty_json(path: &Path, payload: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, payload)
            .await
            .with_context(|| format!("failed writing snapshot file {path:?}"))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn put(&self, snapshot: &SessionSnapshot) -> TerminalResult<()> {
        let path = self.snapshot_path(&snapshot.id);
        let payload = serde_json::to_string_pretty(snapshot)?;
        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes(&path).await.map_err(storage_error)?;
            over_quota(used, payload.len() as u64, quota)?;
        }
        Self::write_pretty_json(&path, &payload)
            .await
            .map_err(storage_error)
    }

    async fn get(&self, id: &SnapshotId) -> TerminalResult<Option<SessionSnapshot>> {
        let path = self.snapshot_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_snapshot(&path)
            .await
            .map(Some)
            .map_err(storage_error)
    }

    async fn delete(&self, id: &SnapshotId) -> TerminalResult<bool> {
        let path = self.snapshot_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::remove_file(&path)
            .await
            .with_context(|| format!("failed removing snapshot file {path:?}"))
            .map_err(storage_error)?;
        Ok(true)
    }

    /// Unreadable files are skipped with a warning.
    async fn list(&self) -> TerminalResult<Vec<SessionSnapshot>> {
        let files = self.snapshot_files().await.map_err(storage_error)?;
        let mut snapshots = Vec::with_capacity(files.len());
        for path in files {
            match Self::read_snapshot(&path).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(error) => {
                    warn!(path = ?path, error = %format!("{error:#}"), "skipping unreadable snapshot")
                }
            }
        }
        Ok(snapshots)
    }
}
