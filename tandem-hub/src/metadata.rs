//! Session metadata store.
//!
//! One pretty-printed `metadata.json` per session under
//! `sessions_root/<session_id>/`. Writes go through a temp file and a
//! rename so a crash never leaves a truncated document behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::MetadataError;

/// File name of the per-session metadata document.
pub const METADATA_FILE: &str = "metadata.json";

/// Current metadata document version.
pub const METADATA_VERSION: u32 = 1;

/// Lifecycle of a session as recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no device started yet.
    Created,
    /// `start_recording` was broadcast.
    Recording,
    /// `stop_recording` was broadcast.
    Stopped,
    /// Stopped and every participant's data has arrived.
    Archived,
}

/// Outcome of one received archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Received and unpacked.
    Completed,
    /// Failed; partial data left in place.
    Failed,
}

/// One archive received for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedFile {
    /// Archive name from the transfer header.
    pub filename: String,
    /// Sending device.
    pub device_id: String,
    /// Bytes received.
    pub size: u64,
    /// Hub monotonic instant the transfer finished.
    pub received_at_ns: i64,
    /// Outcome.
    pub status: FileStatus,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Document version.
    pub version: u32,
    /// Session id.
    pub session_id: String,
    /// Participating device ids.
    pub participants: Vec<String>,
    /// Lifecycle state.
    pub state: SessionState,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When recording started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When recording stopped.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at`.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Per-device clock offsets at start.
    #[serde(default)]
    pub clock_offsets_ns: BTreeMap<String, i64>,
    /// Per-device `flash_sync` timestamps, in the device's clock.
    #[serde(default)]
    pub flash_sync: BTreeMap<String, Vec<i64>>,
    /// Archives received for this session.
    #[serde(default)]
    pub received_files: Vec<ReceivedFile>,
}

impl SessionMetadata {
    /// Fresh metadata in state `Created`.
    pub fn new(session_id: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            version: METADATA_VERSION,
            session_id: session_id.into(),
            participants,
            state: SessionState::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            clock_offsets_ns: BTreeMap::new(),
            flash_sync: BTreeMap::new(),
            received_files: Vec::new(),
        }
    }

    /// Record the start of recording.
    pub fn mark_started(&mut self, at: DateTime<Utc>, offsets: BTreeMap<String, i64>) {
        self.state = SessionState::Recording;
        self.started_at = Some(at);
        self.clock_offsets_ns = offsets;
    }

    /// Record the end of recording, then archive if everything arrived.
    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.state = SessionState::Stopped;
        self.ended_at = Some(at);
        self.duration_ms = self
            .started_at
            .map(|start| (at - start).num_milliseconds().max(0) as u64);
        self.settle();
    }

    /// Devices with at least one completed archive.
    pub fn completed_devices(&self) -> BTreeSet<&str> {
        self.received_files
            .iter()
            .filter(|f| f.status == FileStatus::Completed)
            .map(|f| f.device_id.as_str())
            .collect()
    }

    /// Every participant has a completed archive.
    pub fn all_received(&self) -> bool {
        let done = self.completed_devices();
        !self.participants.is_empty() && self.participants.iter().all(|p| done.contains(p.as_str()))
    }

    /// Move `Stopped` to `Archived` once all data is in. Returns true on
    /// the transition.
    pub fn settle(&mut self) -> bool {
        if self.state == SessionState::Stopped && self.all_received() {
            self.state = SessionState::Archived;
            return true;
        }
        false
    }
}

/// Filesystem-backed metadata for all sessions under one root.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    /// Store rooted at `root`. Nothing is created until the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Sessions root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(METADATA_FILE)
    }

    /// Persist new metadata. Fails if the session already has some.
    pub async fn create(&self, meta: SessionMetadata) -> Result<SessionMetadata, MetadataError> {
        let _guard = self.lock.lock().await;
        let path = self.metadata_path(&meta.session_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MetadataError::AlreadyExists(meta.session_id));
        }
        self.write(&meta).await?;
        tracing::info!("Created session {} at {}", meta.session_id, path.display());
        Ok(meta)
    }

    /// Read a session's metadata.
    pub async fn load(&self, session_id: &str) -> Result<SessionMetadata, MetadataError> {
        let path = self.metadata_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MetadataError::NotFound(session_id.to_string()))
            }
            Err(source) => return Err(MetadataError::Io { path, source }),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read, modify and write back a session's metadata.
    pub async fn update<F>(&self, session_id: &str, f: F) -> Result<SessionMetadata, MetadataError>
    where
        F: FnOnce(&mut SessionMetadata),
    {
        let _guard = self.lock.lock().await;
        let mut meta = self.load(session_id).await?;
        f(&mut meta);
        self.write(&meta).await?;
        Ok(meta)
    }

    /// Append a received archive, archiving the session when it completes
    /// the set. Creates metadata for sessions this hub never started.
    pub async fn record_transfer(
        &self,
        session_id: &str,
        file: ReceivedFile,
    ) -> Result<SessionMetadata, MetadataError> {
        let _guard = self.lock.lock().await;
        let mut meta = match self.load(session_id).await {
            Ok(meta) => meta,
            Err(MetadataError::NotFound(_)) => {
                tracing::warn!("Transfer for unknown session {}, creating metadata", session_id);
                SessionMetadata::new(session_id, Vec::new())
            }
            Err(e) => return Err(e),
        };
        meta.received_files.push(file);
        if meta.settle() {
            tracing::info!("Session {} archived, all participant data received", session_id);
        }
        self.write(&meta).await?;
        Ok(meta)
    }

    /// Ids of every session with metadata, sorted.
    pub async fn list(&self) -> Result<Vec<String>, MetadataError> {
        let io_err = |source| MetadataError::Io {
            path: self.root.clone(),
            source,
        };
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            if entry.path().join(METADATA_FILE).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn write(&self, meta: &SessionMetadata) -> Result<(), MetadataError> {
        let dir = self.session_dir(&meta.session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| MetadataError::Io {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(METADATA_FILE);
        let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(meta)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| MetadataError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| MetadataError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(device: &str) -> ReceivedFile {
        ReceivedFile {
            filename: format!("s1_{device}.zip"),
            device_id: device.into(),
            size: 10,
            received_at_ns: 1,
            status: FileStatus::Completed,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store
            .create(SessionMetadata::new("s1", vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        let meta = store.load("s1").await.unwrap();
        assert_eq!(meta.version, METADATA_VERSION);
        assert_eq!(meta.state, SessionState::Created);
        assert_eq!(meta.participants, vec!["a", "b"]);
        assert!(dir.path().join("s1").join(METADATA_FILE).is_file());
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create(SessionMetadata::new("s1", vec![])).await.unwrap();
        let err = store
            .create(SessionMetadata::new("s1", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(matches!(
            store.load("nope").await.unwrap_err(),
            MetadataError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn json_uses_snake_case_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create(SessionMetadata::new("s1", vec![])).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("s1").join(METADATA_FILE)).unwrap();
        assert!(text.contains("\"state\": \"created\""), "{text}");
    }

    #[tokio::test]
    async fn archived_once_every_participant_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store
            .create(SessionMetadata::new("s1", vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        store
            .update("s1", |m| {
                let start = Utc::now();
                m.mark_started(start, BTreeMap::from([("a".to_string(), 5)]));
                m.mark_stopped(start + chrono::Duration::milliseconds(1500));
            })
            .await
            .unwrap();

        let meta = store.record_transfer("s1", completed("a")).await.unwrap();
        assert_eq!(meta.state, SessionState::Stopped);
        assert_eq!(meta.duration_ms, Some(1500));

        let mut failed = completed("b");
        failed.status = FileStatus::Failed;
        failed.error = Some("short read".into());
        let meta = store.record_transfer("s1", failed).await.unwrap();
        assert_eq!(meta.state, SessionState::Stopped);

        let meta = store.record_transfer("s1", completed("b")).await.unwrap();
        assert_eq!(meta.state, SessionState::Archived);
        assert_eq!(meta.received_files.len(), 3);
    }

    #[tokio::test]
    async fn transfer_for_unknown_session_creates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let meta = store.record_transfer("s9", completed("a")).await.unwrap();
        assert_eq!(meta.state, SessionState::Created);
        assert_eq!(store.list().await.unwrap(), vec!["s9"]);
    }

    #[tokio::test]
    async fn list_skips_directories_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        store.create(SessionMetadata::new("b", vec![])).await.unwrap();
        store.create(SessionMetadata::new("a", vec![])).await.unwrap();
        std::fs::create_dir(dir.path().join("stray")).unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn no_participants_never_archives() {
        let mut meta = SessionMetadata::new("s1", vec![]);
        meta.mark_stopped(Utc::now());
        assert_eq!(meta.state, SessionState::Stopped);
        assert_eq!(meta.duration_ms, None);
    }
}
