//! Transfer receiver.
//!
//! Accepts one archive per connection on a dedicated listener, independent
//! of the control connections:
//!
//! 1. Read the JSON header line (bounded, with the per-read timeout).
//! 2. Stream the archive to `sessions_root/<session>/<filename>`, every read
//!    bounded by the per-read timeout. With `size` in the header exactly
//!    that many bytes are expected.
//! 3. Unpack into `sessions_root/<session>/<device>/`, rejecting entries
//!    that would escape it, then delete the archive.
//! 4. Record the outcome in the session metadata.
//!
//! A failed job keeps whatever was written for manual inspection.

use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::Clock;
use tandem_types::{safe_component, SessionId, TransferHeader};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{HubError, TransferError};
use crate::metadata::{FileStatus, ReceivedFile, SessionStore, METADATA_FILE};
use crate::metrics::HubMetrics;

const CHUNK: usize = 64 * 1024;
const UPDATE_BUFFER: usize = 64;

/// Per-session directory holding archives while they arrive.
const INCOMING_DIR: &str = ".incoming";

/// Where a transfer job stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Archive bytes are arriving.
    Receiving,
    /// Archive is being unpacked.
    Extracting,
    /// Unpacked; `files` regular files written.
    Completed {
        /// Files extracted.
        files: usize,
    },
    /// Failed; partial data kept.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

impl JobStatus {
    /// Completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

/// Snapshot of one transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    /// Job id.
    pub id: Uuid,
    /// Session from the header.
    pub session_id: String,
    /// Archive name on disk.
    pub filename: String,
    /// Device id from the header.
    pub device_id: String,
    /// Sender address.
    pub peer: String,
    /// Bytes received so far.
    pub bytes: u64,
    /// Current status.
    pub status: JobStatus,
}

struct Shared {
    config: TransferConfig,
    store: Arc<SessionStore>,
    metrics: Arc<HubMetrics>,
    clock: Arc<dyn Clock>,
    jobs: DashMap<Uuid, TransferJob>,
    updates: broadcast::Sender<TransferJob>,
}

impl Shared {
    fn publish(&self, job: &TransferJob) {
        self.jobs.insert(job.id, job.clone());
        let _ = self.updates.send(job.clone());
    }
}

/// Hub-side receiver for session archives.
pub struct TransferReceiver {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl TransferReceiver {
    /// Bind `addr` and start accepting transfers.
    pub async fn bind(
        addr: &str,
        config: TransferConfig,
        store: Arc<SessionStore>,
        metrics: Arc<HubMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HubError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let shared = Arc::new(Shared {
            config,
            store,
            metrics,
            clock,
            jobs: DashMap::new(),
            updates,
        });
        let accept = tokio::spawn(accept_loop(listener, shared.clone()));
        tracing::info!("Transfer receiver listening on {}", local_addr);
        Ok(Self {
            shared,
            local_addr,
            accept,
        })
    }

    /// Address the receiver is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of every job seen so far.
    pub fn jobs(&self) -> Vec<TransferJob> {
        self.shared.jobs.iter().map(|j| j.value().clone()).collect()
    }

    /// Jobs for one session.
    pub fn jobs_for(&self, session_id: &str) -> Vec<TransferJob> {
        self.shared
            .jobs
            .iter()
            .filter(|j| j.session_id == session_id)
            .map(|j| j.value().clone())
            .collect()
    }

    /// Stream of job updates.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferJob> {
        self.shared.updates.subscribe()
    }

    /// Wait until every device in `devices` has a finished job for
    /// `session_id`, or `timeout` elapses. Returns the finished jobs.
    pub async fn wait_for(
        &self,
        session_id: &str,
        devices: &[String],
        timeout: Duration,
    ) -> Result<Vec<TransferJob>, HubError> {
        let mut updates = self.subscribe();
        let finished = |jobs: &[TransferJob]| {
            devices.iter().all(|d| {
                jobs.iter()
                    .any(|j| &j.device_id == d && j.status.is_finished())
            })
        };

        let wait = async {
            loop {
                let jobs = self.jobs_for(session_id);
                if finished(&jobs) {
                    return jobs;
                }
                match updates.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    // sender lives in self, so this cannot close first
                    Err(broadcast::error::RecvError::Closed) => return jobs,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| HubError::Timeout(timeout))
    }
}

impl Drop for TransferReceiver {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("Transfer connection from {}", peer);
                tokio::spawn(handle_connection(stream, peer, shared.clone()));
            }
            Err(e) => {
                tracing::error!("Transfer accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let read_timeout = shared.config.read_timeout();
    let mut reader = BufReader::with_capacity(CHUNK, stream);

    let header = match read_header(&mut reader, shared.config.max_header_bytes, read_timeout).await
    {
        Ok(header) => header,
        Err(e) => {
            HubMetrics::incr(&shared.metrics.transfers_failed);
            tracing::warn!("Rejected transfer from {}: {}", peer, e);
            return;
        }
    };

    let mut job = TransferJob {
        id: Uuid::new_v4(),
        session_id: header.session_id.clone(),
        filename: archive_file_name(&header),
        device_id: header.device_id.clone(),
        peer: peer.to_string(),
        bytes: 0,
        status: JobStatus::Receiving,
    };
    shared.publish(&job);
    tracing::info!(
        "Receiving {} for session {} from {}",
        job.filename,
        job.session_id,
        job.device_id
    );

    let result = receive(&mut reader, &header, &mut job, &shared).await;
    let status = match &result {
        Ok(files) => {
            HubMetrics::incr(&shared.metrics.transfers_completed);
            tracing::info!(
                "Transfer {} complete: {} bytes, {} files",
                job.filename,
                job.bytes,
                files
            );
            JobStatus::Completed { files: *files }
        }
        Err(e) => {
            HubMetrics::incr(&shared.metrics.transfers_failed);
            tracing::error!("Transfer {} failed: {}", job.filename, e);
            JobStatus::Failed {
                reason: e.to_string(),
            }
        }
    };

    let record = ReceivedFile {
        filename: job.filename.clone(),
        device_id: job.device_id.clone(),
        size: job.bytes,
        received_at_ns: shared.clock.now_ns(),
        status: if result.is_ok() {
            FileStatus::Completed
        } else {
            FileStatus::Failed
        },
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    if let Err(e) = shared.store.record_transfer(&job.session_id, record).await {
        tracing::error!("Failed to record transfer {} in metadata: {}", job.filename, e);
    }

    // metadata is written before the final update so waiters see it
    job.status = status;
    shared.publish(&job);
}

async fn read_header<R>(
    reader: &mut R,
    max_bytes: usize,
    read_timeout: Duration,
) -> Result<TransferHeader, TransferError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = max_bytes as u64 + 1;
    tokio::time::timeout(read_timeout, (&mut *reader).take(limit).read_until(b'\n', &mut line))
        .await
        .map_err(|_| TransferError::ReadTimeout(read_timeout))??;

    if line.last() != Some(&b'\n') {
        let reason = if line.len() as u64 >= limit {
            "header line too long"
        } else {
            "connection closed before header"
        };
        return Err(TransferError::BadHeader(reason.into()));
    }
    let mut header =
        TransferHeader::from_line(&line).map_err(|e| TransferError::BadHeader(e.to_string()))?;
    let session = SessionId::parse(&header.session_id)
        .ok_or_else(|| TransferError::BadHeader(format!("invalid session id {:?}", header.session_id)))?;
    header.session_id = session.as_str().to_string();
    Ok(header)
}

/// Last path component of the header's filename, sanitized.
fn archive_file_name(header: &TransferHeader) -> String {
    let base = header
        .filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let fallback = format!("{}_{}.zip", header.session_id, safe_component(&header.device_id, "device"));
    safe_component(base, &fallback)
}

async fn receive<R>(
    reader: &mut R,
    header: &TransferHeader,
    job: &mut TransferJob,
    shared: &Shared,
) -> Result<usize, TransferError>
where
    R: AsyncRead + Unpin,
{
    let session_dir = shared.store.session_dir(&job.session_id);
    let archive = incoming_path(&session_dir, job.id);
    if let Some(parent) = archive.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    job.bytes = stream_to_file(reader, &archive, header.size, shared).await?;
    job.status = JobStatus::Extracting;
    shared.publish(job);

    let dest = session_dir.join(device_dir_name(&header.device_id));
    let source = archive.clone();
    let files = tokio::task::spawn_blocking(move || extract(&source, &dest))
        .await
        .map_err(|e| TransferError::Join(e.to_string()))??;

    if let Err(e) = tokio::fs::remove_file(&archive).await {
        tracing::warn!("Failed to remove {}: {}", archive.display(), e);
    }
    Ok(files)
}

/// Directory a device's files unpack into; never one of the session's own
/// entries.
fn device_dir_name(device_id: &str) -> String {
    let name = safe_component(device_id, "unknown_device");
    if name.starts_with(METADATA_FILE) {
        format!("device_{name}")
    } else {
        name
    }
}

/// Where the raw archive for job `id` lands. Named by the hub, never by
/// the sender.
fn incoming_path(session_dir: &Path, id: Uuid) -> PathBuf {
    session_dir.join(INCOMING_DIR).join(format!("{id}.zip"))
}

async fn stream_to_file<R>(
    reader: &mut R,
    path: &Path,
    expected: Option<u64>,
    shared: &Shared,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let read_timeout = shared.config.read_timeout();
    let mut file = tokio::fs::File::create(path).await?;
    let mut buf = vec![0u8; CHUNK];
    let mut received: u64 = 0;

    loop {
        let want = match expected {
            Some(total) if received >= total => break,
            Some(total) => CHUNK.min((total - received) as usize),
            None => CHUNK,
        };
        let n = tokio::time::timeout(read_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| TransferError::ReadTimeout(read_timeout))??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        shared
            .metrics
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
    }
    file.flush().await?;

    if let Some(total) = expected {
        if received < total {
            return Err(TransferError::ShortRead {
                received,
                expected: total,
            });
        }
    }
    Ok(received)
}

/// Unpack `archive` under `dest`. Returns the number of files written.
fn extract(archive: &Path, dest: &Path) -> Result<usize, TransferError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(dest)?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let target: PathBuf = match entry.enclosed_name() {
            Some(rel) => dest.join(rel),
            None => return Err(TransferError::UnsafeEntry(entry.name().to_string())),
        };
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        files += 1;
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{SessionMetadata, SessionState};
    use std::io::Write;
    use tandem_core::ManualClock;
    use zip::write::SimpleFileOptions;

    async fn receiver(root: &Path, read_timeout_ms: u64) -> (TransferReceiver, Arc<SessionStore>) {
        let config = TransferConfig {
            sessions_root: root.to_path_buf(),
            read_timeout_ms,
            ..TransferConfig::default()
        };
        let store = Arc::new(SessionStore::new(root));
        let rx = TransferReceiver::bind(
            "127.0.0.1:0",
            config,
            store.clone(),
            Arc::new(HubMetrics::default()),
            Arc::new(ManualClock::new(7)),
        )
        .await
        .unwrap();
        (rx, store)
    }

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn header(session: &str, device: &str, size: Option<u64>) -> Vec<u8> {
        TransferHeader {
            session_id: session.into(),
            filename: format!("{session}_{device}.zip"),
            device_id: device.into(),
            size,
        }
        .to_line()
        .unwrap()
    }

    async fn send(addr: SocketAddr, bytes: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    async fn finished(rx: &TransferReceiver, session: &str, device: &str) -> TransferJob {
        rx.wait_for(session, &[device.to_string()], Duration::from_secs(5))
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.device_id == device)
            .unwrap()
    }

    #[tokio::test]
    async fn unpacks_archive_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, store) = receiver(dir.path(), 5000).await;
        store
            .create(SessionMetadata::new("s1", vec!["dev-1".into()]))
            .await
            .unwrap();

        let mut bytes = header("s1", "dev-1", None);
        bytes.extend(archive(&[("a.txt", "x"), ("sub/b.txt", "y")]));
        send(rx.local_addr(), &bytes).await;

        let job = finished(&rx, "s1", "dev-1").await;
        assert_eq!(job.status, JobStatus::Completed { files: 2 });

        let root = dir.path().join("s1").join("dev-1");
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "x");
        assert_eq!(
            std::fs::read_to_string(root.join("sub").join("b.txt")).unwrap(),
            "y"
        );
        assert!(!incoming_path(&dir.path().join("s1"), job.id).exists());

        let meta = store.load("s1").await.unwrap();
        assert_eq!(meta.received_files.len(), 1);
        assert_eq!(meta.received_files[0].status, FileStatus::Completed);
        assert_eq!(meta.received_files[0].received_at_ns, 7);
        assert_eq!(meta.state, SessionState::Created);
    }

    #[tokio::test]
    async fn short_read_fails_and_keeps_partial_archive() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, store) = receiver(dir.path(), 5000).await;

        let body = archive(&[("a.txt", "x")]);
        let mut bytes = header("s2", "dev-1", Some(body.len() as u64 + 100));
        bytes.extend(&body);
        send(rx.local_addr(), &bytes).await;

        let job = finished(&rx, "s2", "dev-1").await;
        assert!(matches!(job.status, JobStatus::Failed { .. }), "{job:?}");
        assert!(incoming_path(&dir.path().join("s2"), job.id).exists());

        let meta = store.load("s2").await.unwrap();
        assert_eq!(meta.received_files[0].status, FileStatus::Failed);
        assert!(meta.received_files[0].error.as_deref().unwrap().contains("short read"));
    }

    #[tokio::test]
    async fn stalled_sender_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, _store) = receiver(dir.path(), 200).await;

        let mut stream = TcpStream::connect(rx.local_addr()).await.unwrap();
        stream.write_all(&header("s3", "dev-1", None)).await.unwrap();
        stream.write_all(b"PK").await.unwrap();

        let job = finished(&rx, "s3", "dev-1").await;
        match job.status {
            JobStatus::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("expected failure, got {other:?}"),
        }
        drop(stream);
    }

    #[tokio::test]
    async fn entries_escaping_the_session_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, _store) = receiver(&dir.path().join("root"), 5000).await;

        let mut bytes = header("s4", "dev-1", None);
        bytes.extend(archive(&[("../../evil.txt", "boom")]));
        send(rx.local_addr(), &bytes).await;

        let job = finished(&rx, "s4", "dev-1").await;
        assert!(matches!(job.status, JobStatus::Failed { .. }));
        assert!(!dir.path().join("evil.txt").exists());
        assert!(incoming_path(&dir.path().join("root").join("s4"), job.id).exists());
    }

    #[tokio::test]
    async fn sender_filename_cannot_replace_session_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, store) = receiver(dir.path(), 5000).await;
        store
            .create(SessionMetadata::new("s9", vec!["dev-1".into(), "dev-2".into()]))
            .await
            .unwrap();

        let mut bytes = TransferHeader {
            session_id: "s9".into(),
            filename: METADATA_FILE.into(),
            device_id: "dev-1".into(),
            size: None,
        }
        .to_line()
        .unwrap();
        bytes.extend(archive(&[("a.txt", "x")]));
        send(rx.local_addr(), &bytes).await;

        let job = finished(&rx, "s9", "dev-1").await;
        assert_eq!(job.status, JobStatus::Completed { files: 1 });
        assert_eq!(job.filename, METADATA_FILE);

        let meta = store.load("s9").await.unwrap();
        assert_eq!(meta.participants, vec!["dev-1".to_string(), "dev-2".to_string()]);
        assert_eq!(meta.received_files.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("s9").join("dev-1").join("a.txt")).unwrap(),
            "x"
        );
    }

    #[tokio::test]
    async fn uploads_with_the_same_filename_do_not_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, _store) = receiver(dir.path(), 5000).await;

        for (device, body) in [("dev-1", "one"), ("dev-2", "two")] {
            let mut bytes = TransferHeader {
                session_id: "s10".into(),
                filename: "upload.zip".into(),
                device_id: device.into(),
                size: None,
            }
            .to_line()
            .unwrap();
            bytes.extend(archive(&[("a.txt", body)]));
            send(rx.local_addr(), &bytes).await;
        }

        let jobs = rx
            .wait_for(
                "s10",
                &["dev-1".to_string(), "dev-2".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(jobs
            .iter()
            .all(|j| j.status == JobStatus::Completed { files: 1 }));
        let session = dir.path().join("s10");
        assert_eq!(std::fs::read_to_string(session.join("dev-1").join("a.txt")).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(session.join("dev-2").join("a.txt")).unwrap(), "two");
    }

    #[test]
    fn device_named_like_metadata_gets_its_own_directory() {
        assert_eq!(device_dir_name("dev-1"), "dev-1");
        assert_eq!(device_dir_name("metadata.json"), "device_metadata.json");
        assert_eq!(device_dir_name("metadata.json.tmp"), "device_metadata.json.tmp");
    }

    #[tokio::test]
    async fn invalid_session_id_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, _store) = receiver(dir.path(), 5000).await;

        let mut bytes = header("../etc", "dev-1", None);
        bytes.extend(archive(&[("a.txt", "x")]));
        send(rx.local_addr(), &bytes).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.jobs().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn filename_loses_path_components() {
        let header = TransferHeader {
            session_id: "s1".into(),
            filename: "../../tmp/x.zip".into(),
            device_id: "d".into(),
            size: None,
        };
        assert_eq!(archive_file_name(&header), "x.zip");

        let header = TransferHeader {
            filename: "..".into(),
            ..header
        };
        assert_eq!(archive_file_name(&header), "s1_d.zip");
    }

    #[tokio::test]
    async fn updates_are_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (rx, _store) = receiver(dir.path(), 5000).await;
        let mut updates = rx.subscribe();

        let mut bytes = header("s5", "dev-1", None);
        bytes.extend(archive(&[("a.txt", "x")]));
        send(rx.local_addr(), &bytes).await;

        let mut seen = Vec::new();
        while let Ok(job) = updates.recv().await {
            let done = job.status.is_finished();
            seen.push(job.status);
            if done {
                break;
            }
        }
        assert_eq!(seen.first(), Some(&JobStatus::Receiving));
        assert!(seen.contains(&JobStatus::Extracting));
        assert_eq!(seen.last(), Some(&JobStatus::Completed { files: 1 }));
    }
}
