//! Hub controller.
//!
//! Owns the connected devices, the clock sync engine, the transfer receiver
//! and the session metadata store, and runs the session lifecycle across
//! all devices:
//!
//! ```text
//! connect ─▶ sync_clocks ─▶ start_session ─▶ flash_sync* ─▶ stop_session
//!                                                              │
//!                       wait_for_transfers ◀─ request_transfers ┘
//! ```
//!
//! Broadcasts run one task per device and report every device's outcome.
//! Nothing is rolled back when only some devices succeed; the split is
//! visible in the report and in [`HubController::session_status`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tandem_core::{aggregate, Clock, DeviceStatus, SessionStatus};
use tandem_types::{Request, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::clock::{ClockRecord, ClockSyncEngine};
use crate::config::Config;
use crate::device::{DeviceEvent, DeviceOptions, DeviceSession};
use crate::error::{CommandError, HubError, MetadataError, Result, SyncError};
use crate::metadata::{SessionMetadata, SessionStore};
use crate::metrics::HubMetrics;
use crate::transfer::{TransferJob, TransferReceiver};

/// Capacity of the shared device event channel.
pub const EVENT_BUFFER: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-device outcomes of a broadcast.
#[derive(Debug)]
pub struct BroadcastReport<T, E = CommandError> {
    /// Outcome per device id.
    pub outcomes: BTreeMap<String, std::result::Result<T, E>>,
}

impl<T, E> BroadcastReport<T, E> {
    /// Devices that succeeded.
    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Devices that failed, with their errors.
    pub fn failed(&self) -> Vec<(&str, &E)> {
        self.outcomes
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
            .collect()
    }

    /// Successful values by device.
    pub fn values(&self) -> impl Iterator<Item = (&str, &T)> {
        self.outcomes
            .iter()
            .filter_map(|(id, r)| r.as_ref().ok().map(|v| (id.as_str(), v)))
    }

    /// Every device succeeded.
    pub fn all_ok(&self) -> bool {
        self.outcomes.values().all(|r| r.is_ok())
    }
}

/// The running session.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSession {
    /// Session id.
    pub session_id: String,
    /// Devices `start_recording` was sent to.
    pub participants: Vec<String>,
    /// When recording started.
    pub started_at: DateTime<Utc>,
}

/// Result of [`HubController::start_session`].
#[derive(Debug)]
pub struct SessionStart {
    /// New session id.
    pub session_id: String,
    /// Clock offsets stored at start.
    pub offsets: BTreeMap<String, i64>,
    /// Per-device `start_recording` outcome.
    pub report: BroadcastReport<()>,
}

/// Result of [`HubController::stop_session`].
#[derive(Debug)]
pub struct SessionStop {
    /// Stopped session id.
    pub session_id: String,
    /// Per-device `stop_recording` outcome.
    pub report: BroadcastReport<()>,
}

/// What the hub knows about one device right now.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Device id.
    pub device_id: String,
    /// Address the device was reached at.
    pub address: String,
    /// Model string from capabilities.
    pub model: Option<String>,
    /// Recording status as tracked by the hub.
    pub status: DeviceStatus,
    /// Silent longer than the staleness threshold.
    pub stale: bool,
    /// Milliseconds since the last inbound message.
    pub silent_ms: u64,
    /// Current clock offset, if synced.
    pub clock: Option<ClockRecord>,
}

/// Coordinates every device taking part in recording sessions.
pub struct HubController {
    config: Config,
    devices: DashMap<String, DeviceSession>,
    clock_sync: Arc<ClockSyncEngine>,
    store: Arc<SessionStore>,
    receiver: TransferReceiver,
    metrics: Arc<HubMetrics>,
    /// Serializes start/stop.
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveSession>>,
    last_session: Mutex<Option<String>>,
    events_tx: mpsc::Sender<DeviceEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
    started: Instant,
}

impl HubController {
    /// Build a controller and bind its transfer receiver.
    pub async fn bind(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(HubMetrics::default());
        let store = Arc::new(SessionStore::new(config.transfer.sessions_root.clone()));
        let receiver = TransferReceiver::bind(
            &config.server.transfer_bind,
            config.transfer.clone(),
            store.clone(),
            metrics.clone(),
            clock.clone(),
        )
        .await?;
        let clock_sync = Arc::new(ClockSyncEngine::new(clock, config.clock.sync_timeout()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        Ok(Self {
            config,
            devices: DashMap::new(),
            clock_sync,
            store,
            receiver,
            metrics,
            lifecycle: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            last_session: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            started: Instant::now(),
        })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Operational counters.
    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// Clock offsets.
    pub fn clock_sync(&self) -> &ClockSyncEngine {
        &self.clock_sync
    }

    /// Session metadata.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Transfer receiver.
    pub fn receiver(&self) -> &TransferReceiver {
        &self.receiver
    }

    /// Time since the controller was built.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take the receiving end of the device event channel. Only the first
    /// caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        lock(&self.events_rx).take()
    }

    // ===== Devices =====

    /// Connect to a device at `addr` and register it under its reported id.
    pub async fn connect(&self, addr: &str) -> Result<String> {
        let session = DeviceSession::connect(
            addr,
            DeviceOptions::from(&self.config.protocol),
            Some(self.events_tx.clone()),
            self.metrics.clone(),
        )
        .await?;
        self.attach(session).await
    }

    /// Register an already connected device. Queries its capabilities and
    /// replaces any previous session with the same id.
    pub async fn attach(&self, session: DeviceSession) -> Result<String> {
        let caps = match session.query_capabilities().await {
            Ok(caps) => caps,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };
        let id = caps.device_id.clone();
        if let Some(old) = self.devices.insert(id.clone(), session.clone()) {
            tracing::warn!("Device {} reconnected, replacing previous connection", id);
            old.close().await;
        }
        tracing::info!(
            "Device {} ({}) registered from {}",
            id,
            caps.device_model,
            session.label()
        );
        Ok(id)
    }

    /// Options new device sessions should be created with, including the
    /// shared event sink.
    pub fn device_options(&self) -> (DeviceOptions, mpsc::Sender<DeviceEvent>) {
        (
            DeviceOptions::from(&self.config.protocol),
            self.events_tx.clone(),
        )
    }

    /// Close and forget a device.
    pub async fn disconnect(&self, id: &str) -> bool {
        match self.devices.remove(id) {
            Some((_, session)) => {
                session.close().await;
                self.clock_sync.forget(id);
                true
            }
            None => false,
        }
    }

    /// Device session by id.
    pub fn device(&self, id: &str) -> Option<DeviceSession> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    /// Registered device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    fn connected(&self) -> Vec<DeviceSession> {
        self.devices
            .iter()
            .filter(|d| d.is_connected())
            .map(|d| d.value().clone())
            .collect()
    }

    /// Status of every registered device.
    pub fn statuses(&self) -> BTreeMap<String, DeviceStatus> {
        self.devices
            .iter()
            .map(|d| (d.key().clone(), d.status()))
            .collect()
    }

    /// Aggregate over every registered device, disconnected ones included.
    pub fn session_status(&self) -> SessionStatus {
        aggregate(self.statuses().values())
    }

    /// Connected devices silent for longer than `threshold`.
    pub fn stale_devices(&self, threshold: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.is_connected() && d.silent_for() > threshold)
            .map(|d| d.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Per-device view for status reporting.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let threshold = self.config.liveness.stale_after();
        let mut devices: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .map(|d| {
                let silent = d.silent_for();
                DeviceSnapshot {
                    device_id: d.key().clone(),
                    address: d.label().to_string(),
                    model: d.capabilities().map(|c| c.device_model),
                    status: d.status(),
                    stale: d.is_connected() && silent > threshold,
                    silent_ms: silent.as_millis() as u64,
                    clock: self.clock_sync.record(d.key()),
                }
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    // ===== Clock sync =====

    /// Probe every connected device. Uses several probes per device when
    /// configured; otherwise one.
    pub async fn sync_clocks(&self) -> BroadcastReport<ClockRecord, SyncError> {
        let engine = self.clock_sync.clone();
        let probes = self.config.clock.probes;
        let trim = self.config.clock.trim_ratio;
        broadcast(self.connected(), move |device| {
            let engine = engine.clone();
            async move {
                if probes > 1 {
                    engine.sync_many(&device, probes, trim).await
                } else {
                    engine.sync_once(&device).await
                }
            }
        })
        .await
    }

    // ===== Session lifecycle =====

    /// Running session, if any.
    pub fn active_session(&self) -> Option<ActiveSession> {
        lock(&self.active).clone()
    }

    /// Most recently started session.
    pub fn last_session(&self) -> Option<String> {
        lock(&self.last_session).clone()
    }

    /// Create a session and start recording on every connected device.
    ///
    /// `tag` goes into the session id; defaults to the first device id.
    pub async fn start_session(&self, tag: Option<&str>) -> Result<SessionStart> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(active) = self.active_session() {
            return Err(HubError::SessionActive(active.session_id));
        }
        let devices = self.connected();
        if devices.is_empty() {
            return Err(HubError::NoDevices);
        }
        let mut participants: Vec<String> = devices.iter().map(DeviceSession::id).collect();
        participants.sort();

        let tag = tag
            .map(str::to_string)
            .or_else(|| participants.first().cloned())
            .unwrap_or_else(|| "hub".to_string());
        let session_id = SessionId::generate(&tag).as_str().to_string();
        self.store
            .create(SessionMetadata::new(&session_id, participants.clone()))
            .await?;

        if self.config.clock.sync_before_start {
            let sync = self.sync_clocks().await;
            for (id, e) in sync.failed() {
                tracing::warn!("Starting {} with stale clock offset for {}: {}", session_id, id, e);
            }
        }
        let offsets: BTreeMap<String, i64> = participants
            .iter()
            .filter_map(|id| self.clock_sync.offset(id).map(|o| (id.clone(), o)))
            .collect();

        let sid = session_id.clone();
        let report = broadcast(devices, move |device| {
            let session_id = sid.clone();
            async move {
                device
                    .request(Request::StartRecording { session_id })
                    .await
                    .map(|_| ())
            }
        })
        .await;
        if !report.all_ok() {
            tracing::warn!(
                "Session {} started on {} of {} devices",
                session_id,
                report.succeeded().len(),
                report.outcomes.len()
            );
        }

        let started_at = Utc::now();
        let stored = offsets.clone();
        self.store
            .update(&session_id, move |m| m.mark_started(started_at, stored))
            .await?;
        *lock(&self.active) = Some(ActiveSession {
            session_id: session_id.clone(),
            participants,
            started_at,
        });
        *lock(&self.last_session) = Some(session_id.clone());
        tracing::info!("Session {} started", session_id);

        Ok(SessionStart {
            session_id,
            offsets,
            report,
        })
    }

    /// Stop recording on every participant of the running session.
    pub async fn stop_session(&self) -> Result<SessionStop> {
        let _lifecycle = self.lifecycle.lock().await;
        let active = self.active_session().ok_or(HubError::NoActiveSession)?;

        let devices: Vec<DeviceSession> = active
            .participants
            .iter()
            .filter_map(|id| self.device(id))
            .filter(DeviceSession::is_connected)
            .collect();
        let report = broadcast(devices, |device| async move {
            device.request(Request::StopRecording).await.map(|_| ())
        })
        .await;
        for (id, e) in report.failed() {
            tracing::warn!("Stop of {} on {} failed: {}", active.session_id, id, e);
        }

        let ended_at = Utc::now();
        self.store
            .update(&active.session_id, move |m| m.mark_stopped(ended_at))
            .await?;
        *lock(&self.active) = None;
        tracing::info!("Session {} stopped", active.session_id);

        Ok(SessionStop {
            session_id: active.session_id,
            report,
        })
    }

    /// Trigger the synchronization flash on every connected device and
    /// collect each device's `ts`. Stored in the active session's metadata.
    pub async fn flash_sync(&self) -> Result<BroadcastReport<i64>> {
        let devices = self.connected();
        if devices.is_empty() {
            return Err(HubError::NoDevices);
        }
        let report = broadcast(devices, |device| async move {
            let ack = device.request(Request::FlashSync).await?;
            ack.field::<i64>("ts")
                .ok_or_else(|| CommandError::UnexpectedReply("flash_sync ack without ts".into()))
        })
        .await;

        if let Some(active) = self.active_session() {
            let stamps: Vec<(String, i64)> =
                report.values().map(|(id, ts)| (id.to_string(), *ts)).collect();
            self.store
                .update(&active.session_id, move |m| {
                    for (id, ts) in stamps {
                        m.flash_sync.entry(id).or_default().push(ts);
                    }
                })
                .await?;
        }
        Ok(report)
    }

    /// Ask the session's devices to send their data to the transfer
    /// receiver. Defaults to the most recent session.
    pub async fn request_transfers(&self, session_id: Option<&str>) -> Result<BroadcastReport<()>> {
        let session_id = session_id
            .map(str::to_string)
            .or_else(|| self.last_session())
            .ok_or(HubError::NoActiveSession)?;
        if let Some(active) = self.active_session() {
            if active.session_id == session_id {
                return Err(HubError::SessionActive(session_id));
            }
        }

        let participants = match self.store.load(&session_id).await {
            Ok(meta) => Some(meta.participants),
            Err(MetadataError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let devices: Vec<DeviceSession> = self
            .connected()
            .into_iter()
            .filter(|d| {
                participants
                    .as_ref()
                    .map_or(true, |p| p.contains(&d.id()))
            })
            .collect();
        if devices.is_empty() {
            return Err(HubError::NoDevices);
        }

        let host = self.config.server.advertise_host.clone();
        let port = self.receiver.local_addr().port();
        tracing::info!(
            "Requesting {} from {} device(s) to {}:{}",
            session_id,
            devices.len(),
            host,
            port
        );
        let report = broadcast(devices, move |device| {
            let request = Request::TransferFiles {
                host: host.clone(),
                port,
                session_id: session_id.clone(),
            };
            async move { device.request(request).await.map(|_| ()) }
        })
        .await;
        Ok(report)
    }

    /// Wait until every participant of `session_id` has a finished transfer.
    pub async fn wait_for_transfers(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Vec<TransferJob>> {
        let meta = self.store.load(session_id).await?;
        self.receiver
            .wait_for(session_id, &meta.participants, timeout)
            .await
    }
}

/// Run `op` against every device concurrently, one task each.
async fn broadcast<T, E, F, Fut>(devices: Vec<DeviceSession>, op: F) -> BroadcastReport<T, E>
where
    F: Fn(DeviceSession) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let mut tasks = JoinSet::new();
    for device in devices {
        let id = device.id();
        let fut = op(device);
        tasks.spawn(async move { (id, fut.await) });
    }

    let mut outcomes = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, outcome)) => {
                outcomes.insert(id, outcome);
            }
            Err(e) => tracing::error!("Broadcast task failed: {}", e),
        }
    }
    BroadcastReport { outcomes }
}
