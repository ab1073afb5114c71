//! Device session manager.
//!
//! One [`DeviceSession`] per connected device. It owns the control
//! connection: a reader task dispatches replies to waiting callers by
//! `ack_id` and forwards events to an optional sink, while callers write
//! commands through a shared writer.
//!
//! ```text
//! caller ──send_command──▶ writer ──────────────▶ device
//!    ▲                                              │
//!    └── oneshot ◀── pending[ack_id] ◀── reader ◀───┘
//!                                          │
//!                                          └──▶ event sink (try_send)
//! ```
//!
//! Unless pipelining is enabled, a device has at most one outstanding
//! command; later callers queue behind it.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tandem_core::DeviceStatus;
use tandem_types::{
    read_message, write_message, Ack, Capabilities, CodecError, Command, ControlMessage,
    ErrorCode, Event, Framing, Heartbeat, Request, DEFAULT_MAX_FRAME_LEN,
};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ProtocolConfig;
use crate::error::{CommandError, HubError};
use crate::metrics::HubMetrics;

/// Budget for establishing a control connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection protocol settings.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Budget for each command's reply.
    pub command_timeout: Duration,
    /// Largest accepted inbound message.
    pub max_frame_len: usize,
    /// Allow concurrent outstanding commands.
    pub pipelining: bool,
    /// Framing for outbound commands.
    pub framing: Framing,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            pipelining: false,
            framing: Framing::LengthPrefixed,
        }
    }
}

impl From<&ProtocolConfig> for DeviceOptions {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            max_frame_len: config.max_frame_bytes,
            pipelining: config.pipelining,
            framing: Framing::LengthPrefixed,
        }
    }
}

/// An event received from a device.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Device the event came from.
    pub device_id: String,
    /// The event itself.
    pub event: Event,
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    label: String,
    options: DeviceOptions,
    writer: tokio::sync::Mutex<BoxWriter>,
    /// Serializes commands when pipelining is off.
    gate: tokio::sync::Mutex<()>,
    pending: DashMap<u64, oneshot::Sender<ControlMessage>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    status: Mutex<DeviceStatus>,
    last_seen: Mutex<Instant>,
    capabilities: Mutex<Option<Capabilities>>,
    events: Option<mpsc::Sender<DeviceEvent>>,
    metrics: Arc<HubMetrics>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn id(&self) -> String {
        lock(&self.capabilities)
            .as_ref()
            .map(|c| c.device_id.clone())
            .unwrap_or_else(|| self.label.clone())
    }

    fn set_status(&self, status: DeviceStatus) {
        let mut current = lock(&self.status);
        if *current != DeviceStatus::Disconnected {
            *current = status;
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        *lock(&self.status) = DeviceStatus::Disconnected;
        // dropping the senders resolves every waiter as ConnectionLost
        self.pending.clear();
    }

    fn dispatch(&self, msg: ControlMessage) {
        *lock(&self.last_seen) = Instant::now();
        let ack_id = match &msg {
            ControlMessage::Ack(ack) => Some(ack.ack_id),
            ControlMessage::Error(err) => Some(err.ack_id),
            _ => None,
        };

        match (ack_id, msg) {
            (Some(id), msg) => match self.pending.remove(&id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(msg);
                }
                None => tracing::debug!(
                    "Reply to unknown or expired command {} from {}",
                    id,
                    self.label
                ),
            },
            (None, ControlMessage::Event(event)) => self.forward(event),
            (None, other) => {
                tracing::warn!("Ignoring {} message from device {}", other.kind(), self.label)
            }
        }
    }

    fn forward(&self, event: Event) {
        HubMetrics::incr(&self.metrics.events_received);
        if event.name == Heartbeat::NAME {
            return;
        }
        let Some(sink) = &self.events else {
            return;
        };
        let event = DeviceEvent {
            device_id: self.id(),
            event,
        };
        match sink.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                HubMetrics::incr(&self.metrics.events_dropped);
                tracing::warn!(
                    "Event sink full, dropping {} from {}",
                    dropped.event.name,
                    dropped.device_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Removes a pending entry when the waiting caller finishes or gives up.
struct PendingSlot<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<ControlMessage>>,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_message(&mut reader, inner.options.max_frame_len).await {
            Ok(msg) => inner.dispatch(msg),
            Err(CodecError::Closed) => {
                tracing::info!("Device {} closed the connection", inner.label);
                break;
            }
            Err(e) => {
                tracing::warn!("Dropping connection to {}: {}", inner.label, e);
                break;
            }
        }
    }
    inner.mark_disconnected();
}

/// The hub's end of one device control connection.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Open a control connection to `addr` (`host:port`).
    pub async fn connect(
        addr: &str,
        options: DeviceOptions,
        events: Option<mpsc::Sender<DeviceEvent>>,
        metrics: Arc<HubMetrics>,
    ) -> Result<Self, HubError> {
        let connect_err = |source| HubError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                connect_err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(connect_err)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set nodelay for {}: {}", addr, e);
        }
        Ok(Self::from_stream(stream, addr, options, events, metrics))
    }

    /// Wrap an established stream. Spawns the reader task.
    pub fn from_stream<S>(
        stream: S,
        label: &str,
        options: DeviceOptions,
        events: Option<mpsc::Sender<DeviceEvent>>,
        metrics: Arc<HubMetrics>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        HubMetrics::incr(&metrics.connections_total);
        let inner = Arc::new(Inner {
            label: label.to_string(),
            options,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            gate: tokio::sync::Mutex::new(()),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            status: Mutex::new(DeviceStatus::Idle),
            last_seen: Mutex::new(Instant::now()),
            capabilities: Mutex::new(None),
            events,
            metrics,
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(inner.clone(), BufReader::new(read_half)));
        *lock(&inner.reader) = Some(handle);
        tracing::info!("Connected to device at {}", label);
        Self { inner }
    }

    /// Send a raw command and wait for its reply.
    ///
    /// Fails with [`CommandError::Timeout`] if nothing arrives within the
    /// command budget, and with [`CommandError::ConnectionLost`] if the
    /// connection drops first.
    pub async fn send_command(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<Ack, CommandError> {
        self.send_command_within(command, params, self.inner.options.command_timeout)
            .await
    }

    /// Like [`send_command`](Self::send_command) with an explicit budget.
    ///
    /// The budget covers waiting for the device's turn, the write and the
    /// reply. A write cut off by the budget leaves a partial frame on the
    /// wire, so the device is marked disconnected.
    pub async fn send_command_within(
        &self,
        command: &str,
        params: Map<String, Value>,
        budget: Duration,
    ) -> Result<Ack, CommandError> {
        let inner = &self.inner;
        let deadline = tokio::time::Instant::now() + budget;

        let _turn = if inner.options.pipelining {
            None
        } else {
            match tokio::time::timeout_at(deadline, inner.gate.lock()).await {
                Ok(turn) => Some(turn),
                Err(_) => return Err(self.timed_out(command, budget)),
            }
        };
        if !self.is_connected() {
            return Err(CommandError::ConnectionLost);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &inner.pending,
            id,
        };
        if !self.is_connected() {
            return Err(CommandError::ConnectionLost);
        }

        let msg = ControlMessage::Command(Command {
            id,
            command: command.to_string(),
            params,
        });
        {
            let mut writer = match tokio::time::timeout_at(deadline, inner.writer.lock()).await {
                Ok(writer) => writer,
                Err(_) => return Err(self.timed_out(command, budget)),
            };
            match tokio::time::timeout_at(
                deadline,
                write_message(&mut *writer, &msg, inner.options.framing),
            )
            .await
            {
                Ok(written) => written?,
                Err(_) => {
                    tracing::warn!(
                        "Write of {} to {} stalled; dropping connection",
                        command,
                        inner.label
                    );
                    inner.mark_disconnected();
                    return Err(self.timed_out(command, budget));
                }
            }
        }
        HubMetrics::incr(&inner.metrics.commands_sent);
        tracing::debug!("Sent {} ({}) to {}", command, id, inner.label);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(ControlMessage::Ack(ack))) => Ok(ack),
            Ok(Ok(ControlMessage::Error(reply))) => {
                HubMetrics::incr(&inner.metrics.commands_rejected);
                tracing::warn!(
                    "{} rejected {}: {} {}",
                    inner.label,
                    command,
                    reply.code,
                    reply.message
                );
                Err(CommandError::Rejected {
                    code: reply.code,
                    message: reply.message,
                })
            }
            Ok(Ok(other)) => Err(CommandError::UnexpectedReply(other.kind().to_string())),
            Ok(Err(_)) => Err(CommandError::ConnectionLost),
            Err(_) => Err(self.timed_out(command, budget)),
        }
    }

    fn timed_out(&self, command: &str, budget: Duration) -> CommandError {
        HubMetrics::incr(&self.inner.metrics.commands_timed_out);
        tracing::warn!(
            "{} to {} timed out after {:?}",
            command,
            self.inner.label,
            budget
        );
        CommandError::Timeout {
            command: command.to_string(),
            after: budget,
        }
    }

    /// Send a typed request, tracking the device's recording status.
    pub async fn request(&self, request: Request) -> Result<Ack, CommandError> {
        self.request_within(request, self.inner.options.command_timeout)
            .await
    }

    /// Like [`request`](Self::request) with an explicit budget.
    pub async fn request_within(
        &self,
        request: Request,
        budget: Duration,
    ) -> Result<Ack, CommandError> {
        let is_start = matches!(request, Request::StartRecording { .. });
        let is_stop = matches!(request, Request::StopRecording);
        let before = self.status();
        if is_start {
            self.inner.set_status(DeviceStatus::Preparing);
        } else if is_stop {
            self.inner.set_status(DeviceStatus::Stopping);
        }

        let Command {
            command, params, ..
        } = request.into_command(0);
        let result = self.send_command_within(&command, params, budget).await;

        if is_start || is_stop {
            let next = match &result {
                Ok(_) if is_start => Some(DeviceStatus::Recording),
                Ok(_) => Some(DeviceStatus::Idle),
                Err(CommandError::Rejected { code, .. }) => {
                    if is_stop && *code == ErrorCode::NotRecording {
                        Some(DeviceStatus::Idle)
                    } else {
                        Some(before)
                    }
                }
                // outcome unknown until the next successful exchange
                Err(_) => None,
            };
            if let Some(next) = next {
                self.inner.set_status(next);
            }
        }
        result
    }

    /// Ask the device to describe itself and remember the answer.
    pub async fn query_capabilities(&self) -> Result<Capabilities, CommandError> {
        let ack = self.request(Request::QueryCapabilities).await?;
        let caps: Capabilities = ack
            .field("capabilities")
            .ok_or_else(|| CommandError::UnexpectedReply("ack without capabilities".into()))?;
        *lock(&self.inner.capabilities) = Some(caps.clone());
        Ok(caps)
    }

    /// Device id from its capabilities, or the connection label before the
    /// first capability query.
    pub fn id(&self) -> String {
        self.inner.id()
    }

    /// Address or name this session was created with.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Last capabilities reported by the device.
    pub fn capabilities(&self) -> Option<Capabilities> {
        lock(&self.inner.capabilities).clone()
    }

    /// The hub's view of the device's recording status.
    pub fn status(&self) -> DeviceStatus {
        *lock(&self.inner.status)
    }

    /// False once the connection has dropped.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Time since any message arrived from the device.
    pub fn silent_for(&self) -> Duration {
        lock(&self.inner.last_seen).elapsed()
    }

    /// Number of commands awaiting a reply.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close the connection. Outstanding commands resolve as
    /// [`CommandError::ConnectionLost`].
    pub async fn close(&self) {
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        let _ = self.inner.writer.lock().await.shutdown().await;
        self.inner.mark_disconnected();
        tracing::info!("Closed connection to {}", self.inner.label);
    }
}
