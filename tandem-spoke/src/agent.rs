//! Device agent: serves hub control connections.
//!
//! Each accepted connection is split into a read loop and a writer task.
//! The read loop decodes commands and hands each one to its own task, so a
//! slow `start_recording` does not hold up a `time_sync` probe. Replies,
//! forwarded events and heartbeats all funnel through the writer task, which
//! is the only code that touches the write half.
//!
//! ```text
//! hub ──cmd──▶ read loop ──spawn──▶ handle() ──reply──┐
//!                                                     ▼
//! hub ◀────────────────────────────────────────── writer ◀── events / heartbeat
//! ```

use serde_json::json;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{Clock, MonotonicClock};
use tandem_types::{
    read_message, write_message, Ack, Capabilities, CodecError, Command, ControlMessage, ErrorCode,
    Event, Framing, Heartbeat, Request, SessionId,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Interval;

use crate::capture::CaptureResource;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::{EventPublisher, DEFAULT_EVENT_BUFFER};
use crate::recorder::RecorderHandle;
use crate::time_echo::run_time_echo;
use crate::transfer::{send_session, SendRequest};

struct AgentShared {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    recorder: RecorderHandle,
    events: EventPublisher,
    /// Port the control listener actually bound, `0` until `serve` runs.
    service_port: AtomicU16,
}

/// A device endpoint that accepts hub connections and records on command.
#[derive(Clone)]
pub struct DeviceAgent {
    shared: Arc<AgentShared>,
}

impl DeviceAgent {
    /// Create an agent using a monotonic clock.
    ///
    /// Spawns the recorder task, so this must be called inside a tokio
    /// runtime.
    pub fn new(config: AgentConfig, resources: Vec<Box<dyn CaptureResource>>) -> Self {
        Self::with_clock(config, resources, Arc::new(MonotonicClock::new()))
    }

    /// Create an agent with an explicit time source.
    pub fn with_clock(
        config: AgentConfig,
        resources: Vec<Box<dyn CaptureResource>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventPublisher::new(&config.device_id, DEFAULT_EVENT_BUFFER);
        let recorder = RecorderHandle::spawn(resources, config.data_dir.clone(), events.clone());
        Self {
            shared: Arc::new(AgentShared {
                service_port: AtomicU16::new(config.listen_addr.port()),
                config,
                clock,
                recorder,
                events,
            }),
        }
    }

    /// Agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Time source used for every timestamp this agent reports.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Publisher for events forwarded to connected hubs.
    pub fn events(&self) -> EventPublisher {
        self.shared.events.clone()
    }

    /// Handle to the recorder task.
    pub fn recorder(&self) -> RecorderHandle {
        self.shared.recorder.clone()
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), AgentError> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve hub connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), AgentError> {
        let local = listener.local_addr()?;
        self.shared.service_port.store(local.port(), Ordering::Relaxed);
        tracing::info!(
            "Device {} listening on {}",
            self.shared.config.device_id,
            local
        );

        if let Some(addr) = self.shared.config.time_echo_addr {
            let socket = UdpSocket::bind(addr).await?;
            let clock = self.shared.clock.clone();
            tokio::spawn(async move {
                if let Err(e) = run_time_echo(socket, clock).await {
                    tracing::error!("Time echo stopped: {}", e);
                }
            });
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!("Hub connected from {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set nodelay for {}: {}", peer, e);
            }
            let agent = self.clone();
            tokio::spawn(async move {
                match agent.serve_connection(stream).await {
                    Ok(()) => tracing::info!("Hub {} disconnected", peer),
                    Err(e) => tracing::warn!("Connection from {} dropped: {}", peer, e),
                }
            });
        }
    }

    /// Serve one control connection until the hub closes it.
    ///
    /// A malformed frame ends the connection with an error.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &self.shared.config;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let (reply_tx, reply_rx) = mpsc::channel::<ControlMessage>(64);

        let writer = tokio::spawn(write_loop(
            write_half,
            reply_rx,
            self.shared.events.subscribe(),
            config.heartbeat_interval,
            config.device_id.clone(),
            self.shared.clock.clone(),
            config.framing,
        ));

        let result = loop {
            match read_message(&mut reader, config.max_frame_len).await {
                Ok(ControlMessage::Command(cmd)) => {
                    let received_ns = self.shared.clock.now_ns();
                    let agent = self.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let reply = agent.handle(cmd, received_ns).await;
                        let _ = reply_tx.send(reply).await;
                    });
                }
                Ok(other) => {
                    tracing::debug!("Ignoring {} message from hub", other.kind());
                }
                Err(CodecError::Closed) => break Ok(()),
                Err(e) => break Err(AgentError::from(e)),
            }
        };

        drop(reply_tx);
        writer.abort();
        result
    }

    fn capabilities(&self) -> Capabilities {
        let config = &self.shared.config;
        Capabilities {
            device_id: config.device_id.clone(),
            device_model: config.device_model.clone(),
            android_sdk: config.android_sdk,
            service_port: Some(self.shared.service_port.load(Ordering::Relaxed)),
            has_rgb: config.has_rgb,
            has_thermal: config.has_thermal,
            has_gsr: config.has_gsr,
            cameras: config.cameras.clone(),
        }
    }

    async fn handle(&self, cmd: Command, received_ns: i64) -> ControlMessage {
        let id = cmd.id;
        let request = match Request::try_from(&cmd) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Rejecting command {}: {}", id, e);
                return ControlMessage::error(id, e.code(), e.to_string());
            }
        };
        tracing::debug!("Command {} ({})", id, request.name());

        match request {
            Request::QueryCapabilities => {
                let caps = serde_json::to_value(self.capabilities()).unwrap_or_default();
                ControlMessage::Ack(Ack::ok(id).with_field("capabilities", caps))
            }
            Request::TimeSync { seq, .. } => {
                let mut ack = Ack::ok(id)
                    .with_field("t1", received_ns)
                    .with_field("t2", self.shared.clock.now_ns());
                if let Some(seq) = seq {
                    ack = ack.with_field("seq", seq);
                }
                ControlMessage::Ack(ack)
            }
            Request::StartRecording { session_id } => {
                if !session_id.trim().is_empty() && SessionId::parse(&session_id).is_none() {
                    return ControlMessage::error(
                        id,
                        ErrorCode::BadParam,
                        format!("invalid session id: {session_id:?}"),
                    );
                }
                self.shared
                    .recorder
                    .start(id, session_id)
                    .await
                    .unwrap_or_else(|e| recorder_gone(id, e))
            }
            Request::StopRecording => self
                .shared
                .recorder
                .stop(id)
                .await
                .unwrap_or_else(|e| recorder_gone(id, e)),
            Request::FlashSync => {
                let ts = self.shared.clock.now_ns();
                tracing::info!("Flash sync at {}", ts);
                ControlMessage::Ack(Ack::ok(id).with_field("ts", ts))
            }
            Request::TransferFiles {
                host,
                port,
                session_id,
            } => self.start_transfer(id, host, port, session_id).await,
        }
    }

    async fn start_transfer(
        &self,
        id: u64,
        host: String,
        port: u16,
        session_id: String,
    ) -> ControlMessage {
        if SessionId::parse(&session_id).is_none() {
            return ControlMessage::error(
                id,
                ErrorCode::BadParam,
                format!("invalid session id: {session_id:?}"),
            );
        }
        if host.trim().is_empty() || port == 0 {
            return ControlMessage::error(id, ErrorCode::BadParam, "host and port are required");
        }

        match self.shared.recorder.state().await {
            Ok(state) if !state.is_idle() && state.session_id() == Some(session_id.as_str()) => {
                return ControlMessage::error(
                    id,
                    ErrorCode::RecordingActive,
                    format!("session {session_id} is still recording"),
                );
            }
            Ok(_) => {}
            Err(e) => return recorder_gone(id, e),
        }

        let config = &self.shared.config;
        let dir = config.session_dir(&session_id);
        let is_dir = tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return ControlMessage::error(
                id,
                ErrorCode::StorageError,
                format!("no data for session {session_id}"),
            );
        }

        let request = SendRequest {
            dir,
            host,
            port,
            session_id: session_id.clone(),
            device_id: config.device_id.clone(),
            connect_timeout: config.transfer_connect_timeout,
            write_timeout: config.transfer_write_timeout,
        };
        let events = self.shared.events.clone();
        tokio::spawn(async move {
            let target = format!("{}:{}", request.host, request.port);
            match send_session(request).await {
                Ok(bytes) => {
                    events.publish_named(
                        "transfer_complete",
                        json!({ "session_id": session_id, "bytes": bytes }),
                    );
                }
                Err(e) => {
                    tracing::error!("Transfer of {} to {} failed: {}", session_id, target, e);
                    events.publish_named(
                        "transfer_failed",
                        json!({ "session_id": session_id, "error": e.to_string() }),
                    );
                }
            }
        });

        ControlMessage::Ack(Ack::ok(id))
    }
}

fn recorder_gone(id: u64, e: AgentError) -> ControlMessage {
    tracing::error!("Command {} failed: {}", id, e);
    ControlMessage::error(id, ErrorCode::SensorError, e.to_string())
}

async fn next_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut replies: mpsc::Receiver<ControlMessage>,
    mut events: broadcast::Receiver<Event>,
    heartbeat: Option<Duration>,
    device_id: String,
    clock: Arc<dyn Clock>,
    framing: Framing,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut heartbeat = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let msg = tokio::select! {
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => ControlMessage::Event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Hub link lagging, dropped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => continue,
            },
            _ = next_heartbeat(&mut heartbeat) => {
                let beat = Heartbeat {
                    device_id: device_id.clone(),
                    ts: clock.now_ns(),
                };
                match Event::new(Heartbeat::NAME, &beat) {
                    Ok(event) => ControlMessage::Event(event),
                    Err(_) => continue,
                }
            }
        };

        if let Err(e) = write_message(&mut writer, &msg, framing).await {
            tracing::debug!("Control write failed: {}", e);
            return Err(e);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}
