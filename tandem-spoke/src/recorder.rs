//! Recorder task.
//!
//! Owns the recording state machine and the capture resources. Requests
//! arrive over a channel and are processed one at a time; opening and
//! closing resources runs on a spawned job whose result comes back as the
//! next state machine event. The state machine never has a `Preparing` or
//! `Stopping` job in flight twice, so internally-driven transitions for this
//! device are serialized.

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tandem_core::{Action, Event, RecorderEvent, RecordingState};
use tandem_types::{Ack, ControlMessage};
use tokio::sync::{mpsc, oneshot};

use crate::capture::CaptureResource;
use crate::error::AgentError;
use crate::events::EventPublisher;

enum Request {
    Start {
        ack_id: u64,
        session_id: String,
        reply: oneshot::Sender<ControlMessage>,
    },
    Stop {
        ack_id: u64,
        reply: oneshot::Sender<ControlMessage>,
    },
    State {
        reply: oneshot::Sender<RecordingState>,
    },
}

enum JobDone {
    Prepared {
        rig: Option<Rig>,
        error: Option<String>,
    },
    Flushed {
        rig: Option<Rig>,
        errors: Vec<String>,
    },
}

/// The set of capture resources, plus how many are currently open.
struct Rig {
    resources: Vec<Box<dyn CaptureResource>>,
    prepared: usize,
}

impl Rig {
    async fn prepare(&mut self, dir: &Path) -> Result<(), String> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        for resource in self.resources.iter_mut() {
            resource.prepare(dir).await.map_err(|e| e.to_string())?;
            self.prepared += 1;
        }
        Ok(())
    }

    /// Close every open resource, newest first. Never stops early.
    async fn release(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        for resource in self.resources[..self.prepared].iter_mut().rev() {
            if let Err(e) = resource.finish().await {
                errors.push(e.to_string());
            }
        }
        self.prepared = 0;
        errors
    }
}

/// Handle for talking to the recorder task.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Request>,
}

impl RecorderHandle {
    /// Spawn the recorder task. Must be called inside a tokio runtime.
    pub fn spawn(
        resources: Vec<Box<dyn CaptureResource>>,
        data_dir: PathBuf,
        events: EventPublisher,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let recorder = Recorder {
            state: RecordingState::new(),
            rig: Some(Rig {
                resources,
                prepared: 0,
            }),
            data_dir,
            events,
            pending: HashMap::new(),
            next_ticket: 0,
            job_tx,
        };
        tokio::spawn(recorder.run(rx, job_rx));
        Self { tx }
    }

    /// Ask to start recording; resolves once resources are ready or failed.
    pub async fn start(&self, ack_id: u64, session_id: String) -> Result<ControlMessage, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Start {
                ack_id,
                session_id,
                reply,
            })
            .await
            .map_err(|_| AgentError::RecorderGone)?;
        rx.await.map_err(|_| AgentError::RecorderGone)
    }

    /// Ask to stop recording; resolves once resources are flushed.
    pub async fn stop(&self, ack_id: u64) -> Result<ControlMessage, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Stop { ack_id, reply })
            .await
            .map_err(|_| AgentError::RecorderGone)?;
        rx.await.map_err(|_| AgentError::RecorderGone)
    }

    /// Current state snapshot.
    pub async fn state(&self) -> Result<RecordingState, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::State { reply })
            .await
            .map_err(|_| AgentError::RecorderGone)?;
        rx.await.map_err(|_| AgentError::RecorderGone)
    }
}

struct Recorder {
    state: RecordingState,
    /// `None` while a prepare or flush job owns the resources.
    rig: Option<Rig>,
    data_dir: PathBuf,
    events: EventPublisher,
    /// Replies waiting on a state machine action, keyed by ticket.
    pending: HashMap<u64, (u64, oneshot::Sender<ControlMessage>)>,
    next_ticket: u64,
    job_tx: mpsc::UnboundedSender<JobDone>,
}

impl Recorder {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut jobs: mpsc::UnboundedReceiver<JobDone>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                Some(done) = jobs.recv() => self.on_job(done).await,
            }
        }

        if let Some(rig) = self.rig.as_mut() {
            for error in rig.release().await {
                tracing::warn!("Error closing capture resource on shutdown: {}", error);
            }
        }
        tracing::debug!("Recorder task exiting");
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Start {
                ack_id,
                session_id,
                reply,
            } => {
                let ticket = self.register(ack_id, reply);
                self.step(Event::StartRequested {
                    request_id: ticket,
                    session_id,
                })
                .await;
            }
            Request::Stop { ack_id, reply } => {
                let ticket = self.register(ack_id, reply);
                self.step(Event::StopRequested { request_id: ticket }).await;
            }
            Request::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    async fn on_job(&mut self, done: JobDone) {
        match done {
            JobDone::Prepared { rig, error } => {
                if let Some(rig) = rig {
                    self.rig = Some(rig);
                }
                let event = match error {
                    None => Event::ResourcesReady,
                    Some(error) => Event::ResourceFailed { error },
                };
                self.step(event).await;
            }
            JobDone::Flushed { rig, errors } => {
                if let Some(rig) = rig {
                    self.rig = Some(rig);
                }
                self.step(Event::ResourcesFlushed { errors }).await;
            }
        }
    }

    fn register(&mut self, ack_id: u64, reply: oneshot::Sender<ControlMessage>) -> u64 {
        self.next_ticket += 1;
        self.pending.insert(self.next_ticket, (ack_id, reply));
        self.next_ticket
    }

    async fn step(&mut self, event: Event) {
        let state = std::mem::take(&mut self.state);
        let from = state.name();
        let (next, actions) = state.on_event(event);
        if next.name() != from {
            tracing::debug!("Recorder state {} -> {}", from, next.name());
        }
        self.state = next;
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::PrepareResources { session_id } => {
                let dir = self.data_dir.join(&session_id);
                let job_tx = self.job_tx.clone();
                match self.rig.take() {
                    Some(mut rig) => {
                        tokio::spawn(async move {
                            let error = rig.prepare(&dir).await.err();
                            let _ = job_tx.send(JobDone::Prepared {
                                rig: Some(rig),
                                error,
                            });
                        });
                    }
                    None => {
                        let _ = job_tx.send(JobDone::Prepared {
                            rig: None,
                            error: Some("capture resources unavailable".into()),
                        });
                    }
                }
            }
            Action::ReleaseResources => {
                if let Some(rig) = self.rig.as_mut() {
                    for error in rig.release().await {
                        tracing::warn!("Error releasing capture resource: {}", error);
                    }
                }
            }
            Action::FlushResources { session_id } => {
                tracing::info!("Stopping recording for session {}", session_id);
                let job_tx = self.job_tx.clone();
                match self.rig.take() {
                    Some(mut rig) => {
                        tokio::spawn(async move {
                            let errors = rig.release().await;
                            let _ = job_tx.send(JobDone::Flushed {
                                rig: Some(rig),
                                errors,
                            });
                        });
                    }
                    None => {
                        let _ = job_tx.send(JobDone::Flushed {
                            rig: None,
                            errors: vec!["capture resources unavailable".into()],
                        });
                    }
                }
            }
            Action::Ack { request_id } => {
                if let Some((ack_id, reply)) = self.pending.remove(&request_id) {
                    let _ = reply.send(ControlMessage::Ack(Ack::ok(ack_id)));
                }
            }
            Action::Reject {
                request_id,
                code,
                message,
            } => {
                if let Some((ack_id, reply)) = self.pending.remove(&request_id) {
                    tracing::warn!("Rejecting command {}: {} {}", ack_id, code, message);
                    let _ = reply.send(ControlMessage::error(ack_id, code, message));
                }
            }
            Action::EmitEvent(event) => self.emit(event),
        }
    }

    fn emit(&self, event: RecorderEvent) {
        match event {
            RecorderEvent::Started { session_id } => {
                tracing::info!("Recording started: {}", session_id);
                self.events
                    .publish_named("recording_started", json!({ "session_id": session_id }));
            }
            RecorderEvent::StartFailed { session_id, error } => {
                tracing::warn!("Recording {} failed to start: {}", session_id, error);
                self.events.publish_named(
                    "recording_failed",
                    json!({ "session_id": session_id, "error": error }),
                );
            }
            RecorderEvent::FlushError { session_id, error } => {
                tracing::warn!("Flush error in {}: {}", session_id, error);
                self.events.publish_named(
                    "flush_error",
                    json!({ "session_id": session_id, "error": error }),
                );
            }
            RecorderEvent::Stopped { session_id } => {
                tracing::info!("Recording stopped: {}", session_id);
                self.events
                    .publish_named("recording_stopped", json!({ "session_id": session_id }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tandem_types::ErrorCode;

    #[derive(Default)]
    struct Probe {
        prepared: AtomicUsize,
        finished: AtomicUsize,
    }

    struct TestResource {
        probe: Arc<Probe>,
        fail_prepare: bool,
        fail_finish: bool,
        delay: Duration,
    }

    impl TestResource {
        fn ok(probe: &Arc<Probe>) -> Box<dyn CaptureResource> {
            Box::new(Self {
                probe: probe.clone(),
                fail_prepare: false,
                fail_finish: false,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl CaptureResource for TestResource {
        fn name(&self) -> &str {
            "test"
        }

        async fn prepare(&mut self, _dir: &Path) -> Result<(), CaptureError> {
            tokio::time::sleep(self.delay).await;
            if self.fail_prepare {
                return Err(CaptureError::Sensor {
                    resource: "test".into(),
                    reason: "no sensor".into(),
                });
            }
            self.probe.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), CaptureError> {
            self.probe.finished.fetch_add(1, Ordering::SeqCst);
            if self.fail_finish {
                return Err(CaptureError::Sensor {
                    resource: "test".into(),
                    reason: "flush failed".into(),
                });
            }
            Ok(())
        }
    }

    fn error_code(msg: &ControlMessage) -> Option<ErrorCode> {
        match msg {
            ControlMessage::Error(e) => Some(e.code.clone()),
            _ => None,
        }
    }

    fn spawn(resources: Vec<Box<dyn CaptureResource>>) -> (RecorderHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let handle = RecorderHandle::spawn(
            resources,
            dir.path().to_path_buf(),
            EventPublisher::new("dev", 16),
        );
        (handle, dir)
    }

    #[tokio::test]
    async fn start_and_stop_cycle() {
        let probe = Arc::new(Probe::default());
        let (recorder, dir) = spawn(vec![TestResource::ok(&probe), TestResource::ok(&probe)]);

        let reply = recorder.start(1, "s1".into()).await.unwrap();
        assert_eq!(reply, ControlMessage::Ack(Ack::ok(1)));
        assert!(recorder.state().await.unwrap().is_recording());
        assert!(dir.path().join("s1").is_dir());
        assert_eq!(probe.prepared.load(Ordering::SeqCst), 2);

        let reply = recorder.stop(2).await.unwrap();
        assert_eq!(reply, ControlMessage::Ack(Ack::ok(2)));
        assert!(recorder.state().await.unwrap().is_idle());
        assert_eq!(probe.finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_prepare_releases_opened_resources() {
        let probe = Arc::new(Probe::default());
        let failing = Box::new(TestResource {
            probe: probe.clone(),
            fail_prepare: true,
            fail_finish: false,
            delay: Duration::ZERO,
        });
        let (recorder, _dir) = spawn(vec![TestResource::ok(&probe), failing]);

        let reply = recorder.start(1, "s1".into()).await.unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::SensorError));
        assert!(recorder.state().await.unwrap().is_idle());
        // only the first resource was opened, and it was closed again
        assert_eq!(probe.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(probe.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_errors_still_reach_idle() {
        let probe = Arc::new(Probe::default());
        let flaky = Box::new(TestResource {
            probe: probe.clone(),
            fail_prepare: false,
            fail_finish: true,
            delay: Duration::ZERO,
        });
        let events = EventPublisher::new("dev", 16);
        let mut rx = events.subscribe();
        let dir = tempfile::tempdir().unwrap();
        let recorder = RecorderHandle::spawn(vec![flaky], dir.path().to_path_buf(), events);

        recorder.start(1, "s1".into()).await.unwrap();
        let reply = recorder.stop(2).await.unwrap();
        assert_eq!(reply, ControlMessage::Ack(Ack::ok(2)));
        assert!(recorder.state().await.unwrap().is_idle());

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name);
        }
        assert!(names.contains(&"flush_error".to_string()));
        assert!(names.contains(&"recording_stopped".to_string()));
    }

    #[tokio::test]
    async fn requests_during_prepare_are_rejected() {
        let probe = Arc::new(Probe::default());
        let slow = Box::new(TestResource {
            probe: probe.clone(),
            fail_prepare: false,
            fail_finish: false,
            delay: Duration::from_millis(200),
        });
        let (recorder, _dir) = spawn(vec![slow]);

        let first = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.start(1, "s1".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = recorder.start(2, "s2".into()).await.unwrap();
        assert_eq!(error_code(&second), Some(ErrorCode::RecordingActive));
        let stop = recorder.stop(3).await.unwrap();
        assert_eq!(error_code(&stop), Some(ErrorCode::NotRecording));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first, ControlMessage::Ack(Ack::ok(1)));
    }

    #[tokio::test]
    async fn stop_when_idle_is_rejected() {
        let (recorder, _dir) = spawn(vec![]);
        let reply = recorder.stop(7).await.unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::NotRecording));
    }

    #[tokio::test]
    async fn empty_session_is_bad_param() {
        let (recorder, _dir) = spawn(vec![]);
        let reply = recorder.start(1, String::new()).await.unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::BadParam));
    }
}
