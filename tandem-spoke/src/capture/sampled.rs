//! Thread-sampled scalar stream.
//!
//! A dedicated producer thread samples a [`ScalarSource`] at a fixed rate and
//! pushes `(timestamp, value)` pairs into the SPSC ring. A second thread
//! drains the ring periodically and appends CSV rows to
//! `<session_dir>/<name>/samples.csv`.

use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tandem_core::{ring, Clock};

use super::CaptureResource;
use crate::error::CaptureError;

/// Default ring size: 32 seconds of headroom at 128 Hz.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Something that produces one scalar reading per call.
pub trait ScalarSource: Send + 'static {
    /// Take one reading at `now_ns`.
    fn sample(&mut self, now_ns: i64) -> f64;
}

/// Slowly oscillating skin-conductance-like signal, in microsiemens.
#[derive(Debug, Clone, Default)]
pub struct SyntheticGsr;

impl ScalarSource for SyntheticGsr {
    fn sample(&mut self, now_ns: i64) -> f64 {
        let t = now_ns as f64 / 1e9;
        2.0 + 0.5 * (2.0 * std::f64::consts::PI * 0.1 * t).sin()
    }
}

struct Running<S> {
    stop: Arc<AtomicBool>,
    producer: JoinHandle<S>,
    consumer: JoinHandle<Result<u64, std::io::Error>>,
}

/// A [`CaptureResource`] backed by a sampling thread and the ingestion ring.
pub struct SampledStream<S: ScalarSource> {
    name: String,
    rate_hz: f64,
    ring_capacity: usize,
    clock: Arc<dyn Clock>,
    source: Option<S>,
    running: Option<Running<S>>,
}

impl<S: ScalarSource> SampledStream<S> {
    /// Create a stream sampling `source` at `rate_hz`.
    pub fn new(name: &str, source: S, rate_hz: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            rate_hz: if rate_hz > 0.0 { rate_hz } else { 1.0 },
            ring_capacity: DEFAULT_RING_CAPACITY,
            clock,
            source: Some(source),
            running: None,
        }
    }

    /// Override the ring capacity.
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    fn sensor_error(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::Sensor {
            resource: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> CaptureError {
        CaptureError::Io {
            resource: self.name.clone(),
            source,
        }
    }
}

#[async_trait]
impl<S: ScalarSource> CaptureResource for SampledStream<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&mut self, session_dir: &Path) -> Result<(), CaptureError> {
        if self.running.is_some() {
            return Err(self.sensor_error("already running"));
        }
        let mut source = self
            .source
            .take()
            .ok_or_else(|| self.sensor_error("source lost by a previous run"))?;

        let dir = session_dir.join(&self.name);
        let csv = std::fs::create_dir_all(&dir)
            .and_then(|_| File::create(dir.join("samples.csv")));
        let file = match csv {
            Ok(file) => file,
            Err(e) => {
                self.source = Some(source);
                return Err(self.io_error(e));
            }
        };

        let (mut tx, mut rx) = ring::channel(self.ring_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let producer_done = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs_f64(1.0 / self.rate_hz);

        let producer = {
            let stop = stop.clone();
            let done = producer_done.clone();
            let clock = self.clock.clone();
            thread::Builder::new()
                .name(format!("{}-sampler", self.name))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let now = clock.now_ns();
                        tx.push(now, source.sample(now));
                        thread::sleep(period);
                    }
                    done.store(true, Ordering::Release);
                    source
                })
                .map_err(|e| self.io_error(e))?
        };

        let name = self.name.clone();
        let consumer = match thread::Builder::new()
            .name(format!("{}-drain", self.name))
            .spawn(move || {
                let mut out = BufWriter::new(file);
                writeln!(out, "timestamp_ns,value")?;
                let mut rows = 0u64;
                let mut batch = Vec::new();
                loop {
                    let finished = producer_done.load(Ordering::Acquire);
                    batch.clear();
                    rx.drain_into(&mut batch);
                    for s in &batch {
                        writeln!(out, "{},{}", s.timestamp_ns, s.value)?;
                    }
                    rows += batch.len() as u64;
                    if finished {
                        break;
                    }
                    thread::sleep(DRAIN_INTERVAL);
                }
                out.flush()?;
                if rx.dropped() > 0 {
                    tracing::warn!("{}: ring overran, {} samples dropped", name, rx.dropped());
                }
                Ok::<u64, std::io::Error>(rows)
            }) {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::Release);
                return Err(self.io_error(e));
            }
        };

        tracing::debug!("{}: sampling at {} Hz into {:?}", self.name, self.rate_hz, dir);
        self.running = Some(Running {
            stop,
            producer,
            consumer,
        });
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CaptureError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.stop.store(true, Ordering::Release);

        let joined = tokio::task::spawn_blocking(move || {
            let source = running.producer.join();
            let rows = running.consumer.join();
            (source, rows)
        })
        .await
        .map_err(|e| self.sensor_error(format!("join failed: {e}")))?;

        match joined {
            (Ok(source), Ok(Ok(rows))) => {
                self.source = Some(source);
                tracing::debug!("{}: wrote {} samples", self.name, rows);
                Ok(())
            }
            (Ok(source), Ok(Err(e))) => {
                self.source = Some(source);
                Err(self.io_error(e))
            }
            (Ok(source), Err(_)) => {
                self.source = Some(source);
                Err(self.sensor_error("drain thread panicked"))
            }
            (Err(_), _) => Err(self.sensor_error("sampler thread panicked")),
        }
    }
}
