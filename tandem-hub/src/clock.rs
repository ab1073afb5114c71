//! Clock sync engine.
//!
//! Keeps one offset record per device. [`ClockSyncEngine::sync_once`]
//! performs a single round trip and replaces the stored record; a failed
//! probe leaves the previous record untouched. [`ClockSyncEngine::sync_many`]
//! is the caller-level helper for a trimmed median over several probes.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{robust_offset, Clock, OffsetSample, SyncStats};
use tandem_types::Request;
use tokio::net::UdpSocket;

use crate::device::DeviceSession;
use crate::error::{CommandError, SyncError};

/// Last accepted clock estimate for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockRecord {
    /// Device clock minus hub clock, nanoseconds.
    pub offset_ns: i64,
    /// Round-trip network delay of the accepted probe (or the smallest one).
    pub delay_ns: i64,
    /// Hub clock reading when the record was stored.
    pub synced_at_ns: i64,
    /// Probes behind this record.
    pub samples: usize,
    /// Spread of the offsets that were kept; zero for a single probe.
    pub std_dev_ns: f64,
}

impl ClockRecord {
    fn from_sample(sample: &OffsetSample, synced_at_ns: i64) -> Result<Self, SyncError> {
        let offset_ns = sample
            .offset_ns()
            .ok_or_else(|| SyncError::BadReply("device instants out of range".into()))?;
        Ok(Self {
            offset_ns,
            delay_ns: sample.delay_ns(),
            synced_at_ns,
            samples: 1,
            std_dev_ns: 0.0,
        })
    }

    fn from_stats(stats: &SyncStats, synced_at_ns: i64) -> Self {
        Self {
            offset_ns: stats.offset_ns,
            delay_ns: stats.min_delay_ns,
            synced_at_ns,
            samples: stats.used,
            std_dev_ns: stats.std_dev_ns,
        }
    }
}

/// Per-device clock offsets against the hub's local clock.
pub struct ClockSyncEngine {
    local: Arc<dyn Clock>,
    timeout: Duration,
    records: DashMap<String, ClockRecord>,
    seq: AtomicU64,
}

impl ClockSyncEngine {
    /// Engine measuring against `local`, failing probes after `timeout`.
    pub fn new(local: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            records: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// The hub clock offsets are measured against.
    pub fn local_clock(&self) -> &Arc<dyn Clock> {
        &self.local
    }

    /// One `time_sync` round trip, without storing anything.
    pub async fn probe(&self, device: &DeviceSession) -> Result<OffsetSample, SyncError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let t1 = self.local.now_ns();
        let request = Request::TimeSync {
            seq: Some(seq),
            t0: Some(t1),
        };
        let ack = match device.request_within(request, self.timeout).await {
            Ok(ack) => ack,
            Err(CommandError::Timeout { .. }) => return Err(SyncError::Timeout(self.timeout)),
            Err(e) => return Err(e.into()),
        };
        let t2 = self.local.now_ns();

        let receive: i64 = ack
            .field("t1")
            .ok_or_else(|| SyncError::BadReply("time_sync ack without t1".into()))?;
        let send: i64 = ack.field("t2").unwrap_or(receive);
        Ok(OffsetSample::stamped(t1, receive, send, t2))
    }

    /// Probe once over the control channel and replace the stored offset.
    pub async fn sync_once(&self, device: &DeviceSession) -> Result<ClockRecord, SyncError> {
        let key = device.id();
        let sample = match self.probe(device).await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!("Clock probe to {} failed: {}", key, e);
                return Err(e);
            }
        };
        let record = match ClockRecord::from_sample(&sample, sample.local_receive) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Clock probe to {} failed: {}", key, e);
                return Err(e);
            }
        };
        self.store(&key, record);
        Ok(record)
    }

    /// Probe once over the UDP time echo at `addr` and store the result
    /// under `key`.
    pub async fn sync_udp(&self, key: &str, addr: &str) -> Result<ClockRecord, SyncError> {
        let target = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
            SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{addr} resolved to no addresses"),
            ))
        })?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;

        let t1 = self.local.now_ns();
        socket.send(b"t").await?;
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))??;
        let t2 = self.local.now_ns();

        let remote: i64 = std::str::from_utf8(&buf[..n])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| SyncError::BadReply("time echo is not a decimal instant".into()))?;
        let sample = OffsetSample::echo(t1, remote, t2);
        let record = ClockRecord::from_sample(&sample, t2)?;
        self.store(key, record);
        Ok(record)
    }

    /// Run `probes` round trips and store the trimmed median.
    ///
    /// Failed probes are skipped; the call fails only if none succeed.
    pub async fn sync_many(
        &self,
        device: &DeviceSession,
        probes: usize,
        trim_ratio: f64,
    ) -> Result<ClockRecord, SyncError> {
        let key = device.id();
        let mut samples = Vec::with_capacity(probes);
        let mut last_err = None;
        for _ in 0..probes.max(1) {
            match self.probe(device).await {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    tracing::debug!("Clock probe to {} failed: {}", key, e);
                    last_err = Some(e);
                }
            }
        }
        if samples.is_empty() {
            if let Some(e) = last_err {
                tracing::warn!("All clock probes to {} failed: {}", key, e);
                return Err(e);
            }
        }

        let stats = robust_offset(&samples, trim_ratio)?;
        let record = ClockRecord::from_stats(&stats, self.local.now_ns());
        self.store(&key, record);
        Ok(record)
    }

    fn store(&self, key: &str, record: ClockRecord) {
        tracing::info!(
            "Clock offset for {}: {} ns (delay {} ns, {} probe(s))",
            key,
            record.offset_ns,
            record.delay_ns,
            record.samples
        );
        self.records.insert(key.to_string(), record);
    }

    /// Stored offset, if the device was ever synced.
    pub fn offset(&self, key: &str) -> Option<i64> {
        self.records.get(key).map(|r| r.offset_ns)
    }

    /// Whether any probe for `key` ever succeeded.
    pub fn has_synced(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Full stored record.
    pub fn record(&self, key: &str) -> Option<ClockRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Every stored offset, keyed by device.
    pub fn offsets(&self) -> BTreeMap<String, i64> {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.offset_ns))
            .collect()
    }

    /// Local time translated into the device's clock. Applies a zero
    /// offset if the device was never synced; check [`Self::has_synced`].
    pub fn synced_timestamp(&self, key: &str) -> i64 {
        self.local.now_ns() + self.offset(key).unwrap_or(0)
    }

    /// Drop the record for `key`.
    pub fn forget(&self, key: &str) {
        self.records.remove(key);
    }
}
