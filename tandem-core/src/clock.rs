//! Clock offset math.
//!
//! A probe records the local send instant `T1`, whatever the device reports,
//! and the local receive instant `T2`. When the device reports a single
//! instant `T_remote` the estimate is
//!
//! ```text
//! offset = (T_remote + (T2 - T1) / 2) - T2
//! ```
//!
//! which assumes the two network directions are symmetric. When the device
//! reports separate receive/send instants the usual four-timestamp form is
//! used instead. A positive offset means the device clock is ahead.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Errors from clock statistics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// No samples were supplied.
    #[error("no clock samples")]
    NoSamples,

    /// Every sample's instants were too far apart to give an offset.
    #[error("clock instants out of range")]
    OutOfRange,
}

/// What the device reported for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTime {
    /// One device instant (UDP echo, or `t1 == t2`).
    Echo(i64),
    /// Device receive and send instants.
    Stamped {
        /// Device instant the probe arrived.
        receive: i64,
        /// Device instant the reply left.
        send: i64,
    },
}

/// One round-trip clock probe, all values in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    /// Local instant the probe was sent (`T1`).
    pub local_send: i64,
    /// Device-side instants.
    pub remote: RemoteTime,
    /// Local instant the reply arrived (`T2`).
    pub local_receive: i64,
}

impl OffsetSample {
    /// Sample from a single remote instant.
    pub fn echo(local_send: i64, remote: i64, local_receive: i64) -> Self {
        Self {
            local_send,
            remote: RemoteTime::Echo(remote),
            local_receive,
        }
    }

    /// Sample from explicit device receive/send instants.
    ///
    /// Collapses to [`RemoteTime::Echo`] when both instants are equal.
    pub fn stamped(local_send: i64, receive: i64, send: i64, local_receive: i64) -> Self {
        let remote = if receive == send {
            RemoteTime::Echo(receive)
        } else {
            RemoteTime::Stamped { receive, send }
        };
        Self {
            local_send,
            remote,
            local_receive,
        }
    }

    /// Estimated device clock minus local clock.
    ///
    /// `None` when the instants are so far apart that the offset does not
    /// fit in an `i64`.
    pub fn offset_ns(&self) -> Option<i64> {
        let t1 = i128::from(self.local_send);
        let t2 = i128::from(self.local_receive);
        let offset = match self.remote {
            RemoteTime::Echo(remote) => (i128::from(remote) + (t2 - t1) / 2) - t2,
            RemoteTime::Stamped { receive, send } => {
                ((i128::from(receive) - t1) + (i128::from(send) - t2)) / 2
            }
        };
        i64::try_from(offset).ok()
    }

    /// Round-trip network delay, excluding device processing time.
    /// Saturates at `i64::MAX`.
    pub fn delay_ns(&self) -> i64 {
        let rtt = i128::from(self.local_receive) - i128::from(self.local_send);
        let processing = match self.remote {
            RemoteTime::Echo(_) => 0,
            RemoteTime::Stamped { receive, send } => i128::from(send) - i128::from(receive),
        };
        i64::try_from((rtt - processing).max(0)).unwrap_or(i64::MAX)
    }
}

/// Robust summary of several probes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStats {
    /// Median of the trimmed offsets.
    pub offset_ns: i64,
    /// Smallest delay across all probes.
    pub min_delay_ns: i64,
    /// Population standard deviation of the trimmed offsets.
    pub std_dev_ns: f64,
    /// Number of probes left after trimming.
    pub used: usize,
}

/// Trimmed-median offset over several probes.
///
/// `trim_ratio` (clamped to `0.0..=0.45`) is the fraction dropped from each
/// tail of the sorted offsets. At least one sample always survives.
/// Samples whose offset does not fit in an `i64` are dropped.
pub fn robust_offset(samples: &[OffsetSample], trim_ratio: f64) -> Result<SyncStats, ClockError> {
    if samples.is_empty() {
        return Err(ClockError::NoSamples);
    }
    let mut offsets: Vec<i64> = samples.iter().filter_map(OffsetSample::offset_ns).collect();
    if offsets.is_empty() {
        return Err(ClockError::OutOfRange);
    }
    offsets.sort_unstable();
    let n = offsets.len();

    let ratio = if trim_ratio.is_finite() {
        trim_ratio.clamp(0.0, 0.45)
    } else {
        0.0
    };
    let mut k = (n as f64 * ratio).round() as usize;
    if k * 2 >= n {
        k = (n - 1) / 2;
    }
    let trimmed = &offsets[k..n - k];

    let mid = trimmed.len() / 2;
    let offset_ns = if trimmed.len() % 2 == 1 {
        trimmed[mid]
    } else {
        // floor division, same as the two-sample midpoint
        let sum = i128::from(trimmed[mid - 1]) + i128::from(trimmed[mid]);
        // the midpoint of two i64 values is always an i64
        sum.div_euclid(2) as i64
    };

    let std_dev_ns = if trimmed.len() <= 1 {
        0.0
    } else {
        let len = trimmed.len() as f64;
        let mean = trimmed.iter().map(|&x| x as f64).sum::<f64>() / len;
        let var = trimmed
            .iter()
            .map(|&x| (x as f64 - mean).powi(2))
            .sum::<f64>()
            / len;
        var.sqrt()
    };

    let min_delay_ns = samples
        .iter()
        .map(OffsetSample::delay_ns)
        .min()
        .unwrap_or(0);

    Ok(SyncStats {
        offset_ns,
        min_delay_ns,
        std_dev_ns,
        used: trimmed.len(),
    })
}

/// Source of monotonic nanosecond timestamps.
///
/// Passed explicitly to whatever needs the time so tests can substitute a
/// controllable clock.
pub trait Clock: Send + Sync {
    /// Current monotonic time in nanoseconds.
    fn now_ns(&self) -> i64;
}

/// Monotonic clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock reading zero now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock starting at `start_ns`.
    pub fn new(start_ns: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ns),
        }
    }

    /// Set the current time.
    pub fn set(&self, ns: i64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, ns: i64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Offset formula =====

    #[test]
    fn symmetric_round_trip_has_zero_offset() {
        let sample = OffsetSample::echo(1000, 1050, 1100);
        assert_eq!(sample.offset_ns(), Some(1050 + 50 - 1100));
        assert_eq!(sample.offset_ns(), Some(0));
    }

    #[test]
    fn device_ahead_gives_positive_offset() {
        let sample = OffsetSample::echo(0, 500, 100);
        assert_eq!(sample.offset_ns(), Some(450));
        assert_eq!(sample.delay_ns(), 100);
    }

    #[test]
    fn device_behind_gives_negative_offset() {
        let sample = OffsetSample::echo(10_000, 2_000, 10_200);
        assert_eq!(sample.offset_ns(), Some(2_000 + 100 - 10_200));
    }

    #[test]
    fn equal_stamps_match_echo_formula() {
        let stamped = OffsetSample::stamped(0, 500, 500, 100);
        assert_eq!(stamped.remote, RemoteTime::Echo(500));
        assert_eq!(stamped.offset_ns(), Some(450));
    }

    #[test]
    fn four_timestamp_form_discounts_processing() {
        // device is 1000ns ahead, 40ns each way, 20ns processing
        let sample = OffsetSample::stamped(0, 1040, 1060, 100);
        assert_eq!(sample.offset_ns(), Some(1000));
        assert_eq!(sample.delay_ns(), 80);
    }

    #[test]
    fn extreme_instants_do_not_overflow() {
        let sample = OffsetSample::echo(0, i64::MAX, i64::MIN);
        assert_eq!(sample.offset_ns(), None);
        assert_eq!(sample.delay_ns(), 0);

        let slow = OffsetSample::echo(i64::MIN, 0, i64::MAX);
        assert_eq!(slow.offset_ns(), Some(0));
        assert_eq!(slow.delay_ns(), i64::MAX);

        let stamped = OffsetSample::stamped(i64::MAX, i64::MIN, i64::MAX, i64::MIN);
        assert_eq!(stamped.delay_ns(), 0);

        // far apart but still representable
        let sample = OffsetSample::echo(0, i64::MAX, 0);
        assert_eq!(sample.offset_ns(), Some(i64::MAX));
    }

    // ===== Robust statistics =====

    #[test]
    fn robust_offset_rejects_outliers() {
        let samples: Vec<_> = [10, 11, 12, 13, 5_000]
            .iter()
            .map(|&off| OffsetSample::echo(0, off + 50, 100))
            .collect();
        let stats = robust_offset(&samples, 0.2).unwrap();
        assert_eq!(stats.used, 3);
        assert_eq!(stats.offset_ns, 12);
        assert_eq!(stats.min_delay_ns, 100);
        assert!(stats.std_dev_ns < 1.0);
    }

    #[test]
    fn robust_offset_even_count_uses_midpoint() {
        let samples: Vec<_> = [0, 10]
            .iter()
            .map(|&off| OffsetSample::echo(0, off, 0))
            .collect();
        let stats = robust_offset(&samples, 0.0).unwrap();
        assert_eq!(stats.offset_ns, 5);
        assert_eq!(stats.used, 2);
        assert!((stats.std_dev_ns - 5.0).abs() < 1e-9);
    }

    #[test]
    fn robust_offset_keeps_at_least_one_sample() {
        let samples = [OffsetSample::echo(0, 7, 0), OffsetSample::echo(0, 9, 0)];
        let stats = robust_offset(&samples, 0.45).unwrap();
        assert!(stats.used >= 1);

        let single = [OffsetSample::echo(0, 42, 0)];
        let stats = robust_offset(&single, 0.45).unwrap();
        assert_eq!(stats.offset_ns, 42);
        assert_eq!(stats.used, 1);
        assert_eq!(stats.std_dev_ns, 0.0);
    }

    #[test]
    fn robust_offset_needs_samples() {
        assert_eq!(robust_offset(&[], 0.1), Err(ClockError::NoSamples));
    }

    #[test]
    fn robust_offset_drops_out_of_range_samples() {
        let wild = OffsetSample::echo(0, i64::MAX, i64::MIN);
        let samples = [wild, OffsetSample::echo(0, 20, 0), OffsetSample::echo(0, 30, 0)];
        let stats = robust_offset(&samples, 0.0).unwrap();
        assert_eq!(stats.used, 2);
        assert_eq!(stats.offset_ns, 25);

        assert_eq!(robust_offset(&[wild], 0.0), Err(ClockError::OutOfRange));
    }

    #[test]
    fn midpoint_of_extremes_does_not_overflow() {
        let samples = [OffsetSample::echo(0, i64::MAX, 0), OffsetSample::echo(0, i64::MAX - 2, 0)];
        let stats = robust_offset(&samples, 0.0).unwrap();
        assert_eq!(stats.offset_ns, i64::MAX - 1);
    }

    // ===== Clocks =====

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_is_controllable() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_ns(), 150);
        clock.set(7);
        assert_eq!(clock.now_ns(), 7);
    }
}
