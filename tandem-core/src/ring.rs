//! Single-producer/single-consumer sample ring.
//!
//! Decouples a high-rate sampling thread from a slower drain. The producer
//! never blocks and never fails: when the consumer falls behind by more than
//! the capacity, the oldest unread samples are discarded.
//!
//! The producer only ever advances `head`. The consumer treats anything older
//! than `head - capacity` as overwritten and starts from there, which is what
//! implements drop-oldest. Each slot carries a sequence stamp so a read that
//! races with the producer lapping it is detected and discarded instead of
//! returning a torn `(timestamp, value)` pair.
//!
//! Exactly one [`Producer`] and one [`Consumer`] exist per ring. Neither is
//! `Clone`, and both take `&mut self`, so the single-producer/single-consumer
//! contract is enforced by the type system.

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Stamp value while a slot is being written.
const WRITING: usize = usize::MAX;

/// One timestamped scalar sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Capture instant in nanoseconds.
    pub timestamp_ns: i64,
    /// Sampled value.
    pub value: f64,
}

struct Slot {
    /// `position + 1` of the sample held, `0` if never written.
    stamp: AtomicUsize,
    timestamp: AtomicU64,
    value: AtomicU64,
}

struct Shared {
    slots: Box<[Slot]>,
    mask: usize,
    /// Next position the producer will write.
    head: AtomicUsize,
    /// Next position the consumer will read.
    tail: AtomicUsize,
}

impl Shared {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity())
    }
}

/// Create a ring holding at least `capacity` samples.
///
/// Capacity is rounded up to a power of two (minimum 1).
pub fn channel(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.max(1).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| Slot {
            stamp: AtomicUsize::new(0),
            timestamp: AtomicU64::new(0),
            value: AtomicU64::new(0),
        })
        .collect();
    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            shared: shared.clone(),
            head: 0,
        },
        Consumer { shared, dropped: 0 },
    )
}

/// Writing end of the ring.
pub struct Producer {
    shared: Arc<Shared>,
    head: usize,
}

impl Producer {
    /// Append a sample, overwriting the oldest unread one if the ring is full.
    pub fn push(&mut self, timestamp_ns: i64, value: f64) {
        let pos = self.head;
        let slot = &self.shared.slots[pos & self.shared.mask];

        slot.stamp.store(WRITING, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.timestamp.store(timestamp_ns as u64, Ordering::Relaxed);
        slot.value.store(value.to_bits(), Ordering::Relaxed);
        slot.stamp.store(pos.wrapping_add(1), Ordering::Release);

        self.head = pos.wrapping_add(1);
        self.shared.head.store(self.head, Ordering::Release);
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Approximate number of unread samples.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// True if the consumer has caught up.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reading end of the ring.
pub struct Consumer {
    shared: Arc<Shared>,
    dropped: u64,
}

impl Consumer {
    /// Take every sample currently available, oldest first.
    ///
    /// Never blocks; returns an empty vector when nothing is pending.
    pub fn drain_all(&mut self) -> Vec<Sample> {
        let mut out = Vec::new();
        self.drain_into(&mut out);
        out
    }

    /// Append every available sample to `out`, returning how many were added.
    pub fn drain_into(&mut self, out: &mut Vec<Sample>) -> usize {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let head = shared.head.load(Ordering::Acquire);
        let tail = shared.tail.load(Ordering::Relaxed);

        let start = if head.wrapping_sub(tail) > cap {
            head.wrapping_sub(cap)
        } else {
            tail
        };
        let mut lost = start.wrapping_sub(tail);
        let before = out.len();
        out.reserve(head.wrapping_sub(start));

        let mut pos = start;
        while pos != head {
            let slot = &shared.slots[pos & shared.mask];
            let expected = pos.wrapping_add(1);

            let first = slot.stamp.load(Ordering::Acquire);
            if first == expected {
                let timestamp = slot.timestamp.load(Ordering::Relaxed);
                let value = slot.value.load(Ordering::Relaxed);
                fence(Ordering::Acquire);
                if slot.stamp.load(Ordering::Relaxed) == expected {
                    out.push(Sample {
                        timestamp_ns: timestamp as i64,
                        value: f64::from_bits(value),
                    });
                } else {
                    lost += 1;
                }
            } else {
                lost += 1;
            }
            pos = pos.wrapping_add(1);
        }

        shared.tail.store(head, Ordering::Release);
        self.dropped += lost as u64;
        out.len() - before
    }

    /// Samples discarded because the producer overran the consumer.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Approximate number of unread samples.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(channel(0).0.capacity(), 1);
        assert_eq!(channel(1).0.capacity(), 1);
        assert_eq!(channel(5).0.capacity(), 8);
        assert_eq!(channel(4096).1.capacity(), 4096);
    }

    #[test]
    fn drain_empty_returns_nothing() {
        let (_tx, mut rx) = channel(4);
        assert!(rx.drain_all().is_empty());
        assert!(rx.is_empty());
    }

    #[test]
    fn drain_returns_fifo_order() {
        let (mut tx, mut rx) = channel(8);
        for i in 0..5 {
            tx.push(i, i as f64 * 0.5);
        }
        assert_eq!(rx.len(), 5);
        let samples = rx.drain_all();
        let stamps: Vec<i64> = samples.iter().map(|s| s.timestamp_ns).collect();
        assert_eq!(stamps, vec![0, 1, 2, 3, 4]);
        assert_eq!(samples[3].value, 1.5);
        assert!(rx.drain_all().is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let (mut tx, mut rx) = channel(4);
        let cap = tx.capacity() as i64;
        for i in 0..=cap {
            tx.push(i, i as f64);
        }
        let samples = rx.drain_all();
        assert_eq!(samples.len(), cap as usize);
        assert!(samples.iter().all(|s| s.timestamp_ns != 0));
        assert_eq!(samples.first().unwrap().timestamp_ns, 1);
        assert_eq!(samples.last().unwrap().timestamp_ns, cap);
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn interleaved_push_and_drain() {
        let (mut tx, mut rx) = channel(2);
        tx.push(1, 1.0);
        assert_eq!(rx.drain_all().len(), 1);
        tx.push(2, 2.0);
        tx.push(3, 3.0);
        tx.push(4, 4.0);
        let samples = rx.drain_all();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp_ns, 3);
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn threaded_producer_never_tears_samples() {
        const N: i64 = 200_000;
        let (mut tx, mut rx) = channel(256);

        let producer = thread::spawn(move || {
            for i in 0..N {
                tx.push(i, (i * 2) as f64);
            }
        });

        let mut received = Vec::new();
        while !producer.is_finished() {
            rx.drain_into(&mut received);
        }
        producer.join().unwrap();
        rx.drain_into(&mut received);

        assert!(!received.is_empty());
        for pair in received.windows(2) {
            assert!(pair[0].timestamp_ns < pair[1].timestamp_ns);
        }
        for s in &received {
            assert_eq!(s.value, (s.timestamp_ns * 2) as f64, "torn sample");
        }
        assert_eq!(received.last().unwrap().timestamp_ns, N - 1);
        assert_eq!(received.len() as u64 + rx.dropped(), N as u64);
    }

    #[test]
    fn ends_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Producer>();
        assert_send::<Consumer>();
    }
}
