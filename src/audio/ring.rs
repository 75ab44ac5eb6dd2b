//! Lock-free SPSC ring buffer for the capture -> playback sample path
//!
//! One producer (the input stream callback) and one consumer (the
//! output stream callback). Push and pop are transactional: an
//! operation either transfers the whole requested count or fails
//! without touching the buffer, so a short callback never receives a
//! torn block. Failures are counted as overruns (producer side) and
//! underruns (consumer side); the caller decides what to do with them.
//!
//! Capacity is rounded up to a power of two. The default of 16384
//! samples (~340 ms at 48 kHz) rides out wireless-transport jitter.

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default ring capacity in samples.
pub const DEFAULT_RING_CAPACITY: usize = 16384;

/// Counters shared by both ends of the ring.
#[derive(Default)]
pub struct RingCounters {
    written: AtomicU64,
    read: AtomicU64,
    overflows: AtomicU64,
    underflows: AtomicU64,
}

impl RingCounters {
    /// Total samples ever pushed.
    pub fn samples_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Total samples ever popped.
    pub fn samples_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Failed pushes (ring full).
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Failed pops (ring empty).
    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Overruns plus underruns.
    pub fn xruns(&self) -> u64 {
        self.overflows() + self.underflows()
    }

    pub fn reset(&self) {
        self.written.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
        self.underflows.store(0, Ordering::Relaxed);
    }
}

/// Bounded SPSC sample queue.
pub struct SampleRing;

impl SampleRing {
    /// Build a ring with at least `capacity` samples (rounded up to a
    /// power of two) and split it into its two ends.
    pub fn with_capacity(capacity: usize) -> (RingProducer, RingConsumer) {
        let capacity = capacity.max(2).next_power_of_two();
        let rb = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = rb.split();
        let counters = Arc::new(RingCounters::default());

        (
            RingProducer {
                producer,
                capacity,
                counters: Arc::clone(&counters),
            },
            RingConsumer {
                consumer,
                capacity,
                counters,
            },
        )
    }
}

/// Producer end; lives in the input callback.
pub struct RingProducer {
    producer: HeapProducer<f32>,
    capacity: usize,
    counters: Arc<RingCounters>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots.
    pub fn available_to_write(&self) -> usize {
        self.capacity - self.producer.len()
    }

    /// Push the whole slice or nothing. A full ring counts one overrun
    /// and returns false. Pushing an empty slice is a no-op returning
    /// true.
    pub fn push(&mut self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return true;
        }
        if self.available_to_write() < samples.len() {
            self.counters.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let pushed = self.producer.push_slice(samples);
        debug_assert_eq!(pushed, samples.len());
        self.counters
            .written
            .fetch_add(pushed as u64, Ordering::Relaxed);
        true
    }

    pub fn counters(&self) -> Arc<RingCounters> {
        Arc::clone(&self.counters)
    }
}

/// Consumer end; lives in the output callback.
pub struct RingConsumer {
    consumer: HeapConsumer<f32>,
    capacity: usize,
    counters: Arc<RingCounters>,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples waiting to be read.
    pub fn available_to_read(&self) -> usize {
        self.consumer.len()
    }

    /// Occupancy in [0, 1].
    pub fn fill_ratio(&self) -> f32 {
        self.consumer.len() as f32 / self.capacity as f32
    }

    /// Fill the whole slice or nothing. An empty ring counts one
    /// underrun and returns false with the destination untouched.
    /// Popping into an empty slice is a no-op returning true.
    pub fn pop(&mut self, out: &mut [f32]) -> bool {
        if out.is_empty() {
            return true;
        }
        if self.consumer.len() < out.len() {
            self.counters.underflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let popped = self.consumer.pop_slice(out);
        debug_assert_eq!(popped, out.len());
        self.counters
            .read
            .fetch_add(popped as u64, Ordering::Relaxed);
        true
    }

    /// Discard everything currently buffered.
    pub fn drain(&mut self) {
        let drained = self.consumer.len();
        self.consumer.skip(drained);
    }

    pub fn counters(&self) -> Arc<RingCounters> {
        Arc::clone(&self.counters)
    }
}
