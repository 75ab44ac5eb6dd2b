//! Latency estimation and smoothing
//!
//! The engine cannot see the driver's internal FIFO directly, so it
//! triangulates: burst-based (callback sizes), buffer-based (configured
//! stream buffers), frame-position-based (samples in flight between
//! capture and playback), and the ring occupancy. The perceived value
//! reported to the host is the output burst midpoint plus the ring
//! backlog plus whatever codec latency the transport declares.
//!
//! Estimates update at 10 Hz on the audio thread; the host reads
//! smoothed atomics whenever it likes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// EMA smoothing factor per 10 Hz sample, roughly a 5 s window.
const EMA_ALPHA: f64 = 0.3;

/// Rolling min/max window length.
const WINDOW_US: u64 = 5_000_000;

#[inline]
fn store_ms(slot: &AtomicU32, ms: f64) {
    slot.store((ms as f32).to_bits(), Ordering::Relaxed);
}

#[inline]
fn load_ms(slot: &AtomicU32) -> f64 {
    f32::from_bits(slot.load(Ordering::Relaxed)) as f64
}

/// Published latency figures, all in milliseconds.
#[derive(Default)]
pub struct LatencyShared {
    input_ms: AtomicU32,
    output_ms: AtomicU32,
    total_ms: AtomicU32,
    burst_ms: AtomicU32,
    buffer_ms: AtomicU32,
    frame_position_ms: AtomicU32,
    ring_ms: AtomicU32,
    perceived_ms: AtomicU32,
    ema_ms: AtomicU32,
    min_ms: AtomicU32,
    max_ms: AtomicU32,
    /// Micros timestamp of the rolling window start.
    window_start_us: AtomicU64,
}

impl LatencyShared {
    pub fn input_ms(&self) -> f64 {
        load_ms(&self.input_ms)
    }

    pub fn output_ms(&self) -> f64 {
        load_ms(&self.output_ms)
    }

    pub fn total_ms(&self) -> f64 {
        load_ms(&self.total_ms)
    }

    pub fn burst_ms(&self) -> f64 {
        load_ms(&self.burst_ms)
    }

    pub fn buffer_ms(&self) -> f64 {
        load_ms(&self.buffer_ms)
    }

    pub fn frame_position_ms(&self) -> f64 {
        load_ms(&self.frame_position_ms)
    }

    pub fn ring_ms(&self) -> f64 {
        load_ms(&self.ring_ms)
    }

    pub fn perceived_ms(&self) -> f64 {
        load_ms(&self.perceived_ms)
    }

    pub fn ema_ms(&self) -> f64 {
        load_ms(&self.ema_ms)
    }

    pub fn min_ms(&self) -> f64 {
        load_ms(&self.min_ms)
    }

    pub fn max_ms(&self) -> f64 {
        load_ms(&self.max_ms)
    }

    /// Monotonic micros at which the current min/max window opened.
    pub fn window_start_us(&self) -> u64 {
        self.window_start_us.load(Ordering::Relaxed)
    }
}

/// Raw inputs for one estimation tick.
#[derive(Clone, Copy, Debug)]
pub struct LatencyInputs {
    pub sample_rate: u32,
    /// Frames delivered by the last input callback.
    pub input_burst: u32,
    /// Frames requested by the last output callback.
    pub output_burst: u32,
    /// Input stream buffer depth in frames; the input runs at the
    /// driver default, so callers pass an estimate from the observed
    /// burst.
    pub input_buffer: u32,
    /// Output stream buffer in frames as negotiated with the driver.
    pub output_buffer: u32,
    /// Samples captured but not yet played out.
    pub frames_in_flight: u64,
    /// Ring occupancy in samples.
    pub ring_pending: u64,
    /// Codec latency declared by the transport, ms.
    pub declared_ms: f64,
}

/// Audio-thread latency state. Publishes into a [`LatencyShared`].
pub struct LatencyTracker {
    ema_ms: f64,
    window_min: f64,
    window_max: f64,
    window_start_us: u64,
    primed: bool,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            ema_ms: 0.0,
            window_min: f64::INFINITY,
            window_max: 0.0,
            window_start_us: 0,
            primed: false,
        }
    }

    pub fn reset(&mut self) {
        self.ema_ms = 0.0;
        self.window_min = f64::INFINITY;
        self.window_max = 0.0;
        self.window_start_us = 0;
        self.primed = false;
    }

    /// Compute every estimate and publish. Returns the smoothed
    /// perceived latency in ms.
    pub fn tick(&mut self, shared: &LatencyShared, inputs: LatencyInputs, now_us: u64) -> f64 {
        let sr = inputs.sample_rate.max(1) as f64;
        let to_ms = 1000.0 / sr;

        let burst_ms = (inputs.input_burst + inputs.output_burst) as f64 * to_ms;
        let buffer_ms = (inputs.input_buffer + inputs.output_buffer) as f64 * to_ms;
        let frame_position_ms = inputs.frames_in_flight as f64 * to_ms;
        let ring_ms = inputs.ring_pending as f64 * to_ms;

        let input_ms = (inputs.input_burst as f64 + inputs.ring_pending as f64) * to_ms;
        let output_ms = (inputs.output_burst + inputs.output_buffer) as f64 * to_ms;
        let total_ms = input_ms + output_ms + inputs.declared_ms;

        let perceived_ms =
            inputs.output_burst as f64 * to_ms / 2.0 + ring_ms + inputs.declared_ms;

        if !self.primed {
            self.ema_ms = perceived_ms;
            self.primed = true;
        } else {
            self.ema_ms = EMA_ALPHA * perceived_ms + (1.0 - EMA_ALPHA) * self.ema_ms;
        }

        // Rolling 5 s min/max of the perceived value.
        if self.window_start_us == 0 || now_us.saturating_sub(self.window_start_us) >= WINDOW_US {
            self.window_start_us = now_us;
            self.window_min = perceived_ms;
            self.window_max = perceived_ms;
        } else {
            self.window_min = self.window_min.min(perceived_ms);
            self.window_max = self.window_max.max(perceived_ms);
        }

        store_ms(&shared.input_ms, input_ms);
        store_ms(&shared.output_ms, output_ms);
        store_ms(&shared.total_ms, total_ms);
        store_ms(&shared.burst_ms, burst_ms);
        store_ms(&shared.buffer_ms, buffer_ms);
        store_ms(&shared.frame_position_ms, frame_position_ms);
        store_ms(&shared.ring_ms, ring_ms);
        store_ms(&shared.perceived_ms, perceived_ms);
        store_ms(&shared.ema_ms, self.ema_ms);
        store_ms(&shared.min_ms, self.window_min);
        store_ms(&shared.max_ms, self.window_max);
        shared.window_start_us.store(self.window_start_us, Ordering::Relaxed);

        self.ema_ms
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}
