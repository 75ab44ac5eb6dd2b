//! 10-band peaking equalizer with lock-free coefficient updates
//!
//! Coefficient changes must never be observed half-applied by the audio
//! thread, and changing one band must not reset the state of the other
//! nine. Both constraints are met with double buffering: two complete
//! filter cascades exist, an atomic index selects the active one, and
//! the control thread prepares the inactive cascade before flipping the
//! index.
//!
//! Update protocol (control thread, `set_band_gain`):
//!   1. clamp and publish the new band gain
//!   2. compute the new coefficients for that band
//!   3. copy the active cascade (coefficients and delay-line state)
//!      into the inactive one
//!   4. overwrite the changed band's coefficients in the inactive copy
//!   5. release-store the new active index
//!
//! The audio thread acquires the index once per block and runs that
//! cascade for the whole block, so it always sees a consistent set.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::biquad::{BiquadCoefficients, BiquadFilter};

/// Number of EQ bands.
pub const NUM_BANDS: usize = 10;

/// Fixed band center frequencies (Hz), one octave apart.
pub const CENTER_FREQUENCIES: [f32; NUM_BANDS] = [
    31.25, 62.5, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// Default Q for all bands.
pub const DEFAULT_Q: f32 = std::f32::consts::SQRT_2;

/// Per-band gain range in dB.
pub const MAX_BAND_GAIN_DB: f32 = 12.0;

type FilterSet = [BiquadFilter; NUM_BANDS];

/// Thread-safe 10-band peaking EQ.
///
/// One control-thread writer and one audio-thread reader. The writer
/// only touches the inactive snapshot between index flips; the reader
/// only touches the active snapshot. `reset` is the exception and must
/// only run while the audio thread is not processing.
pub struct Equalizer {
    snapshots: [UnsafeCell<FilterSet>; 2],
    active: AtomicUsize,
    gains: [AtomicU32; NUM_BANDS],
    sample_rate: f32,
}

// Safety: the snapshot selected by `active` is mutated only by the audio
// thread, and the other snapshot only by the control thread. The
// release-store in `set_band_gain` publishes all writes to the new
// snapshot before the audio thread can acquire its index.
unsafe impl Send for Equalizer {}
unsafe impl Sync for Equalizer {}

impl Equalizer {
    pub fn new(sample_rate: f32) -> Self {
        let flat: FilterSet = std::array::from_fn(|band| {
            BiquadFilter::new(BiquadCoefficients::peaking(
                sample_rate,
                CENTER_FREQUENCIES[band],
                0.0,
                DEFAULT_Q,
            ))
        });

        Self {
            snapshots: [UnsafeCell::new(flat), UnsafeCell::new(flat)],
            active: AtomicUsize::new(0),
            gains: std::array::from_fn(|_| AtomicU32::new(0.0f32.to_bits())),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Set the gain of one band. Out-of-range band indices are ignored.
    /// Called from the control thread only.
    pub fn set_band_gain(&self, band: usize, gain_db: f32) {
        if band >= NUM_BANDS {
            return;
        }

        let gain_db = gain_db.clamp(-MAX_BAND_GAIN_DB, MAX_BAND_GAIN_DB);
        self.gains[band].store(gain_db.to_bits(), Ordering::Release);

        let coef =
            BiquadCoefficients::peaking(self.sample_rate, CENTER_FREQUENCIES[band], gain_db, DEFAULT_Q);

        let current = self.active.load(Ordering::Acquire);
        let inactive = 1 - current;

        // Safety: per the struct contract the inactive snapshot has no
        // other writer or reader until the index flip below.
        unsafe {
            let src = &*self.snapshots[current].get();
            let dst = &mut *self.snapshots[inactive].get();
            *dst = *src;
            dst[band].set_coefficients(coef);
        }

        self.active.store(inactive, Ordering::Release);
    }

    /// Apply all ten band gains in order. Input slices longer than the
    /// band count are truncated, shorter ones set only the leading bands.
    pub fn set_band_gains(&self, gains_db: &[f32]) {
        for (band, &gain) in gains_db.iter().take(NUM_BANDS).enumerate() {
            self.set_band_gain(band, gain);
        }
    }

    /// Last published gain for a band, 0.0 for invalid indices.
    pub fn band_gain(&self, band: usize) -> f32 {
        if band >= NUM_BANDS {
            return 0.0;
        }
        f32::from_bits(self.gains[band].load(Ordering::Acquire))
    }

    /// Run the cascade over a block in place. Audio thread only.
    ///
    /// Bands run high-to-low frequency: the high-Q low bands accumulate
    /// less numerical error when they see the already-filtered signal.
    pub fn process_block(&self, buffer: &mut [f32]) {
        let current = self.active.load(Ordering::Acquire);

        // Safety: the audio thread is the only mutator of the active
        // snapshot, and the index is stable for the duration of the block.
        let set = unsafe { &mut *self.snapshots[current].get() };
        for filter in set.iter_mut().rev() {
            filter.process_block(buffer);
        }
    }

    /// Flat gains, zeroed filter state on both snapshots.
    ///
    /// Control thread only, and only while the engine is stopped; this
    /// touches both snapshots.
    pub fn reset(&self) {
        for gain in &self.gains {
            gain.store(0.0f32.to_bits(), Ordering::Release);
        }

        for snapshot in &self.snapshots {
            // Safety: caller guarantees no concurrent processing.
            let set = unsafe { &mut *snapshot.get() };
            for (band, filter) in set.iter_mut().enumerate() {
                filter.set_coefficients(BiquadCoefficients::peaking(
                    self.sample_rate,
                    CENTER_FREQUENCIES[band],
                    0.0,
                    DEFAULT_Q,
                ));
                filter.reset();
            }
        }

        self.active.store(0, Ordering::Release);
    }

    #[cfg(test)]
    fn active_coefficients(&self, band: usize) -> BiquadCoefficients {
        let current = self.active.load(Ordering::Acquire);
        let set = unsafe { &*self.snapshots[current].get() };
        set[band].coefficients()
    }
}
