//! Peak limiter with optional lookahead and soft-clip output stage
//!
//! Instant attack, smoothed release, infinite ratio above the
//! threshold. With lookahead enabled the envelope is driven by the
//! undelayed input while the gained sample is the delayed one, so the
//! gain is already down when the peak itself arrives.
//!
//! The delay line is preallocated for the 10 ms maximum at construction;
//! `set_lookahead` only changes the effective length. No audio-thread
//! path allocates.

use super::math;

/// Lookahead bounds in milliseconds.
const MAX_LOOKAHEAD_MS: f32 = 10.0;

/// Drive applied before the tanh stage. The stage is normalized for
/// unity slope at zero, so `tanh(drive * x) / drive` never exceeds `x`
/// and the limiter ceiling survives the clip.
const SOFT_CLIP_DRIVE: f32 = 0.95;

/// Brick-wall peak limiter.
pub struct Limiter {
    sample_rate: f32,

    threshold_db: f32,
    threshold_linear: f32,
    release_coef: f32,

    /// Peak envelope, linear amplitude.
    envelope: f32,

    /// Applied reduction in dB, always <= 0. For metering.
    gain_reduction_db: f32,

    lookahead_buffer: Vec<f32>,
    /// Effective delay length in samples; 0 disables the delay path.
    lookahead_len: usize,
    lookahead_index: usize,

    /// 1 / DRIVE, computed once.
    soft_clip_norm: f32,
}

impl Limiter {
    /// Defaults: -1 dB threshold, 50 ms release, lookahead off.
    pub fn new(sample_rate: f32) -> Self {
        let max_lookahead = ((MAX_LOOKAHEAD_MS / 1000.0) * sample_rate) as usize;
        let mut limiter = Self {
            sample_rate,
            threshold_db: -1.0,
            threshold_linear: math::db_to_linear(-1.0),
            release_coef: 0.0,
            envelope: 0.0,
            gain_reduction_db: 0.0,
            lookahead_buffer: vec![0.0; max_lookahead.max(1)],
            lookahead_len: 0,
            lookahead_index: 0,
            soft_clip_norm: 1.0 / SOFT_CLIP_DRIVE,
        };
        limiter.set_release(50.0);
        limiter
    }

    /// Threshold, clamped to [-12, 0] dB.
    pub fn set_threshold(&mut self, threshold_db: f32) {
        self.threshold_db = threshold_db.clamp(-12.0, 0.0);
        self.threshold_linear = math::db_to_linear(self.threshold_db);
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Release in milliseconds, clamped to [10, 500].
    pub fn set_release(&mut self, release_ms: f32) {
        let release_ms = release_ms.clamp(10.0, 500.0);
        self.release_coef = math::time_constant_to_coeff(release_ms, self.sample_rate);
    }

    /// Lookahead in milliseconds, clamped to [0, 10]. 0 disables the
    /// delay path. Changing it zeroes the delay line.
    pub fn set_lookahead(&mut self, lookahead_ms: f32) {
        let lookahead_ms = lookahead_ms.clamp(0.0, MAX_LOOKAHEAD_MS);
        self.lookahead_len = ((lookahead_ms / 1000.0) * self.sample_rate) as usize;
        self.lookahead_buffer.fill(0.0);
        self.lookahead_index = 0;
    }

    /// Lookahead delay in samples.
    pub fn lookahead_samples(&self) -> usize {
        self.lookahead_len
    }

    /// Current reduction in dB, always <= 0.
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    #[inline]
    fn soft_clip(&self, x: f32) -> f32 {
        (x * SOFT_CLIP_DRIVE).tanh() * self.soft_clip_norm
    }

    /// Process one sample.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        // The gained sample is the delayed one; the envelope sees the
        // fresh input and reacts before the peak leaves the delay line.
        let sample = if self.lookahead_len > 0 {
            let delayed = self.lookahead_buffer[self.lookahead_index];
            self.lookahead_buffer[self.lookahead_index] = input;
            self.lookahead_index = (self.lookahead_index + 1) % self.lookahead_len;
            delayed
        } else {
            input
        };

        let level = input.abs();
        if level > self.envelope {
            self.envelope = level;
        } else {
            self.envelope = self.release_coef * self.envelope + (1.0 - self.release_coef) * level;
        }

        let gain = if self.envelope > self.threshold_linear {
            self.threshold_linear / self.envelope
        } else {
            1.0
        };
        self.gain_reduction_db = if gain < 1.0 {
            math::linear_to_db(gain)
        } else {
            0.0
        };

        self.soft_clip(sample * gain)
    }

    /// Process a block in place.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Zero the envelope and delay line.
    pub fn reset(&mut self) {
        self.envelope = 0.0;
        self.gain_reduction_db = 0.0;
        self.lookahead_buffer.fill(0.0);
        self.lookahead_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    #[test]
    fn test_below_threshold_nearly_transparent() {
        let mut lim = Limiter::new(SR);
        lim.set_threshold(-1.0);

        // Well under the ceiling only the soft clip touches the signal,
        // and at this level its deviation is tiny.
        let input = 0.25f32;
        let output = lim.process(input);
        assert!((output - input).abs() < 0.01);
        assert_eq!(lim.gain_reduction_db(), 0.0);
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let mut lim = Limiter::new(SR);
        lim.set_threshold(-3.0);
        let ceiling = 10f32.powf(-3.0 / 20.0);

        for i in 0..9600 {
            let t = i as f32 / SR;
            let x = (2.0 * std::f32::consts::PI * 440.0 * t).sin();
            let y = lim.process(x);
            // 1% soft-clip tolerance on top of the ceiling.
            assert!(
                y.abs() <= ceiling * 1.01,
                "sample {} exceeded ceiling: {} > {}",
                i,
                y,
                ceiling
            );
        }
        assert!(lim.gain_reduction_db() <= -2.5);
    }

    #[test]
    fn test_release_recovers_gain() {
        let mut lim = Limiter::new(SR);
        lim.set_threshold(-6.0);
        lim.set_release(10.0);

        for _ in 0..100 {
            lim.process(0.9);
        }
        let reduction_during = lim.gain_reduction_db();
        assert!(reduction_during < -3.0);

        for _ in 0..48000 {
            lim.process(0.01);
        }
        assert!(lim.gain_reduction_db() > -0.1);
    }

    #[test]
    fn test_lookahead_delays_signal() {
        let mut lim = Limiter::new(SR);
        lim.set_threshold(0.0);
        lim.set_lookahead(1.0);
        let delay = lim.lookahead_samples();
        assert_eq!(delay, 48);

        // An impulse through the delay line comes out `delay` samples
        // later (modulo the soft-clip shaping).
        let mut outputs = Vec::new();
        outputs.push(lim.process(0.5));
        for _ in 0..(delay * 2) {
            outputs.push(lim.process(0.0));
        }

        let peak_at = outputs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_at, delay);
    }

    #[test]
    fn test_zero_lookahead_disables_delay() {
        let mut lim = Limiter::new(SR);
        lim.set_threshold(0.0);
        lim.set_lookahead(5.0);
        lim.set_lookahead(0.0);
        assert_eq!(lim.lookahead_samples(), 0);

        // First sample comes straight through.
        let out = lim.process(0.3);
        assert!((out - 0.3).abs() < 0.01);
    }

    #[test]
    fn test_lookahead_catches_transient() {
        // With lookahead the envelope reacts before the peak exits the
        // delay line, so the burst onset is already attenuated.
        let mut with_la = Limiter::new(SR);
        with_la.set_threshold(-6.0);
        with_la.set_release(100.0);
        with_la.set_lookahead(2.0);

        let ceiling = 10f32.powf(-6.0 / 20.0);
        let delay = with_la.lookahead_samples();

        // Silence, then a step to full scale.
        let mut worst = 0.0f32;
        for i in 0..4800 {
            let x = if i >= 1000 { 1.0 } else { 0.0 };
            let y = with_la.process(x);
            if i >= 1000 + delay {
                worst = worst.max(y.abs());
            }
        }
        assert!(
            worst <= ceiling * 1.01,
            "delayed peak {} escaped ceiling {}",
            worst,
            ceiling
        );
    }

    #[test]
    fn test_parameter_clamping() {
        let mut lim = Limiter::new(SR);
        lim.set_threshold(-20.0);
        assert_eq!(lim.threshold_db(), -12.0);
        lim.set_threshold(3.0);
        assert_eq!(lim.threshold_db(), 0.0);
        lim.set_lookahead(50.0);
        assert_eq!(lim.lookahead_samples(), (0.01 * SR) as usize);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut lim = Limiter::new(SR);
        lim.set_lookahead(5.0);
        for _ in 0..1000 {
            lim.process(0.9);
        }
        lim.reset();

        assert_eq!(lim.gain_reduction_db(), 0.0);
        assert_eq!(lim.process(0.0), 0.0);
    }
}
