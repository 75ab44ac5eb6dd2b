//! Downward compressor with soft-knee gain reduction
//!
//! Envelope following runs in the dB domain with selectable detection:
//! instantaneous peak or a sliding-window RMS. The envelope starts and
//! resets at the -60 dB floor so the first samples after start never see
//! a spurious full-scale reduction.

use super::math;

/// RMS detection window bounds in milliseconds. The window buffer is
/// preallocated for the maximum so window changes never allocate.
const MIN_RMS_WINDOW_MS: f32 = 1.0;
const MAX_RMS_WINDOW_MS: f32 = 100.0;

/// Level detection mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMode {
    /// Instantaneous `|x|`. Fast, catches transients.
    Peak,
    /// Sliding-window RMS. Smoother, closer to perceived loudness.
    Rms,
}

/// Soft-knee downward compressor.
pub struct Compressor {
    sample_rate: f32,

    threshold_db: f32,
    ratio: f32,
    knee_db: f32,
    makeup_gain_db: f32,
    makeup_gain_linear: f32,
    auto_makeup: bool,

    attack_coef: f32,
    release_coef: f32,

    detection: DetectionMode,
    rms_buffer: Vec<f32>,
    rms_window: usize,
    rms_index: usize,
    rms_sum: f32,

    /// Smoothed level in dB. Floored at -60 dB.
    envelope_db: f32,

    /// Applied reduction in dB, always <= 0. For metering.
    gain_reduction_db: f32,
}

impl Compressor {
    /// Voice defaults: -20 dB threshold, 4:1, 10 ms attack, 200 ms
    /// release, 6 dB knee, no makeup, peak detection.
    pub fn new(sample_rate: f32) -> Self {
        let max_window = ((MAX_RMS_WINDOW_MS / 1000.0) * sample_rate) as usize;
        let mut comp = Self {
            sample_rate,
            threshold_db: -20.0,
            ratio: 4.0,
            knee_db: 6.0,
            makeup_gain_db: 0.0,
            makeup_gain_linear: 1.0,
            auto_makeup: false,
            attack_coef: 0.0,
            release_coef: 0.0,
            detection: DetectionMode::Peak,
            rms_buffer: vec![0.0; max_window.max(1)],
            rms_window: ((10.0 / 1000.0) * sample_rate) as usize,
            rms_index: 0,
            rms_sum: 0.0,
            envelope_db: math::DB_MIN,
            gain_reduction_db: 0.0,
        };
        comp.set_attack(10.0);
        comp.set_release(200.0);
        comp
    }

    /// Threshold, clamped to [-60, 0] dB.
    pub fn set_threshold(&mut self, threshold_db: f32) {
        self.threshold_db = threshold_db.clamp(-60.0, 0.0);
        self.refresh_auto_makeup();
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Ratio, clamped to [1, 20].
    pub fn set_ratio(&mut self, ratio: f32) {
        self.ratio = ratio.clamp(1.0, 20.0);
        self.refresh_auto_makeup();
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    /// Attack in milliseconds, clamped to [0.1, 100].
    pub fn set_attack(&mut self, attack_ms: f32) {
        let attack_ms = attack_ms.clamp(0.1, 100.0);
        self.attack_coef = math::time_constant_to_coeff(attack_ms, self.sample_rate);
    }

    /// Release in milliseconds, clamped to [10, 1000].
    pub fn set_release(&mut self, release_ms: f32) {
        let release_ms = release_ms.clamp(10.0, 1000.0);
        self.release_coef = math::time_constant_to_coeff(release_ms, self.sample_rate);
    }

    /// Knee width, clamped to [0, 12] dB. 0 is a hard knee.
    pub fn set_knee(&mut self, knee_db: f32) {
        self.knee_db = knee_db.clamp(0.0, 12.0);
    }

    /// Makeup gain, clamped to [0, 24] dB. Ignored while auto-makeup is
    /// enabled.
    pub fn set_makeup_gain(&mut self, makeup_db: f32) {
        if self.auto_makeup {
            return;
        }
        self.makeup_gain_db = makeup_db.clamp(0.0, 24.0);
        self.makeup_gain_linear = math::db_to_linear(self.makeup_gain_db);
    }

    pub fn makeup_gain_db(&self) -> f32 {
        self.makeup_gain_db
    }

    /// Derive makeup from threshold and ratio instead of the manual
    /// value: `|threshold| * (1 - 1/ratio) / 2`.
    pub fn set_auto_makeup(&mut self, enabled: bool) {
        self.auto_makeup = enabled;
        self.refresh_auto_makeup();
    }

    pub fn auto_makeup(&self) -> bool {
        self.auto_makeup
    }

    fn refresh_auto_makeup(&mut self) {
        if self.auto_makeup {
            self.makeup_gain_db =
                (self.threshold_db.abs() * (1.0 - 1.0 / self.ratio) / 2.0).clamp(0.0, 24.0);
            self.makeup_gain_linear = math::db_to_linear(self.makeup_gain_db);
        }
    }

    /// Switch between peak and RMS detection.
    pub fn set_detection_mode(&mut self, mode: DetectionMode) {
        if mode != self.detection {
            self.detection = mode;
            self.rms_buffer.fill(0.0);
            self.rms_sum = 0.0;
            self.rms_index = 0;
        }
    }

    pub fn detection_mode(&self) -> DetectionMode {
        self.detection
    }

    /// RMS window in milliseconds, clamped to [1, 100]. Resets the
    /// detector history.
    pub fn set_rms_window(&mut self, window_ms: f32) {
        let window_ms = window_ms.clamp(MIN_RMS_WINDOW_MS, MAX_RMS_WINDOW_MS);
        self.rms_window = (((window_ms / 1000.0) * self.sample_rate) as usize)
            .clamp(1, self.rms_buffer.len());
        self.rms_buffer.fill(0.0);
        self.rms_sum = 0.0;
        self.rms_index = 0;
    }

    /// Current reduction in dB, always <= 0.
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    #[inline]
    fn detect(&mut self, input: f32) -> f32 {
        match self.detection {
            DetectionMode::Peak => input.abs(),
            DetectionMode::Rms => {
                let sq = input * input;
                let old = self.rms_buffer[self.rms_index];
                self.rms_buffer[self.rms_index] = sq;
                self.rms_sum += sq - old;
                if self.rms_sum < 0.0 {
                    self.rms_sum = 0.0;
                }
                self.rms_index = (self.rms_index + 1) % self.rms_window;
                (self.rms_sum / self.rms_window as f32).sqrt()
            }
        }
    }

    /// Reduction in dB (positive number) for a level in dB.
    #[inline]
    fn compute_reduction(&self, level_db: f32) -> f32 {
        let over = level_db - self.threshold_db;
        let knee_half = self.knee_db / 2.0;

        if over <= -knee_half {
            0.0
        } else if over >= knee_half || self.knee_db <= 0.0 {
            over * (1.0 - 1.0 / self.ratio)
        } else {
            let x = over + knee_half;
            x * x * (1.0 - 1.0 / self.ratio) / (2.0 * self.knee_db)
        }
    }

    /// Process one sample.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let level = self.detect(input);
        let level_db = math::linear_to_db(level);

        let coef = if level_db > self.envelope_db {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope_db = coef * self.envelope_db + (1.0 - coef) * level_db;

        let reduction = self.compute_reduction(self.envelope_db);
        self.gain_reduction_db = -reduction;

        input * math::db_to_linear(-reduction) * self.makeup_gain_linear
    }

    /// Process a block in place.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Return the envelope to the -60 dB floor and clear the detector.
    pub fn reset(&mut self) {
        self.envelope_db = math::DB_MIN;
        self.gain_reduction_db = 0.0;
        self.rms_buffer.fill(0.0);
        self.rms_sum = 0.0;
        self.rms_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    /// Square wave keeps |x| constant, so the envelope settles exactly
    /// on the input level and the static curve can be read off directly.
    fn feed_square(comp: &mut Compressor, peak: f32, samples: usize) -> f32 {
        let mut last = 0.0f32;
        for i in 0..samples {
            let x = if (i / 24) % 2 == 0 { peak } else { -peak };
            last = comp.process(x).abs();
        }
        last
    }

    #[test]
    fn test_below_threshold_is_transparent() {
        let mut comp = Compressor::new(SR);
        comp.set_threshold(-20.0);
        comp.set_knee(0.0);

        // -30 dB input sits well under the threshold.
        let peak = 10f32.powf(-30.0 / 20.0);
        let out = feed_square(&mut comp, peak, 48000);

        let out_db = 20.0 * out.log10();
        assert!(
            (out_db + 30.0).abs() < 0.01,
            "below-threshold level shifted to {} dB",
            out_db
        );
        assert!(comp.gain_reduction_db().abs() < 0.01);
    }

    #[test]
    fn test_static_curve_above_threshold() {
        let mut comp = Compressor::new(SR);
        comp.set_threshold(-20.0);
        comp.set_ratio(4.0);
        comp.set_knee(0.0);
        comp.set_attack(0.1);

        // 12 dB over threshold compresses down to threshold + 12/4.
        let peak = 10f32.powf(-8.0 / 20.0);
        let out = feed_square(&mut comp, peak, 96000);

        let out_db = 20.0 * out.log10();
        let expected = -20.0 + 12.0 / 4.0;
        assert!(
            (out_db - expected).abs() < 0.2,
            "steady-state output {} dB, expected {} dB",
            out_db,
            expected
        );
        assert!((comp.gain_reduction_db() + 9.0).abs() < 0.2);
    }

    #[test]
    fn test_soft_knee_is_gentler_than_hard() {
        let comp_hard = {
            let mut c = Compressor::new(SR);
            c.set_threshold(-20.0);
            c.set_ratio(4.0);
            c.set_knee(0.0);
            c
        };
        let comp_soft = {
            let mut c = Compressor::new(SR);
            c.set_threshold(-20.0);
            c.set_ratio(4.0);
            c.set_knee(12.0);
            c
        };

        // Inside the knee the quadratic curve reduces less.
        let hard = comp_hard.compute_reduction(-18.0);
        let soft = comp_soft.compute_reduction(-18.0);
        assert!(hard > 0.0);
        assert!(soft < hard);

        // At the threshold itself the soft knee already engages.
        let at_threshold = comp_soft.compute_reduction(-20.0);
        let expected = 6.0 * 6.0 * 0.75 / 24.0;
        assert!((at_threshold - expected).abs() < 1e-4);

        // Far above the knee both converge.
        let hard_far = comp_hard.compute_reduction(-2.0);
        let soft_far = comp_soft.compute_reduction(-2.0);
        assert!((hard_far - soft_far).abs() < 0.5);
    }

    #[test]
    fn test_auto_makeup_value() {
        let mut comp = Compressor::new(SR);
        comp.set_threshold(-24.0);
        comp.set_ratio(4.0);
        comp.set_auto_makeup(true);

        // |threshold| * (1 - 1/ratio) / 2 = 24 * 0.75 / 2 = 9 dB.
        assert!((comp.makeup_gain_db() - 9.0).abs() < 1e-4);

        // Changing ratio re-derives the makeup while auto is on.
        comp.set_ratio(2.0);
        assert!((comp.makeup_gain_db() - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_rms_detection_tracks_level() {
        let mut comp = Compressor::new(SR);
        comp.set_threshold(-20.0);
        comp.set_ratio(4.0);
        comp.set_knee(0.0);
        comp.set_attack(0.1);
        comp.set_detection_mode(DetectionMode::Rms);
        comp.set_rms_window(10.0);

        let peak = 10f32.powf(-8.0 / 20.0);
        feed_square(&mut comp, peak, 96000);

        // Square-wave RMS equals its peak, so RMS detection lands on the
        // same static curve point.
        assert!((comp.gain_reduction_db() + 9.0).abs() < 0.3);
    }

    #[test]
    fn test_envelope_floor_after_reset() {
        let mut comp = Compressor::new(SR);
        feed_square(&mut comp, 0.5, 4800);
        comp.reset();

        assert_eq!(comp.gain_reduction_db(), 0.0);
        assert!(comp.envelope_db >= math::DB_MIN);

        // Zero input stays zero after reset.
        assert_eq!(comp.process(0.0), 0.0);
    }

    #[test]
    fn test_parameter_clamping() {
        let mut comp = Compressor::new(SR);
        comp.set_threshold(-100.0);
        assert_eq!(comp.threshold_db(), -60.0);
        comp.set_ratio(0.5);
        assert_eq!(comp.ratio(), 1.0);
        comp.set_ratio(100.0);
        assert_eq!(comp.ratio(), 20.0);
        comp.set_makeup_gain(-5.0);
        assert_eq!(comp.makeup_gain_db(), 0.0);
        comp.set_makeup_gain(30.0);
        assert_eq!(comp.makeup_gain_db(), 24.0);
    }
}
