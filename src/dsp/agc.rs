//! Automatic gain control with sliding-window RMS detection
//!
//! Tracks the input level over a configurable window and steers the
//! applied gain toward a target level. Below the noise threshold the
//! gain update freezes so silence is not pumped up to the target.
//!
//! Time constants are given in seconds and converted at the configured
//! sample rate, so behavior is identical across rates and block sizes.

use super::math;

/// Window buffer covers the 2 s maximum at this many samples per second.
/// Preallocated so window changes never allocate.
const MAX_WINDOW_SECONDS: f32 = 2.0;

/// Automatic gain controller.
pub struct Agc {
    sample_rate: f32,

    target_level_db: f32,
    max_gain_db: f32,
    min_gain_db: f32,
    noise_threshold_db: f32,

    attack_coef: f32,
    release_coef: f32,

    /// Squared-sample history for the sliding RMS window.
    rms_buffer: Vec<f32>,
    window_size: usize,
    write_index: usize,
    rms_sum: f32,

    current_gain_db: f32,
    current_level_db: f32,
    frozen: bool,
}

impl Agc {
    /// Create an AGC with voice defaults: target -20 dBFS, gain range
    /// [-10, +25] dB, noise threshold -55 dBFS, 0.5 s window.
    pub fn new(sample_rate: f32) -> Self {
        let max_window = (MAX_WINDOW_SECONDS * sample_rate) as usize;
        let mut agc = Self {
            sample_rate,
            target_level_db: -20.0,
            max_gain_db: 25.0,
            min_gain_db: -10.0,
            noise_threshold_db: -55.0,
            attack_coef: 0.0,
            release_coef: 0.0,
            rms_buffer: vec![0.0; max_window.max(1)],
            window_size: ((0.5 * sample_rate) as usize).max(1),
            write_index: 0,
            rms_sum: 0.0,
            current_gain_db: 0.0,
            current_level_db: math::DB_MIN,
            frozen: false,
        };
        agc.set_attack_time(5.0);
        agc.set_release_time(20.0);
        agc
    }

    /// Target output level, clamped to [-60, 0] dBFS.
    pub fn set_target_level(&mut self, dbfs: f32) {
        self.target_level_db = dbfs.clamp(-60.0, 0.0);
    }

    /// Maximum boost, clamped to [0, 30] dB.
    pub fn set_max_gain(&mut self, db: f32) {
        self.max_gain_db = db.clamp(0.0, 30.0);
    }

    /// Maximum attenuation, clamped to [-40, 0] dB.
    pub fn set_min_gain(&mut self, db: f32) {
        self.min_gain_db = db.clamp(-40.0, 0.0);
    }

    /// Level below which the gain update freezes, clamped to
    /// [-80, -30] dBFS.
    pub fn set_noise_threshold(&mut self, dbfs: f32) {
        self.noise_threshold_db = dbfs.clamp(-80.0, -30.0);
    }

    /// Attack time constant in seconds, floored at 0.1 s.
    pub fn set_attack_time(&mut self, seconds: f32) {
        self.attack_coef = math::seconds_to_coeff(seconds.max(0.1), self.sample_rate);
    }

    /// Release time constant in seconds, floored at 0.5 s.
    pub fn set_release_time(&mut self, seconds: f32) {
        self.release_coef = math::seconds_to_coeff(seconds.max(0.5), self.sample_rate);
    }

    /// RMS window length in seconds, clamped to [0.1, 2.0]. Resets the
    /// detector state.
    pub fn set_window_size(&mut self, seconds: f32) {
        let seconds = seconds.clamp(0.1, MAX_WINDOW_SECONDS);
        self.window_size = ((seconds * self.sample_rate) as usize)
            .clamp(1, self.rms_buffer.len());
        self.reset();
    }

    /// Applied gain in dB, for metering.
    pub fn current_gain_db(&self) -> f32 {
        self.current_gain_db
    }

    /// Detected input level in dB, for metering.
    pub fn current_level_db(&self) -> f32 {
        self.current_level_db
    }

    /// True while the level sits below the noise threshold and the gain
    /// is held.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Process one sample.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let input = input.clamp(-1.0, 1.0);

        // Sliding RMS: replace the oldest squared sample in the window.
        let new_sq = input * input;
        let old_sq = self.rms_buffer[self.write_index];
        self.rms_buffer[self.write_index] = new_sq;
        self.rms_sum += new_sq - old_sq;
        if self.rms_sum < 0.0 {
            self.rms_sum = 0.0;
        }
        self.write_index = (self.write_index + 1) % self.window_size;

        let rms = (self.rms_sum / self.window_size as f32 + 1e-10).sqrt();
        self.current_level_db = math::linear_to_db(rms);

        // Below the noise floor: hold the current gain.
        if self.current_level_db < self.noise_threshold_db {
            self.frozen = true;
            let output = input * math::db_to_linear(self.current_gain_db);
            return output.clamp(-0.95, 0.95);
        }
        self.frozen = false;

        let error = self.target_level_db - self.current_level_db;
        let target_gain_db = error.clamp(self.min_gain_db, self.max_gain_db);

        let coef = if target_gain_db > self.current_gain_db {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.current_gain_db = coef * self.current_gain_db + (1.0 - coef) * target_gain_db;

        let output = input * math::db_to_linear(self.current_gain_db);
        output.clamp(-0.95, 0.95)
    }

    /// Process a block in place.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Clear the detector window and return the gain to unity.
    pub fn reset(&mut self) {
        self.rms_buffer.fill(0.0);
        self.rms_sum = 0.0;
        self.write_index = 0;
        self.current_gain_db = 0.0;
        self.current_level_db = math::DB_MIN;
        self.frozen = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    fn rms_db(samples: &[f32]) -> f32 {
        let mean_sq = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        10.0 * (mean_sq + 1e-20).log10()
    }

    fn feed_sine(agc: &mut Agc, peak: f32, freq: f32, seconds: f32) -> Vec<f32> {
        let n = (seconds * SR) as usize;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let t = i as f32 / SR;
            let x = peak * (2.0 * std::f32::consts::PI * freq * t).sin();
            out.push(agc.process(x));
        }
        out
    }

    #[test]
    fn test_quiet_input_converges_to_target() {
        let mut agc = Agc::new(SR);
        agc.set_target_level(-20.0);
        agc.set_attack_time(0.1);
        agc.set_release_time(0.5);
        agc.set_window_size(0.1);

        // -40 dBFS peak sine needs roughly +23 dB of boost.
        let out = feed_sine(&mut agc, 0.01, 1000.0, 3.0);
        let tail = &out[out.len() - 24000..];
        let level = rms_db(tail);
        assert!(
            (level + 20.0).abs() < 1.0,
            "output settled at {} dBFS instead of -20",
            level
        );
    }

    #[test]
    fn test_on_target_input_stays_near_unity() {
        let mut agc = Agc::new(SR);
        agc.set_target_level(-20.0);
        agc.set_attack_time(0.1);
        agc.set_release_time(0.5);
        agc.set_window_size(0.1);

        // RMS of a sine is peak - 3 dB, so a -17 dBFS peak sits at the
        // -20 dBFS RMS target already.
        let peak = 10f32.powf(-17.0 / 20.0);
        let out = feed_sine(&mut agc, peak, 1000.0, 3.0);
        let level = rms_db(&out[out.len() - 24000..]);
        assert!(
            (level + 20.0).abs() < 1.0,
            "near-target input drifted to {} dBFS",
            level
        );
    }

    #[test]
    fn test_gain_respects_max() {
        let mut agc = Agc::new(SR);
        agc.set_target_level(-10.0);
        agc.set_max_gain(6.0);
        agc.set_attack_time(0.1);
        agc.set_window_size(0.1);

        // Very quiet input would need far more than 6 dB.
        feed_sine(&mut agc, 0.005, 1000.0, 2.0);
        assert!(agc.current_gain_db() <= 6.0 + 0.01);
    }

    #[test]
    fn test_noise_threshold_freezes_gain() {
        let mut agc = Agc::new(SR);
        agc.set_noise_threshold(-50.0);
        agc.set_attack_time(0.1);
        agc.set_window_size(0.1);

        // Loud enough to move gain, then near-silence. The first quiet
        // stretch lets the detector window drain past the threshold.
        feed_sine(&mut agc, 0.1, 1000.0, 1.0);
        feed_sine(&mut agc, 0.0001, 1000.0, 0.5);
        assert!(agc.is_frozen());

        let gain_frozen = agc.current_gain_db();
        feed_sine(&mut agc, 0.0001, 1000.0, 1.0);
        assert!(agc.is_frozen());
        assert!((agc.current_gain_db() - gain_frozen).abs() < 1e-3);
    }

    #[test]
    fn test_output_clamped() {
        let mut agc = Agc::new(SR);
        agc.set_target_level(0.0);
        agc.set_max_gain(30.0);
        agc.set_attack_time(0.1);
        agc.set_window_size(0.1);

        let out = feed_sine(&mut agc, 0.9, 100.0, 1.0);
        assert!(out.iter().all(|s| s.abs() <= 0.95));
    }

    #[test]
    fn test_reset_restores_unity() {
        let mut agc = Agc::new(SR);
        agc.set_attack_time(0.1);
        feed_sine(&mut agc, 0.005, 1000.0, 1.0);
        agc.reset();

        assert_eq!(agc.current_gain_db(), 0.0);
        assert!(!agc.is_frozen());
        assert_eq!(agc.process(0.0), 0.0);
    }

    #[test]
    fn test_parameter_clamping() {
        let mut agc = Agc::new(SR);
        agc.set_target_level(10.0);
        assert_eq!(agc.target_level_db, 0.0);
        agc.set_target_level(-100.0);
        assert_eq!(agc.target_level_db, -60.0);
        agc.set_max_gain(50.0);
        assert_eq!(agc.max_gain_db, 30.0);
        agc.set_min_gain(-60.0);
        assert_eq!(agc.min_gain_db, -40.0);
        agc.set_noise_threshold(0.0);
        assert_eq!(agc.noise_threshold_db, -30.0);
    }
}
