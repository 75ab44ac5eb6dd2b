//! Voice processing chain and its control-surface parameter block
//!
//! The chain owns the per-module DSP state and runs on the audio
//! thread. The host mutates a shared block of atomics and bumps an
//! epoch counter; the chain notices the epoch once per block, loads a
//! consistent snapshot, and applies only the fields that changed. That
//! keeps every parameter observable within one block of the store
//! without the audio thread ever taking a lock.
//!
//! Chain order: AGC -> EQ -> voice gain -> noise canceller ->
//! compressor -> limiter. In safe mode only the limiter runs.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use super::agc::Agc;
use super::canceller::NoiseCanceller;
use super::compressor::{Compressor, DetectionMode};
use super::eq::{Equalizer, NUM_BANDS};
use super::limiter::Limiter;
use super::math;

/// Voice gain range in dB.
pub const MAX_VOICE_GAIN_DB: f32 = 12.0;

#[inline]
fn store_f32(slot: &AtomicU32, value: f32) {
    slot.store(value.to_bits(), Ordering::Relaxed);
}

#[inline]
fn load_f32(slot: &AtomicU32) -> f32 {
    f32::from_bits(slot.load(Ordering::Relaxed))
}

/// Shared parameter block. Written by the control thread, read by the
/// audio thread once per block when the epoch moved.
pub struct ChainParams {
    epoch: AtomicU32,

    pub agc_enabled: AtomicBool,
    pub eq_enabled: AtomicBool,
    pub canceller_enabled: AtomicBool,
    pub compressor_enabled: AtomicBool,
    pub limiter_enabled: AtomicBool,
    pub bypass: AtomicBool,

    voice_gain_db: AtomicU32,

    agc_target_db: AtomicU32,
    agc_max_gain_db: AtomicU32,
    agc_min_gain_db: AtomicU32,
    agc_noise_threshold_db: AtomicU32,
    agc_attack_s: AtomicU32,
    agc_release_s: AtomicU32,
    agc_window_s: AtomicU32,

    comp_threshold_db: AtomicU32,
    comp_ratio: AtomicU32,
    comp_attack_ms: AtomicU32,
    comp_release_ms: AtomicU32,
    comp_knee_db: AtomicU32,
    comp_makeup_db: AtomicU32,
    comp_auto_makeup: AtomicBool,
    comp_detection: AtomicU8,
    comp_rms_window_ms: AtomicU32,

    limiter_threshold_db: AtomicU32,
    limiter_release_ms: AtomicU32,
    limiter_lookahead_ms: AtomicU32,

    /// Band gains mirrored here so they survive engine restarts and are
    /// readable before the EQ exists.
    eq_band_gains_db: [AtomicU32; NUM_BANDS],
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            agc_enabled: AtomicBool::new(false),
            eq_enabled: AtomicBool::new(false),
            canceller_enabled: AtomicBool::new(false),
            compressor_enabled: AtomicBool::new(false),
            limiter_enabled: AtomicBool::new(true),
            bypass: AtomicBool::new(false),
            voice_gain_db: AtomicU32::new(0.0f32.to_bits()),
            agc_target_db: AtomicU32::new((-20.0f32).to_bits()),
            agc_max_gain_db: AtomicU32::new(25.0f32.to_bits()),
            agc_min_gain_db: AtomicU32::new((-10.0f32).to_bits()),
            agc_noise_threshold_db: AtomicU32::new((-55.0f32).to_bits()),
            agc_attack_s: AtomicU32::new(5.0f32.to_bits()),
            agc_release_s: AtomicU32::new(20.0f32.to_bits()),
            agc_window_s: AtomicU32::new(0.5f32.to_bits()),
            comp_threshold_db: AtomicU32::new((-20.0f32).to_bits()),
            comp_ratio: AtomicU32::new(4.0f32.to_bits()),
            comp_attack_ms: AtomicU32::new(10.0f32.to_bits()),
            comp_release_ms: AtomicU32::new(200.0f32.to_bits()),
            comp_knee_db: AtomicU32::new(6.0f32.to_bits()),
            comp_makeup_db: AtomicU32::new(0.0f32.to_bits()),
            comp_auto_makeup: AtomicBool::new(false),
            comp_detection: AtomicU8::new(0),
            comp_rms_window_ms: AtomicU32::new(10.0f32.to_bits()),
            limiter_threshold_db: AtomicU32::new((-1.0f32).to_bits()),
            limiter_release_ms: AtomicU32::new(50.0f32.to_bits()),
            limiter_lookahead_ms: AtomicU32::new(0.0f32.to_bits()),
            eq_band_gains_db: std::array::from_fn(|_| AtomicU32::new(0.0f32.to_bits())),
        }
    }
}

impl ChainParams {
    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    // Voice gain

    pub fn set_voice_gain_db(&self, db: f32) {
        store_f32(
            &self.voice_gain_db,
            db.clamp(-MAX_VOICE_GAIN_DB, MAX_VOICE_GAIN_DB),
        );
    }

    pub fn voice_gain_db(&self) -> f32 {
        load_f32(&self.voice_gain_db)
    }

    // AGC

    pub fn set_agc_target_level(&self, dbfs: f32) {
        store_f32(&self.agc_target_db, dbfs);
        self.bump();
    }

    pub fn set_agc_max_gain(&self, db: f32) {
        store_f32(&self.agc_max_gain_db, db);
        self.bump();
    }

    pub fn set_agc_min_gain(&self, db: f32) {
        store_f32(&self.agc_min_gain_db, db);
        self.bump();
    }

    pub fn set_agc_noise_threshold(&self, dbfs: f32) {
        store_f32(&self.agc_noise_threshold_db, dbfs);
        self.bump();
    }

    pub fn set_agc_attack_time(&self, seconds: f32) {
        store_f32(&self.agc_attack_s, seconds);
        self.bump();
    }

    pub fn set_agc_release_time(&self, seconds: f32) {
        store_f32(&self.agc_release_s, seconds);
        self.bump();
    }

    pub fn set_agc_window_size(&self, seconds: f32) {
        store_f32(&self.agc_window_s, seconds);
        self.bump();
    }

    // Compressor

    pub fn set_compressor_threshold(&self, db: f32) {
        store_f32(&self.comp_threshold_db, db);
        self.bump();
    }

    pub fn set_compressor_ratio(&self, ratio: f32) {
        store_f32(&self.comp_ratio, ratio);
        self.bump();
    }

    pub fn set_compressor_attack(&self, ms: f32) {
        store_f32(&self.comp_attack_ms, ms);
        self.bump();
    }

    pub fn set_compressor_release(&self, ms: f32) {
        store_f32(&self.comp_release_ms, ms);
        self.bump();
    }

    pub fn set_compressor_knee(&self, db: f32) {
        store_f32(&self.comp_knee_db, db);
        self.bump();
    }

    pub fn set_compressor_makeup(&self, db: f32) {
        store_f32(&self.comp_makeup_db, db);
        self.bump();
    }

    pub fn set_compressor_auto_makeup(&self, enabled: bool) {
        self.comp_auto_makeup.store(enabled, Ordering::Relaxed);
        self.bump();
    }

    pub fn set_compressor_detection(&self, mode: DetectionMode) {
        let raw = match mode {
            DetectionMode::Peak => 0,
            DetectionMode::Rms => 1,
        };
        self.comp_detection.store(raw, Ordering::Relaxed);
        self.bump();
    }

    pub fn compressor_detection(&self) -> DetectionMode {
        match self.comp_detection.load(Ordering::Relaxed) {
            1 => DetectionMode::Rms,
            _ => DetectionMode::Peak,
        }
    }

    pub fn set_compressor_rms_window(&self, ms: f32) {
        store_f32(&self.comp_rms_window_ms, ms);
        self.bump();
    }

    // Limiter

    pub fn set_limiter_threshold(&self, db: f32) {
        store_f32(&self.limiter_threshold_db, db);
        self.bump();
    }

    pub fn set_limiter_release(&self, ms: f32) {
        store_f32(&self.limiter_release_ms, ms);
        self.bump();
    }

    pub fn set_limiter_lookahead(&self, ms: f32) {
        store_f32(&self.limiter_lookahead_ms, ms);
        self.bump();
    }

    // EQ band gain mirror

    pub fn set_eq_band_gain(&self, band: usize, gain_db: f32) {
        if band < NUM_BANDS {
            store_f32(&self.eq_band_gains_db[band], gain_db.clamp(-12.0, 12.0));
        }
    }

    pub fn eq_band_gain(&self, band: usize) -> f32 {
        if band < NUM_BANDS {
            load_f32(&self.eq_band_gains_db[band])
        } else {
            0.0
        }
    }
}

/// Plain copy of the tunable fields, used for change detection so a
/// single setter does not re-apply (and reset) unrelated modules.
#[derive(Clone, Copy, PartialEq)]
struct ParamsSnapshot {
    agc_target_db: f32,
    agc_max_gain_db: f32,
    agc_min_gain_db: f32,
    agc_noise_threshold_db: f32,
    agc_attack_s: f32,
    agc_release_s: f32,
    agc_window_s: f32,

    comp_threshold_db: f32,
    comp_ratio: f32,
    comp_attack_ms: f32,
    comp_release_ms: f32,
    comp_knee_db: f32,
    comp_makeup_db: f32,
    comp_auto_makeup: bool,
    comp_detection: DetectionMode,
    comp_rms_window_ms: f32,

    limiter_threshold_db: f32,
    limiter_release_ms: f32,
    limiter_lookahead_ms: f32,
}

impl ParamsSnapshot {
    fn load(params: &ChainParams) -> Self {
        Self {
            agc_target_db: load_f32(&params.agc_target_db),
            agc_max_gain_db: load_f32(&params.agc_max_gain_db),
            agc_min_gain_db: load_f32(&params.agc_min_gain_db),
            agc_noise_threshold_db: load_f32(&params.agc_noise_threshold_db),
            agc_attack_s: load_f32(&params.agc_attack_s),
            agc_release_s: load_f32(&params.agc_release_s),
            agc_window_s: load_f32(&params.agc_window_s),
            comp_threshold_db: load_f32(&params.comp_threshold_db),
            comp_ratio: load_f32(&params.comp_ratio),
            comp_attack_ms: load_f32(&params.comp_attack_ms),
            comp_release_ms: load_f32(&params.comp_release_ms),
            comp_knee_db: load_f32(&params.comp_knee_db),
            comp_makeup_db: load_f32(&params.comp_makeup_db),
            comp_auto_makeup: params.comp_auto_makeup.load(Ordering::Relaxed),
            comp_detection: params.compressor_detection(),
            comp_rms_window_ms: load_f32(&params.comp_rms_window_ms),
            limiter_threshold_db: load_f32(&params.limiter_threshold_db),
            limiter_release_ms: load_f32(&params.limiter_release_ms),
            limiter_lookahead_ms: load_f32(&params.limiter_lookahead_ms),
        }
    }
}

/// Per-module meters published from the audio thread.
#[derive(Default)]
pub struct ChainMonitor {
    agc_gain_db: AtomicU32,
    agc_level_db: AtomicU32,
    agc_frozen: AtomicBool,
    compressor_reduction_db: AtomicU32,
    limiter_reduction_db: AtomicU32,
}

impl ChainMonitor {
    pub fn agc_gain_db(&self) -> f32 {
        load_f32(&self.agc_gain_db)
    }

    pub fn agc_level_db(&self) -> f32 {
        load_f32(&self.agc_level_db)
    }

    pub fn agc_frozen(&self) -> bool {
        self.agc_frozen.load(Ordering::Relaxed)
    }

    pub fn compressor_reduction_db(&self) -> f32 {
        load_f32(&self.compressor_reduction_db)
    }

    pub fn limiter_reduction_db(&self) -> f32 {
        load_f32(&self.limiter_reduction_db)
    }
}

/// The DSP chain proper. Owned by the audio callback.
pub struct VoiceChain {
    agc: Agc,
    eq: Arc<Equalizer>,
    canceller: Box<dyn NoiseCanceller>,
    compressor: Compressor,
    limiter: Limiter,

    params: Arc<ChainParams>,
    monitor: Arc<ChainMonitor>,
    applied: ParamsSnapshot,
    seen_epoch: u32,
}

impl VoiceChain {
    pub fn new(
        sample_rate: u32,
        eq: Arc<Equalizer>,
        mut canceller: Box<dyn NoiseCanceller>,
        params: Arc<ChainParams>,
        monitor: Arc<ChainMonitor>,
    ) -> Self {
        let sr = sample_rate as f32;
        let agc = Agc::new(sr);
        let compressor = Compressor::new(sr);
        let limiter = Limiter::new(sr);
        canceller.configure(sample_rate);

        // Pick up whatever the host configured before start.
        for band in 0..NUM_BANDS {
            eq.set_band_gain(band, params.eq_band_gain(band));
        }

        let mut chain = Self {
            agc,
            eq,
            canceller,
            compressor,
            limiter,
            seen_epoch: params.epoch(),
            applied: ParamsSnapshot::load(&params),
            params,
            monitor,
        };
        chain.apply_all();
        chain
    }

    fn apply_all(&mut self) {
        let s = self.applied;
        self.agc.set_target_level(s.agc_target_db);
        self.agc.set_max_gain(s.agc_max_gain_db);
        self.agc.set_min_gain(s.agc_min_gain_db);
        self.agc.set_noise_threshold(s.agc_noise_threshold_db);
        self.agc.set_attack_time(s.agc_attack_s);
        self.agc.set_release_time(s.agc_release_s);
        self.agc.set_window_size(s.agc_window_s);
        self.compressor.set_threshold(s.comp_threshold_db);
        self.compressor.set_ratio(s.comp_ratio);
        self.compressor.set_attack(s.comp_attack_ms);
        self.compressor.set_release(s.comp_release_ms);
        self.compressor.set_knee(s.comp_knee_db);
        self.compressor.set_auto_makeup(s.comp_auto_makeup);
        self.compressor.set_makeup_gain(s.comp_makeup_db);
        self.compressor.set_detection_mode(s.comp_detection);
        self.compressor.set_rms_window(s.comp_rms_window_ms);
        self.limiter.set_threshold(s.limiter_threshold_db);
        self.limiter.set_release(s.limiter_release_ms);
        self.limiter.set_lookahead(s.limiter_lookahead_ms);
    }

    /// Diff the shared parameters against the applied snapshot and push
    /// only the changed fields into the modules. Field-level diffing
    /// matters: blanket re-application would reset detector windows and
    /// the lookahead line on every unrelated change.
    fn refresh_params(&mut self) {
        let epoch = self.params.epoch();
        if epoch == self.seen_epoch {
            return;
        }
        self.seen_epoch = epoch;

        let next = ParamsSnapshot::load(&self.params);
        let prev = self.applied;
        if next == prev {
            return;
        }

        if next.agc_target_db != prev.agc_target_db {
            self.agc.set_target_level(next.agc_target_db);
        }
        if next.agc_max_gain_db != prev.agc_max_gain_db {
            self.agc.set_max_gain(next.agc_max_gain_db);
        }
        if next.agc_min_gain_db != prev.agc_min_gain_db {
            self.agc.set_min_gain(next.agc_min_gain_db);
        }
        if next.agc_noise_threshold_db != prev.agc_noise_threshold_db {
            self.agc.set_noise_threshold(next.agc_noise_threshold_db);
        }
        if next.agc_attack_s != prev.agc_attack_s {
            self.agc.set_attack_time(next.agc_attack_s);
        }
        if next.agc_release_s != prev.agc_release_s {
            self.agc.set_release_time(next.agc_release_s);
        }
        if next.agc_window_s != prev.agc_window_s {
            self.agc.set_window_size(next.agc_window_s);
        }

        if next.comp_threshold_db != prev.comp_threshold_db {
            self.compressor.set_threshold(next.comp_threshold_db);
        }
        if next.comp_ratio != prev.comp_ratio {
            self.compressor.set_ratio(next.comp_ratio);
        }
        if next.comp_attack_ms != prev.comp_attack_ms {
            self.compressor.set_attack(next.comp_attack_ms);
        }
        if next.comp_release_ms != prev.comp_release_ms {
            self.compressor.set_release(next.comp_release_ms);
        }
        if next.comp_knee_db != prev.comp_knee_db {
            self.compressor.set_knee(next.comp_knee_db);
        }
        if next.comp_auto_makeup != prev.comp_auto_makeup {
            self.compressor.set_auto_makeup(next.comp_auto_makeup);
        }
        if next.comp_makeup_db != prev.comp_makeup_db {
            self.compressor.set_makeup_gain(next.comp_makeup_db);
        }
        if next.comp_detection != prev.comp_detection {
            self.compressor.set_detection_mode(next.comp_detection);
        }
        if next.comp_rms_window_ms != prev.comp_rms_window_ms {
            self.compressor.set_rms_window(next.comp_rms_window_ms);
        }

        if next.limiter_threshold_db != prev.limiter_threshold_db {
            self.limiter.set_threshold(next.limiter_threshold_db);
        }
        if next.limiter_release_ms != prev.limiter_release_ms {
            self.limiter.set_release(next.limiter_release_ms);
        }
        if next.limiter_lookahead_ms != prev.limiter_lookahead_ms {
            self.limiter.set_lookahead(next.limiter_lookahead_ms);
        }

        self.applied = next;
    }

    /// Run the chain over one block in place. `safe_mode` short-circuits
    /// everything but the limiter.
    pub fn process_block(&mut self, buffer: &mut [f32], safe_mode: bool) {
        self.refresh_params();

        if self.params.bypass.load(Ordering::Relaxed) {
            self.publish_idle_monitors();
            return;
        }

        if safe_mode {
            store_f32(&self.monitor.agc_gain_db, 0.0);
            store_f32(&self.monitor.compressor_reduction_db, 0.0);
            if self.params.limiter_enabled.load(Ordering::Relaxed) {
                self.limiter.process_block(buffer);
                store_f32(
                    &self.monitor.limiter_reduction_db,
                    self.limiter.gain_reduction_db(),
                );
            } else {
                store_f32(&self.monitor.limiter_reduction_db, 0.0);
            }
            return;
        }

        if self.params.agc_enabled.load(Ordering::Relaxed) {
            self.agc.process_block(buffer);
            store_f32(&self.monitor.agc_gain_db, self.agc.current_gain_db());
            store_f32(&self.monitor.agc_level_db, self.agc.current_level_db());
            self.monitor
                .agc_frozen
                .store(self.agc.is_frozen(), Ordering::Relaxed);
        } else {
            store_f32(&self.monitor.agc_gain_db, 0.0);
        }

        if self.params.eq_enabled.load(Ordering::Relaxed) {
            self.eq.process_block(buffer);
        }

        let voice_gain_db = self.params.voice_gain_db();
        if voice_gain_db != 0.0 {
            let gain = math::db_to_linear(voice_gain_db);
            for sample in buffer.iter_mut() {
                *sample *= gain;
            }
        }

        if self.params.canceller_enabled.load(Ordering::Relaxed) {
            self.canceller.process_block(buffer);
        }

        if self.params.compressor_enabled.load(Ordering::Relaxed) {
            self.compressor.process_block(buffer);
            store_f32(
                &self.monitor.compressor_reduction_db,
                self.compressor.gain_reduction_db(),
            );
        } else {
            store_f32(&self.monitor.compressor_reduction_db, 0.0);
        }

        if self.params.limiter_enabled.load(Ordering::Relaxed) {
            self.limiter.process_block(buffer);
            store_f32(
                &self.monitor.limiter_reduction_db,
                self.limiter.gain_reduction_db(),
            );
        } else {
            store_f32(&self.monitor.limiter_reduction_db, 0.0);
        }
    }

    fn publish_idle_monitors(&self) {
        store_f32(&self.monitor.agc_gain_db, 0.0);
        store_f32(&self.monitor.compressor_reduction_db, 0.0);
        store_f32(&self.monitor.limiter_reduction_db, 0.0);
    }

    /// Reset every module. Control thread only, engine stopped.
    pub fn reset(&mut self) {
        self.agc.reset();
        self.eq.reset();
        self.canceller.reset();
        self.compressor.reset();
        self.limiter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::canceller::PassthroughCanceller;

    const SR: u32 = 48000;

    fn make_chain() -> (VoiceChain, Arc<ChainParams>, Arc<ChainMonitor>) {
        let params = Arc::new(ChainParams::default());
        let monitor = Arc::new(ChainMonitor::default());
        let eq = Arc::new(Equalizer::new(SR as f32));
        let chain = VoiceChain::new(
            SR,
            eq,
            Box::new(PassthroughCanceller),
            Arc::clone(&params),
            Arc::clone(&monitor),
        );
        (chain, params, monitor)
    }

    fn sine_block(freq: f32, peak: f32, offset: usize, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = (offset + i) as f32 / SR as f32;
                peak * (2.0 * std::f32::consts::PI * freq * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_all_disabled_is_identity() {
        let (mut chain, params, _) = make_chain();
        params.limiter_enabled.store(false, Ordering::Relaxed);

        let mut block = sine_block(1000.0, 0.5, 0, 512);
        let expected = block.clone();
        chain.process_block(&mut block, false);
        assert_eq!(block, expected);
    }

    #[test]
    fn test_voice_gain_applies_linear_multiply() {
        let (mut chain, params, _) = make_chain();
        params.limiter_enabled.store(false, Ordering::Relaxed);
        params.set_voice_gain_db(6.0);

        let mut block = vec![0.1f32; 256];
        chain.process_block(&mut block, false);

        let expected = 0.1 * math::db_to_linear(6.0);
        assert!((block[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_voice_gain_clamped() {
        let params = ChainParams::default();
        params.set_voice_gain_db(40.0);
        assert_eq!(params.voice_gain_db(), MAX_VOICE_GAIN_DB);
        params.set_voice_gain_db(-40.0);
        assert_eq!(params.voice_gain_db(), -MAX_VOICE_GAIN_DB);
    }

    #[test]
    fn test_safe_mode_runs_limiter_only() {
        let (mut chain, params, monitor) = make_chain();
        params.agc_enabled.store(true, Ordering::Relaxed);
        params.compressor_enabled.store(true, Ordering::Relaxed);
        params.limiter_enabled.store(true, Ordering::Relaxed);
        params.set_limiter_threshold(-6.0);
        params.set_voice_gain_db(12.0);

        let ceiling = 10f32.powf(-6.0 / 20.0);
        let mut offset = 0;
        for _ in 0..20 {
            let mut block = sine_block(440.0, 0.9, offset, 480);
            offset += 480;
            chain.process_block(&mut block, true);
            for &s in &block {
                assert!(s.abs() <= ceiling * 1.01);
            }
        }

        // Only the limiter reported activity; the voice gain and the
        // other stages were skipped.
        assert!(monitor.limiter_reduction_db() < -2.0);
        assert_eq!(monitor.compressor_reduction_db(), 0.0);
        assert_eq!(monitor.agc_gain_db(), 0.0);
    }

    #[test]
    fn test_safe_mode_with_limiter_disabled_is_passthrough() {
        let (mut chain, params, _) = make_chain();
        params.limiter_enabled.store(false, Ordering::Relaxed);

        let mut block = sine_block(440.0, 0.9, 0, 256);
        let expected = block.clone();
        chain.process_block(&mut block, true);
        assert_eq!(block, expected);
    }

    #[test]
    fn test_bypass_skips_everything() {
        let (mut chain, params, _) = make_chain();
        params.limiter_enabled.store(true, Ordering::Relaxed);
        params.compressor_enabled.store(true, Ordering::Relaxed);
        params.bypass.store(true, Ordering::Relaxed);

        let mut block = sine_block(440.0, 0.9, 0, 256);
        let expected = block.clone();
        chain.process_block(&mut block, false);
        assert_eq!(block, expected);
    }

    #[test]
    fn test_epoch_change_applies_within_one_block() {
        let (mut chain, params, monitor) = make_chain();
        params.limiter_enabled.store(true, Ordering::Relaxed);
        params.set_limiter_threshold(-12.0);

        let mut block = vec![0.9f32; 480];
        chain.process_block(&mut block, false);
        let reduction = monitor.limiter_reduction_db();
        assert!(reduction < -8.0, "threshold change not applied: {}", reduction);
    }

    #[test]
    fn test_unrelated_setter_keeps_limiter_delay_line() {
        let (mut chain, params, _) = make_chain();
        params.limiter_enabled.store(true, Ordering::Relaxed);
        params.set_limiter_lookahead(5.0);

        let mut block = vec![0.2f32; 480];
        chain.process_block(&mut block, false);

        // An AGC tweak must not zero the limiter's delay line; the next
        // block comes out continuous, not silent at its head.
        params.set_agc_target_level(-18.0);
        let mut next = vec![0.2f32; 480];
        chain.process_block(&mut next, false);
        assert!(next[0].abs() > 0.1, "delay line was reset: {}", next[0]);
    }

    #[test]
    fn test_compressor_enable_flag_per_block() {
        let (mut chain, params, monitor) = make_chain();
        params.limiter_enabled.store(false, Ordering::Relaxed);
        params.compressor_enabled.store(true, Ordering::Relaxed);
        params.set_compressor_threshold(-30.0);
        params.set_compressor_knee(0.0);
        params.set_compressor_attack(0.1);

        let mut offset = 0;
        for _ in 0..50 {
            let mut block = sine_block(440.0, 0.5, offset, 480);
            offset += 480;
            chain.process_block(&mut block, false);
        }
        assert!(monitor.compressor_reduction_db() < -1.0);

        params.compressor_enabled.store(false, Ordering::Relaxed);
        let mut block = sine_block(440.0, 0.5, offset, 480);
        chain.process_block(&mut block, false);
        assert_eq!(monitor.compressor_reduction_db(), 0.0);
    }
}
