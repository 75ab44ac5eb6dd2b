//! Host-facing pipeline surface
//!
//! `VoicePipeline` wires the engine, the transport router, the DSP
//! chain, and the parameter block together and exposes the control and
//! monitoring operations the host calls. Every setter publishes an
//! atomic and returns; every getter reads an atomic and returns. The
//! Python wrapper at the bottom mirrors the Rust surface one-to-one.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pyo3::prelude::*;

use crate::audio::engine::{AudioEngine, EngineError, EngineMonitor, StreamSpec};
use crate::audio::latency::LatencyShared;
use crate::audio::transport::{SafeModeState, TransportRouter};
use crate::dsp::canceller::{NoiseCanceller, PassthroughCanceller};
use crate::dsp::chain::{ChainMonitor, ChainParams, VoiceChain};
use crate::dsp::compressor::DetectionMode;
use crate::dsp::eq::{Equalizer, NUM_BANDS};

/// The assembled voice pipeline: one engine, one chain, one control
/// surface. The host holds exactly one of these.
pub struct VoicePipeline {
    engine: AudioEngine,
    router: Arc<TransportRouter>,
    params: Arc<ChainParams>,
    chain_monitor: Arc<ChainMonitor>,
    monitor: Arc<EngineMonitor>,
    latency: Arc<LatencyShared>,
    /// Built at start with the negotiated rate.
    eq: Option<Arc<Equalizer>>,
    /// Staged canceller, consumed by the next start.
    canceller: Option<Box<dyn NoiseCanceller>>,
}

impl Default for VoicePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl VoicePipeline {
    pub fn new() -> Self {
        let router = Arc::new(TransportRouter::new());
        let engine = AudioEngine::new(Arc::clone(&router));
        let monitor = engine.monitor();
        let latency = engine.latency();
        Self {
            engine,
            router,
            params: Arc::new(ChainParams::default()),
            chain_monitor: Arc::new(ChainMonitor::default()),
            monitor,
            latency,
            eq: None,
            canceller: None,
        }
    }

    /// Install a noise-cancellation backend for the next `start`. The
    /// backend moves into the audio callback and is dropped at stop, so
    /// this must be called again before a restart to keep it.
    pub fn set_noise_canceller(&mut self, canceller: Box<dyn NoiseCanceller>) {
        self.canceller = Some(canceller);
    }

    /// Negotiate devices, build the DSP chain at the negotiated rate,
    /// and start the duplex streams.
    pub fn start(
        &mut self,
        input_device: Option<&str>,
        output_device: Option<&str>,
    ) -> Result<StreamSpec, EngineError> {
        let spec = self.engine.negotiate(input_device, output_device)?;

        let eq = Arc::new(Equalizer::new(spec.sample_rate as f32));
        let canceller = self
            .canceller
            .take()
            .unwrap_or_else(|| Box::new(PassthroughCanceller));
        let mut chain = VoiceChain::new(
            spec.sample_rate,
            Arc::clone(&eq),
            canceller,
            Arc::clone(&self.params),
            Arc::clone(&self.chain_monitor),
        );

        let router = Arc::clone(&self.router);
        self.engine.start(Box::new(move |block| {
            let safe_mode = router.is_safe_mode_active();
            chain.process_block(block, safe_mode);
        }))?;

        self.eq = Some(eq);
        Ok(spec)
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Negotiated pipeline rate; 0 before the first start.
    pub fn sample_rate(&self) -> u32 {
        self.engine.spec().map(|s| s.sample_rate).unwrap_or(0)
    }

    pub fn set_latency_listener(&self, listener: Option<Arc<dyn Fn(f64) + Send + Sync>>) {
        self.engine.set_latency_listener(listener);
    }

    // === master ===

    pub fn set_bypass(&self, bypass: bool) {
        self.params.bypass.store(bypass, Ordering::Relaxed);
    }

    pub fn is_bypass(&self) -> bool {
        self.params.bypass.load(Ordering::Relaxed)
    }

    // === AGC ===

    pub fn set_agc_enabled(&self, enabled: bool) {
        self.params.agc_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_agc_enabled(&self) -> bool {
        self.params.agc_enabled.load(Ordering::Relaxed)
    }

    pub fn set_agc_target_level(&self, dbfs: f32) {
        self.params.set_agc_target_level(dbfs);
    }

    pub fn set_agc_max_gain(&self, db: f32) {
        self.params.set_agc_max_gain(db);
    }

    pub fn set_agc_min_gain(&self, db: f32) {
        self.params.set_agc_min_gain(db);
    }

    pub fn set_agc_noise_threshold(&self, dbfs: f32) {
        self.params.set_agc_noise_threshold(dbfs);
    }

    pub fn set_agc_attack_time(&self, seconds: f32) {
        self.params.set_agc_attack_time(seconds);
    }

    pub fn set_agc_release_time(&self, seconds: f32) {
        self.params.set_agc_release_time(seconds);
    }

    pub fn set_agc_window_size(&self, seconds: f32) {
        self.params.set_agc_window_size(seconds);
    }

    pub fn agc_gain_db(&self) -> f32 {
        self.chain_monitor.agc_gain_db()
    }

    pub fn agc_level_db(&self) -> f32 {
        self.chain_monitor.agc_level_db()
    }

    pub fn is_agc_frozen(&self) -> bool {
        self.chain_monitor.agc_frozen()
    }

    // === EQ ===

    pub fn set_eq_enabled(&self, enabled: bool) {
        self.params.eq_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_eq_enabled(&self) -> bool {
        self.params.eq_enabled.load(Ordering::Relaxed)
    }

    /// Set one band's gain. Invalid band indices are ignored.
    pub fn set_eq_band_gain(&self, band: usize, gain_db: f32) {
        self.params.set_eq_band_gain(band, gain_db);
        if let Some(eq) = &self.eq {
            eq.set_band_gain(band, gain_db);
        }
    }

    pub fn eq_band_gain(&self, band: usize) -> f32 {
        self.params.eq_band_gain(band)
    }

    /// Apply all ten band gains at once.
    pub fn set_eq_bands(&self, gains_db: &[f32]) -> Result<(), String> {
        if gains_db.len() != NUM_BANDS {
            return Err(format!(
                "expected {} band gains, got {}",
                NUM_BANDS,
                gains_db.len()
            ));
        }
        for (band, &gain) in gains_db.iter().enumerate() {
            self.set_eq_band_gain(band, gain);
        }
        Ok(())
    }

    // === voice gain ===

    pub fn set_voice_gain_db(&self, db: f32) {
        self.params.set_voice_gain_db(db);
    }

    pub fn voice_gain_db(&self) -> f32 {
        self.params.voice_gain_db()
    }

    // === noise canceller ===

    pub fn set_canceller_enabled(&self, enabled: bool) {
        self.params
            .canceller_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn is_canceller_enabled(&self) -> bool {
        self.params.canceller_enabled.load(Ordering::Relaxed)
    }

    // === compressor ===

    pub fn set_compressor_enabled(&self, enabled: bool) {
        self.params
            .compressor_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn is_compressor_enabled(&self) -> bool {
        self.params.compressor_enabled.load(Ordering::Relaxed)
    }

    pub fn set_compressor_threshold(&self, db: f32) {
        self.params.set_compressor_threshold(db);
    }

    pub fn set_compressor_ratio(&self, ratio: f32) {
        self.params.set_compressor_ratio(ratio);
    }

    pub fn set_compressor_attack(&self, ms: f32) {
        self.params.set_compressor_attack(ms);
    }

    pub fn set_compressor_release(&self, ms: f32) {
        self.params.set_compressor_release(ms);
    }

    pub fn set_compressor_knee(&self, db: f32) {
        self.params.set_compressor_knee(db);
    }

    pub fn set_compressor_makeup(&self, db: f32) {
        self.params.set_compressor_makeup(db);
    }

    pub fn set_compressor_auto_makeup(&self, enabled: bool) {
        self.params.set_compressor_auto_makeup(enabled);
    }

    pub fn set_compressor_detection(&self, mode: DetectionMode) {
        self.params.set_compressor_detection(mode);
    }

    pub fn set_compressor_rms_window(&self, ms: f32) {
        self.params.set_compressor_rms_window(ms);
    }

    pub fn compressor_gain_reduction_db(&self) -> f32 {
        self.chain_monitor.compressor_reduction_db()
    }

    // === limiter ===

    pub fn set_limiter_enabled(&self, enabled: bool) {
        self.params
            .limiter_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn is_limiter_enabled(&self) -> bool {
        self.params.limiter_enabled.load(Ordering::Relaxed)
    }

    pub fn set_limiter_threshold(&self, db: f32) {
        self.params.set_limiter_threshold(db);
    }

    pub fn set_limiter_release(&self, ms: f32) {
        self.params.set_limiter_release(ms);
    }

    pub fn set_limiter_lookahead(&self, ms: f32) {
        self.params.set_limiter_lookahead(ms);
    }

    pub fn limiter_gain_reduction_db(&self) -> f32 {
        self.chain_monitor.limiter_reduction_db()
    }

    // === monitoring ===

    pub fn output_peak_db(&self) -> f32 {
        self.monitor.output_peak_db()
    }

    pub fn output_rms_db(&self) -> f32 {
        self.monitor.output_rms_db()
    }

    pub fn latency(&self) -> &LatencyShared {
        &self.latency
    }

    pub fn xrun_count(&self) -> u64 {
        self.monitor.xrun_count()
    }

    pub fn overflow_count(&self) -> u64 {
        self.monitor.overflow_count()
    }

    pub fn underflow_count(&self) -> u64 {
        self.monitor.underflow_count()
    }

    pub fn callback_frames(&self) -> u32 {
        self.monitor.callback_frames()
    }

    pub fn buffer_fill_ratio(&self) -> f32 {
        self.monitor.buffer_fill_ratio()
    }

    pub fn cpu_percent(&self) -> f32 {
        self.monitor.cpu_percent()
    }

    pub fn rss_bytes(&self) -> u64 {
        self.monitor.rss_bytes()
    }

    pub fn safe_mode_state(&self) -> SafeModeState {
        self.router.state()
    }

    pub fn is_safe_mode_active(&self) -> bool {
        self.router.is_safe_mode_active()
    }

    pub fn router(&self) -> &TransportRouter {
        &self.router
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// === Python bindings ===

/// Python-exposed voice pipeline
#[pyclass(name = "VoicePipeline", unsendable)]
pub struct PyVoicePipeline {
    pipeline: VoicePipeline,
}

#[pymethods]
impl PyVoicePipeline {
    #[new]
    fn new() -> Self {
        Self {
            pipeline: VoicePipeline::new(),
        }
    }

    /// Start audio processing
    #[pyo3(signature = (input_device=None, output_device=None))]
    fn start(
        &mut self,
        input_device: Option<&str>,
        output_device: Option<&str>,
    ) -> PyResult<String> {
        self.pipeline
            .start(input_device, output_device)
            .map(|spec| {
                format!(
                    "Started: {} -> {} @ {} Hz",
                    spec.input_device, spec.output_device, spec.sample_rate
                )
            })
            .map_err(|e| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(e.to_string()))
    }

    /// Stop audio processing
    fn stop(&mut self) {
        self.pipeline.stop();
    }

    fn is_running(&self) -> bool {
        self.pipeline.is_running()
    }

    fn sample_rate(&self) -> u32 {
        self.pipeline.sample_rate()
    }

    /// Register a callable invoked at ~10 Hz with the smoothed
    /// perceived latency in milliseconds.
    fn set_latency_callback(&self, callback: PyObject) {
        self.pipeline
            .set_latency_listener(Some(Arc::new(move |ms| {
                Python::with_gil(|py| {
                    if let Err(e) = callback.call1(py, (ms,)) {
                        e.print(py);
                    }
                });
            })));
    }

    fn clear_latency_callback(&self) {
        self.pipeline.set_latency_listener(None);
    }

    // === master ===

    fn set_bypass(&self, bypass: bool) {
        self.pipeline.set_bypass(bypass);
    }

    fn is_bypass(&self) -> bool {
        self.pipeline.is_bypass()
    }

    // === AGC ===

    fn set_agc_enabled(&self, enabled: bool) {
        self.pipeline.set_agc_enabled(enabled);
    }

    fn is_agc_enabled(&self) -> bool {
        self.pipeline.is_agc_enabled()
    }

    fn set_agc_target_level(&self, dbfs: f32) {
        self.pipeline.set_agc_target_level(dbfs);
    }

    fn set_agc_max_gain(&self, db: f32) {
        self.pipeline.set_agc_max_gain(db);
    }

    fn set_agc_min_gain(&self, db: f32) {
        self.pipeline.set_agc_min_gain(db);
    }

    fn set_agc_noise_threshold(&self, dbfs: f32) {
        self.pipeline.set_agc_noise_threshold(dbfs);
    }

    fn set_agc_attack_time(&self, seconds: f32) {
        self.pipeline.set_agc_attack_time(seconds);
    }

    fn set_agc_release_time(&self, seconds: f32) {
        self.pipeline.set_agc_release_time(seconds);
    }

    fn set_agc_window_size(&self, seconds: f32) {
        self.pipeline.set_agc_window_size(seconds);
    }

    fn get_agc_gain(&self) -> f32 {
        self.pipeline.agc_gain_db()
    }

    fn get_agc_level(&self) -> f32 {
        self.pipeline.agc_level_db()
    }

    fn is_agc_frozen(&self) -> bool {
        self.pipeline.is_agc_frozen()
    }

    // === EQ ===

    fn set_eq_enabled(&self, enabled: bool) {
        self.pipeline.set_eq_enabled(enabled);
    }

    fn is_eq_enabled(&self) -> bool {
        self.pipeline.is_eq_enabled()
    }

    fn set_eq_band_gain(&self, band: usize, gain_db: f32) {
        self.pipeline.set_eq_band_gain(band, gain_db);
    }

    fn get_eq_band_gain(&self, band: usize) -> f32 {
        self.pipeline.eq_band_gain(band)
    }

    /// Apply all ten band gains in one call
    fn set_eq_bands(&self, gains_db: Vec<f32>) -> PyResult<()> {
        self.pipeline
            .set_eq_bands(&gains_db)
            .map_err(|e| PyErr::new::<pyo3::exceptions::PyValueError, _>(e))
    }

    // === voice gain ===

    fn set_voice_gain(&self, db: f32) {
        self.pipeline.set_voice_gain_db(db);
    }

    fn get_voice_gain(&self) -> f32 {
        self.pipeline.voice_gain_db()
    }

    // === noise canceller ===

    fn set_noise_canceller_enabled(&self, enabled: bool) {
        self.pipeline.set_canceller_enabled(enabled);
    }

    fn is_noise_canceller_enabled(&self) -> bool {
        self.pipeline.is_canceller_enabled()
    }

    // === compressor ===

    fn set_compressor_enabled(&self, enabled: bool) {
        self.pipeline.set_compressor_enabled(enabled);
    }

    fn is_compressor_enabled(&self) -> bool {
        self.pipeline.is_compressor_enabled()
    }

    fn set_compressor_threshold(&self, db: f32) {
        self.pipeline.set_compressor_threshold(db);
    }

    fn set_compressor_ratio(&self, ratio: f32) {
        self.pipeline.set_compressor_ratio(ratio);
    }

    fn set_compressor_attack(&self, ms: f32) {
        self.pipeline.set_compressor_attack(ms);
    }

    fn set_compressor_release(&self, ms: f32) {
        self.pipeline.set_compressor_release(ms);
    }

    fn set_compressor_knee(&self, db: f32) {
        self.pipeline.set_compressor_knee(db);
    }

    fn set_compressor_makeup(&self, db: f32) {
        self.pipeline.set_compressor_makeup(db);
    }

    fn set_compressor_auto_makeup(&self, enabled: bool) {
        self.pipeline.set_compressor_auto_makeup(enabled);
    }

    /// Detection mode: "peak" or "rms"
    fn set_compressor_detection(&self, mode: &str) -> PyResult<()> {
        let mode = match mode.to_ascii_lowercase().as_str() {
            "peak" => DetectionMode::Peak,
            "rms" => DetectionMode::Rms,
            other => {
                return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                    "unknown detection mode '{}'",
                    other
                )))
            }
        };
        self.pipeline.set_compressor_detection(mode);
        Ok(())
    }

    fn set_compressor_rms_window(&self, ms: f32) {
        self.pipeline.set_compressor_rms_window(ms);
    }

    fn get_compressor_gain_reduction(&self) -> f32 {
        self.pipeline.compressor_gain_reduction_db()
    }

    // === limiter ===

    fn set_limiter_enabled(&self, enabled: bool) {
        self.pipeline.set_limiter_enabled(enabled);
    }

    fn is_limiter_enabled(&self) -> bool {
        self.pipeline.is_limiter_enabled()
    }

    fn set_limiter_threshold(&self, db: f32) {
        self.pipeline.set_limiter_threshold(db);
    }

    fn set_limiter_release(&self, ms: f32) {
        self.pipeline.set_limiter_release(ms);
    }

    fn set_limiter_lookahead(&self, ms: f32) {
        self.pipeline.set_limiter_lookahead(ms);
    }

    fn get_limiter_gain_reduction(&self) -> f32 {
        self.pipeline.limiter_gain_reduction_db()
    }

    // === monitoring ===

    fn get_output_peak(&self) -> f32 {
        self.pipeline.output_peak_db()
    }

    fn get_output_rms(&self) -> f32 {
        self.pipeline.output_rms_db()
    }

    /// Smoothed perceived latency in ms
    fn get_latency(&self) -> f64 {
        self.pipeline.latency().ema_ms()
    }

    /// (burst, buffer, frame-position, ring) latency estimates in ms
    fn get_latency_components(&self) -> (f64, f64, f64, f64) {
        let l = self.pipeline.latency();
        (
            l.burst_ms(),
            l.buffer_ms(),
            l.frame_position_ms(),
            l.ring_ms(),
        )
    }

    fn get_latency_min(&self) -> f64 {
        self.pipeline.latency().min_ms()
    }

    fn get_latency_max(&self) -> f64 {
        self.pipeline.latency().max_ms()
    }

    fn get_xrun_count(&self) -> u64 {
        self.pipeline.xrun_count()
    }

    fn get_overflow_count(&self) -> u64 {
        self.pipeline.overflow_count()
    }

    fn get_underflow_count(&self) -> u64 {
        self.pipeline.underflow_count()
    }

    fn get_callback_frames(&self) -> u32 {
        self.pipeline.callback_frames()
    }

    fn get_buffer_fill_ratio(&self) -> f32 {
        self.pipeline.buffer_fill_ratio()
    }

    fn get_cpu_percent(&self) -> f32 {
        self.pipeline.cpu_percent()
    }

    fn get_ram_bytes(&self) -> u64 {
        self.pipeline.rss_bytes()
    }

    fn get_safe_mode_state(&self) -> String {
        self.pipeline.safe_mode_state().name().to_string()
    }

    fn is_safe_mode_active(&self) -> bool {
        self.pipeline.is_safe_mode_active()
    }

    /// (profile, codec, declared latency ms) of the active transport
    fn get_transport_profile(&self) -> (String, String, f32) {
        let profile = self.pipeline.router().profile();
        (
            profile.name().to_string(),
            profile.codec_name().to_string(),
            profile.declared_latency_ms(),
        )
    }
}
