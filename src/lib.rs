//! livemic-core - real-time voice monitoring DSP engine
//!
//! Processing chain: Mic Input -> AGC -> 10-Band EQ -> Voice Gain ->
//! (Noise Canceller) -> Compressor -> Limiter -> Output

use pyo3::prelude::*;

pub mod audio;
pub mod bridge;
pub mod dsp;

// Re-export main types
pub use audio::{AudioEngine, EngineError, SampleRing, TransportProfile, TransportRouter};
pub use bridge::{PyVoicePipeline, VoicePipeline};
pub use dsp::{Agc, BiquadFilter, Compressor, Equalizer, Limiter, NoiseCanceller, VoiceChain};

/// Python module initialization
#[pymodule]
fn livemic_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Main pipeline handle
    m.add_class::<bridge::PyVoicePipeline>()?;

    // Device enumeration
    m.add_class::<audio::DeviceInfo>()?;
    m.add_function(wrap_pyfunction!(audio::device::list_input_devices, m)?)?;
    m.add_function(wrap_pyfunction!(audio::device::list_output_devices, m)?)?;

    Ok(())
}
