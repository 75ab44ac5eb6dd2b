//! Digital signal processing components

pub mod agc;
pub mod biquad;
pub mod canceller;
pub mod chain;
pub mod compressor;
pub mod eq;
pub mod limiter;
pub mod math;

pub use agc::Agc;
pub use biquad::{BiquadCoefficients, BiquadFilter};
pub use canceller::{NoiseCanceller, PassthroughCanceller};
pub use chain::{ChainMonitor, ChainParams, VoiceChain, MAX_VOICE_GAIN_DB};
pub use compressor::{Compressor, DetectionMode};
pub use eq::{Equalizer, CENTER_FREQUENCIES, DEFAULT_Q, NUM_BANDS};
pub use limiter::Limiter;
