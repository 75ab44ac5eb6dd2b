//! Noise-canceller hook
//!
//! The pipeline reserves a slot between the voice gain and the
//! compressor for an external noise-cancellation backend. The backend
//! itself (typically an ML inference engine running off the audio
//! thread) is not part of this crate; implementations plug in through
//! this trait. The default is a passthrough that touches nothing.

/// Block-processing interface for a pluggable noise canceller.
///
/// `process_block` runs on the audio thread and must not allocate,
/// block, or lock. When the host disables the hook the chain skips the
/// call entirely, so a disabled canceller costs one relaxed load.
pub trait NoiseCanceller: Send {
    /// Called with the negotiated stream sample rate before processing
    /// starts, and again whenever the engine restarts. Backends that
    /// resample or hold rate-dependent state reconfigure here.
    fn configure(&mut self, sample_rate: u32);

    /// Process a block in place.
    fn process_block(&mut self, buffer: &mut [f32]);

    /// Drop accumulated state.
    fn reset(&mut self);
}

/// Default hook: leaves the signal untouched.
pub struct PassthroughCanceller;

impl NoiseCanceller for PassthroughCanceller {
    fn configure(&mut self, _sample_rate: u32) {}

    fn process_block(&mut self, _buffer: &mut [f32]) {}

    fn reset(&mut self) {}
}
