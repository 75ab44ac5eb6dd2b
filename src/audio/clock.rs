//! Process-local monotonic timestamps
//!
//! The safe-mode machine and the latency tracker compare times on the
//! audio thread, where wall-clock reads are off limits. Everything runs
//! off one monotonic origin captured on first use.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

#[inline]
fn origin() -> Instant {
    *ORIGIN.get_or_init(Instant::now)
}

/// Monotonic microseconds since the process-local origin.
#[inline]
pub fn now_micros() -> u64 {
    origin().elapsed().as_micros() as u64
}

/// Pin the origin. Called during engine start so the first audio
/// callback does not pay for the lazy init.
pub fn warm_up() {
    let _ = origin();
}
