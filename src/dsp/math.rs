//! dB <-> linear conversion backed by lookup tables
//!
//! The dynamics modules (AGC, compressor, limiter) convert between dB and
//! linear amplitude once or twice per sample. Replacing `powf`/`log10`
//! with interpolated table lookups keeps that cost flat on the audio
//! thread. Tables are built once on first use and immutable afterwards.

use std::sync::OnceLock;

/// Lower edge of the dB table range. Doubles as the floor returned by
/// [`linear_to_db`] for near-zero inputs.
pub const DB_MIN: f32 = -60.0;

/// Upper edge of the dB table range.
pub const DB_MAX: f32 = 60.0;

/// Linear range matching [-60, +60] dB.
const LIN_MIN: f32 = 1e-3;
const LIN_MAX: f32 = 1e3;

/// 2400 entries = 0.05 dB steps across the 120 dB span.
const TABLE_SIZE: usize = 2400;

const DB_STEP: f32 = (DB_MAX - DB_MIN) / (TABLE_SIZE - 1) as f32;

struct GainTables {
    db_to_lin: Vec<f32>,
    lin_to_db: Vec<f32>,
    /// log10(LIN_MIN), cached for index math.
    log_min: f32,
    /// log10(LIN_MAX) - log10(LIN_MIN).
    log_span: f32,
}

impl GainTables {
    fn build() -> Self {
        let mut db_to_lin = Vec::with_capacity(TABLE_SIZE);
        for i in 0..TABLE_SIZE {
            let db = DB_MIN as f64 + i as f64 * DB_STEP as f64;
            db_to_lin.push(10f64.powf(db / 20.0) as f32);
        }

        // The linear axis is log-spaced so the dB output stays uniformly
        // sampled across the whole range.
        let log_min = (LIN_MIN as f64).log10();
        let log_max = (LIN_MAX as f64).log10();
        let mut lin_to_db = Vec::with_capacity(TABLE_SIZE);
        for i in 0..TABLE_SIZE {
            let t = i as f64 / (TABLE_SIZE - 1) as f64;
            let linear = (LIN_MIN as f64) * (LIN_MAX as f64 / LIN_MIN as f64).powf(t);
            lin_to_db.push((20.0 * linear.log10()) as f32);
        }

        Self {
            db_to_lin,
            lin_to_db,
            log_min: log_min as f32,
            log_span: (log_max - log_min) as f32,
        }
    }
}

static TABLES: OnceLock<GainTables> = OnceLock::new();

#[inline]
fn tables() -> &'static GainTables {
    TABLES.get_or_init(GainTables::build)
}

/// Force table construction. Called once during engine start so the lazy
/// init never lands on the audio thread.
pub fn warm_up() {
    let _ = tables();
}

/// Convert dB to linear amplitude. Input is clamped to [-60, +60] dB;
/// the result is linearly interpolated between adjacent table entries.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    let t = tables();
    let db = db.clamp(DB_MIN, DB_MAX);

    let idx = (db - DB_MIN) / DB_STEP;
    let i0 = (idx as usize).min(TABLE_SIZE - 1);
    let i1 = (i0 + 1).min(TABLE_SIZE - 1);
    let frac = (idx - i0 as f32).clamp(0.0, 1.0);

    t.db_to_lin[i0] * (1.0 - frac) + t.db_to_lin[i1] * frac
}

/// Convert linear amplitude to dB. Returns the -60 dB floor for inputs
/// at or below 1e-10; otherwise clamps to the table range and
/// interpolates on the log-spaced axis.
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 1e-10 {
        return DB_MIN;
    }

    let t = tables();
    let linear = linear.clamp(LIN_MIN, LIN_MAX);

    let idx = (linear.log10() - t.log_min) / t.log_span * (TABLE_SIZE - 1) as f32;
    let i0 = (idx as usize).min(TABLE_SIZE - 1);
    let i1 = (i0 + 1).min(TABLE_SIZE - 1);
    let frac = (idx - i0 as f32).clamp(0.0, 1.0);

    t.lin_to_db[i0] * (1.0 - frac) + t.lin_to_db[i1] * frac
}

/// Convert a time constant in milliseconds to a single-pole smoothing
/// coefficient at the given sample rate.
#[inline]
pub fn time_constant_to_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    let tau = time_ms.max(0.001) / 1000.0;
    (-1.0 / (tau * sample_rate)).exp()
}

/// Same conversion with the time constant given in seconds.
#[inline]
pub fn seconds_to_coeff(seconds: f32, sample_rate: f32) -> f32 {
    (-1.0 / (seconds.max(0.001) * sample_rate)).exp()
}
