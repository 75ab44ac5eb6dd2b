//! Stress tests for pipeline parameter changes and lifecycle safety
//!
//! These validate that the control surface survives rapid UI
//! interaction (slider spam, preset switching) and that the lifecycle
//! is safe without any audio devices present.

use livemic_core::bridge::VoicePipeline;
use rand::Rng;

/// Spam every setter with random values and verify the pipeline stays
/// in a valid state. No audio devices are required; setters only
/// publish atomics.
#[test]
fn test_rapid_parameter_changes() {
    let pipeline = VoicePipeline::new();
    assert!(!pipeline.is_running());

    let mut rng = rand::thread_rng();

    for i in 0..1000 {
        let stage = rng.gen_range(0..5); // 0=agc, 1=eq, 2=voice, 3=comp, 4=limiter
        match stage {
            0 => {
                pipeline.set_agc_target_level(rng.gen_range(-80.0..10.0));
                pipeline.set_agc_max_gain(rng.gen_range(-10.0..40.0));
                pipeline.set_agc_min_gain(rng.gen_range(-50.0..10.0));
                pipeline.set_agc_noise_threshold(rng.gen_range(-100.0..0.0));
                pipeline.set_agc_attack_time(rng.gen_range(0.01..20.0));
                pipeline.set_agc_release_time(rng.gen_range(0.01..60.0));
                pipeline.set_agc_window_size(rng.gen_range(0.01..5.0));
                pipeline.set_agc_enabled(rng.gen_bool(0.5));
            }
            1 => {
                let band = rng.gen_range(0..12); // includes invalid indices
                pipeline.set_eq_band_gain(band, rng.gen_range(-30.0..30.0));
                pipeline.set_eq_enabled(rng.gen_bool(0.5));
            }
            2 => {
                pipeline.set_voice_gain_db(rng.gen_range(-30.0..30.0));
                pipeline.set_canceller_enabled(rng.gen_bool(0.5));
                pipeline.set_bypass(rng.gen_bool(0.1));
            }
            3 => {
                pipeline.set_compressor_threshold(rng.gen_range(-80.0..10.0));
                pipeline.set_compressor_ratio(rng.gen_range(0.5..30.0));
                pipeline.set_compressor_attack(rng.gen_range(0.01..200.0));
                pipeline.set_compressor_release(rng.gen_range(1.0..2000.0));
                pipeline.set_compressor_knee(rng.gen_range(-5.0..20.0));
                pipeline.set_compressor_makeup(rng.gen_range(-10.0..30.0));
                pipeline.set_compressor_auto_makeup(rng.gen_bool(0.5));
                pipeline.set_compressor_rms_window(rng.gen_range(0.1..200.0));
                pipeline.set_compressor_enabled(rng.gen_bool(0.5));
            }
            4 => {
                pipeline.set_limiter_threshold(rng.gen_range(-30.0..10.0));
                pipeline.set_limiter_release(rng.gen_range(1.0..1000.0));
                pipeline.set_limiter_lookahead(rng.gen_range(-5.0..20.0));
                pipeline.set_limiter_enabled(rng.gen_bool(0.5));
            }
            _ => unreachable!(),
        }

        if i % 100 == 0 {
            assert!(!pipeline.is_running());
        }
    }

    // Published values stayed inside their documented ranges.
    for band in 0..10 {
        let gain = pipeline.eq_band_gain(band);
        assert!((-12.0..=12.0).contains(&gain));
    }
    let voice = pipeline.voice_gain_db();
    assert!((-12.0..=12.0).contains(&voice));

    // Monitors still answer.
    let _ = pipeline.output_peak_db();
    let _ = pipeline.compressor_gain_reduction_db();
    let _ = pipeline.limiter_gain_reduction_db();
    let _ = pipeline.xrun_count();
}

/// Lifecycle safety without devices: stop before start is a no-op,
/// double stop is a no-op, and setters keep working afterwards.
#[test]
fn test_lifecycle_without_devices() {
    let mut pipeline = VoicePipeline::new();

    pipeline.stop();
    pipeline.stop();
    assert!(!pipeline.is_running());

    // Start may fail on headless CI; it must fail cleanly and leave
    // the pipeline stopped rather than panic.
    match pipeline.start(Some("DEVICE_THAT_DOES_NOT_EXIST"), None) {
        Ok(_) => {
            pipeline.stop();
        }
        Err(_) => {
            assert!(!pipeline.is_running());
        }
    }

    pipeline.set_eq_band_gain(0, 6.0);
    assert_eq!(pipeline.eq_band_gain(0), 6.0);
    pipeline.set_compressor_threshold(-18.0);
    pipeline.set_limiter_threshold(-2.0);
}

/// Control threads spamming the shared parameter block while a worker
/// thread runs the chain the way the audio callback does. Output must
/// stay finite and the published values in range throughout.
#[test]
fn test_concurrent_control_and_processing() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use livemic_core::dsp::canceller::PassthroughCanceller;
    use livemic_core::dsp::chain::{ChainMonitor, ChainParams, VoiceChain};
    use livemic_core::dsp::eq::Equalizer;

    let params = Arc::new(ChainParams::default());
    let monitor = Arc::new(ChainMonitor::default());
    let eq = Arc::new(Equalizer::new(48000.0));
    params.agc_enabled.store(true, Ordering::Relaxed);
    params.eq_enabled.store(true, Ordering::Relaxed);
    params.compressor_enabled.store(true, Ordering::Relaxed);
    params.limiter_enabled.store(true, Ordering::Relaxed);

    let mut chain = VoiceChain::new(
        48000,
        Arc::clone(&eq),
        Box::new(PassthroughCanceller),
        Arc::clone(&params),
        Arc::clone(&monitor),
    );

    let stop = Arc::new(AtomicBool::new(false));

    // Control thread: retunes the EQ through the snapshot swap and
    // bumps the rest of the parameter block.
    let control = {
        let params = Arc::clone(&params);
        let eq = Arc::clone(&eq);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut value = 0.0f32;
            let mut band = 0usize;
            while !stop.load(Ordering::Relaxed) {
                value = (value + 0.7) % 24.0 - 12.0;
                band = (band + 1) % 10;
                eq.set_band_gain(band, value);
                params.set_eq_band_gain(band, value);
                params.set_voice_gain_db(value);
                params.set_compressor_threshold(value - 20.0);
                params.set_limiter_threshold(value / 2.0);
                params.set_agc_target_level(value - 15.0);
            }
        })
    };

    // Worker thread: the audio side.
    let worker = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut block = vec![0.0f32; 480];
            let mut n = 0usize;
            while !stop.load(Ordering::Relaxed) {
                for (i, s) in block.iter_mut().enumerate() {
                    let t = (n + i) as f32 / 48000.0;
                    *s = 0.4 * (2.0 * std::f32::consts::PI * 330.0 * t).sin();
                }
                n += block.len();
                chain.process_block(&mut block, false);
                assert!(block.iter().all(|s| s.is_finite()));
            }
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(300));
    stop.store(true, Ordering::Relaxed);
    control.join().unwrap();
    worker.join().unwrap();

    let gain = params.voice_gain_db();
    assert!((-12.0..=12.0).contains(&gain));
}
