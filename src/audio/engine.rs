//! Duplex real-time audio engine
//!
//! Owns the capture and playback streams, the SPSC ring between them,
//! the transport router, and the monitoring accumulators. The input
//! callback downmixes to mono and pushes into the ring; the output
//! callback pops, hands the block to the installed DSP callback, meters
//! the result, and keeps the latency and safe-mode state fresh at
//! 10 Hz. A small reporter thread on the control side forwards the
//! smoothed latency to the host and samples CPU/RSS.
//!
//! Real-time discipline inside the callbacks: no allocation, no locks,
//! no blocking calls. Scratch buffers are preallocated at start and
//! oversized callbacks are processed in chunks.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, FrameCount, SampleRate, Stream, StreamConfig, SupportedBufferSize,
    SupportedStreamConfigRange,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use super::clock;
use super::latency::{LatencyInputs, LatencyShared, LatencyTracker};
use super::ring::{RingCounters, SampleRing, DEFAULT_RING_CAPACITY};
use super::stats::platform_stats;
use super::transport::TransportRouter;
use crate::dsp::math;

/// Fixed scratch capacity in frames. Callbacks larger than this are
/// processed in chunks rather than grown into.
const SCRATCH_FRAMES: usize = 8192;

/// Metering EMA factor per block.
const METER_ALPHA: f32 = 0.15;

/// Throttle factor for xrun logging.
const XRUN_LOG_EVERY: u64 = 100;

/// Block DSP callback: processes the popped mono block in place.
pub type ProcessCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// Host latency listener, invoked from the reporter thread at ~10 Hz.
/// Shared so the reporter can call it outside the registration lock.
pub type LatencyListener = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no audio device found")]
    NoDevice,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to query device: {0}")]
    DeviceQuery(String),

    #[error("failed to get stream config: {0}")]
    StreamConfig(String),

    #[error("failed to build stream: {0}")]
    BuildStream(String),

    #[error("failed to start stream: {0}")]
    PlayStream(String),

    #[error("engine already running")]
    AlreadyRunning,

    #[error("start called before negotiate")]
    NotNegotiated,
}

/// Result of device/config negotiation.
#[derive(Clone, Debug)]
pub struct StreamSpec {
    pub input_device: String,
    pub output_device: String,
    /// Pipeline rate: the output stream's native rate.
    pub sample_rate: u32,
    pub input_channels: u16,
    pub output_channels: u16,
    /// Output buffer requested from the driver (2x its reported burst);
    /// 0 when the device reports no buffer range and the driver default
    /// is in use.
    pub output_buffer_frames: u32,
}

/// Monitoring values published from the audio threads.
pub struct EngineMonitor {
    out_peak_db: AtomicU32,
    out_rms_db: AtomicU32,
    input_burst: AtomicU32,
    output_burst: AtomicU32,
    fill_ratio: AtomicU32,
    frames_pending: AtomicU64,
    overflow_count: AtomicU64,
    underflow_count: AtomicU64,
    cpu_percent: AtomicU32,
    rss_bytes: AtomicU64,
}

impl Default for EngineMonitor {
    fn default() -> Self {
        Self {
            out_peak_db: AtomicU32::new(math::DB_MIN.to_bits()),
            out_rms_db: AtomicU32::new(math::DB_MIN.to_bits()),
            input_burst: AtomicU32::new(0),
            output_burst: AtomicU32::new(0),
            fill_ratio: AtomicU32::new(0.0f32.to_bits()),
            frames_pending: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
            underflow_count: AtomicU64::new(0),
            cpu_percent: AtomicU32::new(0.0f32.to_bits()),
            rss_bytes: AtomicU64::new(0),
        }
    }
}

impl EngineMonitor {
    pub fn output_peak_db(&self) -> f32 {
        f32::from_bits(self.out_peak_db.load(Ordering::Relaxed))
    }

    pub fn output_rms_db(&self) -> f32 {
        f32::from_bits(self.out_rms_db.load(Ordering::Relaxed))
    }

    /// Frames delivered by the last input callback.
    pub fn input_burst_frames(&self) -> u32 {
        self.input_burst.load(Ordering::Relaxed)
    }

    /// Frames requested by the last output callback.
    pub fn callback_frames(&self) -> u32 {
        self.output_burst.load(Ordering::Relaxed)
    }

    pub fn buffer_fill_ratio(&self) -> f32 {
        f32::from_bits(self.fill_ratio.load(Ordering::Relaxed))
    }

    pub fn frames_pending(&self) -> u64 {
        self.frames_pending.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underflow_count(&self) -> u64 {
        self.underflow_count.load(Ordering::Relaxed)
    }

    pub fn xrun_count(&self) -> u64 {
        self.overflow_count() + self.underflow_count()
    }

    pub fn cpu_percent(&self) -> f32 {
        f32::from_bits(self.cpu_percent.load(Ordering::Relaxed))
    }

    pub fn rss_bytes(&self) -> u64 {
        self.rss_bytes.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.out_peak_db
            .store(math::DB_MIN.to_bits(), Ordering::Relaxed);
        self.out_rms_db
            .store(math::DB_MIN.to_bits(), Ordering::Relaxed);
        self.input_burst.store(0, Ordering::Relaxed);
        self.output_burst.store(0, Ordering::Relaxed);
        self.fill_ratio.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.frames_pending.store(0, Ordering::Relaxed);
        self.overflow_count.store(0, Ordering::Relaxed);
        self.underflow_count.store(0, Ordering::Relaxed);
    }
}

struct Negotiated {
    input_device: Device,
    output_device: Device,
    input_config: StreamConfig,
    output_config: StreamConfig,
    spec: StreamSpec,
}

/// The duplex engine. One instance per pipeline; streams live between
/// `start` and `stop`.
pub struct AudioEngine {
    running: Arc<AtomicBool>,
    monitor: Arc<EngineMonitor>,
    latency: Arc<LatencyShared>,
    router: Arc<TransportRouter>,
    latency_listener: Arc<Mutex<Option<LatencyListener>>>,

    negotiated: Option<Negotiated>,
    spec: Option<StreamSpec>,
    counters: Option<Arc<RingCounters>>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    reporter: Option<std::thread::JoinHandle<()>>,
}

impl AudioEngine {
    pub fn new(router: Arc<TransportRouter>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            monitor: Arc::new(EngineMonitor::default()),
            latency: Arc::new(LatencyShared::default()),
            router,
            latency_listener: Arc::new(Mutex::new(None)),
            negotiated: None,
            spec: None,
            counters: None,
            input_stream: None,
            output_stream: None,
            reporter: None,
        }
    }

    pub fn monitor(&self) -> Arc<EngineMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn latency(&self) -> Arc<LatencyShared> {
        Arc::clone(&self.latency)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Negotiated spec of the current or last session.
    pub fn spec(&self) -> Option<&StreamSpec> {
        self.spec.as_ref()
    }

    /// Install the host latency callback, replacing any previous one.
    pub fn set_latency_listener(&self, listener: Option<LatencyListener>) {
        if let Ok(mut slot) = self.latency_listener.lock() {
            *slot = listener;
        }
    }

    /// Select devices and configs; the pipeline runs at the output
    /// device's native rate, and the output buffer is requested at
    /// twice the driver's burst. Detects the transport profile as a
    /// side effect. Must precede `start`.
    pub fn negotiate(
        &mut self,
        input_name: Option<&str>,
        output_name: Option<&str>,
    ) -> Result<StreamSpec, EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }

        let host = cpal::default_host();

        let output_device = match output_name {
            Some(name) => find_device(
                host.output_devices()
                    .map_err(|e| EngineError::DeviceQuery(e.to_string()))?,
                name,
            )?,
            None => host.default_output_device().ok_or(EngineError::NoDevice)?,
        };
        let input_device = match input_name {
            Some(name) => find_device(
                host.input_devices()
                    .map_err(|e| EngineError::DeviceQuery(e.to_string()))?,
                name,
            )?,
            None => host.default_input_device().ok_or(EngineError::NoDevice)?,
        };

        let output_default = output_device
            .default_output_config()
            .map_err(|e| EngineError::StreamConfig(e.to_string()))?;
        let sample_rate = output_default.sample_rate().0;

        // The output buffer runs at twice the driver's burst (the
        // reported minimum transfer size) so wireless jitter has
        // headroom before the ring underruns.
        let output_buffer_frames = double_burst_buffer(output_default.buffer_size());
        let mut output_config: StreamConfig = output_default.into();
        match output_buffer_frames {
            Some(frames) => output_config.buffer_size = BufferSize::Fixed(frames),
            None => warn!(
                "output device reports no buffer range; keeping the driver default buffer"
            ),
        }

        // Prefer an input config at the pipeline rate; fall back to the
        // device default and accept the mismatch with a warning.
        let input_config: StreamConfig = match input_device.supported_input_configs() {
            Ok(configs) => match find_rate_config(configs, sample_rate) {
                Some(config) => config.into(),
                None => {
                    let default = input_device
                        .default_input_config()
                        .map_err(|e| EngineError::StreamConfig(e.to_string()))?;
                    if default.sample_rate().0 != sample_rate {
                        warn!(
                            "input runs at {} Hz while output runs at {} Hz; expect drift",
                            default.sample_rate().0,
                            sample_rate
                        );
                    }
                    default.into()
                }
            },
            Err(e) => return Err(EngineError::StreamConfig(e.to_string())),
        };

        let input_device_name = input_device
            .name()
            .map_err(|e| EngineError::DeviceQuery(e.to_string()))?;
        let output_device_name = output_device
            .name()
            .map_err(|e| EngineError::DeviceQuery(e.to_string()))?;

        self.router.detect_profile(&output_device_name, sample_rate);

        let spec = StreamSpec {
            input_device: input_device_name,
            output_device: output_device_name,
            sample_rate,
            input_channels: input_config.channels,
            output_channels: output_config.channels,
            output_buffer_frames: output_buffer_frames.unwrap_or(0),
        };

        info!(
            input = %spec.input_device,
            output = %spec.output_device,
            sample_rate = spec.sample_rate,
            output_buffer_frames = spec.output_buffer_frames,
            "negotiated duplex streams"
        );

        self.negotiated = Some(Negotiated {
            input_device,
            output_device,
            input_config,
            output_config,
            spec: spec.clone(),
        });
        self.spec = Some(spec.clone());
        Ok(spec)
    }

    /// Build the streams around the installed DSP callback and start
    /// them. A failed open leaves the engine stopped.
    pub fn start(&mut self, mut process: ProcessCallback) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        let negotiated = self.negotiated.take().ok_or(EngineError::NotNegotiated)?;
        let spec = negotiated.spec.clone();
        let sample_rate = spec.sample_rate;

        // Lazy singletons are paid for here, never in the callback.
        math::warm_up();
        clock::warm_up();

        let (mut producer, mut consumer) = SampleRing::with_capacity(DEFAULT_RING_CAPACITY);
        let counters = producer.counters();
        counters.reset();
        self.monitor.reset();
        self.router.reset(clock::now_micros(), 0);

        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        // ---- input stream: capture, downmix, push ----
        let input_channels = spec.input_channels as usize;
        let input_running = Arc::clone(&self.running);
        let input_monitor = Arc::clone(&self.monitor);
        let input_counters = Arc::clone(&counters);
        let mut input_scratch = vec![0.0f32; SCRATCH_FRAMES];
        let mut input_promoted = false;

        let input_stream = negotiated
            .input_device
            .build_input_stream(
                &negotiated.input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !input_running.load(Ordering::Relaxed) || data.is_empty() {
                        return;
                    }
                    if !input_promoted {
                        input_promoted = true;
                        promote_rt_thread();
                    }

                    let frames = data.len() / input_channels.max(1);
                    input_monitor
                        .input_burst
                        .store(frames as u32, Ordering::Relaxed);

                    let mut consumed = 0usize;
                    while consumed < frames {
                        let chunk = (frames - consumed).min(input_scratch.len());
                        let scratch = &mut input_scratch[..chunk];

                        if input_channels <= 1 {
                            scratch.copy_from_slice(&data[consumed..consumed + chunk]);
                        } else {
                            let start = consumed * input_channels;
                            for (frame, slot) in data[start..start + chunk * input_channels]
                                .chunks_exact(input_channels)
                                .zip(scratch.iter_mut())
                            {
                                let sum: f32 = frame.iter().copied().sum();
                                *slot = sum / input_channels as f32;
                            }
                        }

                        if !producer.push(scratch) {
                            let count = input_counters.overflows();
                            if count % XRUN_LOG_EVERY == 0 {
                                warn!("ring overflow x{}", count);
                            }
                        }
                        consumed += chunk;
                    }
                },
                move |err| {
                    error!("audio input error: {}", err);
                },
                None,
            )
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                EngineError::BuildStream(e.to_string())
            })?;

        // ---- output stream: pop, DSP, meter, monitor ----
        let output_channels = spec.output_channels as usize;
        let configured_output_buffer = spec.output_buffer_frames;
        let output_running = Arc::clone(&self.running);
        let output_monitor = Arc::clone(&self.monitor);
        let output_counters = Arc::clone(&counters);
        let output_router = Arc::clone(&self.router);
        let latency_shared = Arc::clone(&self.latency);
        let mut latency_tracker = LatencyTracker::new();
        let mut output_scratch = vec![0.0f32; SCRATCH_FRAMES];
        let mut output_promoted = false;
        let mut peak_state = 0.0f32;
        let mut rms_state = 0.0f32;
        let mut frames_since_tick = 0u64;

        let output_stream = negotiated
            .output_device
            .build_output_stream(
                &negotiated.output_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if data.is_empty() {
                        return;
                    }
                    if !output_running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    if !output_promoted {
                        output_promoted = true;
                        promote_rt_thread();
                    }

                    let frames = data.len() / output_channels.max(1);

                    // Denormals flushed for the whole DSP section.
                    // Safety: only toggles this thread's FP flags.
                    unsafe {
                        no_denormals::no_denormals(|| {
                            let mut done = 0usize;
                            while done < frames {
                                let chunk = (frames - done).min(output_scratch.len());
                                let block = &mut output_scratch[..chunk];

                                if consumer.pop(block) {
                                    process(block);
                                } else {
                                    block.fill(0.0);
                                    let count = output_counters.underflows();
                                    if count % XRUN_LOG_EVERY == 0 {
                                        warn!("ring underflow x{}", count);
                                    }
                                }

                                // Peak: instant attack, EMA decay.
                                // RMS: EMA both directions.
                                let mut block_peak = 0.0f32;
                                let mut sum_sq = 0.0f32;
                                for &s in block.iter() {
                                    block_peak = block_peak.max(s.abs());
                                    sum_sq += s * s;
                                }
                                let block_rms = (sum_sq / chunk as f32).sqrt();
                                peak_state = if block_peak > peak_state {
                                    block_peak
                                } else {
                                    METER_ALPHA * block_peak + (1.0 - METER_ALPHA) * peak_state
                                };
                                rms_state =
                                    METER_ALPHA * block_rms + (1.0 - METER_ALPHA) * rms_state;

                                if output_channels <= 1 {
                                    data[done..done + chunk].copy_from_slice(block);
                                } else {
                                    let start = done * output_channels;
                                    for (frame, &s) in data
                                        [start..start + chunk * output_channels]
                                        .chunks_exact_mut(output_channels)
                                        .zip(block.iter())
                                    {
                                        frame.fill(s);
                                    }
                                }
                                done += chunk;
                            }
                        });
                    }

                    output_monitor
                        .out_peak_db
                        .store(math::linear_to_db(peak_state).to_bits(), Ordering::Relaxed);
                    output_monitor
                        .out_rms_db
                        .store(math::linear_to_db(rms_state).to_bits(), Ordering::Relaxed);
                    output_monitor
                        .output_burst
                        .store(frames as u32, Ordering::Relaxed);

                    let pending =
                        output_counters.samples_written() - output_counters.samples_read();
                    let fill =
                        pending as f32 / DEFAULT_RING_CAPACITY as f32;
                    output_monitor
                        .frames_pending
                        .store(pending, Ordering::Relaxed);
                    output_monitor
                        .fill_ratio
                        .store(fill.to_bits(), Ordering::Relaxed);

                    // 10 Hz housekeeping: latency estimates and the
                    // safe-mode machine.
                    frames_since_tick += frames as u64;
                    if frames_since_tick >= sample_rate as u64 / 10 {
                        frames_since_tick = 0;
                        let now = clock::now_micros();

                        output_monitor
                            .overflow_count
                            .store(output_counters.overflows(), Ordering::Relaxed);
                        output_monitor
                            .underflow_count
                            .store(output_counters.underflows(), Ordering::Relaxed);

                        let input_burst = output_monitor.input_burst.load(Ordering::Relaxed);
                        let output_burst = frames as u32;
                        // Output side: the buffer negotiated at 2x burst,
                        // or the observed callback size if the device
                        // reported no range. Input side: the stream runs
                        // at the driver default, so its depth is an
                        // estimate from the observed burst.
                        let output_buffer = if configured_output_buffer > 0 {
                            configured_output_buffer
                        } else {
                            output_burst
                        };
                        let input_buffer = input_burst * 2;
                        latency_tracker.tick(
                            &latency_shared,
                            LatencyInputs {
                                sample_rate,
                                input_burst,
                                output_burst,
                                input_buffer,
                                output_buffer,
                                frames_in_flight: pending + output_buffer as u64,
                                ring_pending: pending,
                                declared_ms: output_router.declared_latency_ms() as f64,
                            },
                            now,
                        );

                        output_router.update_safe_mode_status(
                            fill,
                            output_counters.xruns(),
                            now,
                        );
                    }
                },
                move |err| {
                    error!("audio output error: {}", err);
                },
                None,
            )
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                EngineError::BuildStream(e.to_string())
            })?;

        input_stream.play().map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            EngineError::PlayStream(e.to_string())
        })?;
        if let Err(e) = output_stream.play() {
            let _ = input_stream.pause();
            self.running.store(false, Ordering::SeqCst);
            return Err(EngineError::PlayStream(e.to_string()));
        }

        self.spawn_reporter();

        self.counters = Some(counters);
        self.input_stream = Some(input_stream);
        self.output_stream = Some(output_stream);

        info!(
            sample_rate,
            ring_capacity = DEFAULT_RING_CAPACITY,
            "engine started"
        );
        Ok(())
    }

    fn spawn_reporter(&mut self) {
        let running = Arc::clone(&self.running);
        let monitor = Arc::clone(&self.monitor);
        let latency = Arc::clone(&self.latency);
        let listener = Arc::clone(&self.latency_listener);

        self.reporter = Some(std::thread::spawn(move || {
            let mut stats = platform_stats();
            let mut ticks = 0u32;
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));

                let ema = latency.ema_ms();
                // Clone the handle out so the callback runs without the
                // registration lock held; a host callback that blocks
                // (GIL, UI dispatch) must not stall re-registration.
                let callback = listener.lock().ok().and_then(|slot| slot.clone());
                if let Some(callback) = callback {
                    callback(ema);
                }

                ticks = ticks.wrapping_add(1);
                if ticks % 10 == 0 {
                    monitor
                        .cpu_percent
                        .store(stats.read_cpu_percent().to_bits(), Ordering::Relaxed);
                    monitor
                        .rss_bytes
                        .store(stats.read_rss_bytes(), Ordering::Relaxed);
                }
            }
        }));
    }

    /// Cooperative stop: flip the flag, pause input, let the output
    /// drain briefly, then tear the streams down.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(input) = self.input_stream.take() {
            let _ = input.pause();
            drop(input);
        }
        std::thread::sleep(Duration::from_millis(20));
        if let Some(output) = self.output_stream.take() {
            let _ = output.pause();
            drop(output);
        }

        if let Some(handle) = self.reporter.take() {
            let _ = handle.join();
        }

        if let Some(counters) = self.counters.take() {
            info!(
                overflows = counters.overflows(),
                underflows = counters.underflows(),
                "engine stopped"
            );
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_device(
    devices: impl Iterator<Item = Device>,
    name: &str,
) -> Result<Device, EngineError> {
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(EngineError::DeviceNotFound(name.to_string()))
}

/// Buffer request derived from the driver's reported range: twice the
/// minimum transfer size (the burst), clamped to the supported maximum.
/// None when the device reports no usable range.
fn double_burst_buffer(supported: &SupportedBufferSize) -> Option<FrameCount> {
    match *supported {
        SupportedBufferSize::Range { min, max } if min > 0 => {
            Some(min.saturating_mul(2).min(max))
        }
        _ => None,
    }
}

/// Pick a supported config range covering `rate`, if any.
fn find_rate_config(
    configs: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    for config in configs {
        if config.min_sample_rate().0 <= rate && rate <= config.max_sample_rate().0 {
            return Some(config.with_sample_rate(SampleRate(rate)));
        }
    }
    None
}

/// One-shot real-time promotion for a stream thread. SCHED_FIFO 18
/// where the platform supports it; best-effort elsewhere. Failure is
/// logged and processing continues at normal priority.
fn promote_rt_thread() {
    #[cfg(target_os = "linux")]
    {
        use thread_priority::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadPriority, ThreadPriorityValue, ThreadSchedulePolicy,
        };

        let policy = ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo);
        match ThreadPriorityValue::try_from(18u8) {
            Ok(value) => {
                match set_thread_priority_and_policy(
                    thread_native_id(),
                    ThreadPriority::Crossplatform(value),
                    policy,
                ) {
                    Ok(()) => info!("audio thread pinned (SCHED_FIFO priority 18)"),
                    Err(e) => warn!("could not pin audio thread: {:?}", e),
                }
            }
            Err(e) => warn!("invalid realtime priority: {:?}", e),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        use thread_priority::{set_current_thread_priority, ThreadPriority};
        if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
            warn!("could not raise audio thread priority: {:?}", e);
        }
    }
}
