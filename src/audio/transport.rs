//! Transport profile detection and safe-mode degradation policy
//!
//! Wireless transports buffer aggressively and stall under interference;
//! the engine needs to know what it is talking to and when to shed DSP
//! load. The router keeps the active transport profile (wired, A2DP,
//! HFP, LE Audio) and a four-state safe-mode machine driven by ring
//! occupancy and xrun rate.
//!
//! State updates run on the audio thread once per block; every reader
//! sees plain atomics. Profile strings are behind a mutex touched only
//! by control-thread getters and setters.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::info;

/// Xruns per second that count as transport distress.
const XRUN_RATE_TRIGGER: f32 = 5.0;

/// Ring occupancy below this is distress regardless of xrun rate.
const LOW_FILL_TRIGGER: f32 = 0.1;

/// Occupancy that counts as healthy again.
const RECOVERY_FILL: f32 = 0.5;

/// Dwell before Triggered escalates to Active.
const TRIGGER_DWELL_US: u64 = 100_000;

/// Healthy time required before Active moves to Recovering.
const RECOVERY_DWELL_US: u64 = 1_000_000;

/// Clean time required before Recovering returns to Normal.
const NORMAL_DWELL_US: u64 = 1_000_000;

/// Classified audio transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportProfile {
    /// Built-in or wired output. No codec latency.
    Wired,
    /// Bluetooth A2DP media link.
    A2dp { codec: String, latency_ms: f32 },
    /// Bluetooth hands-free link, narrow-band or wide-band.
    Hfp { sample_rate: u32 },
    /// BLE Audio (LC3).
    LeAudio { codec: String, sample_rate: u32 },
}

impl TransportProfile {
    pub fn name(&self) -> &'static str {
        match self {
            TransportProfile::Wired => "wired",
            TransportProfile::A2dp { .. } => "a2dp",
            TransportProfile::Hfp { .. } => "hfp",
            TransportProfile::LeAudio { .. } => "le-audio",
        }
    }

    pub fn codec_name(&self) -> &str {
        match self {
            TransportProfile::Wired => "pcm",
            TransportProfile::A2dp { codec, .. } => codec,
            TransportProfile::Hfp { .. } => "cvsd/msbc",
            TransportProfile::LeAudio { codec, .. } => codec,
        }
    }

    /// Codec latency declared by the transport, added on top of the
    /// measured burst and ring estimates.
    pub fn declared_latency_ms(&self) -> f32 {
        match self {
            TransportProfile::Wired => 0.0,
            TransportProfile::A2dp { latency_ms, .. } => *latency_ms,
            TransportProfile::Hfp { .. } => 40.0,
            TransportProfile::LeAudio { .. } => 30.0,
        }
    }

    pub fn is_wireless(&self) -> bool {
        !matches!(self, TransportProfile::Wired)
    }
}

/// Safe-mode machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SafeModeState {
    Normal = 0,
    Triggered = 1,
    Active = 2,
    Recovering = 3,
}

impl SafeModeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SafeModeState::Triggered,
            2 => SafeModeState::Active,
            3 => SafeModeState::Recovering,
            _ => SafeModeState::Normal,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SafeModeState::Normal => "normal",
            SafeModeState::Triggered => "triggered",
            SafeModeState::Active => "active",
            SafeModeState::Recovering => "recovering",
        }
    }
}

/// Transport profile record plus safe-mode machine.
pub struct TransportRouter {
    profile: Mutex<TransportProfile>,
    declared_latency_ms: AtomicU32,

    state: AtomicU8,
    /// Start of the current 1 s xrun-rate window.
    window_start_us: AtomicU64,
    /// Xrun total at the window start.
    window_xrun_base: AtomicU64,
    /// Xruns per second over the last full window.
    xrun_rate: AtomicU32,
    /// When the condition driving the current state began.
    condition_since_us: AtomicU64,
    /// When occupancy last turned healthy (0 = not healthy).
    healthy_since_us: AtomicU64,
    /// Xrun total when Recovering was entered.
    recover_xrun_base: AtomicU64,
}

impl Default for TransportRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRouter {
    pub fn new() -> Self {
        Self {
            profile: Mutex::new(TransportProfile::Wired),
            declared_latency_ms: AtomicU32::new(0.0f32.to_bits()),
            state: AtomicU8::new(SafeModeState::Normal as u8),
            window_start_us: AtomicU64::new(0),
            window_xrun_base: AtomicU64::new(0),
            xrun_rate: AtomicU32::new(0.0f32.to_bits()),
            condition_since_us: AtomicU64::new(0),
            healthy_since_us: AtomicU64::new(0),
            recover_xrun_base: AtomicU64::new(0),
        }
    }

    /// Classify the transport from the driver's device identifier.
    pub fn detect_profile(&self, device_name: &str, sample_rate: u32) {
        let name = device_name.to_ascii_lowercase();

        let profile = if name.contains("hfp")
            || name.contains("hands-free")
            || name.contains("headset")
            || name.contains("sco")
        {
            TransportProfile::Hfp { sample_rate }
        } else if name.contains("le audio") || name.contains("le-audio") || name.contains("lc3") {
            TransportProfile::LeAudio {
                codec: "lc3".to_string(),
                sample_rate,
            }
        } else if name.contains("bluetooth")
            || name.contains("a2dp")
            || name.contains("airpods")
            || name.contains("bt-")
        {
            // Codec is not visible through the driver; assume the SBC
            // baseline with its typical buffering.
            TransportProfile::A2dp {
                codec: "sbc".to_string(),
                latency_ms: 150.0,
            }
        } else {
            TransportProfile::Wired
        };

        info!(
            transport = profile.name(),
            codec = profile.codec_name(),
            declared_latency_ms = profile.declared_latency_ms(),
            "transport profile detected from '{}'",
            device_name
        );
        self.set_profile(profile);
    }

    /// Host override when the OS reports a transport change.
    pub fn set_profile(&self, profile: TransportProfile) {
        self.declared_latency_ms
            .store(profile.declared_latency_ms().to_bits(), Ordering::Relaxed);
        if let Ok(mut current) = self.profile.lock() {
            *current = profile;
        }
    }

    /// Snapshot of the active profile. Control thread only.
    pub fn profile(&self) -> TransportProfile {
        self.profile
            .lock()
            .map(|p| p.clone())
            .unwrap_or(TransportProfile::Wired)
    }

    /// Declared codec latency in ms. Safe from any thread.
    pub fn declared_latency_ms(&self) -> f32 {
        f32::from_bits(self.declared_latency_ms.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> SafeModeState {
        SafeModeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the DSP chain should be bypassed. Read by the audio
    /// callback once per block. Recovering still bypasses; the chain
    /// comes back only once the machine settles in Normal.
    pub fn is_safe_mode_active(&self) -> bool {
        matches!(
            self.state(),
            SafeModeState::Active | SafeModeState::Recovering
        )
    }

    /// Xruns per second over the last completed window.
    pub fn xrun_rate(&self) -> f32 {
        f32::from_bits(self.xrun_rate.load(Ordering::Relaxed))
    }

    /// Return the machine to Normal and restart the rate window.
    /// Called from the control thread while the engine is stopped or
    /// starting.
    pub fn reset(&self, now_us: u64, xrun_total: u64) {
        self.state
            .store(SafeModeState::Normal as u8, Ordering::Release);
        self.window_start_us.store(now_us, Ordering::Relaxed);
        self.window_xrun_base.store(xrun_total, Ordering::Relaxed);
        self.xrun_rate.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.condition_since_us.store(0, Ordering::Relaxed);
        self.healthy_since_us.store(0, Ordering::Relaxed);
    }

    /// Advance the machine. Audio thread, once per block.
    pub fn update_safe_mode_status(&self, fill_ratio: f32, xrun_total: u64, now_us: u64) {
        // Refresh the xrun rate once per second.
        let window_start = self.window_start_us.load(Ordering::Relaxed);
        if window_start == 0 {
            self.window_start_us.store(now_us, Ordering::Relaxed);
            self.window_xrun_base.store(xrun_total, Ordering::Relaxed);
        } else if now_us.saturating_sub(window_start) >= 1_000_000 {
            let base = self.window_xrun_base.load(Ordering::Relaxed);
            let elapsed_s = now_us.saturating_sub(window_start) as f32 / 1e6;
            let rate = xrun_total.saturating_sub(base) as f32 / elapsed_s;
            self.xrun_rate.store(rate.to_bits(), Ordering::Relaxed);
            self.window_start_us.store(now_us, Ordering::Relaxed);
            self.window_xrun_base.store(xrun_total, Ordering::Relaxed);
        }

        let distressed = self.xrun_rate() > XRUN_RATE_TRIGGER || fill_ratio < LOW_FILL_TRIGGER;

        let state = self.state();
        let next = match state {
            SafeModeState::Normal => {
                if distressed {
                    self.condition_since_us.store(now_us, Ordering::Relaxed);
                    SafeModeState::Triggered
                } else {
                    SafeModeState::Normal
                }
            }
            SafeModeState::Triggered => {
                if !distressed {
                    SafeModeState::Normal
                } else if now_us.saturating_sub(self.condition_since_us.load(Ordering::Relaxed))
                    >= TRIGGER_DWELL_US
                {
                    SafeModeState::Active
                } else {
                    SafeModeState::Triggered
                }
            }
            SafeModeState::Active => {
                if fill_ratio > RECOVERY_FILL {
                    let healthy_since = self.healthy_since_us.load(Ordering::Relaxed);
                    if healthy_since == 0 {
                        self.healthy_since_us.store(now_us, Ordering::Relaxed);
                        SafeModeState::Active
                    } else if now_us.saturating_sub(healthy_since) >= RECOVERY_DWELL_US {
                        self.recover_xrun_base.store(xrun_total, Ordering::Relaxed);
                        self.condition_since_us.store(now_us, Ordering::Relaxed);
                        SafeModeState::Recovering
                    } else {
                        SafeModeState::Active
                    }
                } else {
                    self.healthy_since_us.store(0, Ordering::Relaxed);
                    SafeModeState::Active
                }
            }
            SafeModeState::Recovering => {
                if xrun_total > self.recover_xrun_base.load(Ordering::Relaxed) {
                    self.healthy_since_us.store(0, Ordering::Relaxed);
                    SafeModeState::Active
                } else if now_us.saturating_sub(self.condition_since_us.load(Ordering::Relaxed))
                    >= NORMAL_DWELL_US
                {
                    self.healthy_since_us.store(0, Ordering::Relaxed);
                    SafeModeState::Normal
                } else {
                    SafeModeState::Recovering
                }
            }
        };

        if next != state {
            self.state.store(next as u8, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1000;

    #[test]
    fn test_profile_detection() {
        let router = TransportRouter::new();

        router.detect_profile("Built-in Audio Analog Stereo", 48000);
        assert_eq!(router.profile(), TransportProfile::Wired);
        assert_eq!(router.declared_latency_ms(), 0.0);

        router.detect_profile("WH-1000XM4 (Bluetooth)", 48000);
        assert_eq!(router.profile().name(), "a2dp");
        assert!(router.declared_latency_ms() > 100.0);

        router.detect_profile("Jabra Headset HFP", 16000);
        assert_eq!(router.profile().name(), "hfp");

        router.detect_profile("Buds Pro LC3", 48000);
        assert_eq!(router.profile().name(), "le-audio");
    }

    #[test]
    fn test_host_profile_override() {
        let router = TransportRouter::new();
        router.set_profile(TransportProfile::A2dp {
            codec: "aac".to_string(),
            latency_ms: 170.0,
        });
        assert_eq!(router.profile().codec_name(), "aac");
        assert_eq!(router.declared_latency_ms(), 170.0);
    }

    #[test]
    fn test_low_fill_trips_after_dwell() {
        let router = TransportRouter::new();
        router.reset(0, 0);

        // Healthy blocks first.
        let mut now = 0u64;
        for _ in 0..10 {
            now += 10 * MS;
            router.update_safe_mode_status(0.6, 0, now);
        }
        assert_eq!(router.state(), SafeModeState::Normal);

        // Fill collapses: Triggered immediately, Active after 100 ms.
        now += 10 * MS;
        router.update_safe_mode_status(0.05, 0, now);
        assert_eq!(router.state(), SafeModeState::Triggered);
        assert!(!router.is_safe_mode_active());

        for _ in 0..12 {
            now += 10 * MS;
            router.update_safe_mode_status(0.05, 0, now);
        }
        assert_eq!(router.state(), SafeModeState::Active);
        assert!(router.is_safe_mode_active());
    }

    #[test]
    fn test_brief_dip_returns_to_normal() {
        let router = TransportRouter::new();
        router.reset(0, 0);

        let mut now = 10 * MS;
        router.update_safe_mode_status(0.05, 0, now);
        assert_eq!(router.state(), SafeModeState::Triggered);

        // Condition clears before the dwell elapses.
        now += 20 * MS;
        router.update_safe_mode_status(0.6, 0, now);
        assert_eq!(router.state(), SafeModeState::Normal);
    }

    #[test]
    fn test_full_recovery_cycle() {
        let router = TransportRouter::new();
        router.reset(0, 0);

        // Collapse into Active.
        let mut now = 0u64;
        for _ in 0..20 {
            now += 10 * MS;
            router.update_safe_mode_status(0.05, 0, now);
        }
        assert_eq!(router.state(), SafeModeState::Active);

        // Healthy fill for over a second moves to Recovering.
        for _ in 0..110 {
            now += 10 * MS;
            router.update_safe_mode_status(0.7, 0, now);
        }
        assert_eq!(router.state(), SafeModeState::Recovering);
        assert!(router.is_safe_mode_active());

        // A clean second more and the chain is back.
        for _ in 0..110 {
            now += 10 * MS;
            router.update_safe_mode_status(0.7, 0, now);
        }
        assert_eq!(router.state(), SafeModeState::Normal);
        assert!(!router.is_safe_mode_active());
    }

    #[test]
    fn test_new_xrun_aborts_recovery() {
        let router = TransportRouter::new();
        router.reset(0, 0);

        let mut now = 0u64;
        for _ in 0..20 {
            now += 10 * MS;
            router.update_safe_mode_status(0.05, 5, now);
        }
        for _ in 0..110 {
            now += 10 * MS;
            router.update_safe_mode_status(0.7, 5, now);
        }
        assert_eq!(router.state(), SafeModeState::Recovering);

        // An xrun during recovery falls back to Active.
        now += 10 * MS;
        router.update_safe_mode_status(0.7, 6, now);
        assert_eq!(router.state(), SafeModeState::Active);
    }

    #[test]
    fn test_xrun_rate_window() {
        let router = TransportRouter::new();
        router.reset(0, 0);

        // 20 xruns inside one second: rate approximately 20/s.
        router.update_safe_mode_status(0.6, 0, 1);
        router.update_safe_mode_status(0.6, 20, 1_100_000);
        let rate = router.xrun_rate();
        assert!(
            (rate - 18.2).abs() < 1.0,
            "unexpected xrun rate {}",
            rate
        );

        // The rate alone counts as distress.
        router.update_safe_mode_status(0.6, 20, 1_200_000);
        assert_eq!(router.state(), SafeModeState::Triggered);
    }
}
