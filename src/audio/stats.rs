//! Process CPU and memory sampling
//!
//! The reporter thread polls these once per second for the monitoring
//! surface. Sampling reads OS statistics files and may block, so it
//! never runs on the audio thread. Platforms without a backend get the
//! no-op implementation and sentinel values.

use tracing::warn;

/// Capability for reading process resource usage.
pub trait SystemStats: Send {
    /// Process CPU utilization as a percentage of total machine
    /// capacity since the previous call. Returns 0.0 when unavailable.
    fn read_cpu_percent(&mut self) -> f32;

    /// Resident set size in bytes. Returns 0 when unavailable.
    fn read_rss_bytes(&mut self) -> u64;
}

/// No-op backend: sentinels only.
pub struct NullStats;

impl SystemStats for NullStats {
    fn read_cpu_percent(&mut self) -> f32 {
        0.0
    }

    fn read_rss_bytes(&mut self) -> u64 {
        0
    }
}

/// Linux backend reading `/proc`.
#[cfg(target_os = "linux")]
pub struct ProcStats {
    last_process_jiffies: u64,
    last_total_jiffies: u64,
    warned: bool,
}

#[cfg(target_os = "linux")]
impl ProcStats {
    const PAGE_SIZE: u64 = 4096;

    pub fn new() -> Self {
        Self {
            last_process_jiffies: 0,
            last_total_jiffies: 0,
            warned: false,
        }
    }

    /// Sum of all cpu jiffies from the first line of /proc/stat.
    fn total_jiffies() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let mut fields = line.split_whitespace();
        if fields.next()? != "cpu" {
            return None;
        }
        let mut total = 0u64;
        for field in fields {
            total += field.parse::<u64>().ok()?;
        }
        Some(total)
    }

    /// utime + stime from /proc/self/stat. The comm field may contain
    /// spaces, so parsing starts after the closing parenthesis.
    fn process_jiffies() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        let after_comm = &stat[stat.rfind(')')? + 2..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // Fields are 1-indexed from "state"; utime and stime are the
        // 12th and 13th after comm.
        let utime = fields.get(11)?.parse::<u64>().ok()?;
        let stime = fields.get(12)?.parse::<u64>().ok()?;
        Some(utime + stime)
    }

    fn warn_once(&mut self) {
        if !self.warned {
            self.warned = true;
            warn!("process statistics unavailable; reporting sentinel values");
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl SystemStats for ProcStats {
    fn read_cpu_percent(&mut self) -> f32 {
        let (process, total) = match (Self::process_jiffies(), Self::total_jiffies()) {
            (Some(p), Some(t)) => (p, t),
            _ => {
                self.warn_once();
                return 0.0;
            }
        };

        let delta_process = process.saturating_sub(self.last_process_jiffies);
        let delta_total = total.saturating_sub(self.last_total_jiffies);
        let first_sample = self.last_total_jiffies == 0;
        self.last_process_jiffies = process;
        self.last_total_jiffies = total;

        if first_sample || delta_total == 0 {
            return 0.0;
        }
        (delta_process as f32 / delta_total as f32 * 100.0).clamp(0.0, 100.0)
    }

    fn read_rss_bytes(&mut self) -> u64 {
        let statm = match std::fs::read_to_string("/proc/self/statm") {
            Ok(s) => s,
            Err(_) => {
                self.warn_once();
                return 0;
            }
        };
        statm
            .split_whitespace()
            .nth(1)
            .and_then(|pages| pages.parse::<u64>().ok())
            .map(|pages| pages * Self::PAGE_SIZE)
            .unwrap_or_else(|| {
                self.warn_once();
                0
            })
    }
}

/// Platform default: `/proc` on Linux, sentinels elsewhere.
pub fn platform_stats() -> Box<dyn SystemStats> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcStats::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullStats)
    }
}
