//! Capability-based mode selection and the advisory runtime load monitor.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::{ModeId, SessionConfig};

const CPU_WEIGHT: f64 = 0.5;
const MEMORY_WEIGHT: f64 = 0.25;
const RUNTIME_WEIGHT: f64 = 0.15;
const DEVICE_WEIGHT: f64 = 0.1;
pub const PREMIUM_THRESHOLD: f64 = 60.0;

const BENCHMARK_ITERATIONS: u32 = 5_000_000;
const UPGRADE_MAX_VARIANCE: f32 = 20.0;

/// Source of the raw signals behind the capability score.
pub trait CapabilityProbe: Send + Sync {
    /// Wall time of the floating point micro-benchmark.
    fn cpu_benchmark(&self) -> Duration;

    /// Installed memory in GiB, if known.
    fn memory_gb(&self) -> Option<f64>;

    /// 0..=100 score for the vector units available to the denoiser.
    fn runtime_score(&self) -> f64;

    /// 0..=100 heuristic for the device class.
    fn device_score(&self) -> f64;
}

/// Probes the machine the process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn cpu_benchmark(&self) -> Duration {
        let start = Instant::now();
        let mut result = 0.0_f64;
        for i in 0..BENCHMARK_ITERATIONS {
            let x = std::hint::black_box(i as f64);
            result += x.sqrt() * (x * 0.001).sin() * (x * 0.002).cos();
        }
        std::hint::black_box(result);
        start.elapsed()
    }

    fn memory_gb(&self) -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_total_gb(&meminfo)
    }

    fn runtime_score(&self) -> f64 {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2") {
                100.0
            } else if std::arch::is_x86_feature_detected!("sse4.1") {
                85.0
            } else {
                70.0
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            85.0
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            50.0
        }
    }

    fn device_score(&self) -> f64 {
        match num_cpus::get_physical() {
            n if n >= 4 => 100.0,
            n if n >= 2 => 70.0,
            _ => 50.0,
        }
    }
}

fn parse_mem_total_gb(meminfo: &str) -> Option<f64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / (1024.0 * 1024.0))
}

pub fn cpu_score(elapsed: Duration) -> f64 {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms < 50.0 {
        100.0
    } else if ms > 300.0 {
        0.0
    } else {
        (100.0 - (ms - 50.0) / 250.0 * 100.0).max(0.0)
    }
}

pub fn memory_score(gb: Option<f64>) -> f64 {
    match gb {
        Some(gb) if gb >= 8.0 => 100.0,
        Some(gb) if gb >= 4.0 => 70.0,
        Some(gb) if gb >= 2.0 => 40.0,
        Some(_) => 0.0,
        // Unknown: assume a reasonably modern machine
        None => 70.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapabilityScores {
    pub cpu: f64,
    pub memory: f64,
    pub runtime: f64,
    pub device: f64,
}

impl CapabilityScores {
    pub fn measure(probe: &dyn CapabilityProbe) -> Self {
        let elapsed = probe.cpu_benchmark();
        tracing::debug!("CPU benchmark: {:.1}ms", elapsed.as_secs_f64() * 1000.0);
        Self {
            cpu: cpu_score(elapsed),
            memory: memory_score(probe.memory_gb()),
            runtime: probe.runtime_score(),
            device: probe.device_score(),
        }
    }

    pub fn total(&self) -> f64 {
        self.cpu * CPU_WEIGHT
            + self.memory * MEMORY_WEIGHT
            + self.runtime * RUNTIME_WEIGHT
            + self.device * DEVICE_WEIGHT
    }

    pub fn mode(&self) -> ModeId {
        if self.total() >= PREMIUM_THRESHOLD {
            ModeId::Premium
        } else {
            ModeId::Light
        }
    }
}

/// Pick the mode for a new session. Honors `auto_detect_mode = false`.
pub fn detect_optimal_mode(config: &SessionConfig, probe: &dyn CapabilityProbe) -> ModeId {
    if !config.auto_detect_mode {
        return config.default_mode;
    }
    let scores = CapabilityScores::measure(probe);
    let mode = scores.mode();
    tracing::info!(
        cpu = scores.cpu,
        memory = scores.memory,
        runtime = scores.runtime,
        device = scores.device,
        "selected mode {} (score {:.1})",
        mode,
        scores.total()
    );
    mode
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAdvice {
    Upgrade,
    Downgrade,
}

impl LoadAdvice {
    pub fn suggested_mode(self) -> ModeId {
        match self {
            LoadAdvice::Upgrade => ModeId::Premium,
            LoadAdvice::Downgrade => ModeId::Light,
        }
    }
}

impl fmt::Display for LoadAdvice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadAdvice::Upgrade => f.write_str("UPGRADE"),
            LoadAdvice::Downgrade => f.write_str("DOWNGRADE"),
        }
    }
}

/// Tracks processing time relative to audio time.
///
/// Every `interval` of audio one load sample (busy / audio, in percent) is
/// taken. Once `window` samples exist, each new sample re-evaluates the
/// average and may produce advice. Advice is informational only.
pub struct LoadMonitor {
    samples: VecDeque<f32>,
    window: usize,
    downgrade_percent: f32,
    upgrade_percent: f32,
    interval: Duration,
    audio_acc: Duration,
    busy_acc: Duration,
}

impl LoadMonitor {
    pub fn new(window: usize, downgrade_percent: f32, upgrade_percent: f32, interval: Duration) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            downgrade_percent,
            upgrade_percent,
            interval,
            audio_acc: Duration::ZERO,
            busy_acc: Duration::ZERO,
        }
    }

    pub fn record(&mut self, busy: Duration, audio: Duration) -> Option<LoadAdvice> {
        self.busy_acc += busy;
        self.audio_acc += audio;
        if self.audio_acc < self.interval || self.audio_acc.is_zero() {
            return None;
        }

        let load = (self.busy_acc.as_secs_f64() / self.audio_acc.as_secs_f64() * 100.0) as f32;
        self.busy_acc = Duration::ZERO;
        self.audio_acc = Duration::ZERO;

        self.samples.push_back(load);
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }
        if self.samples.len() < self.window {
            return None;
        }

        let mean = self.samples.iter().sum::<f32>() / self.window as f32;
        let variance =
            self.samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / self.window as f32;

        if mean > self.downgrade_percent {
            tracing::warn!("high processing load ({mean:.1}%), suggesting DOWNGRADE");
            Some(LoadAdvice::Downgrade)
        } else if mean < self.upgrade_percent && variance < UPGRADE_MAX_VARIANCE {
            tracing::debug!("low processing load ({mean:.1}%), UPGRADE possible");
            Some(LoadAdvice::Upgrade)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.audio_acc = Duration::ZERO;
        self.busy_acc = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        benchmark_ms: u64,
        memory: Option<f64>,
        runtime: f64,
        device: f64,
    }

    impl CapabilityProbe for FixedProbe {
        fn cpu_benchmark(&self) -> Duration {
            Duration::from_millis(self.benchmark_ms)
        }
        fn memory_gb(&self) -> Option<f64> {
            self.memory
        }
        fn runtime_score(&self) -> f64 {
            self.runtime
        }
        fn device_score(&self) -> f64 {
            self.device
        }
    }

    #[test]
    fn cpu_score_curve() {
        assert_eq!(cpu_score(Duration::from_millis(10)), 100.0);
        assert!((cpu_score(Duration::from_millis(175)) - 50.0).abs() < 1e-9);
        assert_eq!(cpu_score(Duration::from_millis(400)), 0.0);
    }

    #[test]
    fn memory_score_steps() {
        assert_eq!(memory_score(Some(16.0)), 100.0);
        assert_eq!(memory_score(Some(4.0)), 70.0);
        assert_eq!(memory_score(Some(2.5)), 40.0);
        assert_eq!(memory_score(Some(1.0)), 0.0);
        assert_eq!(memory_score(None), 70.0);
    }

    #[test]
    fn fast_machine_gets_premium() {
        let probe = FixedProbe { benchmark_ms: 20, memory: Some(16.0), runtime: 100.0, device: 100.0 };
        let scores = CapabilityScores::measure(&probe);
        assert!((scores.total() - 100.0).abs() < 1e-9);
        assert_eq!(detect_optimal_mode(&SessionConfig::default(), &probe), ModeId::Premium);
    }

    #[test]
    fn slow_cpu_dominates_score() {
        // cpu 0 * .5 + 100*.25 + 100*.15 + 100*.1 = 50
        let probe = FixedProbe { benchmark_ms: 500, memory: Some(16.0), runtime: 100.0, device: 100.0 };
        let scores = CapabilityScores::measure(&probe);
        assert!((scores.total() - 50.0).abs() < 1e-9);
        assert_eq!(scores.mode(), ModeId::Light);
    }

    #[test]
    fn disabled_auto_detect_uses_default() {
        let probe = FixedProbe { benchmark_ms: 500, memory: None, runtime: 0.0, device: 0.0 };
        let config = SessionConfig {
            auto_detect_mode: false,
            default_mode: ModeId::Premium,
            ..SessionConfig::default()
        };
        assert_eq!(detect_optimal_mode(&config, &probe), ModeId::Premium);
    }

    #[test]
    fn parses_meminfo() {
        let text = "MemTotal:       16318748 kB\nMemFree:         1000000 kB\n";
        let gb = parse_mem_total_gb(text).unwrap();
        assert!((gb - 15.56).abs() < 0.01);
        assert!(parse_mem_total_gb("garbage").is_none());
    }

    #[test]
    fn load_monitor_needs_full_window() {
        let mut m = LoadMonitor::new(3, 75.0, 40.0, Duration::from_secs(2));
        let busy = Duration::from_millis(1800);
        let audio = Duration::from_secs(2);
        assert_eq!(m.record(busy, audio), None);
        assert_eq!(m.record(busy, audio), None);
        assert_eq!(m.record(busy, audio), Some(LoadAdvice::Downgrade));
    }

    #[test]
    fn load_monitor_suggests_upgrade_when_idle_and_stable() {
        let mut m = LoadMonitor::new(2, 75.0, 40.0, Duration::from_millis(100));
        let audio = Duration::from_millis(100);
        assert_eq!(m.record(Duration::from_millis(5), audio), None);
        assert_eq!(m.record(Duration::from_millis(5), audio), Some(LoadAdvice::Upgrade));
    }

    #[test]
    fn load_monitor_accumulates_short_blocks() {
        let mut m = LoadMonitor::new(1, 75.0, 40.0, Duration::from_millis(20));
        let audio = Duration::from_millis(10);
        assert_eq!(m.record(Duration::from_millis(9), audio), None);
        assert_eq!(m.record(Duration::from_millis(9), audio), Some(LoadAdvice::Downgrade));
    }

    #[test]
    fn advice_maps_to_mode() {
        assert_eq!(LoadAdvice::Downgrade.suggested_mode(), ModeId::Light);
        assert_eq!(LoadAdvice::Upgrade.to_string(), "UPGRADE");
    }
}
