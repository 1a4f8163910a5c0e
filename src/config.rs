use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyId;

/// Named processing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModeId {
    Light,
    Premium,
}

impl ModeId {
    pub fn config(self) -> ModeConfig {
        match self {
            ModeId::Light => ModeConfig::LIGHT,
            ModeId::Premium => ModeConfig::PREMIUM,
        }
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeId::Light => f.write_str("LIGHT"),
            ModeId::Premium => f.write_str("PREMIUM"),
        }
    }
}

impl FromStr for ModeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LIGHT" => Ok(ModeId::Light),
            "PREMIUM" => Ok(ModeId::Premium),
            other => Err(anyhow::anyhow!("unknown mode '{other}' (expected LIGHT or PREMIUM)")),
        }
    }
}

#[cfg(feature = "webrtc")]
const PREMIUM_STRATEGY: StrategyId = StrategyId::WebRtc;
#[cfg(not(feature = "webrtc"))]
const PREMIUM_STRATEGY: StrategyId = StrategyId::Rnnoise;

/// Immutable per-session processing configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeConfig {
    pub id: ModeId,
    pub name: &'static str,
    pub capture_rate: u32,
    pub processing_rate: u32,
    pub output_rate: u32,
    pub frame_size: usize,
    pub hop_size: usize,
    pub strategy: StrategyId,
    /// Decimate processing rate -> output rate after denoising.
    pub use_resampler: bool,
    /// Minimum samples (at output rate) accumulated before a PCM16 chunk is emitted.
    pub chunk_samples: usize,
    pub expected_latency_ms: u32,
    pub expected_cpu_percent: u32,
}

impl ModeConfig {
    /// Low-CPU mode: denoise directly at the output rate, no output resampling.
    pub const LIGHT: ModeConfig = ModeConfig {
        id: ModeId::Light,
        name: "Light Mode (RNNoise)",
        capture_rate: 48_000,
        processing_rate: 24_000,
        output_rate: 24_000,
        frame_size: 480,
        hop_size: 240,
        strategy: StrategyId::Rnnoise,
        use_resampler: false,
        chunk_samples: 480,  // 20ms @ 24kHz
        expected_latency_ms: 35,
        expected_cpu_percent: 10,
    };

    /// High-quality mode: denoise at the capture rate, decimate 2:1 for transmission.
    pub const PREMIUM: ModeConfig = ModeConfig {
        id: ModeId::Premium,
        name: "Premium Mode",
        capture_rate: 48_000,
        processing_rate: 48_000,
        output_rate: 24_000,
        frame_size: 480,
        hop_size: 240,
        strategy: PREMIUM_STRATEGY,
        use_resampler: true,
        chunk_samples: 2400, // 100ms @ 24kHz
        expected_latency_ms: 70,
        expected_cpu_percent: 30,
    };
}

/// Session-wide settings. Every field has a default so partial JSON files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_mode: ModeId,
    pub auto_detect_mode: bool,
    pub fade_in_frames: usize,
    pub attenuation_limit_db: f32,
    pub ready_timeout_ms: u64,
    pub prewarm_timeout_ms: u64,
    pub enable_metrics: bool,
    pub toast_ttl_ms: u64,
    pub cpu_threshold_downgrade: f32,
    pub cpu_threshold_upgrade: f32,
    pub monitor_window: usize,
    pub monitor_interval_ms: u64,
    /// Overrides the mode's chunk threshold when set.
    pub chunk_samples: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_mode: ModeId::Premium,
            auto_detect_mode: true,
            fade_in_frames: 3,
            attenuation_limit_db: 32.0,
            ready_timeout_ms: 10_000,
            prewarm_timeout_ms: 5_000,
            enable_metrics: false,
            toast_ttl_ms: 4_000,
            cpu_threshold_downgrade: 75.0,
            cpu_threshold_upgrade: 40.0,
            monitor_window: 10,
            monitor_interval_ms: 2_000,
            chunk_samples: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn prewarm_timeout(&self) -> Duration {
        Duration::from_millis(self.prewarm_timeout_ms)
    }

    pub fn toast_ttl(&self) -> Duration {
        Duration::from_millis(self.toast_ttl_ms)
    }

    /// Build the construction-time configuration handed to a pipeline worker.
    pub fn pipeline_config(&self, mode: ModeConfig, model: Option<Arc<[u8]>>) -> PipelineConfig {
        PipelineConfig {
            mode,
            frame_size: mode.frame_size,
            model,
            enable_metrics: self.enable_metrics,
            chunk_samples: self.chunk_samples.unwrap_or(mode.chunk_samples).max(1),
            fade_in_frames: self.fade_in_frames,
            attenuation_limit_db: self.attenuation_limit_db,
            cpu_threshold_downgrade: self.cpu_threshold_downgrade,
            cpu_threshold_upgrade: self.cpu_threshold_upgrade,
            monitor_window: self.monitor_window.max(1),
            monitor_interval_ms: self.monitor_interval_ms,
        }
    }
}

/// Everything a pipeline worker needs at construction time.
#[derive(Clone)]
pub struct PipelineConfig {
    pub mode: ModeConfig,
    pub frame_size: usize,
    pub model: Option<Arc<[u8]>>,
    pub enable_metrics: bool,
    pub chunk_samples: usize,
    pub fade_in_frames: usize,
    pub attenuation_limit_db: f32,
    pub cpu_threshold_downgrade: f32,
    pub cpu_threshold_upgrade: f32,
    pub monitor_window: usize,
    pub monitor_interval_ms: u64,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("mode", &self.mode.id)
            .field("frame_size", &self.frame_size)
            .field("model_bytes", &self.model.as_ref().map(|m| m.len()))
            .field("enable_metrics", &self.enable_metrics)
            .field("chunk_samples", &self.chunk_samples)
            .field("fade_in_frames", &self.fade_in_frames)
            .finish()
    }
}

impl PipelineConfig {
    pub fn for_mode(mode: ModeConfig) -> Self {
        SessionConfig::default().pipeline_config(mode, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_constants_match_reference_rates() {
        let light = ModeConfig::LIGHT;
        assert_eq!(light.capture_rate, 48_000);
        assert_eq!(light.processing_rate, 24_000);
        assert_eq!(light.output_rate, 24_000);
        assert!(!light.use_resampler);

        let premium = ModeConfig::PREMIUM;
        assert_eq!(premium.processing_rate, 48_000);
        assert_eq!(premium.output_rate, 24_000);
        assert!(premium.use_resampler);
        assert_eq!(premium.processing_rate / premium.output_rate, 2);
    }

    #[test]
    fn mode_id_parses_case_insensitively() {
        assert_eq!("light".parse::<ModeId>().unwrap(), ModeId::Light);
        assert_eq!("PREMIUM".parse::<ModeId>().unwrap(), ModeId::Premium);
        assert!("turbo".parse::<ModeId>().is_err());
        assert_eq!(ModeId::Premium.to_string(), "PREMIUM");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = SessionConfig::from_json_str(r#"{"default_mode":"LIGHT","enable_metrics":true}"#).unwrap();
        assert_eq!(c.default_mode, ModeId::Light);
        assert!(c.enable_metrics);
        assert_eq!(c.fade_in_frames, 3);
        assert_eq!(c.toast_ttl_ms, 4_000);
    }

    #[test]
    fn pipeline_config_applies_chunk_override() {
        let mut c = SessionConfig::default();
        let p = c.pipeline_config(ModeConfig::PREMIUM, None);
        assert_eq!(p.chunk_samples, 2400);

        c.chunk_samples = Some(960);
        let p = c.pipeline_config(ModeConfig::PREMIUM, None);
        assert_eq!(p.chunk_samples, 960);
        assert_eq!(p.frame_size, 480);
    }
}
