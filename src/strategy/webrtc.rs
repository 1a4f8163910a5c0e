use webrtc_audio_processing::config::{HighPassFilter, NoiseSuppression, NoiseSuppressionLevel};
use webrtc_audio_processing::{Config, Processor};

use super::{attenuation_mix, Denoiser, DenoisingStrategy, StrategyId, PARAM_ATTENUATION_LIMIT_DB};
use anyhow::{anyhow, bail, Result};

pub const PARAM_SUPPRESSION_LEVEL: &str = "suppression_level";

/// WebRTC APM noise suppression, used as the full-rate strategy.
pub struct WebRtcStrategy {
    pub level: NoiseSuppressionLevel,
}

impl Default for WebRtcStrategy {
    fn default() -> Self {
        Self {
            level: NoiseSuppressionLevel::High,
        }
    }
}

impl DenoisingStrategy for WebRtcStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::WebRtc
    }

    fn create(
        &self,
        _model: Option<&[u8]>,
        attenuation_limit_db: f32,
        sample_rate: u32,
    ) -> Result<Box<dyn Denoiser>> {
        let apm = Processor::new(sample_rate)
            .map_err(|e| anyhow!("failed to create WebRTC processor: {e}"))?;
        let mut denoiser = WebRtcDenoiser {
            apm,
            scratch: Vec::new(),
            dry_mix: attenuation_mix(attenuation_limit_db),
        };
        denoiser.configure(self.level);
        denoiser.scratch = vec![0.0; denoiser.apm.num_samples_per_frame()];
        Ok(Box::new(denoiser))
    }
}

pub struct WebRtcDenoiser {
    apm: Processor,
    scratch: Vec<f32>,
    dry_mix: f32,
}

impl WebRtcDenoiser {
    fn configure(&mut self, level: NoiseSuppressionLevel) {
        let mut config = Config::default();

        // High pass filter improves NS on low-frequency rumble
        config.high_pass_filter = Some(HighPassFilter::default());
        config.noise_suppression = Some(NoiseSuppression {
            level,
            analyze_linear_aec_output: false,
        });
        config.echo_canceller = None;
        config.gain_controller = None;

        self.apm.set_config(config);
    }
}

impl Denoiser for WebRtcDenoiser {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let expected = self.scratch.len();
        if input.len() != expected || output.len() != expected {
            bail!("WebRTC NS frame must be {} samples, got {}", expected, input.len());
        }

        self.scratch.copy_from_slice(input);
        self.apm
            .process_capture_frame([self.scratch.as_mut_slice()])
            .map_err(|e| anyhow!("WebRTC NS processing error: {e}"))?;

        let wet = 1.0 - self.dry_mix;
        for ((out, &denoised), &dry) in output.iter_mut().zip(&self.scratch).zip(input) {
            *out = denoised * wet + dry * self.dry_mix;
        }
        Ok(())
    }

    fn frame_length(&self) -> usize {
        self.scratch.len()
    }

    fn set_param(&mut self, name: &str, value: f32) -> Result<()> {
        match name {
            PARAM_ATTENUATION_LIMIT_DB => {
                self.dry_mix = attenuation_mix(value);
                Ok(())
            }
            PARAM_SUPPRESSION_LEVEL => {
                let level = match value.round() as i32 {
                    0 => NoiseSuppressionLevel::Low,
                    1 => NoiseSuppressionLevel::Moderate,
                    2 => NoiseSuppressionLevel::High,
                    3 => NoiseSuppressionLevel::VeryHigh,
                    other => bail!("suppression level must be 0..=3, got {other}"),
                };
                self.configure(level);
                Ok(())
            }
            other => bail!("WebRTC NS has no parameter '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_is_10ms_at_48k() {
        let d = WebRtcStrategy::default().create(None, 32.0, 48_000).unwrap();
        assert_eq!(d.frame_length(), 480);
    }

    #[test]
    fn keeps_frame_length_and_rejects_mismatch() {
        let mut d = WebRtcStrategy::default().create(None, 32.0, 48_000).unwrap();
        let input = vec![0.1; 480];
        let mut output = vec![0.0; 480];
        d.process(&input, &mut output).unwrap();

        let mut short = vec![0.0; 160];
        assert!(d.process(&[0.0; 160], &mut short).is_err());
    }

    #[test]
    fn suppression_level_is_validated() {
        let mut d = WebRtcStrategy::default().create(None, 32.0, 48_000).unwrap();
        assert!(d.set_param(PARAM_SUPPRESSION_LEVEL, 3.0).is_ok());
        assert!(d.set_param(PARAM_SUPPRESSION_LEVEL, 7.0).is_err());
    }
}
