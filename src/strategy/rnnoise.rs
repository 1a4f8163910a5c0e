use nnnoiseless::DenoiseState;

use super::{attenuation_mix, Denoiser, DenoisingStrategy, StrategyId, PARAM_ATTENUATION_LIMIT_DB};
use anyhow::{bail, Result};

// RNNoise works on i16-scaled floats.
const PCM_SCALE: f32 = 32768.0;

/// RNNoise (nnnoiseless) denoiser: 480-sample frames, stationary noise.
pub struct RnnoiseStrategy;

impl DenoisingStrategy for RnnoiseStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::Rnnoise
    }

    fn create(
        &self,
        _model: Option<&[u8]>,
        attenuation_limit_db: f32,
        sample_rate: u32,
    ) -> Result<Box<dyn Denoiser>> {
        if sample_rate != 48_000 {
            tracing::info!(
                "RNNoise running at {}Hz (model trained at 48kHz)",
                sample_rate
            );
        }
        Ok(Box::new(RnnoiseDenoiser::new(attenuation_limit_db)))
    }
}

pub struct RnnoiseDenoiser {
    state: Box<DenoiseState<'static>>,
    scaled_in: Vec<f32>,
    scaled_out: Vec<f32>,
    dry_mix: f32,
}

impl RnnoiseDenoiser {
    pub fn new(attenuation_limit_db: f32) -> Self {
        Self {
            state: DenoiseState::new(),
            scaled_in: vec![0.0; DenoiseState::FRAME_SIZE],
            scaled_out: vec![0.0; DenoiseState::FRAME_SIZE],
            dry_mix: attenuation_mix(attenuation_limit_db),
        }
    }
}

impl Denoiser for RnnoiseDenoiser {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let n = DenoiseState::FRAME_SIZE;
        if input.len() != n || output.len() != n {
            bail!("RNNoise frame must be {} samples, got {}", n, input.len());
        }

        for (dst, &src) in self.scaled_in.iter_mut().zip(input) {
            *dst = src * PCM_SCALE;
        }
        self.state.process_frame(&mut self.scaled_out, &self.scaled_in);

        let wet = 1.0 - self.dry_mix;
        for ((out, &denoised), &dry) in output.iter_mut().zip(&self.scaled_out).zip(input) {
            let value = denoised / PCM_SCALE * wet + dry * self.dry_mix;
            if !value.is_finite() {
                bail!("RNNoise produced a non-finite sample");
            }
            *out = value;
        }
        Ok(())
    }

    fn frame_length(&self) -> usize {
        DenoiseState::FRAME_SIZE
    }

    fn set_param(&mut self, name: &str, value: f32) -> Result<()> {
        match name {
            PARAM_ATTENUATION_LIMIT_DB => {
                self.dry_mix = attenuation_mix(value);
                Ok(())
            }
            other => bail!("RNNoise has no parameter '{other}'"),
        }
    }
}
