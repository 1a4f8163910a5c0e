use super::AudioProcessor;
use crate::messages::AudioFrame;
use crate::stats::RuntimeStatsHandle;
use crate::strategy::DenoiserHandle;
use anyhow::{bail, Result};

/// Calls the denoiser once per complete frame.
///
/// The first `fade_in_frames` successful outputs after a reset are shaped by a
/// smoothstep envelope to hide the model's start-up transient. A failed call
/// forwards the unprocessed input instead of dropping the frame.
pub struct DenoiseInvoker {
    denoiser: DenoiserHandle,
    fade_in_frames: usize,
    processed_frames: usize,
    output: Vec<f32>,
    stats: RuntimeStatsHandle,
}

/// Cubic smoothstep `t²(3−2t)` for `t` in [0, 1].
#[inline]
pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

impl DenoiseInvoker {
    pub fn new(denoiser: DenoiserHandle, fade_in_frames: usize, stats: RuntimeStatsHandle) -> Self {
        let frame_length = denoiser.frame_length();
        Self {
            denoiser,
            fade_in_frames,
            processed_frames: 0,
            output: vec![0.0; frame_length],
            stats,
        }
    }

    pub fn frame_length(&self) -> usize {
        self.denoiser.frame_length()
    }

    /// Denoise one frame in place. Never fails: a faulting model leaves the input unchanged.
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        match self.denoiser.process(frame, &mut self.output) {
            Ok(()) => {
                self.processed_frames += 1;
                frame.copy_from_slice(&self.output);
                if self.processed_frames <= self.fade_in_frames {
                    let fade = smoothstep(self.processed_frames as f32 / self.fade_in_frames as f32);
                    frame.iter_mut().for_each(|s| *s *= fade);
                    if self.processed_frames == self.fade_in_frames {
                        tracing::debug!("fade-in complete after {} frames", self.fade_in_frames);
                    }
                }
                self.stats.update(|s| s.frames_denoised += 1);
            }
            Err(e) => {
                self.stats.update(|s| s.denoise_failures += 1);
                tracing::warn!("denoise failed, passing frame through: {e:#}");
            }
        }
    }
}

impl AudioProcessor for DenoiseInvoker {
    fn process(&mut self, mut frame: AudioFrame) -> Result<Option<AudioFrame>> {
        if frame.samples.len() != self.frame_length() {
            bail!(
                "denoiser frame size mismatch: expected {}, got {}",
                self.frame_length(),
                frame.samples.len()
            );
        }
        self.process_frame(&mut frame.samples);
        Ok(Some(frame))
    }

    fn flush(&mut self) -> Vec<AudioFrame> {
        Vec::new()
    }

    fn reset(&mut self) {
        self.processed_frames = 0;
    }

    fn name(&self) -> &'static str {
        "denoise"
    }

    fn set_param(&mut self, name: &str, value: f32) -> Result<bool> {
        self.denoiser.set_param(name, value)?;
        tracing::debug!("denoiser parameter {} set to {}", name, value);
        Ok(true)
    }
}
