use super::AudioProcessor;
use crate::messages::AudioFrame;
use crate::stats::RuntimeStatsHandle;
use anyhow::Result;

const TARGET_RMS: f32 = 0.58;
const NOISE_GATE_RMS: f32 = 0.0008;
const NOISE_GATE_GAIN: f32 = 0.25;
const NORMALIZE_UPPER_RMS: f32 = 0.35;
const REDUCE_UPPER_RMS: f32 = 0.55;
const RMS_FLOOR: f32 = 0.008;
const MAX_GAIN: f32 = 2.5;
const LOUD_GAIN: f32 = 0.95;
const CLIP_GUARD_PEAK: f32 = 0.96;
const CLIP_GUARD_TARGET: f32 = 0.93;
const SMOOTHING_RISE: f32 = 0.88;
const SMOOTHING_FALL: f32 = 0.75;

pub const KNEE_THRESHOLD: f32 = 0.8;
pub const KNEE_WIDTH: f32 = 0.16;
pub const CEILING: f32 = KNEE_THRESHOLD + KNEE_WIDTH;

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicsReport {
    pub processed: Vec<f32>,
    pub gain_applied: f32,
    pub rms: f32,
    pub peak: f32,
    pub saturated: bool,
}

pub fn rms(buffer: &[f32]) -> f32 {
    if buffer.is_empty() {
        return 0.0;
    }
    let sum: f32 = buffer.iter().map(|s| s * s).sum();
    (sum / buffer.len() as f32).sqrt()
}

pub fn peak(buffer: &[f32]) -> f32 {
    buffer.iter().fold(0.0_f32, |p, s| p.max(s.abs()))
}

fn target_gain(rms: f32, peak: f32) -> f32 {
    let mut target = if rms < NOISE_GATE_RMS {
        NOISE_GATE_GAIN
    } else if rms < NORMALIZE_UPPER_RMS {
        (TARGET_RMS / rms.max(RMS_FLOOR)).min(MAX_GAIN)
    } else if rms < REDUCE_UPPER_RMS {
        LOUD_GAIN.max(TARGET_RMS / rms)
    } else {
        LOUD_GAIN
    };

    if peak * target > CLIP_GUARD_PEAK {
        target = CLIP_GUARD_TARGET / peak;
    }
    target
}

/// Soft-knee limiter for one gained sample. Returns the limited sample and
/// whether the hard ceiling was hit.
#[inline]
pub fn soft_knee(sample: f32) -> (f32, bool) {
    let a = sample.abs();
    if a <= KNEE_THRESHOLD {
        return (sample, false);
    }
    let excess = a - KNEE_THRESHOLD;
    if excess < KNEE_WIDTH {
        let ratio = excess / KNEE_WIDTH;
        let curve = ratio * ratio * (3.0 - 2.0 * ratio);
        let compressed = (KNEE_THRESHOLD + excess * (1.0 - curve * 0.5)).min(CEILING);
        (sample / a * compressed, false)
    } else {
        (sample.signum() * CEILING, true)
    }
}

/// Adaptive gain with asymmetric smoothing followed by a soft-knee limiter.
/// The previous gain is the only state and persists until `reset`.
pub struct DynamicsProcessor {
    prev_gain: f32,
}

impl DynamicsProcessor {
    pub fn new() -> Self {
        Self { prev_gain: 1.0 }
    }

    pub fn previous_gain(&self) -> f32 {
        self.prev_gain
    }

    pub fn process(&mut self, buffer: &[f32]) -> DynamicsReport {
        let rms = rms(buffer);
        let peak = peak(buffer);
        let target = target_gain(rms, peak);

        let smoothing = if target < self.prev_gain {
            SMOOTHING_FALL
        } else {
            SMOOTHING_RISE
        };
        let gain = self.prev_gain * smoothing + target * (1.0 - smoothing);
        self.prev_gain = gain;

        let mut saturated = false;
        let processed = buffer
            .iter()
            .map(|&x| {
                let (s, hit) = soft_knee(x * gain);
                saturated |= hit;
                s
            })
            .collect();

        DynamicsReport {
            processed,
            gain_applied: gain,
            rms,
            peak,
            saturated,
        }
    }

    pub fn reset(&mut self) {
        self.prev_gain = 1.0;
    }
}

impl Default for DynamicsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Chain stage wrapping [`DynamicsProcessor`]; records levels into the stats.
pub struct DynamicsStage {
    dynamics: DynamicsProcessor,
    stats: RuntimeStatsHandle,
}

impl DynamicsStage {
    pub fn new(stats: RuntimeStatsHandle) -> Self {
        Self {
            dynamics: DynamicsProcessor::new(),
            stats,
        }
    }
}

impl AudioProcessor for DynamicsStage {
    fn process(&mut self, mut frame: AudioFrame) -> Result<Option<AudioFrame>> {
        let report = self.dynamics.process(&frame.samples);
        self.stats.update(|s| {
            s.last_gain = report.gain_applied;
            s.last_rms = report.rms;
            s.last_peak = report.peak;
            if report.saturated {
                s.saturated_chunks += 1;
            }
        });
        frame.samples = report.processed;
        Ok(Some(frame))
    }

    fn flush(&mut self) -> Vec<AudioFrame> {
        Vec::new()
    }

    fn reset(&mut self) {
        self.dynamics.reset();
    }

    fn name(&self) -> &'static str {
        "dynamics"
    }
}
