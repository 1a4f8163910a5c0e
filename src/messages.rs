use crate::capability::LoadAdvice;
use crate::pcm::Pcm16Chunk;

/// Universal audio frame for the processing chain.
/// Carries raw capture blocks, fixed-size denoiser frames and resampled output alike.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,     // Interleaved when channels > 1
    pub sample_rate: u32,      // Current sample rate (changes across resampling stages)
    pub channels: u16,         // Current channel count (mono after downmix)
    pub timestamp: u64,        // Stream position in nanoseconds
}

impl AudioFrame {
    pub fn mono(samples: Vec<f32>, sample_rate: u32, timestamp: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            timestamp,
        }
    }

    /// Playback duration of this frame in nanoseconds.
    pub fn duration_ns(&self) -> u64 {
        let frames = (self.samples.len() / self.channels.max(1) as usize) as u64;
        if self.sample_rate == 0 {
            0
        } else {
            frames * 1_000_000_000 / self.sample_rate as u64
        }
    }
}

/// Control signals sent from the session controller to the pipeline worker.
/// They are observed at the start of the next block callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Start,
    Stop,
    Flush,
    Cleanup,
    /// Forwarded to whichever stage owns the named parameter.
    SetParam { name: String, value: f32 },
}

/// Status messages sent from the pipeline worker back to the controller.
#[derive(Debug)]
pub enum PipelineEvent {
    /// Denoiser created and warmed.
    Ready,
    Error { message: String },
    /// First processed block after `Start`; lets a recorder align its start point.
    FirstAudio,
    Pcm16(Pcm16Chunk),
    /// All output produced by a `Flush` has been sent.
    Flushed,
    LoadAdvice(LoadAdvice),
}

/// What the external consumer of a session receives.
#[derive(Debug)]
pub enum SessionEvent {
    FirstAudio,
    Audio(Pcm16Chunk),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_clone_preserves_fields() {
        let f = AudioFrame {
            samples: vec![0.1, -0.2],
            sample_rate: 48_000,
            channels: 2,
            timestamp: 123,
        };
        let c = f.clone();
        assert_eq!(c.samples, vec![0.1, -0.2]);
        assert_eq!(c.sample_rate, 48_000);
        assert_eq!(c.channels, 2);
        assert_eq!(c.timestamp, 123);
    }

    #[test]
    fn duration_accounts_for_channels() {
        let stereo = AudioFrame {
            samples: vec![0.0; 960],
            sample_rate: 48_000,
            channels: 2,
            timestamp: 0,
        };
        assert_eq!(stereo.duration_ns(), 10_000_000);

        let mono = AudioFrame::mono(vec![0.0; 240], 24_000, 0);
        assert_eq!(mono.duration_ns(), 10_000_000);
    }
}
