/// Encoded output chunk. Moved, never copied, from the pipeline thread to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcm16Chunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Pcm16Chunk {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels.max(1) as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Native-endian byte view for transports that want raw PCM.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Scale by 32768, round, clamp to the i16 range.
#[inline]
pub fn quantize_sample(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| quantize_sample(s)).collect()
}
