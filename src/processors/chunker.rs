use super::AudioProcessor;
use crate::messages::AudioFrame;
use anyhow::{bail, Result};

/// Accumulates processed output until at least `chunk_samples` are buffered,
/// then releases everything buffered as one chunk.
pub struct ChunkAccumulator {
    buffer: Vec<f32>,
    chunk_samples: usize,
    sample_rate: u32,
    timestamp: Option<u64>,
}

impl ChunkAccumulator {
    pub fn new(chunk_samples: usize, sample_rate: u32) -> Self {
        let chunk_samples = chunk_samples.max(1);
        Self {
            buffer: Vec::with_capacity(chunk_samples * 2),
            chunk_samples,
            sample_rate,
            timestamp: None,
        }
    }

    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take_chunk(&mut self) -> AudioFrame {
        let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_samples * 2));
        AudioFrame::mono(samples, self.sample_rate, self.timestamp.take().unwrap_or(0))
    }
}

impl AudioProcessor for ChunkAccumulator {
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>> {
        if frame.sample_rate != self.sample_rate {
            bail!(
                "chunker expects {}Hz, got {}Hz",
                self.sample_rate,
                frame.sample_rate
            );
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(frame.timestamp);
        }
        self.buffer.extend_from_slice(&frame.samples);

        if self.buffer.len() >= self.chunk_samples {
            Ok(Some(self.take_chunk()))
        } else {
            Ok(None)
        }
    }

    fn flush(&mut self) -> Vec<AudioFrame> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![self.take_chunk()]
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
    }

    fn name(&self) -> &'static str {
        "chunker"
    }
}
