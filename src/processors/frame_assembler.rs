use std::collections::VecDeque;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::AudioProcessor;
use crate::capture::position_ns;
use crate::messages::AudioFrame;
use crate::stats::RuntimeStatsHandle;
use anyhow::{bail, Result};

/// Frame Assembler - converts variable-size blocks into fixed-size denoiser frames.
///
/// The remainder lives in a ring buffer sized to exactly one frame, so the
/// real-time thread never grows a buffer. Frames are emitted in arrival order;
/// an incomplete tail is carried to the next call and discarded on flush.
pub struct FrameAssembler {
    prod: HeapProd<f32>,
    cons: HeapCons<f32>,
    ready_queue: VecDeque<AudioFrame>,
    frame_size: usize,
    sample_rate: u32,
    frames_emitted: u64,
    discarded_samples: u64,
    stats: RuntimeStatsHandle,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        let (prod, cons) = HeapRb::<f32>::new(frame_size).split();
        Self {
            prod,
            cons,
            ready_queue: VecDeque::with_capacity(8),
            frame_size,
            sample_rate,
            frames_emitted: 0,
            discarded_samples: 0,
            stats: RuntimeStatsHandle::disabled(),
        }
    }

    pub fn with_stats(mut self, stats: RuntimeStatsHandle) -> Self {
        self.stats = stats;
        self
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples waiting for the next complete frame.
    pub fn pending(&self) -> usize {
        self.cons.occupied_len()
    }

    /// Total samples dropped by flushes since the last reset.
    pub fn discarded_samples(&self) -> u64 {
        self.discarded_samples
    }

    /// Accumulate `block` and return every complete frame it finishes.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = block;
        while !rest.is_empty() {
            let written = self.prod.push_slice(rest);
            rest = &rest[written..];
            if self.cons.occupied_len() == self.frame_size {
                let mut frame = vec![0.0_f32; self.frame_size];
                let read = self.cons.pop_slice(&mut frame);
                debug_assert_eq!(read, self.frame_size);
                frames.push(frame);
            }
        }
        frames
    }

    /// Drop the incomplete tail. Partial frames are never padded.
    /// Returns the number of samples discarded.
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.cons.clear();
        if dropped > 0 {
            self.discarded_samples += dropped as u64;
            self.stats.update(|s| s.partial_samples_discarded += dropped as u64);
            tracing::debug!(
                "discarding incomplete frame: {} samples (< {})",
                dropped,
                self.frame_size
            );
        }
        dropped
    }

    fn frame_timestamp(&self) -> u64 {
        position_ns(self.frames_emitted * self.frame_size as u64, self.sample_rate)
    }
}

impl AudioProcessor for FrameAssembler {
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>> {
        if frame.channels != 1 {
            bail!("frame assembler expects mono input, got {} channels", frame.channels);
        }
        if frame.sample_rate != self.sample_rate {
            bail!(
                "frame assembler expects {}Hz input, got {}Hz",
                self.sample_rate,
                frame.sample_rate
            );
        }

        for samples in self.push(&frame.samples) {
            let timestamp = self.frame_timestamp();
            self.frames_emitted += 1;
            self.ready_queue
                .push_back(AudioFrame::mono(samples, self.sample_rate, timestamp));
        }
        Ok(self.ready_queue.pop_front())
    }

    fn drain_ready(&mut self) -> Result<Option<AudioFrame>> {
        Ok(self.ready_queue.pop_front())
    }

    fn flush(&mut self) -> Vec<AudioFrame> {
        self.discard_partial();
        self.ready_queue.drain(..).collect()
    }

    fn reset(&mut self) {
        self.cons.clear();
        self.ready_queue.clear();
        self.frames_emitted = 0;
        self.discarded_samples = 0;
    }

    fn name(&self) -> &'static str {
        "frame_assembler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn emits_contiguous_frames_in_order() {
        let mut a = FrameAssembler::new(480, 48_000);
        let sizes = [128, 128, 128, 96, 500, 1000, 60];
        let total: usize = sizes.iter().sum();
        assert_eq!(total % 480, 0);

        let mut offset = 0;
        let mut frames = Vec::new();
        for size in sizes {
            frames.extend(a.push(&ramp(offset, size)));
            offset += size;
        }

        assert_eq!(frames.len(), total / 480);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f, &ramp(i * 480, 480));
        }
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn single_large_block_yields_multiple_frames_and_remainder() {
        let mut a = FrameAssembler::new(8, 48_000);
        let frames = a.push(&ramp(0, 21));
        assert_eq!(frames.len(), 2);
        assert_eq!(a.pending(), 5);

        let frames = a.push(&ramp(21, 3));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], ramp(16, 8));
    }

    #[test]
    fn timestamps_stay_exact_on_long_captures() {
        let mut a = FrameAssembler::new(480, 48_000);
        // 400 000 seconds in, well past the point a u64 product would wrap
        a.frames_emitted = 40_000_000;
        let frame = a.process(AudioFrame::mono(vec![0.0; 480], 48_000, 0)).unwrap().unwrap();
        assert_eq!(frame.timestamp, 400_000 * 1_000_000_000);
    }

    #[test]
    fn flush_discards_partial_frame() {
        let mut a = FrameAssembler::new(480, 48_000);
        assert!(a.push(&vec![0.5; 479]).is_empty());
        let flushed = AudioProcessor::flush(&mut a);
        assert!(flushed.is_empty());
        assert_eq!(a.pending(), 0);
        assert_eq!(a.discarded_samples(), 479);
    }

    #[test]
    fn processor_interface_drains_queued_frames() {
        let mut a = FrameAssembler::new(480, 48_000);
        let first = a.process(AudioFrame::mono(vec![1.0; 960], 48_000, 0)).unwrap().unwrap();
        let second = a.drain_ready().unwrap().unwrap();
        assert!(a.drain_ready().unwrap().is_none());
        assert_eq!(first.samples.len(), 480);
        assert_eq!(second.timestamp - first.timestamp, 10_000_000);
    }

    #[test]
    fn rejects_unexpected_format() {
        let mut a = FrameAssembler::new(480, 48_000);
        assert!(a.process(AudioFrame::mono(vec![0.0; 480], 16_000, 0)).is_err());
        let stereo = AudioFrame {
            samples: vec![0.0; 960],
            sample_rate: 48_000,
            channels: 2,
            timestamp: 0,
        };
        assert!(a.process(stereo).is_err());
    }

    #[test]
    fn reset_clears_remainder() {
        let mut a = FrameAssembler::new(4, 48_000);
        a.push(&[1.0, 2.0, 3.0]);
        a.reset();
        let frames = a.push(&[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(frames, vec![vec![4.0, 5.0, 6.0, 7.0]]);
    }
}
