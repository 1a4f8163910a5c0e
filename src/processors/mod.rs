use crate::messages::AudioFrame;
use anyhow::Result;

// Sub-modules
pub mod frame_assembler;
pub mod denoise;
pub mod resample;
pub mod chunker;
pub mod dynamics;

// Re-exports
pub use frame_assembler::FrameAssembler;
pub use denoise::DenoiseInvoker;
pub use resample::{DecimationProcessor, InputRateAdapter, KaiserDecimator};
pub use chunker::ChunkAccumulator;
pub use dynamics::{DynamicsProcessor, DynamicsReport, DynamicsStage};

/// Trait for all audio processors in the pipeline
pub trait AudioProcessor: Send {
    /// Process a single audio frame
    /// Returns processed frame or None if more input is needed
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>>;

    /// Return additional ready frames produced from previously buffered input.
    /// Processors that are strictly 1:1 can keep the default implementation.
    fn drain_ready(&mut self) -> Result<Option<AudioFrame>> {
        Ok(None)
    }

    /// Flush any remaining buffered data
    fn flush(&mut self) -> Vec<AudioFrame>;

    /// Reset processor state for a new, unrelated stream
    fn reset(&mut self);

    /// Short stage name used for metrics and logs
    fn name(&self) -> &'static str;

    /// Apply a named runtime parameter. Returns `Ok(false)` when this stage
    /// does not own the parameter.
    fn set_param(&mut self, _name: &str, _value: f32) -> Result<bool> {
        Ok(false)
    }
}

/// Push one frame through a processor, collecting everything it makes ready.
pub(crate) fn run_stage(
    processor: &mut dyn AudioProcessor,
    frames: Vec<AudioFrame>,
    out: &mut Vec<AudioFrame>,
) -> usize {
    let mut errors = 0;
    for input in frames {
        match processor.process(input) {
            Ok(Some(processed)) => out.push(processed),
            Ok(None) => {}
            Err(e) => {
                errors += 1;
                tracing::warn!(stage = processor.name(), "processor error: {e:#}");
            }
        }
    }

    loop {
        match processor.drain_ready() {
            Ok(Some(ready)) => out.push(ready),
            Ok(None) => break,
            Err(e) => {
                errors += 1;
                tracing::warn!(stage = processor.name(), "processor drain error: {e:#}");
                break;
            }
        }
    }
    errors
}
