use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::capability::{LoadAdvice, LoadMonitor};
use crate::config::PipelineConfig;
use crate::messages::{AudioFrame, ControlMessage, PipelineEvent};
use crate::pcm::{quantize, Pcm16Chunk};
use crate::processors::{
    run_stage, AudioProcessor, ChunkAccumulator, DecimationProcessor, DenoiseInvoker,
    DynamicsStage, FrameAssembler, InputRateAdapter,
};
use crate::stats::RuntimeStatsHandle;
use crate::strategy::{DenoiserHandle, DenoisingStrategy};

const WARMUP_FRAMES: usize = 2;
const METRICS_LOG_EVERY_CHUNKS: u64 = 50;

/// The real-time block callback: capture block in, PCM16 chunks out.
///
/// All per-session state (remainder, filter history, gain, fade-in counter)
/// lives in the processor chain and is owned by the single worker thread.
pub struct ProcessingPipeline {
    processors: Vec<Box<dyn AudioProcessor>>,
    events: Sender<PipelineEvent>,
    stats: RuntimeStatsHandle,
    monitor: LoadMonitor,
    active: bool,
    first_audio_pending: bool,
    last_advice: Option<LoadAdvice>,
    chunks_out: u64,
}

impl ProcessingPipeline {
    pub fn new(
        config: &PipelineConfig,
        denoiser: DenoiserHandle,
        events: Sender<PipelineEvent>,
        stats: RuntimeStatsHandle,
    ) -> Self {
        let mode = config.mode;
        let rate = mode.processing_rate;
        let output_rate = if mode.use_resampler { rate / 2 } else { rate };
        if output_rate != mode.output_rate {
            tracing::warn!(
                "mode {} declares {}Hz output but the chain produces {}Hz",
                mode.id,
                mode.output_rate,
                output_rate
            );
        }

        let mut processors: Vec<Box<dyn AudioProcessor>> = Vec::new();

        // Stage 1: device rate/channels -> mono at the processing rate
        processors.push(Box::new(InputRateAdapter::new(rate)));

        // Stage 2: fixed-size frames for the denoiser
        processors.push(Box::new(
            FrameAssembler::new(config.frame_size, rate).with_stats(stats.clone()),
        ));

        // Stage 3: denoise with fade-in and fail-open
        processors.push(Box::new(DenoiseInvoker::new(
            denoiser,
            config.fade_in_frames,
            stats.clone(),
        )));

        // Stage 4: 2:1 decimation to the output rate (PREMIUM)
        if mode.use_resampler {
            processors.push(Box::new(DecimationProcessor::new(rate)));
        }

        // Stage 5: batch to the chunk threshold, then level
        processors.push(Box::new(ChunkAccumulator::new(config.chunk_samples, output_rate)));
        processors.push(Box::new(DynamicsStage::new(stats.clone())));

        Self {
            processors,
            events,
            stats,
            monitor: LoadMonitor::new(
                config.monitor_window,
                config.cpu_threshold_downgrade,
                config.cpu_threshold_upgrade,
                Duration::from_millis(config.monitor_interval_ms),
            ),
            active: false,
            first_audio_pending: false,
            last_advice: None,
            chunks_out: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stats(&self) -> &RuntimeStatsHandle {
        &self.stats
    }

    /// Apply a control message. Returns `false` when the worker should exit.
    pub fn handle_control(&mut self, message: ControlMessage) -> bool {
        match message {
            ControlMessage::Start => {
                for processor in &mut self.processors {
                    processor.reset();
                }
                self.monitor.reset();
                self.stats.reset();
                self.last_advice = None;
                self.chunks_out = 0;
                self.active = true;
                self.first_audio_pending = true;
                tracing::debug!("pipeline started");
            }
            ControlMessage::Stop => {
                self.active = false;
                tracing::debug!("pipeline stopped");
            }
            ControlMessage::Flush => self.flush(),
            ControlMessage::Cleanup => {
                self.active = false;
                tracing::debug!("pipeline cleanup requested");
                return false;
            }
            ControlMessage::SetParam { name, value } => self.set_param(&name, value),
        }
        true
    }

    fn set_param(&mut self, name: &str, value: f32) {
        for processor in &mut self.processors {
            match processor.set_param(name, value) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(stage = processor.name(), "set_param {} failed: {e:#}", name);
                    return;
                }
            }
        }
        tracing::warn!("no pipeline stage accepts parameter '{}'", name);
    }

    /// Process one capture block. Blocks arriving while inactive are dropped.
    pub fn process_block(&mut self, block: AudioFrame) {
        if !self.active {
            self.stats.update(|s| s.blocks_dropped_inactive += 1);
            return;
        }
        let started = Instant::now();
        let audio = Duration::from_nanos(block.duration_ns());
        self.stats.update(|s| s.blocks_in += 1);

        if self.first_audio_pending {
            self.first_audio_pending = false;
            let _ = self.events.send(PipelineEvent::FirstAudio);
        }

        let mut frames = vec![block];
        let mut errors = 0;
        for processor in self.processors.iter_mut() {
            let stage_start = Instant::now();
            let mut next = Vec::new();
            errors += run_stage(processor.as_mut(), frames, &mut next);
            let elapsed = stage_start.elapsed().as_nanos() as u64;
            let name = processor.name();
            self.stats.update(|s| {
                if let Some(stage) = s.stage_mut(name) {
                    stage.record(elapsed);
                }
            });
            frames = next;
            if frames.is_empty() {
                break;
            }
        }
        if errors > 0 {
            self.stats.update(|s| s.processor_errors += errors as u64);
        }

        for chunk in frames {
            self.emit_chunk(chunk);
        }

        let busy = started.elapsed();
        self.stats
            .update(|s| s.block_total.record(busy.as_nanos() as u64));
        if let Some(advice) = self.monitor.record(busy, audio) {
            if self.last_advice != Some(advice) {
                self.last_advice = Some(advice);
                self.stats.update(|s| s.load_advice_events += 1);
                let _ = self.events.send(PipelineEvent::LoadAdvice(advice));
            }
        }
    }

    /// Drop the partial frame, push everything still buffered downstream,
    /// emit it, then mark the end of the flush.
    fn flush(&mut self) {
        let mut carry: Vec<AudioFrame> = Vec::new();
        for processor in self.processors.iter_mut() {
            let mut out = Vec::new();
            run_stage(processor.as_mut(), carry, &mut out);
            out.extend(processor.flush());
            carry = out;
        }
        for chunk in carry {
            self.emit_chunk(chunk);
        }
        let _ = self.events.send(PipelineEvent::Flushed);
    }

    fn emit_chunk(&mut self, chunk: AudioFrame) {
        if chunk.samples.is_empty() {
            return;
        }
        let pcm = Pcm16Chunk {
            samples: quantize(&chunk.samples),
            sample_rate: chunk.sample_rate,
            channels: chunk.channels,
        };
        let len = pcm.len() as u64;
        self.chunks_out += 1;
        self.stats.update(|s| {
            s.chunks_out += 1;
            s.samples_out += len;
        });
        if self.stats.is_enabled() && self.chunks_out % METRICS_LOG_EVERY_CHUNKS == 0 {
            let snap = self.stats.snapshot();
            tracing::info!(
                gain = snap.last_gain,
                rms = snap.last_rms,
                peak = snap.last_peak,
                saturated_chunks = snap.saturated_chunks,
                "level summary after {} chunks",
                self.chunks_out
            );
        }
        // Ownership of the samples moves to the consumer
        let _ = self.events.send(PipelineEvent::Pcm16(pcm));
    }
}

/// Feed a few silent frames through a fresh denoiser so the first real frame
/// does not pay the model's first-call cost.
pub fn warm_up(denoiser: &mut DenoiserHandle) {
    let len = denoiser.frame_length();
    let silence = vec![0.0_f32; len];
    let mut out = vec![0.0_f32; len];
    for _ in 0..WARMUP_FRAMES {
        if let Err(e) = denoiser.process(&silence, &mut out) {
            tracing::warn!("denoiser warm-up failed: {e:#}");
            break;
        }
    }
}

/// Apply `control` on the worker. A `Stop` first runs the blocks already
/// queued so audio captured before it reaches the consumer.
fn apply_control(
    pipeline: &mut ProcessingPipeline,
    control: ControlMessage,
    audio_rx: &Receiver<AudioFrame>,
) -> bool {
    if matches!(control, ControlMessage::Stop) && pipeline.is_active() {
        let queued = audio_rx.len();
        for block in audio_rx.try_iter().take(queued) {
            pipeline.process_block(block);
        }
        if queued > 0 {
            tracing::debug!("processed {} queued blocks before stop", queued);
        }
    }
    pipeline.handle_control(control)
}

/// Worker thread body: build the denoiser, warm it, report readiness, then
/// serve control messages and audio blocks until cleanup or disconnect.
pub fn run_worker(
    config: PipelineConfig,
    strategy: Arc<dyn DenoisingStrategy>,
    audio_rx: Receiver<AudioFrame>,
    control_rx: Receiver<ControlMessage>,
    events: Sender<PipelineEvent>,
    stats: RuntimeStatsHandle,
) {
    let mode = config.mode;
    let mut denoiser = match DenoiserHandle::create(
        strategy.as_ref(),
        config.model.as_deref(),
        config.attenuation_limit_db,
        mode.processing_rate,
    ) {
        Ok(denoiser) => denoiser,
        Err(e) => {
            tracing::error!("{} denoiser initialization failed: {e:#}", mode.id);
            let _ = events.send(PipelineEvent::Error {
                message: format!("{e:#}"),
            });
            return;
        }
    };

    if denoiser.frame_length() != config.frame_size {
        let message = format!(
            "denoiser frame length {} does not match configured frame size {}",
            denoiser.frame_length(),
            config.frame_size
        );
        tracing::error!("{}", message);
        let _ = events.send(PipelineEvent::Error { message });
        return;
    }

    warm_up(&mut denoiser);

    let mut pipeline = ProcessingPipeline::new(&config, denoiser, events.clone(), stats);
    tracing::info!("{} pipeline ready ({:?})", mode.name, config);
    if events.send(PipelineEvent::Ready).is_err() {
        return;
    }

    loop {
        crossbeam_channel::select! {
            recv(control_rx) -> msg => match msg {
                Ok(control) => {
                    if !apply_control(&mut pipeline, control, &audio_rx) {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(audio_rx) -> msg => match msg {
                Ok(block) => {
                    // Controls are observed at the start of the next block,
                    // except that a Stop lets the block in hand through
                    let mut pending = Some(block);
                    let mut exit = false;
                    while let Ok(control) = control_rx.try_recv() {
                        if matches!(control, ControlMessage::Stop) {
                            if let Some(block) = pending.take() {
                                pipeline.process_block(block);
                            }
                        }
                        if !apply_control(&mut pipeline, control, &audio_rx) {
                            exit = true;
                            break;
                        }
                    }
                    if exit {
                        break;
                    }
                    if let Some(block) = pending {
                        pipeline.process_block(block);
                    }
                }
                Err(_) => break,
            },
        }
    }

    tracing::debug!("{} pipeline worker exiting", mode.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeConfig;
    use crate::strategy::testing::ScaleStrategy;

    fn pipeline(mode: ModeConfig, strategy: &ScaleStrategy) -> (ProcessingPipeline, Receiver<PipelineEvent>) {
        let config = PipelineConfig::for_mode(mode);
        let denoiser = DenoiserHandle::create(strategy, None, 32.0, mode.processing_rate).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        (ProcessingPipeline::new(&config, denoiser, tx, RuntimeStatsHandle::new()), rx)
    }

    fn blocks(total: usize, block: usize, rate: u32) -> Vec<AudioFrame> {
        (0..total)
            .step_by(block)
            .map(|start| {
                let len = block.min(total - start);
                let samples = (start..start + len)
                    .map(|i| 0.1 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
                    .collect();
                AudioFrame::mono(samples, rate, 0)
            })
            .collect()
    }

    fn drain(rx: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        rx.try_iter().collect()
    }

    fn pcm_samples(events: &[PipelineEvent]) -> usize {
        events
            .iter()
            .map(|e| match e {
                PipelineEvent::Pcm16(c) => c.len(),
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn blocks_before_start_are_dropped() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        for b in blocks(4800, 128, 48_000) {
            p.process_block(b);
        }
        assert!(drain(&rx).is_empty());
        assert_eq!(p.stats().snapshot().blocks_dropped_inactive, 38);
    }

    #[test]
    fn stop_before_first_frame_emits_no_pcm() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        p.handle_control(ControlMessage::Start);
        p.process_block(AudioFrame::mono(vec![0.2; 479], 48_000, 0));
        p.handle_control(ControlMessage::Stop);
        p.handle_control(ControlMessage::Flush);

        let events = drain(&rx);
        assert_eq!(pcm_samples(&events), 0);
        assert!(matches!(events.first(), Some(PipelineEvent::FirstAudio)));
        assert!(matches!(events.last(), Some(PipelineEvent::Flushed)));
        assert_eq!(p.stats().snapshot().partial_samples_discarded, 479);
    }

    #[test]
    fn premium_one_second_yields_half_rate_output() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        p.handle_control(ControlMessage::Start);
        for b in blocks(48_000, 128, 48_000) {
            p.process_block(b);
        }
        p.handle_control(ControlMessage::Stop);
        p.handle_control(ControlMessage::Flush);

        let events = drain(&rx);
        assert_eq!(pcm_samples(&events), 24_000);
        let first_audio = events.iter().filter(|e| matches!(e, PipelineEvent::FirstAudio)).count();
        assert_eq!(first_audio, 1);
        for e in &events {
            if let PipelineEvent::Pcm16(c) = e {
                assert_eq!(c.sample_rate, 24_000);
                assert_eq!(c.channels, 1);
            }
        }
    }

    #[test]
    fn light_mode_denoises_at_output_rate() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, rx) = pipeline(ModeConfig::LIGHT, &strategy);
        p.handle_control(ControlMessage::Start);
        // 48 kHz capture is halved before framing
        for b in blocks(9600, 480, 48_000) {
            p.process_block(b);
        }
        let events = drain(&rx);
        assert_eq!(pcm_samples(&events), 4800);
        for e in &events {
            if let PipelineEvent::Pcm16(c) = e {
                assert_eq!(c.len(), 480);
            }
        }
    }

    #[test]
    fn flush_emits_buffered_chunk_remainder() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        p.handle_control(ControlMessage::Start);
        // 3 full frames + 100 samples; chunk threshold (2400 @ 24k) is not reached
        p.process_block(AudioFrame::mono(vec![0.1; 1540], 48_000, 0));
        assert_eq!(pcm_samples(&drain(&rx)), 0);

        p.handle_control(ControlMessage::Flush);
        let events = drain(&rx);
        assert_eq!(pcm_samples(&events), 720);
        assert!(matches!(events.last(), Some(PipelineEvent::Flushed)));
    }

    #[test]
    fn denoise_fault_passes_audio_through() {
        let mut strategy = ScaleStrategy::new(1.0);
        strategy.fail_on = (0..50).collect();
        let (mut p, rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        p.handle_control(ControlMessage::Start);
        for b in blocks(24_000, 480, 48_000) {
            p.process_block(b);
        }
        p.handle_control(ControlMessage::Flush);
        assert_eq!(pcm_samples(&drain(&rx)), 12_000);
        assert_eq!(p.stats().snapshot().denoise_failures, 50);
    }

    #[test]
    fn restart_emits_first_audio_again() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        for _ in 0..2 {
            p.handle_control(ControlMessage::Start);
            p.process_block(AudioFrame::mono(vec![0.0; 128], 48_000, 0));
            p.handle_control(ControlMessage::Stop);
        }
        let first_audio = drain(&rx)
            .iter()
            .filter(|e| matches!(e, PipelineEvent::FirstAudio))
            .count();
        assert_eq!(first_audio, 2);
    }

    #[test]
    fn cleanup_ends_worker_loop() {
        let strategy = ScaleStrategy::new(1.0);
        let (mut p, _rx) = pipeline(ModeConfig::PREMIUM, &strategy);
        assert!(p.handle_control(ControlMessage::Start));
        assert!(!p.handle_control(ControlMessage::Cleanup));
        assert!(!p.is_active());
    }

    #[test]
    fn worker_processes_queued_blocks_before_stop() {
        let strategy = ScaleStrategy::new(1.0);
        let (audio_tx, audio_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        control_tx.send(ControlMessage::Start).unwrap();
        for b in blocks(48_000, 128, 48_000) {
            audio_tx.send(b).unwrap();
        }
        for control in [ControlMessage::Stop, ControlMessage::Flush, ControlMessage::Cleanup] {
            control_tx.send(control).unwrap();
        }

        run_worker(
            PipelineConfig::for_mode(ModeConfig::PREMIUM),
            Arc::new(strategy),
            audio_rx,
            control_rx,
            events_tx,
            RuntimeStatsHandle::disabled(),
        );
        let events = drain(&events_rx);
        assert_eq!(pcm_samples(&events), 24_000);
        assert!(matches!(events.last(), Some(PipelineEvent::Flushed)));
        drop(audio_tx);
    }

    #[test]
    fn worker_reports_frame_size_mismatch() {
        let mut strategy = ScaleStrategy::new(1.0);
        strategy.frame_length = 256;
        let (_audio_tx, audio_rx) = crossbeam_channel::unbounded();
        let (_control_tx, control_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        run_worker(
            PipelineConfig::for_mode(ModeConfig::PREMIUM),
            Arc::new(strategy),
            audio_rx,
            control_rx,
            events_tx,
            RuntimeStatsHandle::disabled(),
        );
        assert!(matches!(events_rx.try_recv(), Ok(PipelineEvent::Error { .. })));
    }
}
