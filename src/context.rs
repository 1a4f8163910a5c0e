use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::{ModeId, PipelineConfig};
use crate::error::SessionError;
use crate::messages::{AudioFrame, ControlMessage, PipelineEvent};
use crate::pipeline::run_worker;
use crate::stats::{RuntimeStats, RuntimeStatsHandle};
use crate::strategy::DenoisingStrategy;

/// A running pipeline worker plus the channel endpoints that talk to it.
///
/// Dropping the context sends `Cleanup` and joins the worker, so the denoiser
/// is released on every exit path.
pub struct ProcessingContext {
    mode: ModeId,
    control_tx: Sender<ControlMessage>,
    audio_tx: Sender<AudioFrame>,
    events_rx: Receiver<PipelineEvent>,
    worker: Option<JoinHandle<()>>,
    stats: RuntimeStatsHandle,
    ready: bool,
}

impl ProcessingContext {
    pub fn spawn(
        config: PipelineConfig,
        strategy: Arc<dyn DenoisingStrategy>,
    ) -> Result<Self, SessionError> {
        let mode = config.mode.id;
        let (audio_tx, audio_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let stats = RuntimeStatsHandle::with_enabled(config.enable_metrics);
        let worker_stats = stats.clone();

        let worker = std::thread::Builder::new()
            .name(format!("cleanmic-{}", mode.to_string().to_lowercase()))
            .spawn(move || run_worker(config, strategy, audio_rx, control_rx, events_tx, worker_stats))
            .map_err(|e| SessionError::Init {
                mode,
                message: format!("failed to spawn pipeline worker: {e}"),
            })?;

        Ok(Self {
            mode,
            control_tx,
            audio_tx,
            events_rx,
            worker: Some(worker),
            stats,
            ready: false,
        })
    }

    pub fn mode(&self) -> ModeId {
        self.mode
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The worker thread is still running.
    pub fn is_open(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Bounded wait for the worker's `Ready`. Returns immediately if already ready.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), SessionError> {
        if self.ready {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(remaining) {
                Ok(PipelineEvent::Ready) => {
                    self.ready = true;
                    return Ok(());
                }
                Ok(PipelineEvent::Error { message }) => {
                    return Err(SessionError::Init {
                        mode: self.mode,
                        message,
                    })
                }
                Ok(other) => {
                    tracing::debug!("ignoring {:?} before ready", other);
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!("{} pipeline not ready after {:?}", self.mode, timeout);
                    return Err(SessionError::ReadyTimeout(self.mode));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Init {
                        mode: self.mode,
                        message: "pipeline worker exited before becoming ready".to_string(),
                    })
                }
            }
        }
    }

    /// Metrics recorded by the worker; `None` when metrics are disabled.
    pub fn stats(&self) -> Option<RuntimeStats> {
        self.stats.is_enabled().then(|| self.stats.snapshot())
    }

    pub fn send(&self, message: ControlMessage) -> bool {
        self.control_tx.send(message).is_ok()
    }

    /// Sender handed to a capture stream.
    pub fn audio_sender(&self) -> Sender<AudioFrame> {
        self.audio_tx.clone()
    }

    /// Capture blocks queued for the worker and not yet taken.
    pub fn pending_audio(&self) -> usize {
        self.audio_tx.len()
    }

    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    /// Send `Cleanup` and wait for the worker to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.control_tx.send(ControlMessage::Cleanup);
            if worker.join().is_err() {
                tracing::error!("{} pipeline worker panicked", self.mode);
            } else {
                tracing::debug!("{} pipeline context closed", self.mode);
            }
        }
    }
}

impl Drop for ProcessingContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeConfig;
    use crate::strategy::testing::ScaleStrategy;
    use std::sync::atomic::Ordering;

    #[test]
    fn becomes_ready_and_releases_denoiser_on_shutdown() {
        let strategy = ScaleStrategy::new(1.0);
        let dropped = strategy.dropped.clone();
        let mut ctx =
            ProcessingContext::spawn(PipelineConfig::for_mode(ModeConfig::PREMIUM), Arc::new(strategy)).unwrap();
        ctx.wait_ready(Duration::from_secs(5)).unwrap();
        assert!(ctx.is_ready());
        assert!(ctx.is_open());

        ctx.shutdown();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn init_failure_is_typed() {
        let mut strategy = ScaleStrategy::new(1.0);
        strategy.fail_create = true;
        let mut ctx =
            ProcessingContext::spawn(PipelineConfig::for_mode(ModeConfig::LIGHT), Arc::new(strategy)).unwrap();
        match ctx.wait_ready(Duration::from_secs(5)) {
            Err(SessionError::Init { mode, message }) => {
                assert_eq!(mode, ModeId::Light);
                assert!(message.contains("model failed to load"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn processes_audio_end_to_end() {
        let strategy = ScaleStrategy::new(1.0);
        let mut ctx =
            ProcessingContext::spawn(PipelineConfig::for_mode(ModeConfig::PREMIUM), Arc::new(strategy)).unwrap();
        ctx.wait_ready(Duration::from_secs(5)).unwrap();

        assert!(ctx.send(ControlMessage::Start));
        let tx = ctx.audio_sender();
        for _ in 0..10 {
            tx.send(AudioFrame::mono(vec![0.05; 480], 48_000, 0)).unwrap();
        }
        let events = ctx.events();
        // 4800 samples at 48 kHz make exactly one 2400-sample chunk at 24 kHz
        let mut pcm = 0;
        while pcm == 0 {
            match events.recv_timeout(Duration::from_secs(5)) {
                Ok(PipelineEvent::Pcm16(c)) => pcm += c.len(),
                Ok(_) => {}
                Err(e) => panic!("no audio: {e}"),
            }
        }
        assert!(ctx.send(ControlMessage::Stop));
        assert!(ctx.send(ControlMessage::Flush));
        loop {
            match events.recv_timeout(Duration::from_secs(5)) {
                Ok(PipelineEvent::Pcm16(c)) => pcm += c.len(),
                Ok(PipelineEvent::Flushed) => break,
                Ok(_) => {}
                Err(e) => panic!("no flush marker: {e}"),
            }
        }
        assert_eq!(pcm, 2400);
    }
}
