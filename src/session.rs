//! Session controller: owns the capture device and the processing context for
//! one recording session and drives the `Idle -> Initializing -> Capturing <-> Muted`
//! state machine.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::capability::{detect_optimal_mode, CapabilityProbe, SystemProbe};
use crate::capture::{CaptureBackend, CaptureStream, DEFAULT_DEVICE};
use crate::config::{ModeId, SessionConfig};
use crate::context::ProcessingContext;
use crate::error::{CaptureError, SessionError};
use crate::messages::{ControlMessage, PipelineEvent, SessionEvent};
use crate::model_store::ModelStore;
use crate::stats::RuntimeStats;
use crate::strategy::StrategyRegistry;

const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub const NOTICE_BUSY_FALLBACK: &str = "Microphone is in use, switched to default device.";
pub const NOTICE_DEVICE_CHANGED: &str = "Device changed. Please restart recording.";
pub const NOTICE_DEVICE_DISCONNECTED: &str =
    "Your microphone has been disconnected, switching to default.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Initializing,
    Capturing,
    Muted,
    Error,
}

/// Point-in-time view of the session for a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub mode: Option<ModeId>,
    pub selected_device: String,
    pub error: Option<String>,
    /// Transient notice; disappears once its TTL has passed.
    pub toast: Option<String>,
}

struct Toast {
    message: String,
    expires_at: Instant,
}

struct SharedState {
    status: SessionStatus,
    mode: Option<ModeId>,
    error: Option<String>,
    toast: Option<Toast>,
}

impl SharedState {
    fn post_toast(&mut self, message: &str, ttl: Duration) {
        tracing::info!("notice: {}", message);
        self.toast = Some(Toast {
            message: message.to_string(),
            expires_at: Instant::now() + ttl,
        });
    }
}

/// Forwards pipeline events to the session consumer until the flush marker.
struct Dispatcher {
    handle: JoinHandle<()>,
    // Disconnects when the dispatcher thread exits
    done: Receiver<()>,
}

impl Dispatcher {
    fn spawn(
        mode: ModeId,
        events: Receiver<PipelineEvent>,
        out: Sender<SessionEvent>,
        state: Arc<Mutex<SharedState>>,
        toast_ttl: Duration,
    ) -> Result<Self, SessionError> {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("cleanmic-dispatch".to_string())
            .spawn(move || {
                let _done = done_tx;
                for event in events.iter() {
                    match event {
                        PipelineEvent::Pcm16(chunk) => {
                            let _ = out.send(SessionEvent::Audio(chunk));
                        }
                        PipelineEvent::FirstAudio => {
                            let _ = out.send(SessionEvent::FirstAudio);
                        }
                        PipelineEvent::Error { message } => {
                            tracing::error!("{} pipeline error: {}", mode, message);
                            let _ = out.send(SessionEvent::Error(message));
                        }
                        PipelineEvent::LoadAdvice(advice) => {
                            if advice.suggested_mode() != mode {
                                tracing::info!("{} while running {}", advice, mode);
                                if let Ok(mut s) = state.lock() {
                                    s.post_toast(&advice.to_string(), toast_ttl);
                                }
                            }
                        }
                        PipelineEvent::Flushed => break,
                        PipelineEvent::Ready => {}
                    }
                }
            })
            .map_err(|e| SessionError::Init {
                mode,
                message: format!("failed to spawn event dispatcher: {e}"),
            })?;
        Ok(Self { handle, done })
    }

    fn finish(self, timeout: Duration) {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("event dispatcher did not drain within {:?}", timeout);
            }
            _ => {
                let _ = self.handle.join();
            }
        }
    }
}

struct ActiveSession {
    mode: ModeId,
    stream: Box<dyn CaptureStream>,
    context: ProcessingContext,
    dispatcher: Dispatcher,
}

/// Owns one recording session: capture device, processing context and the
/// event stream handed to the consumer.
pub struct SessionController<B: CaptureBackend> {
    config: SessionConfig,
    backend: B,
    strategies: StrategyRegistry,
    models: Arc<dyn ModelStore>,
    probe: Box<dyn CapabilityProbe>,
    state: Arc<Mutex<SharedState>>,
    selected_device: String,
    active: Option<ActiveSession>,
    prewarmed: Option<ProcessingContext>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl<B: CaptureBackend> SessionController<B> {
    pub fn new(
        config: SessionConfig,
        backend: B,
        strategies: StrategyRegistry,
        models: Arc<dyn ModelStore>,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            backend,
            strategies,
            models,
            probe: Box::new(SystemProbe),
            state: Arc::new(Mutex::new(SharedState {
                status: SessionStatus::Idle,
                mode: None,
                error: None,
                toast: None,
            })),
            selected_device: DEFAULT_DEVICE.to_string(),
            active: None,
            prewarmed: None,
            events_tx,
            events_rx,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn CapabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Receiver for audio chunks and notifications of every session run by this controller.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Error)
    }

    pub fn selected_device(&self) -> &str {
        &self.selected_device
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        match self.state.lock() {
            Ok(s) => SessionSnapshot {
                status: s.status,
                mode: s.mode,
                selected_device: self.selected_device.clone(),
                error: s.error.clone(),
                toast: s
                    .toast
                    .as_ref()
                    .filter(|t| t.expires_at > now)
                    .map(|t| t.message.clone()),
            },
            Err(_) => SessionSnapshot {
                status: SessionStatus::Error,
                mode: None,
                selected_device: self.selected_device.clone(),
                error: Some("session state poisoned".to_string()),
                toast: None,
            },
        }
    }

    fn set_status(&self, status: SessionStatus) {
        if let Ok(mut s) = self.state.lock() {
            s.status = status;
        }
    }

    fn toast(&self, message: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.post_toast(message, self.config.toast_ttl());
        }
    }

    /// Start capturing. `forced_mode` bypasses capability detection.
    pub fn start(&mut self, forced_mode: Option<ModeId>) -> Result<(), SessionError> {
        match self.status() {
            SessionStatus::Capturing | SessionStatus::Muted => {
                return Err(SessionError::InvalidState("capturing"))
            }
            SessionStatus::Initializing => return Err(SessionError::InvalidState("initializing")),
            SessionStatus::Idle | SessionStatus::Error => {}
        }
        if let Ok(mut s) = self.state.lock() {
            s.status = SessionStatus::Initializing;
            s.error = None;
        }

        match self.try_start(forced_mode) {
            Ok(active) => {
                tracing::info!("capturing from '{}' in {} mode", active.stream.device_id(), active.mode);
                if let Ok(mut s) = self.state.lock() {
                    s.status = SessionStatus::Capturing;
                    s.mode = Some(active.mode);
                }
                self.active = Some(active);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    // Everything acquired here is dropped on the error path, which releases
    // the device and the denoiser.
    fn try_start(&mut self, forced_mode: Option<ModeId>) -> Result<ActiveSession, SessionError> {
        let mode = match forced_mode {
            Some(mode) => mode,
            None => detect_optimal_mode(&self.config, self.probe.as_ref()),
        };

        let mut stream = self.open_device()?;

        let context = match self.prewarmed.take() {
            Some(ctx) if ctx.mode() == mode && ctx.is_open() && ctx.is_ready() => {
                tracing::info!("reusing pre-warmed {} context", mode);
                ctx
            }
            stale => {
                drop(stale);
                self.build_context(mode, self.config.ready_timeout())?
            }
        };
        // Blocks that reach the worker before `Start` would be dropped
        context.send(ControlMessage::Start);

        let dispatcher = Dispatcher::spawn(
            mode,
            context.events(),
            self.events_tx.clone(),
            self.state.clone(),
            self.config.toast_ttl(),
        )?;

        if let Err(e) = stream.connect(context.audio_sender()) {
            let e = match e {
                CaptureError::Connection(_) => e,
                other => CaptureError::Connection(other.to_string()),
            };
            tracing::error!("{e}");
            stream.stop();
            context.shutdown();
            dispatcher.finish(DISPATCH_DRAIN_TIMEOUT);
            return Err(e.into());
        }

        Ok(ActiveSession {
            mode,
            stream,
            context,
            dispatcher,
        })
    }

    /// Open the selected device. A busy non-default device is retried once on the default.
    fn open_device(&mut self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        match self.backend.open(&self.selected_device) {
            Err(CaptureError::DeviceBusy(id)) if self.selected_device != DEFAULT_DEVICE => {
                tracing::warn!("device '{}' is busy, retrying with default device", id);
                let stream = self.backend.open(DEFAULT_DEVICE)?;
                self.selected_device = DEFAULT_DEVICE.to_string();
                self.toast(NOTICE_BUSY_FALLBACK);
                Ok(stream)
            }
            other => other,
        }
    }

    fn build_context(&self, mode: ModeId, timeout: Duration) -> Result<ProcessingContext, SessionError> {
        let mode_config = mode.config();
        let strategy = self
            .strategies
            .get(mode_config.strategy)
            .ok_or_else(|| SessionError::Init {
                mode,
                message: format!("no strategy registered for {}", mode_config.strategy),
            })?;
        let model = match strategy.model_key() {
            Some(key) => Some(self.models.get(key)?),
            None => None,
        };

        let pipeline_config = self.config.pipeline_config(mode_config, model);
        let mut context = ProcessingContext::spawn(pipeline_config, strategy)?;
        context.wait_ready(timeout)?;
        Ok(context)
    }

    /// Record `error` on the session and release whatever is still held.
    fn fail(&mut self, error: SessionError) -> SessionError {
        tracing::error!("session error: {error}");
        self.teardown(false);
        if let Ok(mut s) = self.state.lock() {
            s.status = SessionStatus::Error;
            s.mode = None;
            s.error = Some(error.user_message());
        }
        error
    }

    fn teardown(&mut self, preserve_context: bool) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        // Stop the device first so every captured block is queued ahead of Stop
        active.stream.stop();
        drop(active.stream);
        active.context.send(ControlMessage::Stop);
        active.context.send(ControlMessage::Flush);
        active.dispatcher.finish(DISPATCH_DRAIN_TIMEOUT);

        if preserve_context && active.context.is_open() {
            tracing::debug!("keeping {} context for reuse", active.mode);
            self.prewarmed = Some(active.context);
        } else {
            active.context.shutdown();
        }
    }

    /// Stop capturing and release the device and the processing context.
    /// Calling it again, or while idle, does nothing.
    pub fn stop(&mut self) {
        self.stop_inner(false);
    }

    /// Like [`stop`](Self::stop) but keeps the warmed context for the next `start`.
    pub fn stop_preserving_context(&mut self) {
        self.stop_inner(true);
    }

    fn stop_inner(&mut self, preserve_context: bool) {
        if self.active.is_some() {
            tracing::info!("stopping session");
        }
        self.teardown(preserve_context);
        if let Ok(mut s) = self.state.lock() {
            s.status = SessionStatus::Idle;
            s.mode = None;
            s.error = None;
        }
    }

    /// End the session entirely: stop capture, release the processing context
    /// and its model (including a pre-warmed one), clear mode, error and notices.
    pub fn full_reset(&mut self) {
        self.stop_inner(false);
        if self.prewarmed.take().is_some() {
            tracing::debug!("released pre-warmed context");
        }
        if let Ok(mut s) = self.state.lock() {
            s.toast = None;
        }
        tracing::debug!("session fully reset");
    }

    pub fn mute(&mut self) -> Result<(), SessionError> {
        self.set_muted(true)
    }

    pub fn unmute(&mut self) -> Result<(), SessionError> {
        self.set_muted(false)
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), SessionError> {
        let Some(active) = self.active.as_mut() else {
            return Err(SessionError::InvalidState("idle"));
        };
        active.stream.set_enabled(!muted);
        self.set_status(if muted {
            SessionStatus::Muted
        } else {
            SessionStatus::Capturing
        });
        Ok(())
    }

    /// Build and ready a context for `mode` ahead of `start`.
    pub fn prewarm(&mut self, mode: ModeId) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::InvalidState("capturing"));
        }
        if let Some(ctx) = &self.prewarmed {
            if ctx.mode() == mode && ctx.is_open() {
                return Ok(());
            }
        }
        self.prewarmed = None;
        let context = self.build_context(mode, self.config.prewarm_timeout())?;
        tracing::info!("{} context pre-warmed", mode);
        self.prewarmed = Some(context);
        Ok(())
    }

    pub fn has_prewarmed_context(&self) -> bool {
        self.prewarmed.is_some()
    }

    /// Select the capture device for the next `start`. Switching while
    /// capturing ends the current session.
    pub fn set_selected_device(&mut self, device_id: &str) {
        if device_id == self.selected_device {
            return;
        }
        self.selected_device = device_id.to_string();
        if self.active.is_some() {
            self.stop();
            self.toast(NOTICE_DEVICE_CHANGED);
        }
    }

    /// Re-check the device list; a vanished selection falls back to the default device.
    pub fn handle_device_change(&mut self) -> Result<(), SessionError> {
        if self.selected_device == DEFAULT_DEVICE {
            return Ok(());
        }
        let devices = self.backend.list_devices()?;
        if devices.iter().any(|d| d.id == self.selected_device) {
            return Ok(());
        }

        tracing::warn!("device '{}' disconnected", self.selected_device);
        self.selected_device = DEFAULT_DEVICE.to_string();
        self.toast(NOTICE_DEVICE_DISCONNECTED);

        let muted = self.status() == SessionStatus::Muted;
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let reopened = self.backend.open(DEFAULT_DEVICE).and_then(|mut stream| {
            stream.set_enabled(!muted);
            stream.connect(active.context.audio_sender())?;
            Ok(stream)
        });
        match reopened {
            Ok(stream) => {
                let mut old = std::mem::replace(&mut active.stream, stream);
                old.stop();
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Forward a named parameter to the running pipeline.
    pub fn set_param(&self, name: &str, value: f32) -> Result<(), SessionError> {
        let active = self
            .active
            .as_ref()
            .ok_or(SessionError::InvalidState("idle"))?;
        active.context.send(ControlMessage::SetParam {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    /// Metrics of the running pipeline, when metrics are enabled.
    pub fn stats(&self) -> Option<RuntimeStats> {
        self.active.as_ref().and_then(|a| a.context.stats())
    }

    /// Wait until the worker has taken every queued capture block.
    /// Returns `false` on timeout or when nothing is running.
    pub fn drain_input(&self, timeout: Duration) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        while active.context.pending_audio() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
        true
    }
}

impl<B: CaptureBackend> Drop for SessionController<B> {
    fn drop(&mut self) {
        self.teardown(false);
    }
}
