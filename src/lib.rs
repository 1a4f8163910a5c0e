//! Real-time microphone denoising.
//!
//! Capture blocks flow through a processor chain on a dedicated worker thread:
//! input rate adaptation, frame assembly, denoising with fade-in, optional 2:1
//! Kaiser decimation, chunk accumulation, dynamics, and PCM16 quantization.
//! A [`SessionController`] owns the capture device and the worker for one
//! recording session and delivers [`SessionEvent`]s to the caller.

pub mod capability;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod messages;
pub mod model_store;
pub mod pcm;
pub mod pipeline;
pub mod processors;
pub mod session;
pub mod stats;
pub mod strategy;

pub use capability::{detect_optimal_mode, CapabilityProbe, LoadAdvice, SystemProbe};
pub use capture::{CaptureBackend, CaptureStream, DeviceInfo, ReplayBackend, DEFAULT_DEVICE};
#[cfg(feature = "cpal")]
pub use capture::CpalBackend;
pub use config::{ModeConfig, ModeId, PipelineConfig, SessionConfig};
pub use context::ProcessingContext;
pub use error::{CaptureError, ModelStoreError, SessionError};
pub use messages::{AudioFrame, ControlMessage, PipelineEvent, SessionEvent};
pub use model_store::{FsModelStore, MemoryModelStore, ModelStore};
pub use pcm::Pcm16Chunk;
pub use session::{SessionController, SessionSnapshot, SessionStatus};
pub use stats::{PipelineStats, RuntimeStats};
pub use strategy::{DenoisingStrategy, StrategyId, StrategyRegistry};
