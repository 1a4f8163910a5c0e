//! Pluggable denoising strategies.
//!
//! A [`DenoisingStrategy`] is the factory selected per mode; it creates a
//! [`Denoiser`] which processes exactly one frame at a time. The pipeline only
//! ever holds a denoiser through a [`DenoiserHandle`], which releases the model
//! when dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

pub mod rnnoise;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use rnnoise::RnnoiseStrategy;
#[cfg(feature = "webrtc")]
pub use webrtc::WebRtcStrategy;

/// Parameter name understood by every built-in denoiser.
pub const PARAM_ATTENUATION_LIMIT_DB: &str = "attenuation_limit_db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyId {
    Rnnoise,
    WebRtc,
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyId::Rnnoise => f.write_str("rnnoise"),
            StrategyId::WebRtc => f.write_str("webrtc-ns"),
        }
    }
}

/// A live denoiser instance. One frame in, one frame of identical length out.
pub trait Denoiser: Send {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()>;

    fn frame_length(&self) -> usize;

    fn set_param(&mut self, name: &str, value: f32) -> Result<()>;
}

pub trait DenoisingStrategy: Send + Sync {
    fn id(&self) -> StrategyId;

    /// Storage key of the model blob this strategy needs, if any.
    fn model_key(&self) -> Option<&str> {
        None
    }

    fn create(
        &self,
        model: Option<&[u8]>,
        attenuation_limit_db: f32,
        sample_rate: u32,
    ) -> Result<Box<dyn Denoiser>>;
}

/// Owning wrapper around a created denoiser; the model is released on drop.
pub struct DenoiserHandle {
    inner: Box<dyn Denoiser>,
    strategy: StrategyId,
}

impl DenoiserHandle {
    pub fn create(
        strategy: &dyn DenoisingStrategy,
        model: Option<&[u8]>,
        attenuation_limit_db: f32,
        sample_rate: u32,
    ) -> Result<Self> {
        let inner = strategy.create(model, attenuation_limit_db, sample_rate)?;
        tracing::debug!(
            strategy = %strategy.id(),
            frame_length = inner.frame_length(),
            "denoiser created"
        );
        Ok(Self {
            inner,
            strategy: strategy.id(),
        })
    }

    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        self.inner.process(input, output)
    }

    pub fn frame_length(&self) -> usize {
        self.inner.frame_length()
    }

    pub fn set_param(&mut self, name: &str, value: f32) -> Result<()> {
        self.inner.set_param(name, value)
    }
}

impl Drop for DenoiserHandle {
    fn drop(&mut self) {
        tracing::debug!(strategy = %self.strategy, "denoiser destroyed");
    }
}

/// Linear gain of the dry signal kept under an attenuation limit.
/// `0 dB` keeps everything, very large limits remove the dry path entirely.
pub fn attenuation_mix(limit_db: f32) -> f32 {
    if limit_db >= 100.0 {
        0.0
    } else {
        10f32.powf(-limit_db.max(0.0) / 20.0)
    }
}

/// Maps strategy identifiers to the factories that implement them.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyId, Arc<dyn DenoisingStrategy>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(StrategyId::Rnnoise, Arc::new(RnnoiseStrategy));
        #[cfg(feature = "webrtc")]
        registry.register(StrategyId::WebRtc, Arc::new(WebRtcStrategy::default()));
        registry
    }

    pub fn register(&mut self, id: StrategyId, strategy: Arc<dyn DenoisingStrategy>) {
        self.strategies.insert(id, strategy);
    }

    pub fn get(&self, id: StrategyId) -> Option<Arc<dyn DenoisingStrategy>> {
        self.strategies.get(&id).cloned()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scales every frame by a constant; optionally fails on chosen frame indices.
    pub struct ScaleStrategy {
        pub gain: f32,
        pub frame_length: usize,
        pub fail_on: Vec<usize>,
        pub fail_create: bool,
        pub model_key: Option<String>,
        pub created: Arc<AtomicUsize>,
        pub dropped: Arc<AtomicUsize>,
    }

    impl ScaleStrategy {
        pub fn new(gain: f32) -> Self {
            Self {
                gain,
                frame_length: 480,
                fail_on: Vec::new(),
                fail_create: false,
                model_key: None,
                created: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    pub struct ScaleDenoiser {
        gain: f32,
        frame_length: usize,
        fail_on: Vec<usize>,
        calls: usize,
        dropped: Arc<AtomicUsize>,
    }

    impl Denoiser for ScaleDenoiser {
        fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&call) {
                anyhow::bail!("injected fault on frame {call}");
            }
            for (o, i) in output.iter_mut().zip(input) {
                *o = i * self.gain;
            }
            Ok(())
        }

        fn frame_length(&self) -> usize {
            self.frame_length
        }

        fn set_param(&mut self, name: &str, value: f32) -> Result<()> {
            match name {
                "gain" => {
                    self.gain = value;
                    Ok(())
                }
                PARAM_ATTENUATION_LIMIT_DB => Ok(()),
                other => anyhow::bail!("unknown parameter '{other}'"),
            }
        }
    }

    impl Drop for ScaleDenoiser {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DenoisingStrategy for ScaleStrategy {
        fn id(&self) -> StrategyId {
            StrategyId::Rnnoise
        }

        fn model_key(&self) -> Option<&str> {
            self.model_key.as_deref()
        }

        fn create(
            &self,
            model: Option<&[u8]>,
            _attenuation_limit_db: f32,
            _sample_rate: u32,
        ) -> Result<Box<dyn Denoiser>> {
            if self.fail_create {
                anyhow::bail!("model failed to load");
            }
            if self.model_key.is_some() && model.is_none() {
                anyhow::bail!("model bytes required");
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScaleDenoiser {
                gain: self.gain,
                frame_length: self.frame_length,
                fail_on: self.fail_on.clone(),
                calls: 0,
                dropped: self.dropped.clone(),
            }))
        }
    }
}
