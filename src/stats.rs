use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct StageStats {
    pub samples: u64,
    pub total_ns: u128,
    pub max_ns: u64,
}

impl StageStats {
    pub fn record(&mut self, duration_ns: u64) {
        self.samples += 1;
        self.total_ns += duration_ns as u128;
        self.max_ns = self.max_ns.max(duration_ns);
    }

    pub fn avg_ns(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ns as f64 / self.samples as f64
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeStats {
    pub blocks_in: u64,
    pub blocks_dropped_inactive: u64,
    pub frames_denoised: u64,
    pub denoise_failures: u64,
    pub partial_samples_discarded: u64,
    pub chunks_out: u64,
    pub samples_out: u64,
    pub saturated_chunks: u64,
    pub processor_errors: u64,
    pub load_advice_events: u64,

    pub last_gain: f32,
    pub last_rms: f32,
    pub last_peak: f32,

    pub input_adapter: StageStats,
    pub frame_assembler: StageStats,
    pub denoise: StageStats,
    pub decimator: StageStats,
    pub chunker: StageStats,
    pub dynamics: StageStats,
    pub block_total: StageStats,
}

impl RuntimeStats {
    pub fn stage_mut(&mut self, stage: &str) -> Option<&mut StageStats> {
        match stage {
            "input_adapter" => Some(&mut self.input_adapter),
            "frame_assembler" => Some(&mut self.frame_assembler),
            "denoise" => Some(&mut self.denoise),
            "decimator" => Some(&mut self.decimator),
            "chunker" => Some(&mut self.chunker),
            "dynamics" => Some(&mut self.dynamics),
            _ => None,
        }
    }
}

/// Shared metrics sink. When created disabled every update is a no-op,
/// which is how the construction-time metrics toggle is honoured.
#[derive(Clone)]
pub struct RuntimeStatsHandle {
    inner: Option<Arc<Mutex<RuntimeStats>>>,
}

impl RuntimeStatsHandle {
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(RuntimeStats::default()))),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn with_enabled(enabled: bool) -> Self {
        if enabled {
            Self::new()
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn reset(&self) {
        if let Some(inner) = &self.inner {
            if let Ok(mut stats) = inner.lock() {
                *stats = RuntimeStats::default();
            }
        }
    }

    pub fn update<F>(&self, update_fn: F)
    where
        F: FnOnce(&mut RuntimeStats),
    {
        if let Some(inner) = &self.inner {
            if let Ok(mut stats) = inner.lock() {
                update_fn(&mut stats);
            }
        }
    }

    pub fn snapshot(&self) -> RuntimeStats {
        match &self.inner {
            Some(inner) => inner.lock().map(|s| s.clone()).unwrap_or_default(),
            None => RuntimeStats::default(),
        }
    }
}

impl Default for RuntimeStatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Millisecond view of the runtime stats for display.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineStats {
    pub frames_denoised: u64,
    pub denoise_failures: u64,
    pub chunks_out: u64,
    pub saturated_chunks: u64,
    pub denoise_avg_ms: f64,
    pub denoise_max_ms: f64,
    pub block_avg_ms: f64,
    pub block_max_ms: f64,
    pub last_gain: f32,
}

impl PipelineStats {
    pub fn from_runtime(s: &RuntimeStats) -> Self {
        Self {
            frames_denoised: s.frames_denoised,
            denoise_failures: s.denoise_failures,
            chunks_out: s.chunks_out,
            saturated_chunks: s.saturated_chunks,
            denoise_avg_ms: s.denoise.avg_ns() / 1_000_000.0,
            denoise_max_ms: s.denoise.max_ns as f64 / 1_000_000.0,
            block_avg_ms: s.block_total.avg_ns() / 1_000_000.0,
            block_max_ms: s.block_total.max_ns as f64 / 1_000_000.0,
            last_gain: s.last_gain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_updates_and_snapshot() {
        let h = RuntimeStatsHandle::new();
        h.update(|s| {
            s.frames_denoised += 2;
            s.denoise.record(1_000_000);
        });
        let snap = h.snapshot();
        assert_eq!(snap.frames_denoised, 2);
        assert_eq!(snap.denoise.samples, 1);
        assert_eq!(snap.denoise.max_ns, 1_000_000);
    }

    #[test]
    fn disabled_handle_ignores_updates() {
        let h = RuntimeStatsHandle::disabled();
        h.update(|s| s.chunks_out += 1);
        assert!(!h.is_enabled());
        assert_eq!(h.snapshot().chunks_out, 0);
    }

    #[test]
    fn pipeline_stats_conversion_uses_ms_units() {
        let mut r = RuntimeStats::default();
        r.denoise.record(2_000_000);
        r.block_total.record(5_000_000);
        let p = PipelineStats::from_runtime(&r);

        assert_eq!(p.denoise_avg_ms, 2.0);
        assert_eq!(p.block_max_ms, 5.0);
    }

    #[test]
    fn stage_lookup_ignores_unknown_names() {
        let mut r = RuntimeStats::default();
        assert!(r.stage_mut("denoise").is_some());
        assert!(r.stage_mut("unknown_stage").is_none());
    }
}
