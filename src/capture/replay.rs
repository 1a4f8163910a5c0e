use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use super::{position_ns, CaptureBackend, CaptureStream, DeviceInfo, DEFAULT_DEVICE};
use crate::error::CaptureError;
use crate::messages::AudioFrame;

const DEFAULT_BLOCK_FRAMES: usize = 128;

#[derive(Clone)]
struct ReplayDevice {
    label: String,
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
}

#[derive(Default)]
struct ReplayState {
    devices: Vec<(String, ReplayDevice)>,
    faults: HashMap<String, CaptureError>,
    opened: Vec<String>,
}

/// Capture backend that replays in-memory or WAV audio as if it came from a device.
///
/// Blocks are `block_frames` long (128 by default), optionally paced at real
/// time. Faults can be injected per device to exercise error handling.
#[derive(Clone)]
pub struct ReplayBackend {
    state: Arc<Mutex<ReplayState>>,
    block_frames: usize,
    realtime: bool,
    completed: Arc<AtomicUsize>,
}

impl ReplayBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplayState::default())),
            block_frames: DEFAULT_BLOCK_FRAMES,
            realtime: false,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames.max(1);
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_device(
        self,
        id: &str,
        label: &str,
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>,
    ) -> Self {
        self.add_device(id, label, sample_rate, channels, samples);
        self
    }

    pub fn add_device(&self, id: &str, label: &str, sample_rate: u32, channels: u16, samples: Vec<f32>) {
        let device = ReplayDevice {
            label: label.to_string(),
            sample_rate,
            channels: channels.max(1),
            samples: samples.into(),
        };
        if let Ok(mut state) = self.state.lock() {
            state.devices.retain(|(existing, _)| existing != id);
            state.devices.push((id.to_string(), device));
        }
    }

    /// Simulate unplugging a device.
    pub fn remove_device(&self, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.devices.retain(|(existing, _)| existing != id);
        }
    }

    /// Make every `open` of `id` fail with `error` until cleared.
    pub fn fail_device(&self, id: &str, error: CaptureError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(id.to_string(), error);
        }
    }

    pub fn clear_fault(&self, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.remove(id);
        }
    }

    /// Device ids in the order they were successfully opened.
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().map(|s| s.opened.clone()).unwrap_or_default()
    }

    /// Number of streams that played their audio to the end.
    pub fn completed_playbacks(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl Default for ReplayBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for ReplayBackend {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let state = self
            .state
            .lock()
            .map_err(|_| CaptureError::Other("replay state poisoned".to_string()))?;
        Ok(state
            .devices
            .iter()
            .map(|(id, d)| DeviceInfo {
                id: id.clone(),
                label: d.label.clone(),
            })
            .collect())
    }

    fn open(&self, device_id: &str) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CaptureError::Other("replay state poisoned".to_string()))?;
        if let Some(fault) = state.faults.get(device_id) {
            return Err(fault.clone());
        }
        let device = state
            .devices
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| CaptureError::DeviceNotFound(device_id.to_string()))?;
        state.opened.push(device_id.to_string());

        Ok(Box::new(ReplayStream {
            device_id: device_id.to_string(),
            device,
            block_frames: self.block_frames,
            realtime: self.realtime,
            enabled: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(AtomicBool::new(false)),
            completed: self.completed.clone(),
            worker: None,
        }))
    }
}

struct ReplayStream {
    device_id: String,
    device: ReplayDevice,
    block_frames: usize,
    realtime: bool,
    enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    completed: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureStream for ReplayStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn sample_rate(&self) -> u32 {
        self.device.sample_rate
    }

    fn channels(&self) -> u16 {
        self.device.channels
    }

    fn connect(&mut self, tx: Sender<AudioFrame>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::Connection(format!(
                "'{}' is already connected",
                self.device_id
            )));
        }
        let device = self.device.clone();
        let block_len = self.block_frames * device.channels as usize;
        let pace = self.realtime.then(|| {
            Duration::from_nanos(position_ns(self.block_frames as u64, device.sample_rate))
        });
        let enabled = self.enabled.clone();
        let stop = self.stop.clone();
        let completed = self.completed.clone();

        let worker = std::thread::Builder::new()
            .name(format!("replay-{}", self.device_id))
            .spawn(move || {
                let mut frames_sent = 0u64;
                for block in device.samples.chunks(block_len) {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let samples = if enabled.load(Ordering::SeqCst) {
                        block.to_vec()
                    } else {
                        vec![0.0; block.len()]
                    };
                    let frame = AudioFrame {
                        samples,
                        sample_rate: device.sample_rate,
                        channels: device.channels,
                        timestamp: position_ns(frames_sent, device.sample_rate),
                    };
                    frames_sent += (block.len() / device.channels as usize) as u64;
                    if tx.send(frame).is_err() {
                        return;
                    }
                    if let Some(pace) = pace {
                        std::thread::sleep(pace);
                    }
                }
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .map_err(|e| CaptureError::Connection(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ReplayStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read a WAV file as interleaved f32 samples.
pub fn load_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32, u16)> {
    let path = path.as_ref();
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    Ok((samples, spec.sample_rate, spec.channels))
}

impl ReplayBackend {
    /// Register the contents of a WAV file as the `default` device.
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self> {
        let (samples, rate, channels) = load_wav(&path)?;
        let label = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        Ok(Self::new().with_device(DEFAULT_DEVICE, &label, rate, channels, samples))
    }
}
