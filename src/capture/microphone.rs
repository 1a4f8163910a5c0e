//! Microphone capture through cpal.
//!
//! A cpal stream is not `Send` on every platform, so each opened device lives
//! on its own thread that builds, plays and finally drops the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, Sender};

use super::{position_ns, CaptureBackend, CaptureStream, DeviceInfo, DEFAULT_DEVICE};
use crate::error::CaptureError;
use crate::messages::AudioFrame;

/// Input devices of cpal's default host. Device ids are device names.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn classify(device_id: &str, message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        CaptureError::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        CaptureError::DeviceBusy(device_id.to_string())
    } else {
        CaptureError::Other(message)
    }
}

fn find_device(device_id: &str) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    if device_id == DEFAULT_DEVICE {
        return host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceNotFound(device_id.to_string()));
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| classify(device_id, e.to_string()))?;
    devices
        .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
        .ok_or_else(|| CaptureError::DeviceNotFound(device_id.to_string()))
}

impl CaptureBackend for CpalBackend {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let host = cpal::default_host();
        let mut out = Vec::new();
        if let Some(default) = host.default_input_device() {
            out.push(DeviceInfo {
                id: DEFAULT_DEVICE.to_string(),
                label: default
                    .name()
                    .map(|n| format!("Default ({n})"))
                    .unwrap_or_else(|_| "Default".to_string()),
            });
        }
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Other(e.to_string()))?;
        for device in devices {
            if let Ok(name) = device.name() {
                out.push(DeviceInfo {
                    id: name.clone(),
                    label: name,
                });
            }
        }
        Ok(out)
    }

    fn open(&self, device_id: &str) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let (opened_tx, opened_rx) = crossbeam_channel::bounded(1);
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let enabled = Arc::new(AtomicBool::new(true));

        let id = device_id.to_string();
        let thread_enabled = enabled.clone();
        let worker = std::thread::Builder::new()
            .name(format!("cpal-{device_id}"))
            .spawn(move || device_thread(id, thread_enabled, opened_tx, command_rx))
            .map_err(|e| CaptureError::Other(e.to_string()))?;

        let (config, format) = match opened_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(CaptureError::Other("capture thread exited".to_string()));
            }
        };
        tracing::info!(
            "opened '{}': {:?} {}Hz x{}",
            device_id,
            format,
            config.sample_rate.0,
            config.channels
        );

        Ok(Box::new(CpalStream {
            device_id: device_id.to_string(),
            sample_rate: config.sample_rate.0,
            channels: config.channels.max(1),
            enabled,
            commands: command_tx,
            worker: Some(worker),
        }))
    }
}

enum Command {
    Connect(Sender<AudioFrame>, Sender<Result<(), CaptureError>>),
    Stop,
}

fn device_thread(
    device_id: String,
    enabled: Arc<AtomicBool>,
    opened: Sender<Result<(StreamConfig, SampleFormat), CaptureError>>,
    commands: Receiver<Command>,
) {
    let setup = find_device(&device_id).and_then(|device| {
        let default_config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                CaptureError::DeviceNotFound(device_id.clone())
            }
            other => classify(&device_id, other.to_string()),
        })?;
        Ok((device, default_config))
    });
    let (device, default_config) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };
    let format = default_config.sample_format();
    let config: StreamConfig = default_config.into();
    if opened.send(Ok((config.clone(), format))).is_err() {
        return;
    }

    // Held until Stop; dropping it releases the device
    let mut stream: Option<cpal::Stream> = None;
    for command in commands.iter() {
        match command {
            Command::Connect(tx, reply) => {
                let result = build_stream(&device, &device_id, &config, format, tx, enabled.clone())
                    .map(|s| stream = Some(s));
                let _ = reply.send(result);
            }
            Command::Stop => break,
        }
    }
    if let Some(stream) = stream.take() {
        if let Err(e) = stream.pause() {
            tracing::debug!("pause on '{}' failed: {}", device_id, e);
        }
    }
    tracing::debug!("released '{}'", device_id);
}

fn build_stream(
    device: &cpal::Device,
    device_id: &str,
    config: &StreamConfig,
    format: SampleFormat,
    tx: Sender<AudioFrame>,
    enabled: Arc<AtomicBool>,
) -> Result<cpal::Stream, CaptureError> {
    let sample_rate = config.sample_rate.0;
    let channels = config.channels.max(1);
    let err_id = device_id.to_string();
    let err_fn = move |err| tracing::warn!("capture stream error on '{}': {}", err_id, err);

    let mut frames_sent = 0u64;
    let mut deliver = move |samples: Vec<f32>| {
        let samples = if enabled.load(Ordering::Relaxed) {
            samples
        } else {
            vec![0.0; samples.len()]
        };
        let frames = (samples.len() / channels as usize) as u64;
        let frame = AudioFrame {
            samples,
            sample_rate,
            channels,
            timestamp: position_ns(frames_sent, sample_rate),
        };
        frames_sent += frames;
        let _ = tx.send(frame);
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _| deliver(data.to_vec()),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _| deliver(data.iter().map(|&s| s as f32 / 32_768.0).collect()),
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _| {
                deliver(data.iter().map(|&s| (s as f32 - 32_768.0) / 32_768.0).collect())
            },
            err_fn,
            None,
        ),
        other => {
            return Err(CaptureError::Connection(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceNotFound(device_id.to_string())
        }
        other => classify(device_id, other.to_string()),
    })?;

    stream
        .play()
        .map_err(|e| classify(device_id, e.to_string()))?;
    Ok(stream)
}

struct CpalStream {
    device_id: String,
    sample_rate: u32,
    channels: u16,
    enabled: Arc<AtomicBool>,
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn connect(&mut self, tx: Sender<AudioFrame>) -> Result<(), CaptureError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Connect(tx, reply_tx))
            .map_err(|_| CaptureError::Connection("capture thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| CaptureError::Connection("capture thread is gone".to_string()))?
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}
