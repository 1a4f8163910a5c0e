//! Capture sources. A backend enumerates and opens devices; a stream pushes
//! interleaved float blocks at the device rate into the pipeline's audio channel.

use crossbeam_channel::Sender;

use crate::error::CaptureError;
use crate::messages::AudioFrame;

pub mod replay;
#[cfg(feature = "cpal")]
pub mod microphone;

pub use replay::ReplayBackend;
#[cfg(feature = "cpal")]
pub use microphone::CpalBackend;

/// Id of the system default input device.
pub const DEFAULT_DEVICE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
}

pub trait CaptureBackend: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError>;

    /// Acquire a device. Nothing is delivered until the stream is connected.
    fn open(&self, device_id: &str) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// An acquired capture device. Dropping it releases the device.
pub trait CaptureStream: Send {
    fn device_id(&self) -> &str;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Start pushing blocks into `tx`.
    fn connect(&mut self, tx: Sender<AudioFrame>) -> Result<(), CaptureError>;

    /// A disabled stream keeps running but delivers silence.
    fn set_enabled(&mut self, enabled: bool);

    /// Stop delivering blocks. Safe to call more than once.
    fn stop(&mut self);
}

/// Convert a running sample count to a stream timestamp in nanoseconds.
pub(crate) fn position_ns(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        0
    } else {
        (frames as u128 * 1_000_000_000 / sample_rate as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_is_in_nanoseconds() {
        assert_eq!(position_ns(48_000, 48_000), 1_000_000_000);
        assert_eq!(position_ns(480, 48_000), 10_000_000);
        assert_eq!(position_ns(10, 0), 0);
        // 200 hours at 48 kHz
        let frames = 200 * 3600 * 48_000_u64;
        assert_eq!(position_ns(frames, 48_000), 200 * 3600 * 1_000_000_000);
    }
}
