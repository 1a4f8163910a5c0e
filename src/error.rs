use thiserror::Error;

use crate::config::ModeId;

/// Capture device failures, classified so each maps to a distinct user-facing message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("capture device '{0}' not found")]
    DeviceNotFound(String),
    #[error("capture device '{0}' is busy")]
    DeviceBusy(String),
    #[error("failed to connect capture source to pipeline: {0}")]
    Connection(String),
    #[error("capture error: {0}")]
    Other(String),
}

impl CaptureError {
    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied => {
                "Microphone permission denied. Please enable it in your settings."
            }
            CaptureError::DeviceNotFound(_) => {
                "The selected microphone was not found. It might be disconnected."
            }
            CaptureError::DeviceBusy(_) => {
                "The microphone is currently in use by another application."
            }
            CaptureError::Connection(_) => "Audio processing pipeline connection failed.",
            CaptureError::Other(_) => "An unexpected error occurred while accessing the microphone.",
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelStoreError {
    #[error("model '{0}' not found in storage")]
    NotFound(String),
    #[error("invalid model file: empty data")]
    Empty,
    #[error("stored model '{0}' is corrupted")]
    Corrupted(String),
    #[error("model storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("{mode} model initialization failed: {message}")]
    Init { mode: ModeId, message: String },
    #[error("{0} model initialization timeout")]
    ReadyTimeout(ModeId),
    #[error(transparent)]
    Model(#[from] ModelStoreError),
    #[error("operation not allowed while {0}")]
    InvalidState(&'static str),
}

impl SessionError {
    /// Human-readable message stored on the session when it enters `Error`.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Capture(e) => e.user_message().to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_map_to_distinct_messages() {
        let messages = [
            CaptureError::PermissionDenied.user_message(),
            CaptureError::DeviceNotFound("x".into()).user_message(),
            CaptureError::DeviceBusy("x".into()).user_message(),
            CaptureError::Other("x".into()).user_message(),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn session_error_prefers_capture_user_message() {
        let e = SessionError::from(CaptureError::PermissionDenied);
        assert!(e.user_message().starts_with("Microphone permission denied"));

        let e = SessionError::ReadyTimeout(ModeId::Premium);
        assert_eq!(e.user_message(), "PREMIUM model initialization timeout");
    }
}
