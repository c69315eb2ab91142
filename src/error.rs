//! Error taxonomy for the capture engine.
//!
//! Application-level code (supervisor, finalizer, CLI, HTTP) uses `anyhow`;
//! these typed errors exist where callers need to branch on the failure kind.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a capture device or device provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// No microphone permission. Never retried.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Device busy or not ready yet. Retried.
    #[error("capture device busy: {0}")]
    Busy(String),

    /// The device stopped delivering data mid-session (hard read error).
    #[error("capture device invalidated: {0}")]
    Invalidated(String),

    /// The device is permanently gone. Never retried.
    #[error("capture device gone: {0}")]
    Gone(String),

    /// Bounded acquisition retry ran out of time.
    #[error("microphone access failed after {waited:?}: {last}")]
    AcquisitionTimedOut { waited: Duration, last: String },
}

impl CaptureError {
    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::PermissionDenied | CaptureError::Gone(_))
    }
}

/// Reasons `Engine::start` can be rejected.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a recording session is already active")]
    AlreadyActive,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("wake token unavailable")]
    WakeTokenUnavailable,

    #[error("audio focus denied")]
    FocusDenied,

    #[error("microphone access failed")]
    MicrophoneAccessFailed(#[source] CaptureError),

    #[error("out of memory allocating capture buffers")]
    OutOfMemory,

    #[error("encoder initialization failed: {0}")]
    Encoder(String),

    #[error("failed to open chunk file")]
    Io(#[from] std::io::Error),
}

impl From<CaptureError> for StartError {
    /// Permission denial keeps its own variant wherever it is detected
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::PermissionDenied => StartError::PermissionDenied,
            other => StartError::MicrophoneAccessFailed(other),
        }
    }
}

/// Frame header errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdtsError {
    #[error("sample rate {0} Hz has no ADTS frequency index")]
    UnsupportedSampleRate(u32),

    #[error("packet of {0} bytes does not fit in an ADTS frame")]
    PacketTooLarge(usize),
}
