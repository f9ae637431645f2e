//! Error types for the voice relay

use thiserror::Error;

/// Audio device failures (microphone or speaker)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied for audio device: {0}")]
    PermissionDenied(String),

    #[error("audio device not found: {0}")]
    NotFound(String),

    #[error("audio device exposes no audio channels")]
    NoAudioTracks,

    #[error("audio stream error: {0}")]
    Stream(String),
}

/// Capture pipeline failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("capture already running")]
    AlreadyRunning,

    #[error("unsupported capture format: {0}")]
    UnsupportedFormat(String),
}

/// Link handshake failures (scoped to one remote participant)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("malformed handshake message from {remote}: {reason}")]
    Malformed { remote: String, reason: String },

    #[error("unexpected {message} from {remote} in state {state}")]
    Unexpected {
        remote: String,
        message: &'static str,
        state: &'static str,
    },

    #[error("link backend error for {remote}: {reason}")]
    Backend { remote: String, reason: String },

    #[error("link to {remote} not connected within {secs}s")]
    Timeout { remote: String, secs: u64 },

    #[error("no link for {0}")]
    UnknownLink(String),
}

impl SignalingError {
    /// Remote identity the error is scoped to
    pub fn remote(&self) -> &str {
        match self {
            SignalingError::Malformed { remote, .. }
            | SignalingError::Unexpected { remote, .. }
            | SignalingError::Backend { remote, .. }
            | SignalingError::Timeout { remote, .. } => remote,
            SignalingError::UnknownLink(remote) => remote,
        }
    }
}

/// Frame delivery failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("messaging channel disconnected")]
    Disconnected,

    #[error("send failed: {0}")]
    Send(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("{0} is not the current speaker")]
    NotSpeaker(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<DeviceError> for VoiceError {
    fn from(err: DeviceError) -> Self {
        VoiceError::Capture(CaptureError::Device(err))
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
