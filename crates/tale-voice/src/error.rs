//! Error types for the tale-voice session core

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a live story session
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session already active (status: {0})")]
    AlreadyActive(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// User-facing failure classes. Every class is terminal for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Microphone permission denied or no input device.
    Microphone,
    /// Handshake or network failure reaching the live service.
    Connection,
    /// Malformed or unexpected inbound message during a session.
    Processing,
    Generic,
}

impl FailureKind {
    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::Microphone => {
                "Microphone access is needed to tell a story together. Please allow microphone access and try again."
            }
            FailureKind::Connection => {
                "Could not connect to the storyteller. Please check your connection and try again."
            }
            FailureKind::Processing => {
                "Something went wrong while processing the story. Please start again."
            }
            FailureKind::Generic => "Something went wrong. Please try again.",
        }
    }
}

impl VoiceError {
    /// Map this error onto the user-facing failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            VoiceError::AudioDevice(_) | VoiceError::AudioStream(_) => FailureKind::Microphone,
            VoiceError::Connection(_) => FailureKind::Connection,
            VoiceError::Protocol(_) | VoiceError::Json(_) | VoiceError::Decode(_) => {
                FailureKind::Processing
            }
            _ => FailureKind::Generic,
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}
