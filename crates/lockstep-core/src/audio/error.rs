//! Output backend error types

use thiserror::Error;

/// Errors raised while opening or running the output stream
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio output devices found")]
    NoDevices,

    #[error("Failed to get default audio device: {0}")]
    NoDefaultDevice(String),

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// Device buffer larger than the engine's preallocated block
    #[error("Device buffer of {requested} frames exceeds engine capacity of {available} frames")]
    InsufficientCapacity { requested: usize, available: usize },
}

pub type AudioResult<T> = Result<T, AudioError>;
