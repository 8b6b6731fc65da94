use thiserror::Error;

use crate::capture::BackendKind;
use crate::platform::Platform;

/// Failures inside a camera backend. These never cross the
/// `CameraBackend` boundary; backends log them and report a bool.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device error: {0}")]
    Device(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("driver returned {code} ({message})")]
    Driver { code: i32, message: &'static str },

    #[error("{0} support was not compiled in")]
    Unsupported(&'static str),

    #[error("backend is not active")]
    NotActive,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Snapshot and video persistence failures.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Empty filename")]
    EmptyFilename,

    #[error("frame has no pixels")]
    EmptyFrame,

    #[error("image encode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("metadata encode failed: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("video encoder: {0}")]
    Encoder(String),

    #[error("frame is {got_w}x{got_h}, recording is locked to {want_w}x{want_h}")]
    DimensionMismatch {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Reasons the registry refuses to boot.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("stream registry is already booted")]
    AlreadyBooted,

    #[error("no camera sources configured")]
    NoSources,

    #[error("stream registry has been shut down")]
    ShutDown,

    #[error("source {index} uses {kind}, which is not available on the {platform} platform")]
    Platform {
        index: usize,
        kind: BackendKind,
        platform: Platform,
    },

    #[error("failed to spawn stream worker: {0}")]
    Spawn(#[from] std::io::Error),
}
