//! Per-stream workers and the requests they serve.

pub mod camera;
pub mod composite;
pub mod request;
pub mod roi;
pub mod stream;
pub mod timer;
pub mod video;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::camera::CameraWorker;
pub use self::composite::{CompositeMailbox, CompositeWorker};
pub use self::request::{SnapProcess, SnapshotRequest, SnapshotStatus, VideoRequest, VideoStatus};
pub use self::stream::{StreamContext, StreamCore, StreamHandle, StreamSettings};

/// Numeric properties reachable through the registry's generic
/// get/set channel. Streams ignore the ones they don't support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamParam {
    /// Opacity of a stream inside the composite, 0..=1.
    Alpha,
    /// Level used by the static threshold processing type.
    StaticThreshold,
    CompositeWidth,
    CompositeHeight,
    ExposureMicroseconds,
}

/// Addresses a stream in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Camera(usize),
    Composite,
    /// Never resolves; lookups return sentinel values.
    Invalid,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Camera(i) => write!(f, "cam{}", i),
            StreamId::Composite => f.write_str("composite"),
            StreamId::Invalid => f.write_str("invalid"),
        }
    }
}

impl From<usize> for StreamId {
    fn from(i: usize) -> Self {
        StreamId::Camera(i)
    }
}

/// Connection state of a stream worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Never started, or the id is unknown.
    #[default]
    Unknown,
    /// No backend configured, or waiting to retry.
    Idling,
    Connecting,
    Polling,
    Shutdown,
}

impl StreamState {
    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Idling,
            2 => StreamState::Connecting,
            3 => StreamState::Polling,
            4 => StreamState::Shutdown,
            _ => StreamState::Unknown,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamState::Unknown => "unknown",
            StreamState::Idling => "idling",
            StreamState::Connecting => "connecting",
            StreamState::Polling => "polling",
            StreamState::Shutdown => "shutdown",
        })
    }
}

