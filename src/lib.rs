pub mod capture;
pub mod config;
pub mod error;
pub mod persist;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod registry;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::sync::Arc;

pub use capture::{BackendKind, BackendRegistry, CameraBackend, Frame};
pub use config::{AppConfig, EncoderKind, SourceConfig, VideoConfig};
pub use error::{BootError, CaptureError, ConfigError, PersistError};
pub use persist::{ImageFileSink, Metadata, SnapshotSink};
pub use pipeline::video::VideoSettings;
pub use pipeline::{
    SnapProcess, SnapshotRequest, SnapshotStatus, StreamContext, StreamId, StreamParam, StreamState, VideoRequest,
    VideoStatus,
};
pub use platform::Platform;
pub use process::ProcessingType;
pub use registry::StreamRegistry;

use persist::video::{VideoEncoderFactory, Y4mEncoderFactory};

/// The video encoder the configuration asks for. Falls back to Y4M when
/// GStreamer support isn't compiled in.
pub fn video_settings(config: &VideoConfig) -> VideoSettings {
    let factory: Arc<dyn VideoEncoderFactory> = match config.encoder {
        EncoderKind::Y4m => Arc::new(Y4mEncoderFactory),
        #[cfg(feature = "gstreamer-pipeline")]
        EncoderKind::Gstreamer => Arc::new(persist::video::GstEncoderFactory),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        EncoderKind::Gstreamer => {
            tracing::warn!("Built without GStreamer support; recording to Y4M instead");
            Arc::new(Y4mEncoderFactory)
        }
    };
    VideoSettings {
        factory,
        fourcc: config.fourcc_bytes(),
        fps: config.fps,
    }
}

/// A registry wired up the way the configuration describes, not yet booted.
pub fn registry_from_config(
    config: &AppConfig,
    backends: BackendRegistry,
    sink: Arc<dyn SnapshotSink>,
) -> StreamRegistry {
    let ctx = StreamContext {
        sink,
        video: video_settings(&config.video),
    };
    StreamRegistry::new(config.platform.resolve(), backends, ctx).with_composite(config.composite.clone())
}
