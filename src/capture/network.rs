use tracing::{info, warn};

use super::decode::flip_frame;
use super::frame::Frame;
use super::gst_capture::GstCapture;
use super::{BackendKind, CameraBackend};
use crate::config::SourceConfig;
use crate::persist::Metadata;

/// Network stream (RTSP, HTTP, file URIs) decoded through GStreamer.
pub struct NetworkBackend {
    uri: String,
    width: u32,
    height: u32,
    flip_horiz: bool,
    flip_vert: bool,
    capture: Option<GstCapture>,
}

impl NetworkBackend {
    pub fn new() -> Self {
        Self {
            uri: String::new(),
            width: 0,
            height: 0,
            flip_horiz: false,
            flip_vert: false,
            capture: None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Default for NetworkBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for NetworkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkUrl
    }

    fn activate(&mut self) -> bool {
        if self.capture.is_some() {
            return true;
        }
        if self.uri.is_empty() {
            warn!("No stream URL configured");
            return false;
        }
        match GstCapture::open(&self.uri, self.width, self.height) {
            Ok(capture) => {
                info!(uri = %self.uri, "Network stream opened");
                self.capture = Some(capture);
                true
            }
            Err(e) => {
                warn!(uri = %self.uri, "Failed to open network stream: {}", e);
                false
            }
        }
    }

    fn deactivate(&mut self) -> bool {
        self.capture = None;
        true
    }

    fn poll_frame(&mut self) -> Option<Frame> {
        let capture = self.capture.as_mut()?;
        if !capture.is_healthy() {
            self.capture = None;
            return None;
        }
        match capture.capture_frame() {
            Ok(frame) => frame.map(|f| flip_frame(f, self.flip_horiz, self.flip_vert)),
            Err(e) => {
                warn!(uri = %self.uri, "Dropping stream: {}", e);
                self.capture = None;
                None
            }
        }
    }

    fn pull_options(&mut self, source: &SourceConfig) -> bool {
        self.uri = source.uri.clone();
        self.width = source.stream_width;
        self.height = source.stream_height;
        self.flip_horiz = source.flip_horiz;
        self.flip_vert = source.flip_vert;
        true
    }

    fn is_valid(&self) -> bool {
        self.capture.is_some()
    }

    fn inject_metadata(&self, meta: &mut Metadata) {
        meta.insert("camera_sensor".into(), format!("network:{}", self.uri));
    }
}
