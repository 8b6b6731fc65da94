use std::path::PathBuf;

use tracing::{info, warn};

use super::decode::flip_frame;
use super::frame::Frame;
use super::{BackendKind, CameraBackend};
use crate::config::SourceConfig;
use crate::persist::Metadata;

/// Serves one still image from disk on every poll. Used for testing and as a
/// hardware-free fallback.
pub struct StaticImageBackend {
    path: PathBuf,
    flip_horiz: bool,
    flip_vert: bool,
    frame: Option<Frame>,
}

impl StaticImageBackend {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            flip_horiz: false,
            flip_vert: false,
            frame: None,
        }
    }
}

impl Default for StaticImageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for StaticImageBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::StaticImage
    }

    fn activate(&mut self) -> bool {
        if self.frame.is_some() {
            return true;
        }
        let img = match image::open(&self.path) {
            Ok(img) => img,
            Err(e) => {
                warn!(path = %self.path.display(), "Could not load static image: {}", e);
                return false;
            }
        };
        let frame = if img.color().has_alpha() {
            Frame::from_rgba(img.to_rgba8(), 0)
        } else {
            Frame::from_rgb(img.to_rgb8(), 0)
        };
        if frame.is_empty() {
            warn!(path = %self.path.display(), "Static image is empty");
            return false;
        }
        info!(
            path = %self.path.display(),
            "Loaded static image {}x{}",
            frame.width(),
            frame.height()
        );
        self.frame = Some(flip_frame(frame, self.flip_horiz, self.flip_vert));
        true
    }

    fn deactivate(&mut self) -> bool {
        self.frame = None;
        true
    }

    fn poll_frame(&mut self) -> Option<Frame> {
        // Bytes clone, no pixel copy
        self.frame.clone()
    }

    fn pull_options(&mut self, source: &SourceConfig) -> bool {
        self.path = PathBuf::from(&source.static_img);
        self.flip_horiz = source.flip_horiz;
        self.flip_vert = source.flip_vert;
        true
    }

    fn is_valid(&self) -> bool {
        self.frame.is_some()
    }

    fn inject_metadata(&self, meta: &mut Metadata) {
        meta.insert("camera_sensor".into(), format!("static:{}", self.path.display()));
    }
}
