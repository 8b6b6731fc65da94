//! Persistence collaborators: where snapshots and recordings end up.
//!
//! The stream workers only ever hand over a frame plus a flat metadata map;
//! the sinks here own the file formats.

pub mod caption;
pub mod video;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use tracing::debug;

use crate::capture::{Frame, PixelFormat};
use crate::error::PersistError;

pub use video::{VideoEncoder, VideoEncoderFactory, Y4mEncoderFactory};

/// Flat key/value tags stored alongside a snapshot.
pub type Metadata = BTreeMap<String, String>;

/// Receives finished snapshots.
pub trait SnapshotSink: Send + Sync {
    /// Store `frame` under exactly `filename`.
    fn save(&self, filename: &str, frame: &Frame, meta: &Metadata) -> Result<(), PersistError>;
}

/// Writes snapshots as image files plus a `<filename>.json` metadata
/// sidecar. The format follows the extension; unknown extensions get PNG
/// bytes under the requested name.
#[derive(Debug, Clone, Default)]
pub struct ImageFileSink {
    /// Relative filenames resolve against this directory when set.
    pub base_dir: Option<PathBuf>,
}

impl ImageFileSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
        }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        match &self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl SnapshotSink for ImageFileSink {
    fn save(&self, filename: &str, frame: &Frame, meta: &Metadata) -> Result<(), PersistError> {
        if filename.is_empty() {
            return Err(PersistError::EmptyFilename);
        }
        let img = frame_to_image(frame).ok_or(PersistError::EmptyFrame)?;
        let path = self.resolve(filename);

        let format = ImageFormat::from_path(&path)
            .ok()
            .filter(|f| matches!(f, ImageFormat::Png | ImageFormat::Jpeg))
            .unwrap_or(ImageFormat::Png);
        let img = match format {
            ImageFormat::Jpeg if img.color().has_alpha() => DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => img,
        };
        img.save_with_format(&path, format)?;

        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".json");
        fs::write(&sidecar, serde_json::to_vec_pretty(meta)?)?;

        debug!(path = %path.display(), ?format, "Saved snapshot");
        Ok(())
    }
}

/// Decoded pixel view of a frame, keeping alpha and single-channel layouts.
pub fn frame_to_image(frame: &Frame) -> Option<DynamicImage> {
    if frame.is_empty() {
        return None;
    }
    Some(match frame.format() {
        PixelFormat::Gray8 => DynamicImage::ImageLuma8(frame.to_luma8()?),
        PixelFormat::Rgba32 => {
            let (w, h) = frame.dimensions();
            let rgba = image::RgbaImage::from_raw(w, h, frame.data[..(w * h * 4) as usize].to_vec())?;
            DynamicImage::ImageRgba8(rgba)
        }
        _ => DynamicImage::ImageRgb8(frame.to_rgb8()?),
    })
}
