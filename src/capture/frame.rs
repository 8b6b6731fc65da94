use bytes::Bytes;
use image::{GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics.
///
/// A published frame is never mutated; consumers that need to draw on it
/// (captions, video conversion) work on their own copy.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba32,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Rgba32 => Some(4),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Channel count once decoded.
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgba32 => 4,
            _ => 3,
        }
    }
}

impl Frame {
    /// Wrap a packed pixel buffer. The stride is derived from the format.
    pub fn from_pixels(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        let bpp = format.bytes_per_pixel().unwrap_or(1);
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * bpp,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn from_gray(img: GrayImage, sequence: u64) -> Self {
        let (w, h) = img.dimensions();
        Self::from_pixels(img.into_raw(), w, h, PixelFormat::Gray8, sequence)
    }

    pub fn from_rgb(img: RgbImage, sequence: u64) -> Self {
        let (w, h) = img.dimensions();
        Self::from_pixels(img.into_raw(), w, h, PixelFormat::Rgb24, sequence)
    }

    pub fn from_rgba(img: RgbaImage, sequence: u64) -> Self {
        let (w, h) = img.dimensions();
        Self::from_pixels(img.into_raw(), w, h, PixelFormat::Rgba32, sequence)
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.meta.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.meta.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    #[inline]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }

    /// A frame with no pixels, or whose buffer can't hold its declared size.
    pub fn is_empty(&self) -> bool {
        if self.meta.width == 0 || self.meta.height == 0 || self.data.is_empty() {
            return true;
        }
        match self.meta.format.bytes_per_pixel() {
            Some(bpp) => self.data.len() < (self.meta.width * self.meta.height * bpp) as usize,
            None => false,
        }
    }

    /// Packed pixel rows without stride padding.
    fn packed(&self) -> Option<Vec<u8>> {
        let bpp = self.meta.format.bytes_per_pixel()? as usize;
        let row = self.meta.width as usize * bpp;
        let stride = (self.meta.stride as usize).max(row);
        if stride == row {
            return Some(self.data[..row * self.meta.height as usize].to_vec());
        }
        let mut out = Vec::with_capacity(row * self.meta.height as usize);
        for y in 0..self.meta.height as usize {
            let start = y * stride;
            out.extend_from_slice(self.data.get(start..start + row)?);
        }
        Some(out)
    }

    /// Luma view of the frame, converting colour formats with BT.601 weights.
    pub fn to_luma8(&self) -> Option<GrayImage> {
        if self.is_empty() {
            return None;
        }
        let (w, h) = self.dimensions();
        let px = self.packed()?;
        let grey = match self.meta.format {
            PixelFormat::Gray8 => px,
            PixelFormat::Rgb24 => px.chunks_exact(3).map(|c| luma(c[0], c[1], c[2])).collect(),
            PixelFormat::Rgba32 => px.chunks_exact(4).map(|c| luma(c[0], c[1], c[2])).collect(),
            PixelFormat::Yuyv4 => px.chunks_exact(2).map(|c| c[0]).collect(),
            PixelFormat::Mjpeg => return None,
        };
        GrayImage::from_raw(w, h, grey)
    }

    /// RGB view of the frame. Alpha is dropped, not applied.
    pub fn to_rgb8(&self) -> Option<RgbImage> {
        if self.is_empty() {
            return None;
        }
        let (w, h) = self.dimensions();
        let px = self.packed()?;
        let rgb = match self.meta.format {
            PixelFormat::Gray8 => px.iter().flat_map(|&g| [g, g, g]).collect(),
            PixelFormat::Rgb24 => px,
            PixelFormat::Rgba32 => px
                .chunks_exact(4)
                .flat_map(|c| [c[0], c[1], c[2]])
                .collect(),
            PixelFormat::Yuyv4 => super::decode::yuyv_to_rgb(&px, w, h),
            PixelFormat::Mjpeg => return None,
        };
        RgbImage::from_raw(w, h, rgb)
    }

    /// A deep copy with its own buffer, used when drawing must not touch
    /// the shared frame.
    pub fn deep_copy(&self) -> Self {
        Self {
            data: Bytes::copy_from_slice(&self.data),
            meta: Arc::new((*self.meta).clone()),
            timestamp: self.timestamp,
        }
    }
}

#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frames_are_detected() {
        let f = Frame::from_pixels(Vec::new(), 4, 4, PixelFormat::Gray8, 0);
        assert!(f.is_empty());

        let short = Frame::from_pixels(vec![0u8; 10], 4, 4, PixelFormat::Rgb24, 0);
        assert!(short.is_empty());

        let ok = Frame::from_pixels(vec![0u8; 48], 4, 4, PixelFormat::Rgb24, 0);
        assert!(!ok.is_empty());
    }

    #[test]
    fn luma_of_rgb_white_is_white() {
        let f = Frame::from_pixels(vec![255u8; 12], 2, 2, PixelFormat::Rgb24, 0);
        let g = f.to_luma8().unwrap();
        assert!(g.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn rgba_to_rgb_drops_alpha() {
        let f = Frame::from_pixels(vec![10, 20, 30, 0], 1, 1, PixelFormat::Rgba32, 0);
        let rgb = f.to_rgb8().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 20, 30]);
    }
}
