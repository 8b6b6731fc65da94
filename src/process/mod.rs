//! Per-frame image processing: thresholding and heatmap colorization.

pub mod colormap;
pub mod ops;
pub mod threshold;

use std::fmt;

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::Frame;

/// The transform applied to every frame before display and storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingType {
    #[default]
    None,
    /// CLAHE, Yen threshold, then edge cleanup into a filled mask.
    YenThreshold,
    /// CLAHE and a binary Yen threshold, no cleanup.
    YenThresholdCompressed,
    /// Binary threshold at the configured level.
    StaticThreshold,
    /// Binary threshold at mean + 2 standard deviations.
    TwoStdDevFromMean,
}

impl ProcessingType {
    pub fn is_thresholded(self) -> bool {
        self != ProcessingType::None
    }
}

impl fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessingType::None => "none",
            ProcessingType::YenThreshold => "yen_threshold",
            ProcessingType::YenThresholdCompressed => "yen_threshold_compressed",
            ProcessingType::StaticThreshold => "static_threshold",
            ProcessingType::TwoStdDevFromMean => "two_std_dev_from_mean",
        })
    }
}

/// Result of processing one frame.
#[derive(Clone)]
pub struct ProcessedFrame {
    pub frame: Frame,
    /// The threshold that produced the mask, when one was applied.
    pub threshold: Option<f64>,
}

/// Turns a raw frame into the display/storage frame for one processing type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameProcessor {
    pub kind: ProcessingType,
    /// Level used by `StaticThreshold`.
    pub static_threshold: u8,
}

impl FrameProcessor {
    pub fn new(kind: ProcessingType, static_threshold: u8) -> Self {
        Self {
            kind,
            static_threshold,
        }
    }

    pub fn identity() -> Self {
        Self::new(ProcessingType::None, 0)
    }

    /// Identity returns the input frame untouched. Thresholding variants
    /// return RGBA: a JET heatmap of the intensities above the threshold,
    /// with the binary mask as alpha. `None` if the frame has no pixels.
    pub fn process(&self, frame: &Frame) -> Option<ProcessedFrame> {
        if self.kind == ProcessingType::None {
            return Some(ProcessedFrame {
                frame: frame.clone(),
                threshold: None,
            });
        }
        let grey = frame.to_luma8()?;
        let (mask, thresh) = self.mask(&grey)?;
        trace!(kind = %self.kind, threshold = thresh, "Processed frame");

        let floor = thresh.clamp(0.0, 255.0) as u8;
        let heat = colormap::apply_jet(&colormap::remap_from(&grey, floor));
        let (w, h) = grey.dimensions();
        let rgba = RgbaImage::from_fn(w, h, |x, y| {
            let [r, g, b] = heat.get_pixel(x, y).0;
            image::Rgba([r, g, b, mask.get_pixel(x, y).0[0]])
        });
        Some(ProcessedFrame {
            frame: Frame::from_rgba(rgba, frame.meta.sequence),
            threshold: Some(thresh),
        })
    }

    /// Binary mask and the threshold that produced it.
    fn mask(&self, grey: &GrayImage) -> Option<(GrayImage, f64)> {
        Some(match self.kind {
            ProcessingType::None => return None,
            ProcessingType::YenThreshold => yen_mask(grey, false),
            ProcessingType::YenThresholdCompressed => yen_mask(grey, true),
            ProcessingType::StaticThreshold => {
                let t = self.static_threshold as f64;
                (ops::threshold_binary(grey, t), t)
            }
            ProcessingType::TwoStdDevFromMean => {
                let (mean, sd) = threshold::mean_std_dev(grey);
                let t = mean + 2.0 * sd;
                (ops::threshold_binary(grey, t), t)
            }
        })
    }
}

/// Yen threshold on the CLAHE-equalized image. The compressed variant is a
/// plain binary threshold; the full one traces the thresholded blobs'
/// edges and fills them into a solid mask.
fn yen_mask(grey: &GrayImage, compressed: bool) -> (GrayImage, f64) {
    let eq = threshold::clahe(grey, threshold::CLAHE_CLIP_LIMIT, threshold::CLAHE_TILES);
    let t = threshold::yen_threshold(&threshold::histogram(&eq)) as f64;
    if compressed {
        return (ops::threshold_binary(&eq, t), t);
    }
    let zeroed = ops::threshold_to_zero(&eq, t);
    let blurred = ops::median_blur(&zeroed, 7);
    let edges = ops::canny(&blurred, 120.0, 120.0);
    let mut flooded = ops::dilate_ellipse3(&edges);
    ops::flood_fill(&mut flooded, (0, 0), 255);
    (ops::invert(&flooded), t)
}
