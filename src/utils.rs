use crate::capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::debug;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

/// Highest `/dev/videoN` node probed.
const MAX_VIDEO_NODES: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
    pub card: String,
}

/// List capture nodes that offer a format we can decode, preferring MJPEG
/// over YUYV per device.
pub fn probe_capture_devices() -> Vec<FoundDevice> {
    use std::path::Path;

    let mut found = Vec::new();
    for i in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!("Could not open {}", path);
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Metadata nodes share the driver but can't capture
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        let mut best = None;
        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                best = Some(PixelFormat::Mjpeg);
                break;
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                best = Some(PixelFormat::Yuyv4);
            }
        }
        if let Some(format) = best {
            found.push(FoundDevice {
                path,
                format,
                card: caps.card,
            });
        }
    }
    found
}
