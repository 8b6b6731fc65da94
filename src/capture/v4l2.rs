//! V4L2 capture for USB cameras, addressed by index or by device node path.

use tracing::{debug, info, instrument, warn};

use super::decode::flip_frame;
use super::frame::Frame;
use super::{BackendKind, CameraBackend};
use crate::config::SourceConfig;
use crate::error::CaptureError;
use crate::persist::Metadata;
use crate::pipeline::StreamParam;

/// How the device node is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNode {
    Index(u32),
    Path(String),
}

impl std::fmt::Display for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceNode::Index(i) => write!(f, "/dev/video{}", i),
            DeviceNode::Path(p) => f.write_str(p),
        }
    }
}

/// Pull-based backend over a V4L2 capture node.
pub struct V4l2Backend {
    kind: BackendKind,
    node: DeviceNode,
    width: u32,
    height: u32,
    flip_horiz: bool,
    flip_vert: bool,
    exposure_micro: u32,
    capture: Option<V4l2Capture>,
    card: Option<String>,
}

impl V4l2Backend {
    pub fn usb() -> Self {
        Self::with_node(BackendKind::UsbIndex, DeviceNode::Index(0))
    }

    pub fn device_path() -> Self {
        Self::with_node(BackendKind::DevicePath, DeviceNode::Path(String::new()))
    }

    fn with_node(kind: BackendKind, node: DeviceNode) -> Self {
        Self {
            kind,
            node,
            width: 0,
            height: 0,
            flip_horiz: false,
            flip_vert: false,
            exposure_micro: 0,
            capture: None,
            card: None,
        }
    }

    pub fn node(&self) -> &DeviceNode {
        &self.node
    }
}

impl CameraBackend for V4l2Backend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    #[instrument(skip(self), fields(node = %self.node))]
    fn activate(&mut self) -> bool {
        if self.capture.is_some() {
            return true;
        }
        if let DeviceNode::Path(p) = &self.node {
            if p.is_empty() {
                warn!("No device path configured");
                return false;
            }
        }
        match V4l2Capture::open(&self.node, self.width, self.height) {
            Ok(mut capture) => {
                if self.exposure_micro > 0 {
                    if let Err(e) = capture.set_exposure(self.exposure_micro) {
                        warn!("Could not set exposure: {}", e);
                    }
                }
                self.card = Some(capture.card().to_string());
                self.capture = Some(capture);
                true
            }
            Err(e) => {
                warn!("Failed to open capture device: {}", e);
                false
            }
        }
    }

    fn deactivate(&mut self) -> bool {
        if self.capture.take().is_some() {
            debug!(node = %self.node, "Capture device released");
        }
        true
    }

    fn poll_frame(&mut self) -> Option<Frame> {
        let capture = self.capture.as_mut()?;
        match capture.capture_frame() {
            Ok(frame) => Some(flip_frame(frame, self.flip_horiz, self.flip_vert)),
            Err(e) => {
                warn!(node = %self.node, "Capture failed, dropping device: {}", e);
                self.capture = None;
                None
            }
        }
    }

    fn pull_options(&mut self, source: &SourceConfig) -> bool {
        self.node = match self.kind {
            BackendKind::DevicePath => DeviceNode::Path(source.dev_path.clone()),
            _ => DeviceNode::Index(source.index),
        };
        self.width = source.stream_width;
        self.height = source.stream_height;
        self.flip_horiz = source.flip_horiz;
        self.flip_vert = source.flip_vert;
        self.exposure_micro = source.video_exposure_micro;
        true
    }

    fn is_valid(&self) -> bool {
        self.capture.is_some()
    }

    fn set_param(&mut self, param: StreamParam, value: f64) -> bool {
        if param != StreamParam::ExposureMicroseconds {
            return false;
        }
        self.exposure_micro = value.max(0.0) as u32;
        match self.capture.as_mut() {
            Some(capture) => match capture.set_exposure(self.exposure_micro) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not set exposure: {}", e);
                    false
                }
            },
            None => true,
        }
    }

    fn inject_metadata(&self, meta: &mut Metadata) {
        if let Some(card) = &self.card {
            meta.insert("camera_sensor".into(), card.clone());
        }
    }
}

#[cfg(feature = "v4l2")]
pub use self::device::V4l2Capture;
#[cfg(not(feature = "v4l2"))]
pub use self::unsupported::V4l2Capture;

#[cfg(feature = "v4l2")]
mod device {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tracing::info;
    use v4l::buffer::Type;
    use v4l::capability::Flags as CapFlags;
    use v4l::control::{Control, Value};
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::MmapStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    use super::DeviceNode;
    use crate::capture::decode::decode_frame;
    use crate::capture::frame::{Frame, PixelFormat};
    use crate::error::CaptureError;

    const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
    const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
    const V4L2_EXPOSURE_MANUAL: i64 = 1;
    const BUFFER_COUNT: u32 = 4;

    /// Memory-mapped V4L2 stream.
    pub struct V4l2Capture {
        // Dropped before the device it maps
        stream: MmapStream<'static>,
        device: Box<Device>,
        card: String,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    }

    impl V4l2Capture {
        pub fn open(node: &DeviceNode, width: u32, height: u32) -> Result<Self, CaptureError> {
            let device = match node {
                DeviceNode::Index(i) => Device::new(*i as usize)?,
                DeviceNode::Path(p) => Device::with_path(p)?,
            };

            let caps = device.query_caps()?;
            info!("Device: {} ({})", caps.card, caps.driver);
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                return Err(CaptureError::Device(format!(
                    "{} doesn't support video capture",
                    node
                )));
            }

            // Prefer MJPEG, fall back to YUYV
            let mjpg = FourCC::new(b"MJPG");
            let yuyv = FourCC::new(b"YUYV");
            let offered: Vec<FourCC> = device
                .enum_formats()?
                .into_iter()
                .map(|f| f.fourcc)
                .collect();
            let fourcc = if offered.contains(&mjpg) {
                mjpg
            } else if offered.contains(&yuyv) {
                yuyv
            } else {
                return Err(CaptureError::Device(format!(
                    "{} offers neither MJPEG nor YUYV",
                    node
                )));
            };

            let mut fmt = device.format()?;
            if width > 0 && height > 0 {
                fmt.width = width;
                fmt.height = height;
            }
            fmt.fourcc = fourcc;
            let fmt = device.set_format(&fmt)?;
            let format = if fmt.fourcc == mjpg {
                PixelFormat::Mjpeg
            } else {
                PixelFormat::Yuyv4
            };

            let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
            info!(
                "Capture stream started: {}x{} {:?} with {} buffers",
                fmt.width, fmt.height, format, BUFFER_COUNT
            );

            Ok(Self {
                stream,
                device: Box::new(device),
                card: caps.card,
                width: fmt.width,
                height: fmt.height,
                format,
                sequence: 0,
            })
        }

        pub fn card(&self) -> &str {
            &self.card
        }

        /// Blocks for the next filled buffer.
        pub fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
            let timestamp = Instant::now();
            let (buf, meta) = self.stream.next()?;
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            self.sequence += 1;
            let mut frame = decode_frame(
                &buf[..used],
                self.width,
                self.height,
                self.format,
                self.sequence,
            )?;
            let mut frame_meta = (*frame.meta).clone();
            frame_meta.device_timestamp = Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            );
            frame.meta = Arc::new(frame_meta);
            frame.timestamp = timestamp;
            Ok(frame)
        }

        /// Exposure is programmed in units of 100us.
        pub fn set_exposure(&mut self, micros: u32) -> Result<(), CaptureError> {
            self.device.set_control(Control {
                id: V4L2_CID_EXPOSURE_AUTO,
                value: Value::Integer(V4L2_EXPOSURE_MANUAL),
            })?;
            self.device.set_control(Control {
                id: V4L2_CID_EXPOSURE_ABSOLUTE,
                value: Value::Integer(i64::from((micros / 100).max(1))),
            })?;
            Ok(())
        }
    }
}

#[cfg(not(feature = "v4l2"))]
mod unsupported {
    use super::DeviceNode;
    use crate::capture::frame::Frame;
    use crate::error::CaptureError;

    /// Stand-in when V4L2 support is not compiled in; never opens.
    pub struct V4l2Capture {
        _private: (),
    }

    impl V4l2Capture {
        pub fn open(_node: &DeviceNode, _width: u32, _height: u32) -> Result<Self, CaptureError> {
            Err(CaptureError::Unsupported("V4L2"))
        }

        pub fn card(&self) -> &str {
            ""
        }

        pub fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
            Err(CaptureError::NotActive)
        }

        pub fn set_exposure(&mut self, _micros: u32) -> Result<(), CaptureError> {
            Err(CaptureError::NotActive)
        }
    }
}

/// Log the V4L2 capture nodes present, preferring ones that offer MJPEG.
pub fn log_capture_devices() {
    #[cfg(feature = "v4l2")]
    {
        for found in crate::utils::probe_capture_devices() {
            info!("Found {:?} capture device: {} - {}", found.format, found.path, found.card);
        }
    }
    #[cfg(not(feature = "v4l2"))]
    info!("Built without V4L2 support; skipping device probe");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_options_picks_node_by_kind() {
        let source = SourceConfig {
            index: 3,
            dev_path: "/dev/video7".into(),
            ..SourceConfig::default()
        };
        let mut usb = V4l2Backend::usb();
        usb.pull_options(&source);
        assert_eq!(usb.node(), &DeviceNode::Index(3));

        let mut path = V4l2Backend::device_path();
        path.pull_options(&source);
        assert_eq!(path.node(), &DeviceNode::Path("/dev/video7".into()));
        assert!(!path.is_valid());
    }

    #[test]
    fn empty_device_path_does_not_activate() {
        let mut backend = V4l2Backend::device_path();
        assert!(!backend.activate());
        assert!(backend.deactivate());
    }

}
