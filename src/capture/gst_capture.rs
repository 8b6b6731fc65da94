//! GStreamer-based network stream capture

#[cfg(feature = "gstreamer-pipeline")]
pub use self::pipeline::GstCapture;
#[cfg(not(feature = "gstreamer-pipeline"))]
pub use self::unsupported::GstCapture;

/// Pipeline description for decoding an arbitrary URI to packed RGB.
pub fn build_pipeline_string(uri: &str, width: u32, height: u32) -> String {
    let scale = if width > 0 && height > 0 {
        format!(
            "videoscale ! video/x-raw,format=RGB,width={},height={} ! ",
            width, height
        )
    } else {
        "video/x-raw,format=RGB ! ".to_string()
    };
    format!(
        "uridecodebin uri={} name=source ! \
         queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
         videoconvert ! {}appsink name=appsink",
        uri, scale
    )
}

#[cfg(feature = "gstreamer-pipeline")]
mod pipeline {
    use std::sync::Arc;
    use std::time::Instant;

    use bytes::Bytes;
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use tracing::{debug, info, warn};

    use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
    use crate::error::CaptureError;

    /// A running `uridecodebin` to `appsink` pipeline.
    pub struct GstCapture {
        pipeline: gst::Pipeline,
        appsink: gst_app::AppSink,
        sequence: u64,
        failed: bool,
    }

    impl GstCapture {
        pub fn open(uri: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
            gst::init().map_err(|e| CaptureError::Device(format!("GStreamer init: {}", e)))?;

            let desc = super::build_pipeline_string(uri, width, height);
            info!("Pipeline: {}", desc);

            let pipeline = gst::parse::launch(&desc)
                .map_err(|e| CaptureError::Device(e.to_string()))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| CaptureError::Device("Failed to create pipeline".into()))?;

            let appsink = pipeline
                .by_name("appsink")
                .ok_or_else(|| CaptureError::Device("Failed to find appsink element".into()))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| CaptureError::Device("Failed to cast to AppSink".into()))?;

            appsink.set_property("emit-signals", false);
            appsink.set_property("max-buffers", 2u32);
            appsink.set_property("drop", true);
            appsink.set_property("sync", false);

            pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| CaptureError::Device(format!("Failed to start pipeline: {:?}", e)))?;

            let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
            match state_change {
                Ok(gst::StateChangeSuccess::Success) => info!("Pipeline started"),
                Ok(gst::StateChangeSuccess::Async) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                    info!("Pipeline starting asynchronously")
                }
                Err(_) => {
                    let _ = pipeline.set_state(gst::State::Null);
                    return Err(CaptureError::Device("Failed to start pipeline".into()));
                }
            }

            Ok(Self {
                pipeline,
                appsink,
                sequence: 0,
                failed: false,
            })
        }

        /// False once the bus has reported an error or end of stream.
        pub fn is_healthy(&mut self) -> bool {
            if self.failed {
                return false;
            }
            if let Some(bus) = self.pipeline.bus() {
                while let Some(msg) =
                    bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])
                {
                    match msg.view() {
                        gst::MessageView::Error(err) => {
                            warn!("Pipeline error: {} ({:?})", err.error(), err.debug());
                        }
                        _ => info!("Stream ended"),
                    }
                    self.failed = true;
                }
            }
            !self.failed
        }

        /// Wait up to 100ms for the next decoded frame.
        pub fn capture_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let timestamp = Instant::now();
            let Some(sample) = self
                .appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(100))
            else {
                return Ok(None);
            };

            let buffer = sample
                .buffer()
                .ok_or_else(|| CaptureError::Decode("Sample contains no buffer".into()))?;
            let map = buffer
                .map_readable()
                .map_err(|_| CaptureError::Decode("Failed to map buffer".into()))?;
            let caps = sample
                .caps()
                .ok_or_else(|| CaptureError::Decode("Sample has no caps".into()))?;
            let video_info = gst_video::VideoInfo::from_caps(caps)
                .map_err(|_| CaptureError::Decode("Failed to parse video info from caps".into()))?;

            let (w, h) = (video_info.width(), video_info.height());
            let stride = video_info.stride()[0] as u32;
            self.sequence += 1;
            debug!(sequence = self.sequence, "Pulled {}x{} sample", w, h);

            Ok(Some(Frame {
                data: Bytes::copy_from_slice(map.as_slice()),
                meta: Arc::new(FrameMetadata {
                    sequence: self.sequence,
                    width: w,
                    height: h,
                    stride,
                    format: PixelFormat::Rgb24,
                    device_timestamp: buffer.pts().map(|pts| pts.into()),
                }),
                timestamp,
            }))
        }

        pub fn stop_stream(&mut self) {
            info!("Stopping GStreamer pipeline");
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
    }

    impl Drop for GstCapture {
        fn drop(&mut self) {
            self.stop_stream();
        }
    }
}

#[cfg(not(feature = "gstreamer-pipeline"))]
mod unsupported {
    use crate::capture::frame::Frame;
    use crate::error::CaptureError;

    /// Stand-in when GStreamer support is not compiled in; never opens.
    pub struct GstCapture {
        _private: (),
    }

    impl GstCapture {
        pub fn open(_uri: &str, _width: u32, _height: u32) -> Result<Self, CaptureError> {
            Err(CaptureError::Unsupported("GStreamer"))
        }

        pub fn is_healthy(&mut self) -> bool {
            false
        }

        pub fn capture_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            Err(CaptureError::NotActive)
        }

        pub fn stop_stream(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_scales_only_when_sized() {
        let sized = build_pipeline_string("rtsp://cam/1", 640, 480);
        assert!(sized.contains("uri=rtsp://cam/1"));
        assert!(sized.contains("width=640,height=480"));
        assert!(sized.ends_with("appsink name=appsink"));

        let native = build_pipeline_string("rtsp://cam/1", 0, 0);
        assert!(!native.contains("videoscale"));
    }
}
