//! Video writers. The stream worker owns pacing; an encoder only ever sees
//! a steady sequence of equally sized RGB frames.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use image::RgbImage;
use tracing::{debug, info};

use crate::error::PersistError;

/// What a recording is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSpec {
    pub path: PathBuf,
    /// Codec tag, e.g. `avc1`.
    pub fourcc: [u8; 4],
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoSpec {
    pub fn fourcc_str(&self) -> String {
        String::from_utf8_lossy(&self.fourcc).into_owned()
    }
}

/// An open recording.
pub trait VideoEncoder: Send {
    /// Append one frame. Its size must match the spec the encoder was
    /// opened with.
    fn write(&mut self, frame: &RgbImage) -> Result<(), PersistError>;

    /// Flush and finalize. Further writes are errors.
    fn close(&mut self) -> Result<(), PersistError>;
}

pub trait VideoEncoderFactory: Send + Sync {
    fn open(&self, spec: &VideoSpec) -> Result<Box<dyn VideoEncoder>, PersistError>;
}

fn check_size(spec: &VideoSpec, frame: &RgbImage) -> Result<(), PersistError> {
    let (w, h) = frame.dimensions();
    if (w, h) != (spec.width, spec.height) {
        return Err(PersistError::DimensionMismatch {
            want_w: spec.width,
            want_h: spec.height,
            got_w: w,
            got_h: h,
        });
    }
    Ok(())
}

/// Uncompressed YUV4MPEG2 (4:4:4) output. Needs no codec libraries; the
/// fourcc is recorded in the stream comment only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Y4mEncoderFactory;

impl VideoEncoderFactory for Y4mEncoderFactory {
    fn open(&self, spec: &VideoSpec) -> Result<Box<dyn VideoEncoder>, PersistError> {
        Ok(Box::new(Y4mEncoder::create(spec.clone())?))
    }
}

pub struct Y4mEncoder {
    spec: VideoSpec,
    out: Option<BufWriter<File>>,
    planes: Vec<u8>,
    frames: u64,
}

impl Y4mEncoder {
    pub fn create(spec: VideoSpec) -> Result<Self, PersistError> {
        if spec.width == 0 || spec.height == 0 {
            return Err(PersistError::Encoder(format!(
                "invalid frame size {}x{}",
                spec.width, spec.height
            )));
        }
        let mut out = BufWriter::new(File::create(&spec.path)?);
        writeln!(
            out,
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444 XCODEC={}",
            spec.width,
            spec.height,
            spec.fps.max(1),
            spec.fourcc_str().trim()
        )?;
        info!(path = %spec.path.display(), width = spec.width, height = spec.height, "Opened Y4M recording");
        let n = (spec.width * spec.height) as usize;
        Ok(Self {
            spec,
            out: Some(out),
            planes: vec![0; n * 3],
            frames: 0,
        })
    }
}

/// BT.601 studio range.
#[inline]
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    [y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8]
}

impl VideoEncoder for Y4mEncoder {
    fn write(&mut self, frame: &RgbImage) -> Result<(), PersistError> {
        check_size(&self.spec, frame)?;
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| PersistError::Encoder("recording is closed".into()))?;

        let n = (self.spec.width * self.spec.height) as usize;
        let (y_plane, rest) = self.planes.split_at_mut(n);
        let (u_plane, v_plane) = rest.split_at_mut(n);
        for (i, px) in frame.pixels().enumerate() {
            let [y, u, v] = rgb_to_yuv(px.0[0], px.0[1], px.0[2]);
            y_plane[i] = y;
            u_plane[i] = u;
            v_plane[i] = v;
        }
        out.write_all(b"FRAME\n")?;
        out.write_all(&self.planes)?;
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            debug!(path = %self.spec.path.display(), frames = self.frames, "Closed Y4M recording");
        }
        Ok(())
    }
}

impl Drop for Y4mEncoder {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(feature = "gstreamer-pipeline")]
pub use gst::GstEncoderFactory;

#[cfg(feature = "gstreamer-pipeline")]
mod gst {
    use super::*;
    use gstreamer::prelude::*;
    use gstreamer_app::AppSrc;
    use tracing::warn;

    /// Encodes through `appsrc ! videoconvert ! <encoder> ! <muxer> ! filesink`.
    /// The encoder follows the fourcc, the muxer the file extension.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct GstEncoderFactory;

    impl VideoEncoderFactory for GstEncoderFactory {
        fn open(&self, spec: &VideoSpec) -> Result<Box<dyn VideoEncoder>, PersistError> {
            Ok(Box::new(GstEncoder::create(spec.clone())?))
        }
    }

    fn encoder_for(fourcc: &[u8; 4]) -> &'static str {
        match &fourcc.to_ascii_lowercase()[..] {
            b"mjpg" => "jpegenc",
            b"vp80" => "vp8enc",
            b"vp90" => "vp9enc",
            _ => "x264enc",
        }
    }

    fn muxer_for(spec: &VideoSpec) -> &'static str {
        let ext = spec
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("mkv") => "matroskamux",
            Some("avi") => "avimux",
            Some("webm") => "webmmux",
            _ => "mp4mux",
        }
    }

    fn make(factory: &str) -> Result<gstreamer::Element, PersistError> {
        gstreamer::ElementFactory::make(factory)
            .build()
            .map_err(|e| PersistError::Encoder(format!("failed to create {}: {}", factory, e)))
    }

    pub struct GstEncoder {
        spec: VideoSpec,
        pipeline: gstreamer::Pipeline,
        appsrc: AppSrc,
        frames: u64,
        closed: bool,
    }

    impl GstEncoder {
        pub fn create(spec: VideoSpec) -> Result<Self, PersistError> {
            gstreamer::init()
                .map_err(|e| PersistError::Encoder(format!("GStreamer init failed: {}", e)))?;

            let pipeline = gstreamer::Pipeline::new();
            let appsrc = make("appsrc")?
                .downcast::<AppSrc>()
                .map_err(|_| PersistError::Encoder("failed to downcast to AppSrc".into()))?;
            let convert = make("videoconvert")?;
            let encoder = make(encoder_for(&spec.fourcc))?;
            let muxer = make(muxer_for(&spec))?;
            let sink = make("filesink")?;
            sink.set_property("location", spec.path.to_string_lossy().as_ref());

            let caps = gstreamer::Caps::builder("video/x-raw")
                .field("format", "RGB")
                .field("width", spec.width as i32)
                .field("height", spec.height as i32)
                .field("framerate", gstreamer::Fraction::new(spec.fps.max(1) as i32, 1))
                .build();
            appsrc.set_caps(Some(&caps));
            appsrc.set_format(gstreamer::Format::Time);

            pipeline
                .add_many([appsrc.upcast_ref(), &convert, &encoder, &muxer, &sink])
                .map_err(|e| PersistError::Encoder(format!("failed to add elements: {}", e)))?;
            gstreamer::Element::link_many([appsrc.upcast_ref(), &convert, &encoder, &muxer, &sink])
                .map_err(|e| PersistError::Encoder(format!("failed to link elements: {}", e)))?;

            pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|e| PersistError::Encoder(format!("failed to start pipeline: {}", e)))?;

            info!(
                path = %spec.path.display(),
                encoder = encoder_for(&spec.fourcc),
                "Opened GStreamer recording"
            );
            Ok(Self {
                spec,
                pipeline,
                appsrc,
                frames: 0,
                closed: false,
            })
        }
    }

    impl VideoEncoder for GstEncoder {
        fn write(&mut self, frame: &RgbImage) -> Result<(), PersistError> {
            check_size(&self.spec, frame)?;
            if self.closed {
                return Err(PersistError::Encoder("recording is closed".into()));
            }
            let mut buffer = gstreamer::Buffer::from_slice(frame.as_raw().clone());
            {
                let buffer = buffer
                    .get_mut()
                    .ok_or_else(|| PersistError::Encoder("buffer is not writable".into()))?;
                let step = 1_000_000_000 / self.spec.fps.max(1) as u64;
                buffer.set_pts(gstreamer::ClockTime::from_nseconds(self.frames * step));
                buffer.set_duration(gstreamer::ClockTime::from_nseconds(step));
            }
            self.appsrc
                .push_buffer(buffer)
                .map_err(|e| PersistError::Encoder(format!("push failed: {:?}", e)))?;
            self.frames += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<(), PersistError> {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            if let Err(e) = self.appsrc.end_of_stream() {
                warn!("Failed to send EOS: {:?}", e);
            }
            if let Some(bus) = self.pipeline.bus() {
                let _ = bus.timed_pop_filtered(
                    gstreamer::ClockTime::from_seconds(5),
                    &[gstreamer::MessageType::Eos, gstreamer::MessageType::Error],
                );
            }
            self.pipeline
                .set_state(gstreamer::State::Null)
                .map_err(|e| PersistError::Encoder(format!("failed to stop pipeline: {}", e)))?;
            debug!(path = %self.spec.path.display(), frames = self.frames, "Closed GStreamer recording");
            Ok(())
        }
    }

    impl Drop for GstEncoder {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }
}
