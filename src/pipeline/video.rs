use std::path::PathBuf;
use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, info, warn};

use super::request::{VideoRequest, VideoStatus};
use super::timer::GrabTimer;
use super::StreamId;
use crate::capture::Frame;
use crate::persist::caption;
use crate::persist::video::{VideoEncoder, VideoEncoderFactory, VideoSpec};

/// Most frames written for one delivered frame. A source slower than the
/// output rate is padded by repeating frames, up to this many per tick.
pub const MAX_CATCH_UP: usize = 10;

/// Recording settings shared by every stream.
#[derive(Clone)]
pub struct VideoSettings {
    pub factory: Arc<dyn VideoEncoderFactory>,
    pub fourcc: [u8; 4],
    pub fps: u32,
}

impl VideoSettings {
    fn frame_ms(&self) -> u64 {
        1000 / self.fps.clamp(1, 1000) as u64
    }
}

/// A stream's single recording slot. Opening a new recording closes the
/// previous one. The encoder opens on the first frame, which locks the
/// size every later frame has to match.
pub struct Recorder {
    stream: StreamId,
    settings: VideoSettings,
    active: Option<Arc<VideoRequest>>,
    encoder: Option<Box<dyn VideoEncoder>>,
    timer: GrabTimer,
    stream_name: String,
}

impl Recorder {
    pub fn new(stream: StreamId, stream_name: impl Into<String>, settings: VideoSettings) -> Self {
        Self {
            stream,
            settings,
            active: None,
            encoder: None,
            timer: GrabTimer::new(),
            stream_name: stream_name.into(),
        }
    }

    /// Start recording to `filename`. `current` is written straight away
    /// when present so the size locks without waiting for the next frame.
    pub fn open(&mut self, filename: &str, current: Option<&Frame>, caption_text: &str) -> Arc<VideoRequest> {
        if filename.is_empty() {
            return VideoRequest::failed(self.stream, filename, "Empty filename");
        }
        if let Some(active) = &self.active {
            if active.filename() == filename && active.status() == VideoStatus::StreamingOut {
                return active.clone();
            }
        }
        self.close();

        let req = VideoRequest::new(self.stream, filename);
        self.active = Some(req.clone());
        info!(stream = %self.stream_name, filename, "Recording requested");
        if let Some(frame) = current.filter(|f| !f.is_empty()) {
            self.write(frame, caption_text);
        }
        req
    }

    /// Close the encoder and finish the active request. False if nothing
    /// was recording.
    pub fn close(&mut self) -> bool {
        if let Some(mut enc) = self.encoder.take() {
            if let Err(e) = enc.close() {
                warn!(stream = %self.stream_name, "Failed to finalize recording: {}", e);
            }
        }
        match self.active.take() {
            Some(req) => {
                req.close();
                debug!(stream = %self.stream_name, filename = req.filename(), status = ?req.status(), "Recording closed");
                true
            }
            None => false,
        }
    }

    /// An encoder is open.
    pub fn is_recording(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn has_request(&self) -> bool {
        self.active.is_some()
    }

    pub fn filename(&self) -> Option<String> {
        self.active.as_ref().map(|r| r.filename().to_string())
    }

    fn fail(&mut self, err: &str) {
        if let Some(req) = &self.active {
            warn!(stream = %self.stream_name, filename = req.filename(), "Recording failed: {}", err);
            req.fail(err);
        }
        self.close();
    }

    /// Feed one delivered frame. Writes as many copies as wall-clock time
    /// calls for, which may be none. Returns false when the recording
    /// could not take the frame.
    pub fn write(&mut self, frame: &Frame, caption_text: &str) -> bool {
        if frame.is_empty() {
            self.close();
            return false;
        }
        let Some(req) = self.active.clone() else {
            return false;
        };
        if req.stop_requested() {
            self.close();
            return true;
        }

        let (w, h) = frame.dimensions();
        if self.encoder.is_none() {
            let spec = VideoSpec {
                path: PathBuf::from(req.filename()),
                fourcc: self.settings.fourcc,
                fps: self.settings.fps,
                width: w,
                height: h,
            };
            match self.settings.factory.open(&spec) {
                Ok(enc) => self.encoder = Some(enc),
                Err(e) => {
                    warn!(stream = %self.stream_name, "Could not open {}: {}", req.filename(), e);
                    self.fail("Could not open requested file.");
                    return false;
                }
            }
            req.start_streaming(w, h);
            self.timer.reset(self.settings.frame_ms());
        }

        if req.dimensions() != Some((w, h)) {
            self.fail("Closed when attempting to add misshapened image.");
            return false;
        }

        let frame_ms = self.settings.frame_ms();
        let mut rgb: Option<RgbImage> = None;
        let mut written = 0;
        while written < MAX_CATCH_UP && self.timer.grab(frame_ms) {
            if rgb.is_none() {
                // Private conversion buffer, so the caption can go straight in.
                let Some(mut img) = frame.to_rgb8() else {
                    self.fail("Frame could not be converted for encoding.");
                    return false;
                };
                caption::burn_rgb(&mut img, caption_text);
                rgb = Some(img);
            }
            let (Some(enc), Some(img)) = (self.encoder.as_mut(), rgb.as_ref()) else {
                break;
            };
            if let Err(e) = enc.write(img) {
                self.fail(&e.to_string());
                return false;
            }
            written += 1;
        }
        if written > 1 {
            metrics::counter!("camstream_video_padded_frames", "stream" => self.stream_name.clone())
                .increment(written as u64 - 1);
        }
        true
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::error::PersistError;
    use std::sync::Mutex;

    /// Records what was written instead of encoding it.
    #[derive(Default, Clone)]
    pub(crate) struct MemoryEncoders {
        pub opened: Arc<Mutex<Vec<VideoSpec>>>,
        pub frames: Arc<Mutex<Vec<(u32, u32)>>>,
        pub closed: Arc<Mutex<usize>>,
        pub fail_open: bool,
    }

    struct MemoryEncoder(MemoryEncoders);

    impl VideoEncoder for MemoryEncoder {
        fn write(&mut self, frame: &RgbImage) -> Result<(), PersistError> {
            self.0.frames.lock().unwrap().push(frame.dimensions());
            Ok(())
        }
        fn close(&mut self) -> Result<(), PersistError> {
            *self.0.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    impl VideoEncoderFactory for MemoryEncoders {
        fn open(&self, spec: &VideoSpec) -> Result<Box<dyn VideoEncoder>, PersistError> {
            if self.fail_open {
                return Err(PersistError::Encoder("no space".into()));
            }
            self.opened.lock().unwrap().push(spec.clone());
            Ok(Box::new(MemoryEncoder(self.clone())))
        }
    }

    fn recorder(enc: &MemoryEncoders) -> Recorder {
        Recorder::new(
            StreamId::Camera(0),
            "cam0",
            VideoSettings {
                factory: Arc::new(enc.clone()),
                fourcc: *b"avc1",
                fps: 30,
            },
        )
    }

    fn frame(w: u32, h: u32) -> Frame {
        Frame::from_pixels(vec![0u8; (w * h * 3) as usize], w, h, PixelFormat::Rgb24, 0)
    }

    #[test]
    fn empty_filename_leaves_active_recording() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        let first = rec.open("a.y4m", Some(&frame(8, 8)), "");
        let bad = rec.open("", None, "");
        assert_eq!(bad.status(), VideoStatus::Error);
        assert_eq!(bad.err(), "Empty filename");
        assert_eq!(first.status(), VideoStatus::StreamingOut);
        assert!(rec.is_recording());
    }

    #[test]
    fn open_with_current_frame_writes_immediately() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        let req = rec.open("a.y4m", Some(&frame(8, 6)), "");
        assert_eq!(req.status(), VideoStatus::StreamingOut);
        assert_eq!(req.dimensions(), Some((8, 6)));
        assert_eq!(enc.frames.lock().unwrap().as_slice(), &[(8, 6)]);
        assert_eq!(enc.opened.lock().unwrap()[0].fourcc, *b"avc1");
    }

    #[test]
    fn same_filename_returns_existing_request() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        let a = rec.open("a.y4m", Some(&frame(4, 4)), "");
        let b = rec.open("a.y4m", None, "");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(enc.opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn new_recording_closes_previous() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        let a = rec.open("a.y4m", Some(&frame(4, 4)), "");
        let b = rec.open("b.y4m", Some(&frame(4, 4)), "");
        assert_eq!(a.status(), VideoStatus::Closed);
        assert_eq!(b.status(), VideoStatus::StreamingOut);
        assert_eq!(*enc.closed.lock().unwrap(), 1);
    }

    #[test]
    fn size_change_errors_without_writing() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        let req = rec.open("a.y4m", Some(&frame(4, 4)), "");
        let before = enc.frames.lock().unwrap().len();

        assert!(!rec.write(&frame(8, 8), ""));
        assert_eq!(req.status(), VideoStatus::Error);
        assert!(!req.err().is_empty());
        assert_eq!(enc.frames.lock().unwrap().len(), before);
        assert!(!rec.is_recording());
    }

    #[test]
    fn stop_flag_closes_before_writing() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        let req = rec.open("a.y4m", Some(&frame(4, 4)), "");
        req.request_stop();
        std::thread::sleep(std::time::Duration::from_millis(40));
        assert!(rec.write(&frame(4, 4), ""));
        assert_eq!(req.status(), VideoStatus::Closed);
        assert_eq!(enc.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn open_failure_marks_request() {
        let enc = MemoryEncoders {
            fail_open: true,
            ..Default::default()
        };
        let mut rec = recorder(&enc);
        let req = rec.open("a.y4m", Some(&frame(4, 4)), "");
        assert_eq!(req.status(), VideoStatus::Error);
        assert!(!rec.has_request());
    }

    #[test]
    fn slow_source_is_padded_but_bounded() {
        let enc = MemoryEncoders::default();
        let mut rec = recorder(&enc);
        rec.open("a.y4m", Some(&frame(4, 4)), "");
        // ~20 frame periods with no delivery
        std::thread::sleep(std::time::Duration::from_millis(700));
        rec.write(&frame(4, 4), "");
        let n = enc.frames.lock().unwrap().len();
        assert_eq!(n, 1 + MAX_CATCH_UP);
    }
}
