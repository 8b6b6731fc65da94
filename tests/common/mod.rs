#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camstream::capture::PixelFormat;
use camstream::config::CompositeConfig;
use camstream::persist::video::{VideoEncoder, VideoEncoderFactory, VideoSpec};
use camstream::{
    BackendKind, BackendRegistry, CameraBackend, Frame, Metadata, PersistError, Platform, SnapshotSink,
    SourceConfig, StreamContext, StreamRegistry, VideoSettings,
};
use image::RgbImage;

/// Keeps snapshots in memory.
#[derive(Default)]
pub struct MemorySink {
    pub saved: Mutex<Vec<(String, Metadata)>>,
}

impl SnapshotSink for MemorySink {
    fn save(&self, filename: &str, _frame: &Frame, meta: &Metadata) -> Result<(), PersistError> {
        self.saved.lock().unwrap().push((filename.to_string(), meta.clone()));
        Ok(())
    }
}

/// Counts written video frames by size.
#[derive(Default, Clone)]
pub struct MemoryEncoders {
    pub frames: Arc<Mutex<Vec<(u32, u32)>>>,
}

struct MemoryEncoder(MemoryEncoders);

impl VideoEncoder for MemoryEncoder {
    fn write(&mut self, frame: &RgbImage) -> Result<(), PersistError> {
        self.0.frames.lock().unwrap().push(frame.dimensions());
        Ok(())
    }

    fn close(&mut self) -> Result<(), PersistError> {
        Ok(())
    }
}

impl VideoEncoderFactory for MemoryEncoders {
    fn open(&self, _spec: &VideoSpec) -> Result<Box<dyn VideoEncoder>, PersistError> {
        Ok(Box::new(MemoryEncoder(self.clone())))
    }
}

/// A camera that serves solid frames at whatever size the test dials in.
#[derive(Clone)]
pub struct Dial {
    pub width: Arc<AtomicU32>,
    pub height: Arc<AtomicU32>,
    pub online: Arc<AtomicBool>,
}

impl Dial {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Arc::new(AtomicU32::new(width)),
            height: Arc::new(AtomicU32::new(height)),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::SeqCst);
        self.height.store(height, Ordering::SeqCst);
    }
}

struct DialBackend {
    dial: Dial,
    active: bool,
    seq: u64,
}

impl CameraBackend for DialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkUrl
    }

    fn activate(&mut self) -> bool {
        self.active = self.dial.online.load(Ordering::SeqCst);
        self.active
    }

    fn deactivate(&mut self) -> bool {
        self.active = false;
        true
    }

    fn poll_frame(&mut self) -> Option<Frame> {
        let w = self.dial.width.load(Ordering::SeqCst);
        let h = self.dial.height.load(Ordering::SeqCst);
        self.seq += 1;
        Some(Frame::from_pixels(
            vec![(self.seq % 200) as u8; (w * h * 3) as usize],
            w,
            h,
            PixelFormat::Rgb24,
            self.seq,
        ))
    }

    fn pull_options(&mut self, _source: &SourceConfig) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        self.active && self.dial.online.load(Ordering::SeqCst)
    }

    fn inject_metadata(&self, meta: &mut Metadata) {
        meta.insert("camera_sensor".into(), "dial".into());
    }
}

/// Backends with the dial standing in for network cameras.
pub fn backends(dial: &Dial) -> BackendRegistry {
    let mut reg = BackendRegistry::default();
    let dial = dial.clone();
    reg.register(BackendKind::NetworkUrl, move || {
        Box::new(DialBackend {
            dial: dial.clone(),
            active: false,
            seq: 0,
        })
    });
    reg
}

pub fn dial_source() -> SourceConfig {
    SourceConfig {
        default_poll: BackendKind::NetworkUrl,
        ..SourceConfig::default()
    }
}

pub fn context(sink: Arc<dyn SnapshotSink>, encoders: &MemoryEncoders) -> StreamContext {
    StreamContext {
        sink,
        video: VideoSettings {
            factory: Arc::new(encoders.clone()),
            fourcc: *b"avc1",
            fps: 30,
        },
    }
}

pub fn registry(backends: BackendRegistry, ctx: StreamContext) -> StreamRegistry {
    StreamRegistry::new(Platform::Desktop, backends, ctx).with_composite(CompositeConfig { width: 64, height: 36 })
}

/// Poll `cond` until it holds or a few seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
