//! The composite stream: blends the latest frame of every camera into one
//! fixed-size output.
//!
//! Cameras push into a [`CompositeMailbox`] handed to them at construction.
//! The composite worker copies the mailbox whenever it has changed and
//! additively blends every entry, each resized to the canvas width and
//! centered. When nothing changed it re-emits its previous output so
//! snapshots and recordings still see a steady frame rate.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage, RgbaImage};
use tracing::{debug, info};

use super::roi;
use super::stream::{lock, StreamContext, StreamCore, StreamHandle};
use super::timer::{FrameBudget, MS_PER_FRAME};
use super::{StreamParam, StreamState};
use crate::capture::{Frame, PixelFormat};
use crate::config::CompositeConfig;
use crate::persist::Metadata;

/// The last frame a camera pushed.
#[derive(Clone)]
pub struct CompositeEntry {
    pub frame: Arc<Frame>,
    /// Single-channel sources draw red when thresholded, grey otherwise.
    pub thresholded: bool,
    pub opacity: f32,
}

#[derive(Default)]
struct Mailbox {
    entries: BTreeMap<usize, CompositeEntry>,
    dirty: bool,
    available: bool,
}

/// Last-writer-wins cache of camera frames, keyed by camera index.
#[derive(Clone, Default)]
pub struct CompositeMailbox {
    inner: Arc<Mutex<Mailbox>>,
}

impl CompositeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting pushes.
    pub fn open(&self) {
        let mut mb = lock(&self.inner);
        mb.available = true;
        mb.dirty = true;
    }

    /// Stop accepting pushes and drop every cached frame.
    pub fn close(&self) {
        let mut mb = lock(&self.inner);
        mb.available = false;
        mb.entries.clear();
    }

    /// Replace camera `index`'s entry. False while the mailbox is closed.
    pub fn push(&self, index: usize, frame: Arc<Frame>, thresholded: bool, opacity: f32) -> bool {
        let mut mb = lock(&self.inner);
        if !mb.available {
            return false;
        }
        mb.entries.insert(
            index,
            CompositeEntry {
                frame,
                thresholded,
                opacity,
            },
        );
        mb.dirty = true;
        true
    }

    /// A copy of every entry if anything was pushed since the last call.
    /// Entries stay cached, so a camera that skips a tick doesn't drop out.
    pub fn take_if_dirty(&self) -> Option<Vec<(usize, CompositeEntry)>> {
        let mut mb = lock(&self.inner);
        if !mb.dirty {
            return None;
        }
        mb.dirty = false;
        Some(mb.entries.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resize unless already the requested size.
fn fit<P>(img: image::ImageBuffer<P, Vec<u8>>, width: u32, height: u32) -> image::ImageBuffer<P, Vec<u8>>
where
    P: image::Pixel<Subpixel = u8> + 'static,
{
    if img.dimensions() == (width, height) {
        return img;
    }
    imageops::resize(&img, width, height, FilterType::Triangle)
}

#[inline]
fn scale(v: u8, by: f32) -> u8 {
    (v as f32 * by).round().clamp(0.0, 255.0) as u8
}

/// `entry` resized to `width`, keeping its aspect, as opacity-weighted RGB.
fn prepare(entry: &CompositeEntry, width: u32) -> Option<RgbImage> {
    let frame = &entry.frame;
    let (sw, sh) = frame.dimensions();
    if frame.is_empty() || width == 0 {
        return None;
    }
    let height = ((width as u64 * sh as u64) / sw as u64).max(1) as u32;
    let opacity = entry.opacity.clamp(0.0, 1.0);

    let rgb = match frame.format() {
        PixelFormat::Gray8 => {
            let grey: GrayImage = fit(frame.to_luma8()?, width, height);
            RgbImage::from_fn(width, height, |x, y| {
                let v = scale(grey.get_pixel(x, y).0[0], opacity);
                image::Rgb(if entry.thresholded { [v, 0, 0] } else { [v, v, v] })
            })
        }
        PixelFormat::Rgba32 => {
            let src = RgbaImage::from_raw(sw, sh, frame.data[..(sw * sh * 4) as usize].to_vec())?;
            let rgba = fit(src, width, height);
            RgbImage::from_fn(width, height, |x, y| {
                let [r, g, b, a] = rgba.get_pixel(x, y).0;
                // alpha gates each pixel
                let k = a as f32 / 255.0 * opacity;
                image::Rgb([scale(r, k), scale(g, k), scale(b, k)])
            })
        }
        _ => {
            let mut rgb = fit(frame.to_rgb8()?, width, height);
            if opacity < 1.0 {
                for p in rgb.pixels_mut() {
                    p.0 = p.0.map(|c| scale(c, opacity));
                }
            }
            rgb
        }
    };
    Some(rgb)
}

/// Additively blend `entries` onto a black `width` x `height` canvas.
pub fn compose(entries: &[(usize, CompositeEntry)], width: u32, height: u32) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    for (_, entry) in entries {
        let Some(src) = prepare(entry, width) else {
            continue;
        };
        let Some((dst_roi, src_roi)) = roi::centered(width, height, src.width(), src.height()) else {
            continue;
        };
        for row in 0..dst_roi.h {
            for col in 0..dst_roi.w {
                let s = src.get_pixel((src_roi.x + col) as u32, (src_roi.y + row) as u32);
                let d = canvas.get_pixel_mut((dst_roi.x + col) as u32, (dst_roi.y + row) as u32);
                for c in 0..3 {
                    d.0[c] = d.0[c].saturating_add(s.0[c]);
                }
            }
        }
    }
    canvas
}

/// Largest canvas edge the composite will allocate.
pub const MAX_CANVAS: u32 = 16384;

/// Canvas size, adjustable through the param channel.
struct CanvasSize {
    width: AtomicU32,
    height: AtomicU32,
}

impl CanvasSize {
    fn get(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Relaxed),
            self.height.load(Ordering::Relaxed),
        )
    }
}

/// The composite stream and its worker thread.
pub struct CompositeWorker {
    core: Arc<StreamCore>,
    mailbox: CompositeMailbox,
    canvas: Arc<CanvasSize>,
    handle: StreamHandle,
}

impl CompositeWorker {
    pub fn spawn(config: &CompositeConfig, ctx: &StreamContext, mailbox: CompositeMailbox) -> io::Result<Self> {
        let core = StreamCore::composite(ctx);
        let canvas = Arc::new(CanvasSize {
            width: AtomicU32::new(config.width.clamp(1, MAX_CANVAS)),
            height: AtomicU32::new(config.height.clamp(1, MAX_CANVAS)),
        });
        let handle = {
            let core = core.clone();
            let mailbox = mailbox.clone();
            let canvas = canvas.clone();
            StreamHandle::spawn(core.clone(), move || run(&core, &mailbox, &canvas))?
        };
        Ok(Self {
            core,
            mailbox,
            canvas,
            handle,
        })
    }

    pub fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }

    pub fn mailbox(&self) -> &CompositeMailbox {
        &self.mailbox
    }

    pub fn get_param(&self, param: StreamParam) -> Option<f64> {
        let (w, h) = self.canvas.get();
        match param {
            StreamParam::CompositeWidth => Some(w as f64),
            StreamParam::CompositeHeight => Some(h as f64),
            _ => self.core.get_param(param),
        }
    }

    pub fn set_param(&self, param: StreamParam, value: f64) -> bool {
        let target = match param {
            StreamParam::CompositeWidth => &self.canvas.width,
            StreamParam::CompositeHeight => &self.canvas.height,
            _ => return self.core.set_param(param, value),
        };
        // Also rejects NaN
        if !(1.0..=MAX_CANVAS as f64).contains(&value) {
            return false;
        }
        target.store(value as u32, Ordering::Relaxed);
        true
    }

    pub fn signal_shutdown(&self) {
        self.handle.signal_shutdown();
    }

    pub fn join(&mut self, timeout: Duration) -> bool {
        self.handle.join(timeout)
    }
}

fn composite_metadata(meta: &mut Metadata) {
    meta.insert("stream_type".into(), "composite".into());
}

fn run(core: &StreamCore, mailbox: &CompositeMailbox, canvas: &CanvasSize) {
    // Not hardware backed, so it is polling from the start.
    core.set_state(StreamState::Polling);
    mailbox.open();
    core.begin_stream();
    let (w, h) = canvas.get();
    info!(width = w, height = h, "Composite started");
    core.handle_frame(Frame::from_rgb(RgbImage::new(w, h), 0), &composite_metadata);

    let mut budget = FrameBudget::new();
    let mut last = Instant::now();
    let mut seq = 1;
    while !core.shutdown_requested() {
        if let Some(entries) = mailbox.take_if_dirty() {
            let (w, h) = canvas.get();
            let out = compose(&entries, w, h);
            core.latch_dimensions(w, h);
            core.handle_frame(Frame::from_rgb(out, seq), &composite_metadata);
            seq += 1;
        } else if let Some(prev) = core.current_frame() {
            core.handle_frame((*prev).clone(), &composite_metadata);
        }

        let now = Instant::now();
        core.frame_done(now - last);
        last = now;
        std::thread::sleep(Duration::from_millis(budget.ms_left(MS_PER_FRAME)));
    }

    mailbox.close();
    core.end_stream();
    core.set_state(StreamState::Shutdown);
    debug!("Composite stopped");
}
