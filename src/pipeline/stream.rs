//! State and pipeline shared by every kind of stream worker.
//!
//! A [`StreamCore`] is shared between the worker thread that feeds it and
//! the registry that queries it. The frame slot, the snapshot queue and the
//! recorder each have their own lock, so a slow save never holds up
//! publication.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use tracing::{debug, info, trace, warn};

use super::composite::CompositeMailbox;
use super::request::{SnapProcess, SnapshotRequest, VideoRequest};
use super::video::{Recorder, VideoSettings};
use super::{StreamId, StreamParam, StreamState};
use crate::capture::Frame;
use crate::persist::{caption, Metadata, SnapshotSink};
use crate::process::{FrameProcessor, ProcessingType};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Collaborators every stream persists through.
#[derive(Clone)]
pub struct StreamContext {
    pub sink: Arc<dyn SnapshotSink>,
    pub video: VideoSettings,
}

/// Settings the UI may change while the worker runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSettings {
    pub processing: ProcessingType,
    pub static_threshold: u8,
    /// Opacity inside the composite.
    pub alpha: f32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            processing: ProcessingType::None,
            static_threshold: 128,
            alpha: 1.0,
        }
    }
}

#[derive(Default)]
struct StreamStats {
    ms_frame_time: AtomicU64,
    frame_count: AtomicU64,
    width: AtomicU32,
    height: AtomicU32,
}

#[derive(Default)]
struct FrameSlot {
    frame: Option<Arc<Frame>>,
    changes: u64,
}

/// Where a camera stream forwards its frames for compositing.
struct CompositeFeed {
    mailbox: CompositeMailbox,
    index: usize,
}

pub struct StreamCore {
    id: StreamId,
    name: String,
    frame: Mutex<FrameSlot>,
    snaps: Mutex<Vec<Arc<SnapshotRequest>>>,
    video: Mutex<Recorder>,
    settings: ArcSwap<StreamSettings>,
    caption: ArcSwap<String>,
    stats: CachePadded<StreamStats>,
    state: AtomicU8,
    shutdown: AtomicBool,
    sink: Arc<dyn SnapshotSink>,
    feed: Option<CompositeFeed>,
}

impl StreamCore {
    /// Core for camera `index`, forwarding processed frames to `mailbox`.
    pub fn camera(
        index: usize,
        settings: StreamSettings,
        ctx: &StreamContext,
        mailbox: CompositeMailbox,
    ) -> Arc<Self> {
        let id = StreamId::Camera(index);
        let feed = CompositeFeed { mailbox, index };
        Arc::new(Self::new(id, format!("CAM{}", index), settings, ctx, Some(feed)))
    }

    pub fn composite(ctx: &StreamContext) -> Arc<Self> {
        Arc::new(Self::new(
            StreamId::Composite,
            "COMP".to_string(),
            StreamSettings::default(),
            ctx,
            None,
        ))
    }

    fn new(
        id: StreamId,
        name: String,
        settings: StreamSettings,
        ctx: &StreamContext,
        feed: Option<CompositeFeed>,
    ) -> Self {
        Self {
            id,
            video: Mutex::new(Recorder::new(id, name.clone(), ctx.video.clone())),
            name,
            frame: Mutex::new(FrameSlot::default()),
            snaps: Mutex::new(Vec::new()),
            settings: ArcSwap::from_pointee(settings),
            caption: ArcSwap::from_pointee(String::new()),
            stats: CachePadded::new(StreamStats::default()),
            state: AtomicU8::new(StreamState::Unknown.to_u8()),
            shutdown: AtomicBool::new(false),
            sink: ctx.sink.clone(),
            feed,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_camera(&self) -> bool {
        self.feed.is_some()
    }

    // Frame slot

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.frame).frame.clone()
    }

    pub fn feed_changes(&self) -> u64 {
        lock(&self.frame).changes
    }

    /// Replace the current frame and bump the change counter together.
    /// Returns the new counter value.
    pub fn publish(&self, frame: Arc<Frame>) -> u64 {
        let mut slot = lock(&self.frame);
        slot.frame = Some(frame);
        slot.changes += 1;
        slot.changes
    }

    // State and shutdown

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StreamState) {
        let prev = StreamState::from_u8(self.state.swap(state.to_u8(), Ordering::AcqRel));
        if prev != state {
            debug!(stream = %self.name, from = %prev, to = %state, "State change");
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sleep up to `ms`, waking early once shutdown is requested.
    pub fn idle(&self, ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while !self.shutdown_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }

    // Settings

    pub fn settings(&self) -> StreamSettings {
        **self.settings.load()
    }

    pub fn processing_type(&self) -> ProcessingType {
        self.settings.load().processing
    }

    /// Composite streams never process.
    pub fn set_processing_type(&self, processing: ProcessingType) -> bool {
        if !self.is_camera() {
            return false;
        }
        self.settings.rcu(|s| StreamSettings {
            processing,
            ..**s
        });
        info!(stream = %self.name, %processing, "Processing type changed");
        true
    }

    pub fn uses_processing(&self) -> bool {
        self.is_camera() && self.processing_type().is_thresholded()
    }

    pub fn caption(&self) -> Arc<String> {
        self.caption.load_full()
    }

    pub fn set_caption(&self, text: &str) {
        self.caption.store(Arc::new(text.to_string()));
    }

    /// The stream-level parameters every stream understands.
    pub fn get_param(&self, param: StreamParam) -> Option<f64> {
        let s = self.settings.load();
        match param {
            StreamParam::Alpha => Some(s.alpha as f64),
            StreamParam::StaticThreshold if self.is_camera() => Some(s.static_threshold as f64),
            _ => None,
        }
    }

    pub fn set_param(&self, param: StreamParam, value: f64) -> bool {
        match param {
            StreamParam::Alpha => {
                if value.is_nan() {
                    return false;
                }
                let alpha = value.clamp(0.0, 1.0) as f32;
                self.settings.rcu(|s| StreamSettings { alpha, ..**s });
                true
            }
            StreamParam::StaticThreshold if self.is_camera() => {
                let level = value.clamp(0.0, 255.0) as u8;
                self.settings.rcu(|s| StreamSettings {
                    static_threshold: level,
                    ..**s
                });
                true
            }
            _ => false,
        }
    }

    // Stats

    pub fn ms_frame_time(&self) -> u64 {
        self.stats.ms_frame_time.load(Ordering::Relaxed)
    }

    pub fn frame_count(&self) -> u64 {
        self.stats.frame_count.load(Ordering::Relaxed)
    }

    /// Size of the first frame since (re)connecting, if any.
    pub fn stream_dimensions(&self) -> Option<(u32, u32)> {
        let w = self.stats.width.load(Ordering::Relaxed);
        let h = self.stats.height.load(Ordering::Relaxed);
        (w > 0 && h > 0).then_some((w, h))
    }

    pub(crate) fn latch_dimensions(&self, width: u32, height: u32) {
        if self.stream_dimensions().is_none() {
            self.stats.width.store(width, Ordering::Relaxed);
            self.stats.height.store(height, Ordering::Relaxed);
            info!(stream = %self.name, width, height, "Streaming");
        }
    }

    pub(crate) fn begin_stream(&self) {
        self.stats.frame_count.store(0, Ordering::Relaxed);
        self.stats.width.store(0, Ordering::Relaxed);
        self.stats.height.store(0, Ordering::Relaxed);
    }

    /// Count a finished iteration that took `elapsed`.
    pub(crate) fn frame_done(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.stats.frame_count.fetch_add(1, Ordering::Relaxed);
        self.stats.ms_frame_time.store(ms, Ordering::Relaxed);
        metrics::histogram!("camstream_frame_time_ms", "stream" => self.name.clone()).record(ms as f64);
    }

    /// The backend went away: forget the stream size and end any recording.
    pub(crate) fn end_stream(&self) {
        self.stats.ms_frame_time.store(0, Ordering::Relaxed);
        self.stats.width.store(0, Ordering::Relaxed);
        self.stats.height.store(0, Ordering::Relaxed);
        let mut video = lock(&self.video);
        if video.has_request() {
            video.close();
        }
    }

    // Snapshots

    /// Queue a snapshot for the next frame.
    pub fn request_snapshot(&self, filename: &str, process: SnapProcess) -> Arc<SnapshotRequest> {
        if filename.is_empty() {
            return SnapshotRequest::failed(filename, process, "Empty filename");
        }
        let req = SnapshotRequest::new(filename, process);
        lock(&self.snaps).push(req.clone());
        debug!(stream = %self.name, filename, ?process, "Snapshot requested");
        req
    }

    /// Cancel everything still queued. Returns how many were cancelled.
    pub fn clear_snapshot_requests(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.snaps));
        pending.iter().filter(|r| r.cancel()).count()
    }

    pub fn pending_snapshots(&self) -> usize {
        lock(&self.snaps).len()
    }

    // Video

    pub fn record_video(&self, filename: &str) -> Arc<VideoRequest> {
        let current = self.current_frame();
        let caption = self.caption();
        lock(&self.video).open(filename, current.as_deref(), &caption)
    }

    pub fn stop_recording(&self) -> bool {
        lock(&self.video).close()
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.video).is_recording()
    }

    pub fn recording_filename(&self) -> Option<String> {
        lock(&self.video).filename()
    }

    // Pipeline

    /// Run one polled frame through the pipeline: process, publish, forward
    /// to the composite, serve queued snapshots, then record. `inject` adds
    /// the worker's own snapshot metadata. Empty frames are ignored.
    pub fn handle_frame(&self, raw: Frame, inject: &dyn Fn(&mut Metadata)) -> bool {
        if raw.is_empty() {
            return false;
        }
        let settings = self.settings();
        let processing = self.uses_processing();

        // Requests made from here on wait for the next frame.
        let queued = std::mem::take(&mut *lock(&self.snaps));
        let (raw_reqs, processed_reqs): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .filter(|r| r.is_pending())
            .partition(|r| r.process().wants_raw(processing));

        let raw = Arc::new(raw);
        let shown = if processing {
            FrameProcessor::new(settings.processing, settings.static_threshold)
                .process(&raw)
                .map(|p| {
                    trace!(stream = %self.name, threshold = ?p.threshold, "Frame processed");
                    Arc::new(p.frame)
                })
                .unwrap_or_else(|| raw.clone())
        } else {
            raw.clone()
        };

        let frame_id = self.publish(shown.clone());

        if let Some(feed) = &self.feed {
            feed.mailbox
                .push(feed.index, shown.clone(), processing, settings.alpha);
        }

        let caption = self.caption();
        if !raw_reqs.is_empty() {
            self.save_snapshots(&raw, &raw_reqs, frame_id, &settings, &caption, inject);
        }
        if !processed_reqs.is_empty() {
            self.save_snapshots(&shown, &processed_reqs, frame_id, &settings, &caption, inject);
        }

        let mut video = lock(&self.video);
        if video.has_request() {
            video.write(&shown, &caption);
        }
        true
    }

    fn snapshot_metadata(
        &self,
        frame_id: u64,
        settings: &StreamSettings,
        inject: &dyn Fn(&mut Metadata),
    ) -> Metadata {
        let now = chrono::Local::now();
        let mut meta = Metadata::new();
        meta.insert("stream_name".into(), self.name.clone());
        meta.insert("frame_id".into(), frame_id.to_string());
        meta.insert("threshold_method".into(), settings.processing.to_string());
        meta.insert("study_date".into(), now.format("%Y%m%d").to_string());
        meta.insert("study_time".into(), now.format("%H%M%S").to_string());
        if settings.processing == ProcessingType::StaticThreshold {
            meta.insert("threshold".into(), settings.static_threshold.to_string());
        }
        inject(&mut meta);
        meta
    }

    fn save_snapshots(
        &self,
        frame: &Frame,
        reqs: &[Arc<SnapshotRequest>],
        frame_id: u64,
        settings: &StreamSettings,
        caption_text: &str,
        inject: &dyn Fn(&mut Metadata),
    ) {
        let captioned;
        let frame = if caption_text.is_empty() {
            frame
        } else {
            captioned = caption::captioned(frame, caption_text);
            &captioned
        };
        let meta = self.snapshot_metadata(frame_id, settings, inject);

        for req in reqs {
            // Cancelled while we were busy
            if !req.is_pending() {
                continue;
            }
            match self.sink.save(req.filename(), frame, &meta) {
                Ok(()) => {
                    req.fill(frame_id);
                    info!(stream = %self.name, filename = req.filename(), frame_id, "Snapshot saved");
                    metrics::counter!("camstream_snapshots_total", "outcome" => "filled").increment(1);
                }
                Err(e) => {
                    warn!(stream = %self.name, filename = req.filename(), "Snapshot failed: {}", e);
                    req.fail(format!("Error attempting to save file: {}", e));
                    metrics::counter!("camstream_snapshots_total", "outcome" => "error").increment(1);
                }
            }
        }
    }
}

/// Join `thread` once `done` fires or its sender is dropped, which a panic
/// or an early return also does. Hands the thread back if neither happens
/// within `timeout`.
pub(crate) fn join_within<T>(
    thread: JoinHandle<T>,
    done: &flume::Receiver<()>,
    timeout: Duration,
) -> Result<thread::Result<T>, JoinHandle<T>> {
    match done.recv_timeout(timeout) {
        Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => Ok(thread.join()),
        Err(flume::RecvTimeoutError::Timeout) => Err(thread),
    }
}

/// A running worker thread and the signal it sends when it has finished.
pub struct StreamHandle {
    core: Arc<StreamCore>,
    thread: Option<JoinHandle<()>>,
    done: flume::Receiver<()>,
}

impl StreamHandle {
    pub fn spawn<F>(core: Arc<StreamCore>, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, done) = flume::bounded(1);
        let thread = thread::Builder::new()
            .name(format!("stream-{}", core.name().to_lowercase()))
            .spawn(move || {
                body();
                let _ = tx.send(());
            })?;
        Ok(Self {
            core,
            thread: Some(thread),
            done,
        })
    }

    pub fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }

    pub fn signal_shutdown(&self) {
        self.core.request_shutdown();
    }

    /// Wait for the worker to finish and join it. False if it is still
    /// running after `timeout`.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        match join_within(thread, &self.done, timeout) {
            Ok(res) => {
                if res.is_err() {
                    warn!(stream = %self.core.name(), "Worker thread panicked");
                }
                true
            }
            Err(thread) => {
                warn!(stream = %self.core.name(), "Worker did not stop within {:?}", timeout);
                self.thread = Some(thread);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
        self.join(Duration::from_secs(5));
    }
}
