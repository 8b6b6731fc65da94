//! Snapshot and video requests: shared handles with an observable status.
//!
//! The requester keeps an `Arc` to poll status; the worker holds another
//! while the request is queued or recording. All transitions are one-way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use super::StreamId;

/// Text stored in `err` when a pending snapshot is cleared.
pub const CANCELLED: &str = "Cancelled";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Which frame variant a snapshot wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapProcess {
    /// The processed frame. Streams without processing save the raw frame.
    HasTo,
    /// Always the raw frame.
    Cannot,
    /// Whatever the stream displays.
    #[default]
    Indifferent,
}

impl SnapProcess {
    /// Whether this request is served from the raw frame, given whether
    /// the stream processes frames at all.
    pub fn wants_raw(self, stream_processes: bool) -> bool {
        match self {
            SnapProcess::Cannot => true,
            SnapProcess::HasTo | SnapProcess::Indifferent => !stream_processes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Requested,
    Filled,
    Error,
}

#[derive(Debug)]
struct SnapshotInner {
    status: SnapshotStatus,
    frame_id: u64,
    err: String,
}

#[derive(Debug)]
pub struct SnapshotRequest {
    filename: String,
    process: SnapProcess,
    inner: Mutex<SnapshotInner>,
}

impl SnapshotRequest {
    pub fn new(filename: impl Into<String>, process: SnapProcess) -> Arc<Self> {
        Arc::new(Self {
            filename: filename.into(),
            process,
            inner: Mutex::new(SnapshotInner {
                status: SnapshotStatus::Requested,
                frame_id: 0,
                err: String::new(),
            }),
        })
    }

    /// A request that is already in `Error`, for calls that can't be queued.
    pub fn failed(filename: impl Into<String>, process: SnapProcess, err: impl Into<String>) -> Arc<Self> {
        let req = Self::new(filename, process);
        req.fail(err);
        req
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn process(&self) -> SnapProcess {
        self.process
    }

    pub fn status(&self) -> SnapshotStatus {
        lock(&self.inner).status
    }

    /// Frame counter value the snapshot was taken at. Zero until filled.
    pub fn frame_id(&self) -> u64 {
        lock(&self.inner).frame_id
    }

    pub fn err(&self) -> String {
        lock(&self.inner).err.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == SnapshotStatus::Requested
    }

    pub fn is_cancelled(&self) -> bool {
        let inner = lock(&self.inner);
        inner.status == SnapshotStatus::Error && inner.err == CANCELLED
    }

    /// `Requested -> Filled`. Returns false if already terminal.
    pub fn fill(&self, frame_id: u64) -> bool {
        let mut inner = lock(&self.inner);
        if inner.status != SnapshotStatus::Requested {
            return false;
        }
        inner.status = SnapshotStatus::Filled;
        inner.frame_id = frame_id;
        true
    }

    /// `Requested -> Error`. Returns false if already terminal.
    pub fn fail(&self, err: impl Into<String>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.status != SnapshotStatus::Requested {
            return false;
        }
        inner.status = SnapshotStatus::Error;
        inner.err = err.into();
        true
    }

    pub fn cancel(&self) -> bool {
        self.fail(CANCELLED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Requested,
    StreamingOut,
    Closed,
    Error,
}

impl VideoStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, VideoStatus::Closed | VideoStatus::Error)
    }
}

#[derive(Debug)]
struct VideoInner {
    status: VideoStatus,
    dims: Option<(u32, u32)>,
    err: String,
}

/// A recording. Dimensions lock on the first written frame; any holder may
/// ask it to stop.
#[derive(Debug)]
pub struct VideoRequest {
    stream: StreamId,
    filename: String,
    stop: AtomicBool,
    inner: Mutex<VideoInner>,
}

impl VideoRequest {
    pub fn new(stream: StreamId, filename: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            stream,
            filename: filename.into(),
            stop: AtomicBool::new(false),
            inner: Mutex::new(VideoInner {
                status: VideoStatus::Requested,
                dims: None,
                err: String::new(),
            }),
        })
    }

    pub fn failed(stream: StreamId, filename: impl Into<String>, err: impl Into<String>) -> Arc<Self> {
        let req = Self::new(stream, filename);
        req.fail(err);
        req
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn status(&self) -> VideoStatus {
        lock(&self.inner).status
    }

    pub fn err(&self) -> String {
        lock(&self.inner).err.clone()
    }

    /// Locked width and height, once a frame has been written.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        lock(&self.inner).dims
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// `Requested -> StreamingOut`, locking the dimensions.
    pub(crate) fn start_streaming(&self, width: u32, height: u32) -> bool {
        let mut inner = lock(&self.inner);
        if inner.status != VideoStatus::Requested {
            return false;
        }
        inner.status = VideoStatus::StreamingOut;
        inner.dims = Some((width, height));
        true
    }

    pub(crate) fn close(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.status.is_terminal() {
            return false;
        }
        inner.status = VideoStatus::Closed;
        true
    }

    pub(crate) fn fail(&self, err: impl Into<String>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.status.is_terminal() {
            return false;
        }
        inner.status = VideoStatus::Error;
        inner.err = err.into();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_terminal_states_stick() {
        let req = SnapshotRequest::new("a.png", SnapProcess::Indifferent);
        assert!(req.fill(7));
        assert!(!req.fail("late"));
        assert!(!req.cancel());
        assert_eq!(req.status(), SnapshotStatus::Filled);
        assert_eq!(req.frame_id(), 7);
        assert!(req.err().is_empty());

        let req = SnapshotRequest::new("b.png", SnapProcess::Indifferent);
        assert!(req.cancel());
        assert!(!req.fill(1));
        assert!(req.is_cancelled());
        assert_eq!(req.frame_id(), 0);
    }

    #[test]
    fn raw_or_processed_selection() {
        assert!(SnapProcess::Cannot.wants_raw(true));
        assert!(!SnapProcess::HasTo.wants_raw(true));
        assert!(!SnapProcess::Indifferent.wants_raw(true));
        // nothing to process: everything comes from the raw frame once
        assert!(SnapProcess::HasTo.wants_raw(false));
        assert!(SnapProcess::Indifferent.wants_raw(false));
    }

    #[test]
    fn video_lifecycle() {
        let req = VideoRequest::new(StreamId::Camera(0), "v.y4m");
        assert!(req.dimensions().is_none());
        assert!(req.start_streaming(640, 480));
        assert!(!req.start_streaming(320, 240));
        assert_eq!(req.dimensions(), Some((640, 480)));
        assert!(req.close());
        assert!(!req.fail("after close"));
        assert_eq!(req.status(), VideoStatus::Closed);
    }

    #[test]
    fn stop_flag_is_shared() {
        let req = VideoRequest::new(StreamId::Composite, "v.y4m");
        let other = req.clone();
        other.request_stop();
        assert!(req.stop_requested());
    }
}
