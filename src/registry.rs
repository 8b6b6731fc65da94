//! The stream registry: owns every camera worker plus the composite and is
//! the only entry point callers use.
//!
//! One lock guards the set of workers. Each worker's internals are behind
//! its own locks, so a call only holds the registry lock for the lookup and
//! the pass-through. Unknown ids return sentinel values instead of errors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::capture::{BackendKind, BackendRegistry, Frame};
use crate::config::{CompositeConfig, SourceConfig};
use crate::error::BootError;
use crate::pipeline::stream::lock;
use crate::pipeline::{
    CameraWorker, CompositeMailbox, CompositeWorker, SnapProcess, SnapshotRequest, StreamContext, StreamCore,
    StreamId, StreamParam, StreamState, VideoRequest,
};
use crate::platform::Platform;
use crate::process::ProcessingType;

/// How long shutdown waits for each worker to stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Workers {
    cameras: Vec<CameraWorker>,
    composite: CompositeWorker,
}

enum Phase {
    Fresh,
    Running(Workers),
    ShutDown,
}

/// A worker looked up by id.
enum Target<'a> {
    Camera(&'a CameraWorker),
    Composite(&'a CompositeWorker),
}

impl Target<'_> {
    fn core(&self) -> &Arc<StreamCore> {
        match self {
            Target::Camera(c) => c.core(),
            Target::Composite(c) => c.core(),
        }
    }
}

pub struct StreamRegistry {
    platform: Platform,
    backends: BackendRegistry,
    ctx: StreamContext,
    composite: CompositeConfig,
    phase: Mutex<Phase>,
}

impl StreamRegistry {
    pub fn new(platform: Platform, backends: BackendRegistry, ctx: StreamContext) -> Self {
        Self {
            platform,
            backends,
            ctx,
            composite: CompositeConfig::default(),
            phase: Mutex::new(Phase::Fresh),
        }
    }

    pub fn with_composite(mut self, composite: CompositeConfig) -> Self {
        self.composite = composite;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Start one worker per source plus the composite. Every source is
    /// checked against the platform before any thread starts.
    #[instrument(skip_all, fields(sources = sources.len(), platform = %self.platform))]
    pub fn try_boot(&self, sources: &[SourceConfig]) -> Result<(), BootError> {
        let mut phase = lock(&self.phase);
        match *phase {
            Phase::Running(_) => return Err(BootError::AlreadyBooted),
            Phase::ShutDown => return Err(BootError::ShutDown),
            Phase::Fresh => {}
        }
        if sources.is_empty() {
            return Err(BootError::NoSources);
        }

        let polls = sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let kind = self.platform.used_poll(source);
                if self.platform.allows(kind) {
                    Ok(kind)
                } else {
                    Err(BootError::Platform {
                        index,
                        kind,
                        platform: self.platform,
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mailbox = CompositeMailbox::new();
        let composite = CompositeWorker::spawn(&self.composite, &self.ctx, mailbox.clone())?;
        // Dropping what was spawned so far stops it again.
        let mut cameras = Vec::with_capacity(sources.len());
        for (index, (source, poll)) in sources.iter().zip(polls).enumerate() {
            info!(index, %poll, "Starting camera stream");
            cameras.push(CameraWorker::spawn(
                index,
                source.clone(),
                poll,
                self.backends.clone(),
                &self.ctx,
                mailbox.clone(),
            )?);
        }

        *phase = Phase::Running(Workers { cameras, composite });
        info!("Stream registry booted");
        Ok(())
    }

    /// [`try_boot`](Self::try_boot), except a platform mismatch ends the
    /// process. That's a deployment error, not something to run through.
    pub fn boot(&self, sources: &[SourceConfig]) -> bool {
        match self.try_boot(sources) {
            Ok(()) => true,
            Err(e @ BootError::Platform { .. }) => {
                error!("Fatal configuration error: {}", e);
                std::process::exit(1);
            }
            Err(e) => {
                warn!("Boot refused: {}", e);
                false
            }
        }
    }

    pub fn is_booted(&self) -> bool {
        matches!(*lock(&self.phase), Phase::Running(_))
    }

    /// Stop every worker. Cameras go first so nothing pushes into the
    /// composite once it starts tearing down. Safe to call repeatedly.
    pub fn shutdown(&self) -> bool {
        let workers = {
            let mut phase = lock(&self.phase);
            match std::mem::replace(&mut *phase, Phase::ShutDown) {
                Phase::Running(w) => w,
                _ => return true,
            }
        };
        let Workers {
            mut cameras,
            mut composite,
        } = workers;
        info!(streams = cameras.len(), "Shutting down streams");

        for cam in &cameras {
            cam.signal_shutdown();
        }
        let mut clean = true;
        for cam in &mut cameras {
            clean &= cam.join(JOIN_TIMEOUT);
        }
        drop(cameras);

        composite.signal_shutdown();
        clean &= composite.join(JOIN_TIMEOUT);
        info!(clean, "Stream registry shut down");
        clean
    }

    fn with<R>(&self, id: StreamId, default: R, f: impl FnOnce(Target<'_>) -> R) -> R {
        let phase = lock(&self.phase);
        let Phase::Running(workers) = &*phase else {
            return default;
        };
        let target = match id {
            StreamId::Camera(i) => match workers.cameras.get(i) {
                Some(c) => Target::Camera(c),
                None => return default,
            },
            StreamId::Composite => Target::Composite(&workers.composite),
            StreamId::Invalid => return default,
        };
        f(target)
    }

    fn cores(&self) -> Vec<Arc<StreamCore>> {
        match &*lock(&self.phase) {
            Phase::Running(w) => w
                .cameras
                .iter()
                .map(|c| c.core().clone())
                .chain(std::iter::once(w.composite.core().clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Number of camera streams, not counting the composite.
    pub fn stream_count(&self) -> usize {
        match &*lock(&self.phase) {
            Phase::Running(w) => w.cameras.len(),
            _ => 0,
        }
    }

    pub fn current_frame(&self, id: StreamId) -> Option<Arc<Frame>> {
        self.with(id, None, |t| t.core().current_frame())
    }

    pub fn camera_feed_changes(&self, id: StreamId) -> u64 {
        self.with(id, 0, |t| t.core().feed_changes())
    }

    pub fn state(&self, id: StreamId) -> StreamState {
        self.with(id, StreamState::Unknown, |t| t.core().state())
    }

    pub fn poll_type(&self, id: StreamId) -> BackendKind {
        self.with(id, BackendKind::Deactivated, |t| match t {
            Target::Camera(c) => c.poll_type(),
            Target::Composite(_) => BackendKind::Deactivated,
        })
    }

    /// Switch a camera to another backend. Refused for kinds the platform
    /// can't run.
    pub fn set_poll_type(&self, id: StreamId, kind: BackendKind) -> bool {
        let platform = self.platform;
        self.with(id, false, |t| match t {
            Target::Camera(c) if platform.allows(kind) => {
                c.set_poll_type(kind);
                true
            }
            Target::Camera(_) => {
                warn!(%id, %kind, %platform, "Poll type not available on this platform");
                false
            }
            Target::Composite(_) => false,
        })
    }

    // Snapshots

    pub fn request_snapshot(&self, id: StreamId, filename: &str, process: SnapProcess) -> Arc<SnapshotRequest> {
        self.with(id, None, |t| Some(t.core().request_snapshot(filename, process)))
            .unwrap_or_else(|| SnapshotRequest::failed(filename, process, format!("Unknown stream {}", id)))
    }

    /// Snapshot every stream, composite included, into
    /// `<base>_<NAME>RAW`. Streams that process also get a processed
    /// `<base>_<NAME>IMPROC`. The extension of `base` is kept.
    pub fn request_snapshot_all(&self, base: &str) -> Vec<Arc<SnapshotRequest>> {
        let (stem, ext) = split_extension(base);
        let mut reqs = Vec::new();
        for core in self.cores() {
            let raw = format!("{}_{}RAW{}", stem, core.name(), ext);
            reqs.push(core.request_snapshot(&raw, SnapProcess::Cannot));
            if core.uses_processing() {
                let processed = format!("{}_{}IMPROC{}", stem, core.name(), ext);
                reqs.push(core.request_snapshot(&processed, SnapProcess::HasTo));
            }
        }
        reqs
    }

    pub fn clear_snapshot_requests(&self, id: StreamId) -> usize {
        self.with(id, 0, |t| t.core().clear_snapshot_requests())
    }

    pub fn clear_all_snapshot_requests(&self) -> usize {
        self.cores().iter().map(|c| c.clear_snapshot_requests()).sum()
    }

    pub fn set_snap_caption(&self, id: StreamId, text: &str) -> bool {
        self.with(id, false, |t| {
            t.core().set_caption(text);
            true
        })
    }

    pub fn set_all_snap_caption(&self, text: &str) {
        for core in self.cores() {
            core.set_caption(text);
        }
    }

    // Video

    pub fn record_video(&self, id: StreamId, filename: &str) -> Arc<VideoRequest> {
        self.with(id, None, |t| Some(t.core().record_video(filename)))
            .unwrap_or_else(|| VideoRequest::failed(id, filename, format!("Unknown stream {}", id)))
    }

    pub fn stop_recording(&self, id: StreamId) -> bool {
        self.with(id, false, |t| t.core().stop_recording())
    }

    pub fn is_recording(&self, id: StreamId) -> bool {
        self.with(id, false, |t| t.core().is_recording())
    }

    pub fn recording_filename(&self, id: StreamId) -> Option<String> {
        self.with(id, None, |t| t.core().recording_filename())
    }

    // Processing and parameters

    pub fn is_thresholded(&self, id: StreamId) -> bool {
        self.with(id, false, |t| t.core().uses_processing())
    }

    pub fn processing_type(&self, id: StreamId) -> ProcessingType {
        self.with(id, ProcessingType::None, |t| t.core().processing_type())
    }

    pub fn set_processing_type(&self, id: StreamId, processing: ProcessingType) -> bool {
        self.with(id, false, |t| t.core().set_processing_type(processing))
    }

    pub fn get_param(&self, id: StreamId, param: StreamParam) -> Option<f64> {
        self.with(id, None, |t| match t {
            Target::Camera(c) => c.get_param(param),
            Target::Composite(c) => c.get_param(param),
        })
    }

    pub fn set_param(&self, id: StreamId, param: StreamParam, value: f64) -> bool {
        self.with(id, false, |t| match t {
            Target::Camera(c) => c.set_param(param, value),
            Target::Composite(c) => c.set_param(param, value),
        })
    }

    // Stats

    pub fn ms_frame_time(&self, id: StreamId) -> u64 {
        self.with(id, 0, |t| t.core().ms_frame_time())
    }

    pub fn stream_frame_count(&self, id: StreamId) -> u64 {
        self.with(id, 0, |t| t.core().frame_count())
    }

    pub fn stream_dimensions(&self, id: StreamId) -> Option<(u32, u32)> {
        self.with(id, None, |t| t.core().stream_dimensions())
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `("shots/a", ".png")` for `"shots/a.png"`. Dots in directory names are
/// not extensions.
fn split_extension(name: &str) -> (&str, &str) {
    let file_start = name.rfind(['/', '\\']).map_or(0, |i| i + 1);
    match name[file_start..].rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => name.split_at(file_start + dot),
    }
}
