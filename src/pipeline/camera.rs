//! Camera stream worker: owns one backend and polls it on its own thread.
//!
//! `Unknown -> Idling <-> Connecting -> Polling -> Idling | Shutdown`. A
//! backend that fails to open or stops being valid is dropped and the
//! worker retries after [`RETRY_MS`]; it never gives up on its own.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use super::composite::CompositeMailbox;
use super::stream::{lock, StreamContext, StreamCore, StreamHandle, StreamSettings};
use super::timer::{FrameBudget, MS_PER_FRAME};
use super::{StreamParam, StreamState};
use crate::capture::{BackendHandle, BackendKind, BackendRegistry};
use crate::config::SourceConfig;
use crate::persist::Metadata;

/// Wait between connection attempts, and between checks while idle.
pub const RETRY_MS: u64 = 500;
/// Back-off when a non-blocking backend has no frame ready.
const NO_FRAME_MS: u64 = 10;
/// Minimum pause between frames so capture threads get scheduled.
const MIN_FRAME_SLEEP_MS: u64 = 2;

#[derive(Default)]
struct BackendParams {
    /// Waiting to be applied on the worker thread.
    pending: Vec<(StreamParam, f64)>,
    /// Last exposure set at runtime, re-applied after reconnecting.
    exposure_micro: Option<f64>,
}

/// State the registry and the worker thread share beyond the core.
struct CameraShared {
    core: Arc<StreamCore>,
    source: SourceConfig,
    poll: Mutex<BackendKind>,
    params: Mutex<BackendParams>,
}

impl CameraShared {
    fn poll_type(&self) -> BackendKind {
        *lock(&self.poll)
    }

    fn take_pending(&self) -> Vec<(StreamParam, f64)> {
        std::mem::take(&mut lock(&self.params).pending)
    }

    fn exposure_override(&self) -> Option<f64> {
        lock(&self.params).exposure_micro
    }
}

/// A camera stream and its polling thread.
pub struct CameraWorker {
    index: usize,
    shared: Arc<CameraShared>,
    handle: StreamHandle,
}

impl CameraWorker {
    /// Start polling `poll` for camera `index`.
    pub fn spawn(
        index: usize,
        source: SourceConfig,
        poll: BackendKind,
        backends: BackendRegistry,
        ctx: &StreamContext,
        mailbox: CompositeMailbox,
    ) -> io::Result<Self> {
        let settings = StreamSettings {
            processing: source.processing_type(),
            static_threshold: source.threshold_level(),
            alpha: source.alpha,
        };
        let core = StreamCore::camera(index, settings, ctx, mailbox);
        let shared = Arc::new(CameraShared {
            core: core.clone(),
            source,
            poll: Mutex::new(poll),
            params: Mutex::new(BackendParams::default()),
        });
        let handle = {
            let shared = shared.clone();
            StreamHandle::spawn(core, move || run(&shared, &backends))?
        };
        Ok(Self {
            index,
            shared,
            handle,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn core(&self) -> &Arc<StreamCore> {
        &self.shared.core
    }

    pub fn poll_type(&self) -> BackendKind {
        self.shared.poll_type()
    }

    /// Switch backends. The worker drops the current one on its next pass.
    pub fn set_poll_type(&self, kind: BackendKind) {
        let mut poll = lock(&self.shared.poll);
        if *poll != kind {
            info!(stream = %self.shared.core.name(), from = %*poll, to = %kind, "Poll type changed");
            *poll = kind;
        }
    }

    pub fn get_param(&self, param: StreamParam) -> Option<f64> {
        match param {
            StreamParam::ExposureMicroseconds => Some(
                self.shared
                    .exposure_override()
                    .unwrap_or(self.shared.source.video_exposure_micro as f64),
            ),
            _ => self.shared.core.get_param(param),
        }
    }

    /// Backend parameters are queued and applied by the worker thread,
    /// which owns the backend.
    pub fn set_param(&self, param: StreamParam, value: f64) -> bool {
        match param {
            StreamParam::ExposureMicroseconds => {
                let mut params = lock(&self.shared.params);
                params.exposure_micro = Some(value);
                params.pending.push((param, value));
                true
            }
            _ => self.shared.core.set_param(param, value),
        }
    }

    pub fn signal_shutdown(&self) {
        self.handle.signal_shutdown();
    }

    pub fn join(&mut self, timeout: Duration) -> bool {
        self.handle.join(timeout)
    }
}

/// Create, initialize, configure and activate a backend. `None` means try
/// again later.
#[instrument(level = "debug", skip_all, fields(stream = %shared.core.name(), %kind))]
fn connect(shared: &CameraShared, backends: &BackendRegistry, kind: BackendKind) -> Option<BackendHandle> {
    let Some(mut backend) = backends.create(kind) else {
        warn!("No backend registered for {}", kind);
        return None;
    };
    if !backend.initialize() {
        warn!("Backend failed to initialize");
        return None;
    }
    if !backend.pull_options(&shared.source) {
        warn!("Backend rejected the source options");
    }
    if !backend.activate() {
        warn!("Backend failed to activate, retrying in {}ms", RETRY_MS);
        return None;
    }
    if let Some(exposure) = shared.exposure_override() {
        backend.set_param(StreamParam::ExposureMicroseconds, exposure);
    }
    info!("Backend activated");
    Some(backend)
}

fn run(shared: &CameraShared, backends: &BackendRegistry) {
    let core = &shared.core;
    let mut backend: Option<BackendHandle> = None;

    while !core.shutdown_requested() {
        let kind = shared.poll_type();

        if backend.as_ref().is_some_and(|b| b.kind() != kind) {
            drop_backend(&mut backend);
        }

        if kind == BackendKind::Deactivated {
            core.set_state(StreamState::Idling);
        } else {
            core.set_state(StreamState::Connecting);
            if backend.is_none() {
                backend = connect(shared, backends, kind);
            }
        }

        if let Some(b) = backend.as_mut().filter(|b| b.is_valid()) {
            poll_loop(shared, b, kind);
            // Not valid any more, or the poll type changed.
            drop_backend(&mut backend);
            core.end_stream();
        }

        core.set_state(StreamState::Idling);
        core.idle(RETRY_MS);
    }

    drop_backend(&mut backend);
    core.end_stream();
    core.set_state(StreamState::Shutdown);
    info!(stream = %core.name(), "Stream stopped");
}

fn drop_backend(backend: &mut Option<BackendHandle>) {
    if let Some(mut b) = backend.take() {
        b.deactivate();
        // the handle's drop runs shutdown
    }
}

fn poll_loop(shared: &CameraShared, backend: &mut BackendHandle, kind: BackendKind) {
    let core = &shared.core;
    core.begin_stream();
    let mut budget = FrameBudget::new();
    let mut last = Instant::now();
    let stream_type = kind.to_string();

    while backend.kind() == shared.poll_type() && backend.is_valid() && !core.shutdown_requested() {
        core.set_state(StreamState::Polling);

        for (param, value) in shared.take_pending() {
            if !backend.set_param(param, value) {
                warn!(stream = %core.name(), ?param, value, "Backend did not accept parameter");
            }
        }

        match backend.poll_frame().filter(|f| !f.is_empty()) {
            Some(frame) => {
                core.latch_dimensions(frame.width(), frame.height());
                let b: &BackendHandle = backend;
                core.handle_frame(frame, &|meta: &mut Metadata| {
                    b.inject_metadata(meta);
                    meta.insert("stream_type".into(), stream_type.clone());
                });

                let now = Instant::now();
                core.frame_done(now - last);
                last = now;
                let ms = budget.ms_left(MS_PER_FRAME).max(MIN_FRAME_SLEEP_MS);
                std::thread::sleep(Duration::from_millis(ms));
            }
            None => std::thread::sleep(Duration::from_millis(NO_FRAME_MS)),
        }
    }
}
