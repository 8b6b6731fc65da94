//! Camera backends: the acquisition strategies a stream worker can poll.

pub mod csi;
pub mod decode;
pub mod frame;
pub mod gst_capture;
pub mod network;
pub mod static_image;
pub mod v4l2;

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::persist::Metadata;
use crate::pipeline::StreamParam;

pub use frame::Frame;
pub use frame::PixelFormat;

/// Which acquisition strategy a stream polls from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "deactivated")]
    Deactivated,
    /// V4L2 capture device by index
    #[serde(rename = "cvusb")]
    UsbIndex,
    /// V4L2 capture device by node path
    #[serde(rename = "devpath")]
    DevicePath,
    /// Network stream (RTSP/HTTP) by URL
    #[serde(rename = "url")]
    NetworkUrl,
    #[serde(rename = "static")]
    StaticImage,
    /// Board camera on the CSI connector
    #[serde(rename = "mmal")]
    CsiSensor,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Deactivated => "deactivated",
            BackendKind::UsbIndex => "cvusb",
            BackendKind::DevicePath => "devpath",
            BackendKind::NetworkUrl => "url",
            BackendKind::StaticImage => "static",
            BackendKind::CsiSensor => "mmal",
        })
    }
}

/// A camera acquisition strategy.
///
/// Construction has no hardware side effects. Failures are logged by the
/// implementation and reported as `false`/`None`; the worker decides when
/// to retry.
pub trait CameraBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Library-level setup.
    fn initialize(&mut self) -> bool {
        true
    }

    /// Open the device. On failure the backend stays usable for a retry.
    fn activate(&mut self) -> bool;

    /// Release the device. Safe to call when never activated.
    fn deactivate(&mut self) -> bool;

    fn shutdown(&mut self) -> bool {
        self.deactivate();
        true
    }

    /// The most recent frame, or `None` when nothing is ready.
    fn poll_frame(&mut self) -> Option<Frame>;

    /// Apply a configuration snapshot. May be called before `activate`.
    fn pull_options(&mut self, source: &SourceConfig) -> bool;

    /// Activated and internally healthy.
    fn is_valid(&self) -> bool;

    fn set_param(&mut self, _param: StreamParam, _value: f64) -> bool {
        false
    }

    /// Add backend-specific keys to a snapshot's metadata.
    fn inject_metadata(&self, _meta: &mut Metadata) {}
}

/// Owns a backend and enforces its lifecycle: `initialize` at most once,
/// `shutdown` at most once and only after `initialize`. Dropping the
/// handle shuts the backend down.
pub struct BackendHandle {
    inner: Box<dyn CameraBackend>,
    initialized: bool,
    shut_down: bool,
}

impl BackendHandle {
    pub fn new(inner: Box<dyn CameraBackend>) -> Self {
        Self {
            inner,
            initialized: false,
            shut_down: false,
        }
    }

    pub fn initialize(&mut self) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        self.inner.initialize()
    }

    pub fn shutdown(&mut self) -> bool {
        if !self.initialized || self.shut_down {
            return false;
        }
        self.shut_down = true;
        debug!(kind = %self.inner.kind(), "Shutting down backend");
        self.inner.shutdown()
    }
}

impl Deref for BackendHandle {
    type Target = dyn CameraBackend;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for BackendHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub type BackendCtor = Arc<dyn Fn() -> Box<dyn CameraBackend> + Send + Sync>;

/// Constructors keyed by backend kind. Workers build a fresh backend from
/// here whenever their poll type changes.
#[derive(Clone)]
pub struct BackendRegistry {
    ctors: HashMap<BackendKind, BackendCtor>,
}

impl BackendRegistry {
    /// No constructors at all.
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Register a constructor, replacing any previous one for `kind`.
    pub fn register<F>(&mut self, kind: BackendKind, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn CameraBackend> + Send + Sync + 'static,
    {
        if kind == BackendKind::Deactivated {
            warn!("Ignoring constructor registered for the deactivated kind");
            return self;
        }
        self.ctors.insert(kind, Arc::new(ctor));
        self
    }

    pub fn create(&self, kind: BackendKind) -> Option<BackendHandle> {
        let ctor = self.ctors.get(&kind)?;
        Some(BackendHandle::new(ctor()))
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        self.ctors.contains_key(&kind)
    }
}

impl Default for BackendRegistry {
    /// The built-in backends.
    fn default() -> Self {
        let mut reg = Self::empty();
        reg.register(BackendKind::UsbIndex, || Box::new(v4l2::V4l2Backend::usb()))
            .register(BackendKind::DevicePath, || {
                Box::new(v4l2::V4l2Backend::device_path())
            })
            .register(BackendKind::NetworkUrl, || {
                Box::new(network::NetworkBackend::new())
            })
            .register(BackendKind::StaticImage, || {
                Box::new(static_image::StaticImageBackend::new())
            })
            .register(BackendKind::CsiSensor, || Box::new(csi::CsiBackend::new()));
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        shutdowns: Arc<AtomicUsize>,
    }

    impl CameraBackend for Counting {
        fn kind(&self) -> BackendKind {
            BackendKind::StaticImage
        }
        fn activate(&mut self) -> bool {
            true
        }
        fn deactivate(&mut self) -> bool {
            true
        }
        fn shutdown(&mut self) -> bool {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn poll_frame(&mut self) -> Option<Frame> {
            None
        }
        fn pull_options(&mut self, _source: &SourceConfig) -> bool {
            true
        }
        fn is_valid(&self) -> bool {
            true
        }
    }

    #[test]
    fn lifecycle_runs_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut handle = BackendHandle::new(Box::new(Counting {
            shutdowns: shutdowns.clone(),
        }));

        assert!(!handle.shutdown(), "shutdown before initialize");
        assert!(handle.initialize());
        assert!(!handle.initialize());
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        drop(handle);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_shuts_down_initialized_backend() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut handle = BackendHandle::new(Box::new(Counting {
            shutdowns: shutdowns.clone(),
        }));
        handle.initialize();
        drop(handle);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_overrides_and_deactivated() {
        let mut reg = BackendRegistry::default();
        assert!(reg.create(BackendKind::Deactivated).is_none());
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let s = shutdowns.clone();
        reg.register(BackendKind::UsbIndex, move || {
            Box::new(Counting {
                shutdowns: s.clone(),
            })
        });
        let handle = reg.create(BackendKind::UsbIndex).unwrap();
        assert_eq!(handle.kind(), BackendKind::StaticImage);
    }
}
