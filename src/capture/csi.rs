//! CSI board camera backend.
//!
//! Unlike the pull-based backends, the sensor driver pushes buffers from a
//! thread it owns. The callback copies the luma plane into a single-slot
//! mailbox and hands the buffer straight back to the driver; `poll_frame`
//! drains the mailbox from the worker thread.

use std::sync::{Arc, Mutex};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, error, info, warn};

use super::decode::flip_frame;
use super::frame::{Frame, PixelFormat};
use super::{BackendKind, CameraBackend};
use crate::config::SourceConfig;
use crate::error::CaptureError;
use crate::persist::Metadata;
use crate::pipeline::StreamParam;

/// Requested sensor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub width: u32,
    pub height: u32,
    pub exposure_micro: u32,
    pub analog_gain: f32,
    pub digital_gain: f32,
    pub red_gain: f32,
    pub blue_gain: f32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            exposure_micro: 0,
            analog_gain: 1.0,
            digital_gain: 1.0,
            red_gain: 1.0,
            blue_gain: 1.0,
        }
    }
}

/// A filled hardware buffer, borrowed for the duration of the callback.
pub struct SensorBuffer<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width`.
    pub stride: u32,
}

pub type BufferCallback = Box<dyn FnMut(SensorBuffer<'_>) + Send>;

/// Hardware access for a CSI sensor. `start` must deliver buffers to the
/// callback from a driver-owned thread until `stop`.
pub trait SensorDriver: Send {
    fn name(&self) -> String;

    /// One-time, process-wide driver subsystem setup.
    fn init_subsystem(&mut self) -> Result<(), CaptureError>;

    fn start(
        &mut self,
        index: u32,
        settings: &SensorSettings,
        on_buffer: BufferCallback,
    ) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn set_exposure(&mut self, micros: u32) -> Result<(), CaptureError>;
}

/// Counts active users of the driver subsystem; the first entry runs the
/// subsystem init.
pub struct InitGate {
    users: Mutex<usize>,
}

impl InitGate {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(0),
        }
    }

    fn enter<F>(&self, init: F) -> Result<(), CaptureError>
    where
        F: FnOnce() -> Result<(), CaptureError>,
    {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if *users == 0 {
            info!("Running one-time sensor subsystem init");
            init()?;
        }
        *users += 1;
        Ok(())
    }

    fn leave(&self) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        *users = users.saturating_sub(1);
    }

    pub fn users(&self) -> usize {
        *self.users.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

static DRIVER_GATE: Lazy<Arc<InitGate>> = Lazy::new(|| Arc::new(InitGate::new()));
static SIGNALS: OnceCell<()> = OnceCell::new();

extern "C" fn exit_on_signal(_signal: libc::c_int) {
    // Only async-signal-safe calls here
    unsafe { libc::_exit(130) }
}

/// SIGUSR1 is ignored, SIGINT terminates the process. Installed once.
fn install_signal_handlers() {
    SIGNALS.get_or_init(|| {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let terminate = SigAction::new(
            SigHandler::Handler(exit_on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: both handlers are async-signal-safe
        unsafe {
            if let Err(e) = sigaction(Signal::SIGUSR1, &ignore) {
                warn!("Could not ignore SIGUSR1: {}", e);
            }
            if let Err(e) = sigaction(Signal::SIGINT, &terminate) {
                warn!("Could not install SIGINT handler: {}", e);
            }
        }
        debug!("Sensor signal handlers installed");
    });
}

/// Human-readable text for a driver status code.
pub fn describe_status(code: i32) -> &'static str {
    match code {
        libc::ENOMEM => "Out of memory",
        libc::ENOSPC => "Out of resources (other than memory)",
        libc::EINVAL => "Argument is invalid",
        libc::ENOSYS => "Function not implemented",
        libc::ENOENT => "No such file or directory",
        libc::ENXIO => "No such device or address",
        libc::EIO => "I/O error",
        libc::ESPIPE => "Illegal seek",
        libc::EBADMSG => "Data is corrupt",
        libc::EBUSY => "Component is not ready",
        libc::ENOTCONN => "Port is disconnected",
        libc::EISCONN => "Port is already connected",
        libc::EAGAIN => "Resource temporarily unavailable. Try again later",
        libc::EFAULT => "Bad address",
        _ => "Unknown status error",
    }
}

/// Convert an OS error from the driver into a logged, mapped status.
pub fn driver_error(e: std::io::Error) -> CaptureError {
    match e.raw_os_error() {
        Some(code) => {
            let message = describe_status(code);
            error!(code, "Sensor driver: {}", message);
            CaptureError::Driver { code, message }
        }
        None => CaptureError::Io(e),
    }
}

/// Rows the sensor rounded up past the requested height are cut off when
/// the overshoot is small; anything larger means the size wasn't honoured.
pub fn trimmed_height(delivered: u32, preferred: u32) -> u32 {
    if preferred == 0 {
        return delivered;
    }
    let extra = delivered as i64 - preferred as i64;
    if extra > 1 && extra <= 32 {
        preferred
    } else {
        delivered
    }
}

type Mailbox = Arc<Mutex<Option<Frame>>>;

fn mailbox_callback(mailbox: Mailbox, preferred_height: u32) -> BufferCallback {
    let mut sequence = 0u64;
    Box::new(move |buf: SensorBuffer<'_>| {
        let height = trimmed_height(buf.height, preferred_height);
        let (w, stride) = (buf.width as usize, buf.stride.max(buf.width) as usize);
        let rows = (buf.data.len() / stride.max(1)).min(height as usize);
        if w == 0 || rows == 0 {
            return;
        }
        let mut luma = Vec::with_capacity(w * rows);
        for row in buf.data.chunks(stride).take(rows) {
            luma.extend_from_slice(&row[..w.min(row.len())]);
        }
        sequence += 1;
        let frame = Frame::from_pixels(luma, buf.width, rows as u32, PixelFormat::Gray8, sequence);
        if let Ok(mut slot) = mailbox.lock() {
            *slot = Some(frame);
        }
    })
}

pub struct CsiBackend {
    driver: Box<dyn SensorDriver>,
    gate: Arc<InitGate>,
    entered: bool,
    index: u32,
    settings: SensorSettings,
    flip_horiz: bool,
    flip_vert: bool,
    mailbox: Mailbox,
    active: bool,
}

impl CsiBackend {
    pub fn new() -> Self {
        Self::with_driver(default_driver(), DRIVER_GATE.clone())
    }

    pub fn with_driver(driver: Box<dyn SensorDriver>, gate: Arc<InitGate>) -> Self {
        Self {
            driver,
            gate,
            entered: false,
            index: 0,
            settings: SensorSettings::default(),
            flip_horiz: false,
            flip_vert: false,
            mailbox: Arc::new(Mutex::new(None)),
            active: false,
        }
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }
}

impl Default for CsiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for CsiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CsiSensor
    }

    fn activate(&mut self) -> bool {
        if self.active {
            return true;
        }
        if !self.entered {
            let driver = &mut self.driver;
            let entered = self.gate.enter(|| {
                driver.init_subsystem()?;
                install_signal_handlers();
                Ok(())
            });
            if let Err(e) = entered {
                warn!("Sensor subsystem init failed: {}", e);
                return false;
            }
            self.entered = true;
        }

        info!(index = self.index, sensor = %self.driver.name(), "Activating CSI sensor");
        let callback = mailbox_callback(self.mailbox.clone(), self.settings.height);
        match self.driver.start(self.index, &self.settings, callback) {
            Ok(()) => {
                self.active = true;
                true
            }
            Err(e) => {
                warn!(index = self.index, "Failed to start CSI sensor: {}", e);
                false
            }
        }
    }

    fn deactivate(&mut self) -> bool {
        if self.active {
            self.driver.stop();
            self.active = false;
        }
        if let Ok(mut slot) = self.mailbox.lock() {
            *slot = None;
        }
        true
    }

    fn shutdown(&mut self) -> bool {
        self.deactivate();
        if self.entered {
            self.gate.leave();
            self.entered = false;
        }
        true
    }

    fn poll_frame(&mut self) -> Option<Frame> {
        if !self.active {
            return None;
        }
        let frame = self.mailbox.lock().ok()?.take()?;
        Some(flip_frame(frame, self.flip_horiz, self.flip_vert))
    }

    fn pull_options(&mut self, source: &SourceConfig) -> bool {
        self.index = source.csi_index;
        self.flip_horiz = source.flip_horiz;
        self.flip_vert = source.flip_vert;
        self.settings = SensorSettings {
            width: source.stream_width,
            height: source.stream_height,
            exposure_micro: source.video_exposure_micro,
            analog_gain: source.analog_gain,
            digital_gain: source.digital_gain,
            red_gain: source.awb_red_gain,
            blue_gain: source.awb_blue_gain,
        };
        true
    }

    fn is_valid(&self) -> bool {
        self.active && self.driver.is_running()
    }

    fn set_param(&mut self, param: StreamParam, value: f64) -> bool {
        if param != StreamParam::ExposureMicroseconds {
            return false;
        }
        self.settings.exposure_micro = value.max(0.0) as u32;
        if !self.active {
            return true;
        }
        match self.driver.set_exposure(self.settings.exposure_micro) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not set sensor exposure: {}", e);
                false
            }
        }
    }

    fn inject_metadata(&self, meta: &mut Metadata) {
        let s = &self.settings;
        meta.insert("camera_sensor".into(), self.driver.name());
        if s.exposure_micro > 0 {
            meta.insert("exposure".into(), format!("{}", s.exposure_micro as f64 / 1000.0));
        }
        meta.insert("analog_gain".into(), s.analog_gain.to_string());
        meta.insert("digital_gain".into(), s.digital_gain.to_string());
        meta.insert("red_gain".into(), s.red_gain.to_string());
        meta.insert("blue_gain".into(), s.blue_gain.to_string());
    }
}

#[cfg(feature = "v4l2")]
fn default_driver() -> Box<dyn SensorDriver> {
    Box::new(v4l2_driver::V4l2SensorDriver::new())
}

#[cfg(not(feature = "v4l2"))]
fn default_driver() -> Box<dyn SensorDriver> {
    Box::new(UnavailableDriver)
}

/// Driver used when no sensor support is compiled in.
#[cfg(not(feature = "v4l2"))]
struct UnavailableDriver;

#[cfg(not(feature = "v4l2"))]
impl SensorDriver for UnavailableDriver {
    fn name(&self) -> String {
        "unavailable".into()
    }

    fn init_subsystem(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn start(&mut self, _: u32, _: &SensorSettings, _: BufferCallback) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported("CSI sensor"))
    }

    fn stop(&mut self) {}

    fn is_running(&self) -> bool {
        false
    }

    fn set_exposure(&mut self, _micros: u32) -> Result<(), CaptureError> {
        Err(CaptureError::NotActive)
    }
}

#[cfg(feature = "v4l2")]
mod v4l2_driver {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use tracing::{info, warn};
    use v4l::buffer::Type;
    use v4l::control::{Control, Value};
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::MmapStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    use super::{driver_error, BufferCallback, SensorBuffer, SensorDriver, SensorSettings};
    use crate::error::CaptureError;
    use crate::pipeline::stream::join_within;

    const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
    const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
    const BUFFER_COUNT: u32 = 3;
    /// How long `stop` waits on a blocked dequeue before giving up on the thread.
    const STOP_TIMEOUT: Duration = Duration::from_secs(5);

    enum Command {
        Exposure(u32),
    }

    /// Sensor reached through its V4L2 node, dequeued on a dedicated thread.
    pub struct V4l2SensorDriver {
        name: String,
        stop: Arc<AtomicBool>,
        commands: Option<flume::Sender<Command>>,
        thread: Option<(JoinHandle<()>, flume::Receiver<()>)>,
    }

    impl V4l2SensorDriver {
        pub fn new() -> Self {
            Self {
                name: "csi".into(),
                stop: Arc::new(AtomicBool::new(false)),
                commands: None,
                thread: None,
            }
        }
    }

    fn set_exposure(dev: &Device, micros: u32) -> std::io::Result<()> {
        if micros == 0 {
            return dev.set_control(Control {
                id: V4L2_CID_EXPOSURE_AUTO,
                value: Value::Integer(0),
            });
        }
        dev.set_control(Control {
            id: V4L2_CID_EXPOSURE_AUTO,
            value: Value::Integer(1),
        })?;
        dev.set_control(Control {
            id: V4L2_CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer(i64::from((micros / 100).max(1))),
        })
    }

    fn open(index: u32, settings: &SensorSettings) -> std::io::Result<(Device, u32, u32, u32, String)> {
        let dev = Device::new(index as usize)?;
        let caps = dev.query_caps()?;
        let mut fmt = dev.format()?;
        if settings.width > 0 && settings.height > 0 {
            // Sensor widths are aligned up to 32
            fmt.width = (settings.width + 31) & !31;
            fmt.height = settings.height;
        }
        fmt.fourcc = FourCC::new(b"YU12");
        let fmt = dev.set_format(&fmt)?;
        if settings.exposure_micro > 0 {
            if let Err(e) = set_exposure(&dev, settings.exposure_micro) {
                warn!("Initial exposure rejected: {}", e);
            }
        }
        Ok((dev, fmt.width, fmt.height, fmt.stride.max(fmt.width), caps.card))
    }

    impl SensorDriver for V4l2SensorDriver {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn init_subsystem(&mut self) -> Result<(), CaptureError> {
            if !std::path::Path::new("/dev/video0").exists() {
                return Err(CaptureError::Device("no V4L2 nodes present".into()));
            }
            Ok(())
        }

        fn start(
            &mut self,
            index: u32,
            settings: &SensorSettings,
            mut on_buffer: BufferCallback,
        ) -> Result<(), CaptureError> {
            self.stop();
            // A fresh flag, so a thread detached by `stop` never resumes
            self.stop = Arc::new(AtomicBool::new(false));

            let (ready_tx, ready_rx) = flume::bounded::<Result<String, CaptureError>>(1);
            let (cmd_tx, cmd_rx) = flume::unbounded::<Command>();
            let (done_tx, done_rx) = flume::bounded::<()>(1);
            let stop = self.stop.clone();
            let settings = settings.clone();

            let thread = std::thread::Builder::new()
                .name(format!("csi-sensor-{}", index))
                .spawn(move || {
                    // Dropped on every exit path
                    let _done = done_tx;
                    let (dev, width, height, stride, card) = match open(index, &settings) {
                        Ok(v) => v,
                        Err(e) => {
                            let _ = ready_tx.send(Err(driver_error(e)));
                            return;
                        }
                    };
                    let mut stream =
                        match MmapStream::with_buffers(&dev, Type::VideoCapture, BUFFER_COUNT) {
                            Ok(s) => s,
                            Err(e) => {
                                let _ = ready_tx.send(Err(driver_error(e)));
                                return;
                            }
                        };
                    let _ = ready_tx.send(Ok(card));

                    while !stop.load(Ordering::Relaxed) {
                        while let Ok(Command::Exposure(us)) = cmd_rx.try_recv() {
                            if let Err(e) = set_exposure(&dev, us) {
                                warn!("Exposure change rejected: {}", driver_error(e));
                            }
                        }
                        match stream.next() {
                            // The buffer is re-queued on the next dequeue
                            Ok((buf, _meta)) => on_buffer(SensorBuffer {
                                data: buf,
                                width,
                                height,
                                stride,
                            }),
                            Err(e) => {
                                warn!("Sensor dequeue failed: {}", driver_error(e));
                                break;
                            }
                        }
                    }
                    stop.store(true, Ordering::SeqCst);
                })?;

            match ready_rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Ok(card)) => {
                    info!(sensor = %card, "CSI sensor streaming");
                    self.name = card;
                    self.commands = Some(cmd_tx);
                    self.thread = Some((thread, done_rx));
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => {
                    self.stop.store(true, Ordering::SeqCst);
                    self.thread = Some((thread, done_rx));
                    Err(CaptureError::Device("sensor did not start in time".into()))
                }
            }
        }

        fn stop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            self.commands = None;
            if let Some((thread, done)) = self.thread.take() {
                if join_within(thread, &done, STOP_TIMEOUT).is_err() {
                    // Dropping the handle detaches the thread
                    warn!("Sensor thread did not stop within {:?}, detaching it", STOP_TIMEOUT);
                }
            }
        }

        fn is_running(&self) -> bool {
            self.thread.is_some() && !self.stop.load(Ordering::Relaxed)
        }

        fn set_exposure(&mut self, micros: u32) -> Result<(), CaptureError> {
            let tx = self.commands.as_ref().ok_or(CaptureError::NotActive)?;
            tx.send(Command::Exposure(micros))
                .map_err(|_| CaptureError::NotActive)
        }
    }

    impl Drop for V4l2SensorDriver {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    /// Pushes fixed-size grey buffers from its own thread.
    struct FakeDriver {
        inits: Arc<AtomicUsize>,
        width: u32,
        height: u32,
        running: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl FakeDriver {
        fn new(inits: Arc<AtomicUsize>, width: u32, height: u32) -> Self {
            Self {
                inits,
                width,
                height,
                running: Arc::new(AtomicBool::new(false)),
                thread: None,
            }
        }
    }

    impl SensorDriver for FakeDriver {
        fn name(&self) -> String {
            "fake-sensor".into()
        }

        fn init_subsystem(&mut self) -> Result<(), CaptureError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn start(
            &mut self,
            _index: u32,
            _settings: &SensorSettings,
            mut on_buffer: BufferCallback,
        ) -> Result<(), CaptureError> {
            self.running.store(true, Ordering::SeqCst);
            let running = self.running.clone();
            let (w, h) = (self.width, self.height);
            self.thread = Some(std::thread::spawn(move || {
                let data = vec![77u8; (w * h) as usize];
                while running.load(Ordering::SeqCst) {
                    on_buffer(SensorBuffer {
                        data: &data,
                        width: w,
                        height: h,
                        stride: w,
                    });
                    std::thread::sleep(Duration::from_millis(2));
                }
            }));
            Ok(())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(t) = self.thread.take() {
                t.join().unwrap();
            }
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn set_exposure(&mut self, _micros: u32) -> Result<(), CaptureError> {
            Ok(())
        }
    }

    fn wait_for_frame(backend: &mut CsiBackend) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(f) = backend.poll_frame() {
                return f;
            }
            assert!(Instant::now() < deadline, "no frame delivered");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn trims_small_row_overshoot_only() {
        assert_eq!(trimmed_height(1088, 1080), 1080);
        assert_eq!(trimmed_height(1081, 1080), 1081);
        assert_eq!(trimmed_height(1112, 1080), 1080);
        assert_eq!(trimmed_height(1113, 1080), 1113);
        assert_eq!(trimmed_height(480, 0), 480);
    }

    #[test]
    fn first_activation_initializes_subsystem_once() {
        let gate = Arc::new(InitGate::new());
        let inits = Arc::new(AtomicUsize::new(0));
        let mut a = CsiBackend::with_driver(Box::new(FakeDriver::new(inits.clone(), 8, 8)), gate.clone());
        let mut b = CsiBackend::with_driver(Box::new(FakeDriver::new(inits.clone(), 8, 8)), gate.clone());

        assert!(a.activate());
        assert!(b.activate());
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(gate.users(), 2);

        a.shutdown();
        b.shutdown();
        assert_eq!(gate.users(), 0);
    }

    #[test]
    fn mailbox_holds_latest_trimmed_frame() {
        let gate = Arc::new(InitGate::new());
        let inits = Arc::new(AtomicUsize::new(0));
        let mut backend =
            CsiBackend::with_driver(Box::new(FakeDriver::new(inits, 32, 488)), gate);
        let source = SourceConfig {
            stream_width: 32,
            stream_height: 480,
            ..SourceConfig::default()
        };
        backend.pull_options(&source);
        assert!(backend.activate());
        assert!(backend.is_valid());

        let frame = wait_for_frame(&mut backend);
        assert_eq!(frame.dimensions(), (32, 480));
        assert_eq!(frame.format(), PixelFormat::Gray8);

        backend.deactivate();
        assert!(!backend.is_valid());
        assert!(backend.poll_frame().is_none());
    }

    #[test]
    fn metadata_reports_sensor_settings() {
        let gate = Arc::new(InitGate::new());
        let mut backend = CsiBackend::with_driver(
            Box::new(FakeDriver::new(Arc::new(AtomicUsize::new(0)), 8, 8)),
            gate,
        );
        backend.pull_options(&SourceConfig {
            video_exposure_micro: 20_000,
            analog_gain: 2.0,
            ..SourceConfig::default()
        });
        let mut meta = Metadata::new();
        backend.inject_metadata(&mut meta);
        assert_eq!(meta["camera_sensor"], "fake-sensor");
        assert_eq!(meta["exposure"], "20");
        assert_eq!(meta["analog_gain"], "2");
    }

    #[test]
    fn status_codes_have_text() {
        assert_eq!(describe_status(libc::ENOMEM), "Out of memory");
        assert_eq!(describe_status(-12345), "Unknown status error");
    }
}
