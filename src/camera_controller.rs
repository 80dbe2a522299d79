use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::Duration,
};

use rscam::{Camera, Config, FIELD_NONE};
use tracing::{debug, error, info, warn};
use turbojpeg::{Image, PixelFormat, Subsamp};

use crate::{
    common::CameraMode,
    error::CameraError,
    user_config::{CameraSettings, ModeProfile},
};

/**
 * The operations the arbiter needs from a physical camera. Every call is
 * made from the arbiter's worker thread, one at a time, so implementations
 * need not be `Send` when opened through `CameraArbiter::spawn_with`.
 */
pub(crate) trait CameraDevice {
    fn stop(&mut self) -> Result<(), CameraError>;
    fn configure(&mut self, mode: CameraMode, profile: &ModeProfile) -> Result<(), CameraError>;
    fn start(&mut self) -> Result<(), CameraError>;
    /// Grabs one frame and returns it JPEG encoded.
    fn capture_jpeg(&mut self) -> Result<Vec<u8>, CameraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceState {
    /// Not streaming. Also the state after a failed mode switch.
    Stopped,
    Running(CameraMode),
}

type Job = Box<dyn FnOnce(&mut ArbiterWorker) + Send>;

/**
 * Owns the single camera and serialises every access to it.
 *
 * The device lives on a dedicated worker thread. `with_mode` hands the
 * worker a job, so at most one mode switch or capture runs at any time,
 * and the caller waits at most `timeout` for the answer. A job that hangs
 * in the driver keeps the worker busy, and later jobs queue behind it and
 * time out, but no calling loop is blocked forever.
 */
pub(crate) struct CameraArbiter {
    jobs: mpsc::Sender<Job>,
    state: Arc<Mutex<DeviceState>>,
    mode_switches: Arc<AtomicU64>,
    timeout: Duration,
}

struct ArbiterWorker {
    device: Box<dyn CameraDevice>,
    settings: CameraSettings,
    state: Arc<Mutex<DeviceState>>,
    mode_switches: Arc<AtomicU64>,
}

impl CameraArbiter {
    /**
     * Starts the worker thread and brings the device up in `initial` mode.
     */
    #[cfg(test)]
    pub(crate) fn spawn(
        device: Box<dyn CameraDevice + Send>,
        settings: CameraSettings,
        initial: CameraMode,
    ) -> Result<Self, CameraError> {
        Self::spawn_with(move || Ok(device as Box<dyn CameraDevice>), settings, initial)
    }

    /**
     * Like `spawn`, but the device is opened by `open` on the worker thread
     * itself and never leaves it.
     */
    pub(crate) fn spawn_with<O>(
        open: O,
        settings: CameraSettings,
        initial: CameraMode,
    ) -> Result<Self, CameraError>
    where
        O: FnOnce() -> Result<Box<dyn CameraDevice>, CameraError> + Send + 'static,
    {
        let (jobs, job_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), CameraError>>(1);
        let state = Arc::new(Mutex::new(DeviceState::Stopped));
        let mode_switches = Arc::new(AtomicU64::new(0));
        let timeout = settings.timeout;

        let worker_state = state.clone();
        let worker_switches = mode_switches.clone();
        thread::Builder::new()
            .name(String::from("camera-arbiter"))
            .spawn(move || {
                let device = match open() {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut worker = ArbiterWorker {
                    device,
                    settings,
                    state: worker_state,
                    mode_switches: worker_switches,
                };
                let _ = ready_tx.send(Ok(()));
                debug!("Camera worker started");

                while let Ok(job) = job_rx.recv() {
                    job(&mut worker);
                }
                // Every sender is gone: release the device.
                if let Err(e) = worker.device.stop() {
                    warn!(error = %e, "Failed to stop camera on shutdown");
                }
                worker.set_state(DeviceState::Stopped);
                debug!("Camera worker exited");
            })
            .map_err(|e| CameraError::Start {
                mode: initial,
                reason: format!("could not spawn camera worker: {}", e),
            })?;

        match ready_rx.recv_timeout(timeout) {
            Ok(opened) => opened?,
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(CameraError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(CameraError::WorkerGone),
        }

        let arbiter = Self {
            jobs,
            state,
            mode_switches,
            timeout,
        };
        arbiter.with_mode(initial, |_| Ok(()))?;
        Ok(arbiter)
    }

    /**
     * Runs `body` with exclusive access to the device, after switching the
     * device into `mode` if it is not already there.
     */
    pub(crate) fn with_mode<R, F>(&self, mode: CameraMode, body: F) -> Result<R, CameraError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn CameraDevice) -> Result<R, CameraError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |worker: &mut ArbiterWorker| {
            let result = worker.run_guarded(|worker| {
                worker
                    .ensure_mode(mode)
                    .and_then(|_| body(worker.device.as_mut()))
            });
            // The caller may have timed out and gone away.
            let _ = reply_tx.send(result);
        });
        self.jobs.send(job).map_err(|_| CameraError::WorkerGone)?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CameraError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CameraError::WorkerGone),
        }
    }

    /// Convenience wrapper: switch to `mode` and grab one JPEG.
    pub(crate) fn capture(&self, mode: CameraMode) -> Result<Vec<u8>, CameraError> {
        self.with_mode(mode, |device| device.capture_jpeg())
    }

    /// Stops streaming. The next `with_mode` brings the device back up.
    pub(crate) fn release(&self) -> Result<(), CameraError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |worker: &mut ArbiterWorker| {
            let result = worker.run_guarded(|worker| {
                worker.set_state(DeviceState::Stopped);
                worker.device.stop()
            });
            let _ = reply_tx.send(result);
        });
        self.jobs.send(job).map_err(|_| CameraError::WorkerGone)?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CameraError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CameraError::WorkerGone),
        }
    }

    pub(crate) fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn mode_switches(&self) -> u64 {
        self.mode_switches.load(Ordering::Relaxed)
    }
}

impl ArbiterWorker {
    fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }

    /**
     * Runs one job on the device. A panic in the driver or in the job body
     * is turned into `CameraError::Panicked` for the caller, and the device
     * is marked stopped because its configuration is unknown.
     */
    fn run_guarded<R>(
        &mut self,
        job: impl FnOnce(&mut Self) -> Result<R, CameraError>,
    ) -> Result<R, CameraError> {
        panic::catch_unwind(AssertUnwindSafe(|| job(&mut *self))).unwrap_or_else(|_| {
            error!("Camera job panicked; forcing a reconfigure on next use");
            self.set_state(DeviceState::Stopped);
            Err(CameraError::Panicked)
        })
    }

    fn ensure_mode(&mut self, mode: CameraMode) -> Result<(), CameraError> {
        let current = *self.state.lock().unwrap();
        if current == DeviceState::Running(mode) {
            return Ok(());
        }

        debug!(from = ?current, to = %mode, "Switching camera mode");
        // Until start succeeds the device is in no usable mode.
        self.set_state(DeviceState::Stopped);
        self.device.stop()?;
        self.device.configure(mode, self.settings.profile(mode))?;
        self.device.start()?;
        self.set_state(DeviceState::Running(mode));
        self.mode_switches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

//////////////////////////// V4L2 Camera Start ////////////////////////////
/// One raw frame as the driver delivered it.
pub(crate) struct RawFrame {
    pub(crate) data: Vec<u8>,
    pub(crate) resolution: (u32, u32),
}

/**
 * A started V4L2 stream. An rscam handle cannot be started again once it
 * has been stopped, so every mode switch opens a new session.
 */
pub(crate) trait FrameSession {
    fn capture(&mut self) -> io::Result<RawFrame>;
    fn stop(&mut self) -> io::Result<()>;
}

/// Opens the device and starts streaming with the given profile.
pub(crate) type SessionOpener =
    Box<dyn FnMut(CameraMode, &ModeProfile) -> Result<Box<dyn FrameSession>, CameraError>>;

struct RscamSession {
    camera: Camera,
}

impl FrameSession for RscamSession {
    fn capture(&mut self) -> io::Result<RawFrame> {
        // The frame hands its V4L2 buffer back when dropped.
        let frame = self.camera.capture()?;
        Ok(RawFrame {
            data: frame[..].to_vec(),
            resolution: frame.resolution,
        })
    }

    fn stop(&mut self) -> io::Result<()> {
        self.camera.stop()
    }
}

fn _open_rscam_session(
    device_path: &str,
    mode: CameraMode,
    profile: &ModeProfile,
) -> Result<Box<dyn FrameSession>, CameraError> {
    let mut camera = Camera::new(device_path).map_err(|source| CameraError::Open {
        path: device_path.to_string(),
        source,
    })?;
    let config = Config {
        interval: (1, 30),
        resolution: profile.resolution,
        format: &profile.format,
        field: FIELD_NONE,
        nbuffers: 2,
    };
    camera.start(&config).map_err(|e| CameraError::Start {
        mode,
        reason: format!("{} on {}", e, device_path),
    })?;
    debug!(device = %device_path, %mode, "Started V4L2 stream");
    Ok(Box::new(RscamSession { camera }))
}

/**
 * V4L2 camera (Pi camera through the kernel driver, or a USB webcam).
 * RGB3 and YUYV frames are JPEG encoded with turbojpeg; MJPG/JPEG frames
 * are checked and passed through untouched.
 */
pub(crate) struct V4l2Camera {
    open_session: SessionOpener,
    jpeg_quality: i32,
    pending: Option<(CameraMode, ModeProfile)>,
    session: Option<(Box<dyn FrameSession>, FrameFormat)>,
}

impl V4l2Camera {
    pub(crate) fn open(settings: &CameraSettings) -> Result<Self, CameraError> {
        // Fail at startup when the device is missing rather than on first use.
        Camera::new(&settings.device_path).map_err(|source| CameraError::Open {
            path: settings.device_path.clone(),
            source,
        })?;
        info!(device = %settings.device_path, "Opened V4L2 camera");

        let device_path = settings.device_path.clone();
        Ok(Self::with_opener(
            settings.jpeg_quality,
            Box::new(move |mode, profile| _open_rscam_session(&device_path, mode, profile)),
        ))
    }

    pub(crate) fn with_opener(jpeg_quality: i32, open_session: SessionOpener) -> Self {
        Self {
            open_session,
            jpeg_quality,
            pending: None,
            session: None,
        }
    }
}

impl CameraDevice for V4l2Camera {
    fn stop(&mut self) -> Result<(), CameraError> {
        // Dropping the session closes the handle.
        if let Some((mut session, _)) = self.session.take() {
            session.stop().map_err(CameraError::Stop)?;
        }
        Ok(())
    }

    fn configure(&mut self, mode: CameraMode, profile: &ModeProfile) -> Result<(), CameraError> {
        if FrameFormat::from_fourcc(&profile.format).is_none() {
            return Err(CameraError::Configure {
                mode,
                reason: format!(
                    "unsupported pixel format {}",
                    String::from_utf8_lossy(&profile.format)
                ),
            });
        }
        self.pending = Some((mode, profile.clone()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        let (mode, profile) = self.pending.take().ok_or_else(|| CameraError::Start {
            mode: CameraMode::Preview,
            reason: String::from("start called before configure"),
        })?;
        let format =
            FrameFormat::from_fourcc(&profile.format).ok_or_else(|| CameraError::Configure {
                mode,
                reason: String::from("unsupported pixel format"),
            })?;

        let mut session = (self.open_session)(mode, &profile)?;
        for _ in 0..profile.warmup_frames {
            session.capture().map_err(CameraError::Capture)?;
        }
        self.session = Some((session, format));
        Ok(())
    }

    fn capture_jpeg(&mut self) -> Result<Vec<u8>, CameraError> {
        let (session, format) = match self.session.as_mut() {
            Some((session, format)) => (session, *format),
            None => return Err(CameraError::InvalidFrame(String::from("camera not started"))),
        };
        let frame = session.capture().map_err(CameraError::Capture)?;
        let (width, height) = (frame.resolution.0 as usize, frame.resolution.1 as usize);

        match format {
            FrameFormat::Rgb24 => encode_rgb(&frame.data, width, height, self.jpeg_quality),
            FrameFormat::Yuyv => {
                let rgb = yuyv_to_rgb(&frame.data, width, height)?;
                encode_rgb(&rgb, width, height, self.jpeg_quality)
            }
            FrameFormat::Jpeg => {
                check_jpeg(&frame.data)?;
                Ok(frame.data)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameFormat {
    Rgb24,
    Yuyv,
    Jpeg,
}

impl FrameFormat {
    fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" | b"JPEG" => Some(Self::Jpeg),
            _ => None,
        }
    }
}
//////////////////////////// V4L2 Camera End ////////////////////////////

/**
 * Encodes a packed RGB24 image.
 */
pub(crate) fn encode_rgb(
    pixels: &[u8],
    width: usize,
    height: usize,
    quality: i32,
) -> Result<Vec<u8>, CameraError> {
    let pitch = width * PixelFormat::RGB.size();
    if width == 0 || height == 0 || pixels.len() < pitch * height {
        return Err(CameraError::InvalidFrame(format!(
            "{} bytes cannot hold a {}x{} RGB image",
            pixels.len(),
            width,
            height
        )));
    }
    let image = Image {
        pixels: &pixels[..pitch * height],
        width,
        pitch,
        height,
        format: PixelFormat::RGB,
    };
    let jpeg = turbojpeg::compress(image, quality, Subsamp::Sub2x2)
        .map_err(|e| CameraError::Encode(e.to_string()))?;
    Ok(jpeg.to_vec())
}

/**
 * Rejects truncated or corrupt JPEGs. The camera occasionally hands out a
 * malformed MJPG frame.
 */
pub(crate) fn check_jpeg(jpeg: &[u8]) -> Result<(usize, usize), CameraError> {
    let header =
        turbojpeg::read_header(jpeg).map_err(|e| CameraError::InvalidFrame(e.to_string()))?;
    Ok((header.width, header.height))
}

/**
 * YUYV (4:2:2 packed) to RGB24 using BT.601 integer coefficients.
 */
pub(crate) fn yuyv_to_rgb(yuyv: &[u8], width: usize, height: usize) -> Result<Vec<u8>, CameraError> {
    if width % 2 != 0 || yuyv.len() < width * height * 2 {
        return Err(CameraError::InvalidFrame(format!(
            "{} bytes cannot hold a {}x{} YUYV image",
            yuyv.len(),
            width,
            height
        )));
    }
    let mut rgb = Vec::with_capacity(width * height * 3);
    for chunk in yuyv[..width * height * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&_yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&_yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn _yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

//////////////////////////// Synthetic Camera Start ////////////////////////////
/**
 * Hardware free camera for development: a diagonal gradient that drifts a
 * little on every frame, at the configured resolution of each mode.
 */
pub(crate) struct SyntheticCamera {
    jpeg_quality: i32,
    pending: Option<ModeProfile>,
    active: Option<ModeProfile>,
    frame_count: u64,
}

impl SyntheticCamera {
    pub(crate) fn new(settings: &CameraSettings) -> Self {
        Self {
            jpeg_quality: settings.jpeg_quality,
            pending: None,
            active: None,
            frame_count: 0,
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn stop(&mut self) -> Result<(), CameraError> {
        self.active = None;
        Ok(())
    }

    fn configure(&mut self, _mode: CameraMode, profile: &ModeProfile) -> Result<(), CameraError> {
        self.pending = Some(profile.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        self.active = self.pending.take();
        match self.active {
            Some(_) => Ok(()),
            None => Err(CameraError::Start {
                mode: CameraMode::Preview,
                reason: String::from("start called before configure"),
            }),
        }
    }

    fn capture_jpeg(&mut self) -> Result<Vec<u8>, CameraError> {
        let (width, height) = match &self.active {
            Some(profile) => (profile.resolution.0 as usize, profile.resolution.1 as usize),
            None => return Err(CameraError::InvalidFrame(String::from("camera not started"))),
        };
        self.frame_count += 1;
        let shift = (self.frame_count % 256) as usize;

        let mut pixels = vec![0u8; width * height * 3];
        for (y, row) in pixels.chunks_exact_mut(width * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                px[0] = ((x * 255 / width.max(1) + shift) % 256) as u8;
                px[1] = (y * 255 / height.max(1)) as u8;
                px[2] = ((x + y + shift) % 256) as u8;
            }
        }
        encode_rgb(&pixels, width, height, self.jpeg_quality)
    }
}
//////////////////////////// Synthetic Camera End ////////////////////////////

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Stop,
        Configure(CameraMode),
        Start,
        Capture,
    }

    /// Records every call and fails the captures listed in `fail_captures`
    /// (1 based).
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedCamera {
        pub(crate) events: Arc<Mutex<Vec<Event>>>,
        pub(crate) fail_captures: Arc<Mutex<HashSet<usize>>>,
        pub(crate) captures: Arc<AtomicUsize>,
        pub(crate) capture_delay: Duration,
    }

    impl ScriptedCamera {
        pub(crate) fn failing_on(captures: &[usize]) -> Self {
            let camera = Self::default();
            camera.fail_captures.lock().unwrap().extend(captures.iter().copied());
            camera
        }

        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl CameraDevice for ScriptedCamera {
        fn stop(&mut self) -> Result<(), CameraError> {
            self.events.lock().unwrap().push(Event::Stop);
            Ok(())
        }

        fn configure(&mut self, mode: CameraMode, _profile: &ModeProfile) -> Result<(), CameraError> {
            self.events.lock().unwrap().push(Event::Configure(mode));
            Ok(())
        }

        fn start(&mut self) -> Result<(), CameraError> {
            self.events.lock().unwrap().push(Event::Start);
            Ok(())
        }

        fn capture_jpeg(&mut self) -> Result<Vec<u8>, CameraError> {
            self.events.lock().unwrap().push(Event::Capture);
            if !self.capture_delay.is_zero() {
                thread::sleep(self.capture_delay);
            }
            let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_captures.lock().unwrap().contains(&n) {
                return Err(CameraError::Capture(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("scripted failure on capture {}", n),
                )));
            }
            // SOI, a marker byte carrying the capture number, EOI.
            Ok(vec![0xFF, 0xD8, n as u8, 0xFF, 0xD9])
        }
    }

    pub(crate) fn test_settings() -> CameraSettings {
        CameraSettings {
            timeout: Duration::from_secs(2),
            ..CameraSettings::default()
        }
    }
}
