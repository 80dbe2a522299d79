use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::{
    common::{sleep_or_cancel, sleep_until_or_cancel, CameraMode, ServiceContext},
    error::{CaptureError, StorageError, VideoError},
    retry::RetryPolicy,
};

const COUNTER_PREFIX: &str = "img_";
const TIMESTAMP_PREFIX: &str = "timelapse_";
const PHOTO_EXTENSION: &str = ".jpg";
const FRAME_LIST_FILE: &str = ".timelapse_frames.ffconcat";
pub(crate) const VIDEO_FPS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhotoNaming {
    /// `img_001.jpg`, `img_002.jpg`, ... continuing after the highest index on disk.
    Counter,
    /// `timelapse_20240131_235959.jpg`
    Timestamp,
}

//////////////////////////// Photo Store Start ////////////////////////////
/**
 * The output directory and its naming scheme. The next counter index is
 * derived from the files already on disk, so numbering survives restarts.
 */
#[derive(Debug)]
pub(crate) struct PhotoStore {
    dir: PathBuf,
    naming: PhotoNaming,
    next_index: Mutex<u64>,
}

impl PhotoStore {
    pub(crate) fn open(dir: impl Into<PathBuf>, naming: PhotoNaming) -> Result<Self, StorageError> {
        let dir = dir.into();
        _ensure_dir(&dir)?;
        let next_index = _highest_index(&dir)? + 1;
        debug!(dir = %dir.display(), next_index, "Opened photo store");
        Ok(Self {
            dir,
            naming,
            next_index: Mutex::new(next_index),
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /**
     * Writes `jpeg` under the next free name. The file appears under its
     * final name only once fully written, and a failed write does not use up
     * an index.
     */
    pub(crate) fn write(&self, jpeg: &[u8]) -> Result<PathBuf, StorageError> {
        _ensure_dir(&self.dir)?;
        let mut next_index = self.next_index.lock().unwrap();
        let path = match self.naming {
            PhotoNaming::Counter => self.dir.join(counter_file_name(*next_index)),
            PhotoNaming::Timestamp => self.free_timestamp_path(),
        };

        let partial = path.with_extension("jpg.part");
        let written = fs::write(&partial, jpeg).and_then(|_| fs::rename(&partial, &path));
        if let Err(source) = written {
            let _ = fs::remove_file(&partial);
            return Err(StorageError::Write { path, source });
        }

        if self.naming == PhotoNaming::Counter {
            *next_index += 1;
        }
        Ok(path)
    }

    fn free_timestamp_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut path = self.dir.join(format!("{TIMESTAMP_PREFIX}{stamp}{PHOTO_EXTENSION}"));
        let mut n = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{TIMESTAMP_PREFIX}{stamp}_{n}{PHOTO_EXTENSION}"));
            n += 1;
        }
        path
    }

    /// Number of `.jpg` files in the output directory, 0 if it cannot be read.
    pub(crate) fn photo_count(&self) -> usize {
        match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(PHOTO_EXTENSION))
                .count(),
            Err(_) => 0,
        }
    }

    /// Photos of the active naming scheme, in capture order.
    pub(crate) fn photos(&self) -> Result<Vec<PathBuf>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StorageError::Scan {
            path: self.dir.clone(),
            source,
        })?;
        let names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        let mut photos: Vec<PathBuf> = match self.naming {
            PhotoNaming::Counter => {
                let mut indexed: Vec<(u64, String)> = names
                    .into_iter()
                    .filter_map(|n| parse_counter_index(&n).map(|i| (i, n)))
                    .collect();
                indexed.sort();
                indexed.into_iter().map(|(_, n)| self.dir.join(n)).collect()
            }
            PhotoNaming::Timestamp => names
                .into_iter()
                .filter(|n| n.starts_with(TIMESTAMP_PREFIX) && n.ends_with(PHOTO_EXTENSION))
                .map(|n| self.dir.join(n))
                .collect(),
        };
        if self.naming == PhotoNaming::Timestamp {
            photos.sort();
        }
        Ok(photos)
    }
}

pub(crate) fn counter_file_name(index: u64) -> String {
    format!("{COUNTER_PREFIX}{index:03}{PHOTO_EXTENSION}")
}

pub(crate) fn parse_counter_index(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(COUNTER_PREFIX)?
        .strip_suffix(PHOTO_EXTENSION)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn _ensure_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn _highest_index(dir: &Path) -> Result<u64, StorageError> {
    let entries = fs::read_dir(dir).map_err(|source| StorageError::Scan {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(entries
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_counter_index(&e.file_name().to_string_lossy()))
        .max()
        .unwrap_or(0))
}
//////////////////////////// Photo Store End ////////////////////////////

//////////////////////////// Capture Loop Start ////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimelapsePhase {
    Idle,
    /// Waiting for the arbiter to put the camera in still mode.
    Acquiring,
    /// Holding the camera for the exposure.
    Capturing,
    Writing,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseEvent {
    Begin,
    Acquired,
    Captured,
    Written,
    Failed,
    Woke,
    Cancelled,
}

/// Stopped is terminal. Unexpected events leave the phase unchanged.
pub(crate) fn next_phase(phase: TimelapsePhase, event: PhaseEvent) -> TimelapsePhase {
    use PhaseEvent as E;
    use TimelapsePhase as P;

    match (phase, event) {
        (P::Stopped, _) => P::Stopped,
        (_, E::Cancelled) => P::Stopped,
        (P::Idle, E::Begin) => P::Acquiring,
        (P::Acquiring, E::Acquired) => P::Capturing,
        (P::Capturing, E::Captured) => P::Writing,
        (P::Writing, E::Written) => P::Sleeping,
        (P::Acquiring | P::Capturing | P::Writing, E::Failed) => P::Sleeping,
        (P::Sleeping, E::Woke) => P::Idle,
        (phase, _) => phase,
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimelapseStats {
    pub(crate) captured: AtomicU64,
    pub(crate) failed: AtomicU64,
}

pub(crate) struct TimelapseController {
    pub(crate) thread_handle: JoinHandle<()>,
    pub(crate) phase: Arc<Mutex<TimelapsePhase>>,
    pub(crate) stats: Arc<TimelapseStats>,
}

struct TimelapseLoop {
    ctx: Arc<ServiceContext>,
    interval: Duration,
    retry: RetryPolicy,
    phase: Arc<Mutex<TimelapsePhase>>,
    stats: Arc<TimelapseStats>,
}

/**
 * Entry point for the timelapse thread. It photographs every `interval`
 * until the context is cancelled, finishing any capture in progress first.
 */
pub(crate) fn start_timelapse_controller(
    ctx: Arc<ServiceContext>,
    interval: Duration,
    retry: RetryPolicy,
) -> TimelapseController {
    let phase = Arc::new(Mutex::new(TimelapsePhase::Idle));
    let stats = Arc::new(TimelapseStats::default());
    let timelapse = TimelapseLoop {
        ctx,
        interval,
        retry,
        phase: phase.clone(),
        stats: stats.clone(),
    };

    let thread_handle = thread::spawn(move || {
        info!(interval_secs = interval.as_secs_f64(), "Starting timelapse thread");
        timelapse.run();
    });

    TimelapseController {
        thread_handle,
        phase,
        stats,
    }
}

impl TimelapseLoop {
    fn advance(&self, event: PhaseEvent) {
        _advance(&self.phase, event);
    }

    fn run(&self) {
        let cancel = &self.ctx.cancel;
        let mut next_shot = Instant::now();
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            self.advance(PhaseEvent::Begin);
            let cancelled = match self.capture_once() {
                Ok(path) => {
                    failures = 0;
                    self.stats.captured.fetch_add(1, Ordering::Relaxed);
                    info!(path = %path.display(), "Photo taken");

                    let now = Instant::now();
                    while next_shot <= now {
                        next_shot += self.interval;
                    }
                    sleep_until_or_cancel(cancel, next_shot)
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.delay(failures).min(self.interval);
                    failures = failures.saturating_add(1);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Timelapse capture failed");
                    sleep_or_cancel(cancel, delay)
                }
            };
            if cancelled {
                break;
            }
            self.advance(PhaseEvent::Woke);
        }

        self.advance(PhaseEvent::Cancelled);
        info!(
            captured = self.stats.captured.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "Timelapse stopped"
        );
    }

    fn capture_once(&self) -> Result<PathBuf, CaptureError> {
        // A job left over from a timed out call must not move the phase, so
        // only the answered call advances it.
        let jpeg = match self.ctx.arbiter.capture(CameraMode::Still) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                self.advance(PhaseEvent::Failed);
                return Err(e.into());
            }
        };
        self.advance(PhaseEvent::Acquired);
        self.advance(PhaseEvent::Captured);

        match self.ctx.photos.write(&jpeg) {
            Ok(path) => {
                self.advance(PhaseEvent::Written);
                Ok(path)
            }
            Err(e) => {
                self.advance(PhaseEvent::Failed);
                Err(e.into())
            }
        }
    }
}

fn _advance(phase: &Mutex<TimelapsePhase>, event: PhaseEvent) {
    let mut phase = phase.lock().unwrap();
    *phase = next_phase(*phase, event);
}
//////////////////////////// Capture Loop End ////////////////////////////

//////////////////////////// Video Assembly Start ////////////////////////////
/**
 * Turns the captured photos into an H.264 video with an external ffmpeg.
 */
#[derive(Debug, Clone)]
pub(crate) struct VideoAssembler {
    program: String,
    fps: u32,
}

impl Default for VideoAssembler {
    fn default() -> Self {
        Self {
            program: String::from("ffmpeg"),
            fps: VIDEO_FPS,
        }
    }
}

impl VideoAssembler {
    /// Writes `timelapse_video_<timestamp>.mp4` into the store's directory.
    pub(crate) fn assemble(&self, store: &PhotoStore) -> Result<(PathBuf, usize), VideoError> {
        let photos = store
            .photos()
            .map_err(|_| VideoError::NoPhotos(store.dir().to_path_buf()))?;
        if photos.is_empty() {
            return Err(VideoError::NoPhotos(store.dir().to_path_buf()));
        }

        let photos: Vec<PathBuf> = photos
            .into_iter()
            .map(|p| fs::canonicalize(&p).unwrap_or(p))
            .collect();
        let list_path = store.dir().join(FRAME_LIST_FILE);
        fs::write(&list_path, ffconcat_list(&photos, self.fps)).map_err(VideoError::FrameList)?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let video_path = store.dir().join(format!("timelapse_video_{stamp}.mp4"));
        info!(photos = photos.len(), video = %video_path.display(), "Creating video");

        let status = Command::new(&self.program)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .arg("-r")
            .arg(self.fps.to_string())
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(&video_path)
            .stdin(Stdio::null())
            .status();
        let _ = fs::remove_file(&list_path);

        let status = status.map_err(VideoError::Spawn)?;
        if !status.success() {
            return Err(VideoError::Failed(status));
        }
        Ok((video_path, photos.len()))
    }
}

/**
 * ffconcat script showing each photo for one frame. The concat demuxer
 * ignores the duration of the last entry, so the last photo is listed twice.
 */
pub(crate) fn ffconcat_list(photos: &[PathBuf], fps: u32) -> String {
    let duration = 1.0 / fps.max(1) as f64;
    let mut list = String::from("ffconcat version 1.0\n");
    for photo in photos {
        list.push_str(&format!("file '{}'\n", _quote(photo)));
        list.push_str(&format!("duration {duration:.6}\n"));
    }
    if let Some(last) = photos.last() {
        list.push_str(&format!("file '{}'\n", _quote(last)));
    }
    list
}

fn _quote(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}
//////////////////////////// Video Assembly End ////////////////////////////
