use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::common::CameraMode;

#[derive(Debug, Error)]
pub(crate) enum CameraError {
    #[error("could not open camera {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("could not configure camera for {mode}: {reason}")]
    Configure { mode: CameraMode, reason: String },
    #[error("could not start camera in {mode}: {reason}")]
    Start { mode: CameraMode, reason: String },
    #[error("could not stop camera: {0}")]
    Stop(io::Error),
    #[error("frame capture failed: {0}")]
    Capture(io::Error),
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
    #[error("camera returned an unusable frame: {0}")]
    InvalidFrame(String),
    #[error("camera call did not finish within {0:?}")]
    Timeout(Duration),
    #[error("camera job panicked in the driver or the job body")]
    Panicked,
    #[error("camera worker is gone")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub(crate) enum SensorError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),
    #[error("sensor did not answer the start signal")]
    NoResponse,
    #[error("sensor timing lost after {0} of 40 bits")]
    Timing(usize),
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("sensor read failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<SensorError>,
    },
}

#[derive(Debug, Error)]
pub(crate) enum StorageError {
    #[error("could not create output directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("could not write photo {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("could not scan output directory {path}: {source}")]
    Scan { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub(crate) enum DisplayError {
    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),
}

#[derive(Debug, Error)]
pub(crate) enum VideoError {
    #[error("no photos found in {0}")]
    NoPhotos(PathBuf),
    #[error("could not prepare frame list: {0}")]
    FrameList(io::Error),
    #[error("could not run ffmpeg: {0}")]
    Spawn(io::Error),
    #[error("ffmpeg exited with {0}")]
    Failed(std::process::ExitStatus),
}

/// Errors a single timelapse iteration can hit. Neither kind stops the loop.
#[derive(Debug, Error)]
pub(crate) enum CaptureError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
