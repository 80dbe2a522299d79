use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use crate::{
    camera_controller::CameraArbiter, timelapse_controller::PhotoStore, user_config::Settings,
};

pub(crate) const MEASUREMENT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CameraMode {
    /// Low resolution, continuous frames for the live view.
    Preview,
    /// High resolution single shots for the timelapse.
    Still,
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraMode::Preview => f.write_str("preview"),
            CameraMode::Still => f.write_str("still"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Measurement {
    pub(crate) timestamp: DateTime<Local>,
    pub(crate) temperature: f64,
    pub(crate) humidity: f64,
}

impl Measurement {
    pub(crate) fn now(temperature: f64, humidity: f64) -> Self {
        Self {
            timestamp: Local::now(),
            temperature,
            humidity,
        }
    }

    /// Zero reading recorded in place of a failed sensor read, so the
    /// sampling cadence stays fixed.
    pub(crate) fn sentinel() -> Self {
        Self::now(0.0, 0.0)
    }

    pub(crate) fn clock_label(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/**
 * Fixed capacity FIFO of recent sensor readings. Pushing into a full buffer
 * evicts the oldest reading. Readers always get a copy.
 */
#[derive(Debug)]
pub(crate) struct MeasurementBuffer {
    entries: Mutex<VecDeque<Measurement>>,
    capacity: usize,
}

impl MeasurementBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends `measurement`, returning the evicted reading if the buffer was full.
    pub(crate) fn push(&self, measurement: Measurement) -> Option<Measurement> {
        if self.capacity == 0 {
            return Some(measurement);
        }
        let mut entries = self.entries.lock().unwrap();
        let evicted = if entries.len() == self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(measurement);
        evicted
    }

    /// Oldest first.
    pub(crate) fn snapshot(&self) -> Vec<Measurement> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn latest(&self) -> Option<Measurement> {
        self.entries.lock().unwrap().back().cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/**
 * Everything the background loops and HTTP handlers share. Built once in
 * main and handed to each loop behind an Arc.
 */
pub(crate) struct ServiceContext {
    pub(crate) settings: Settings,
    pub(crate) arbiter: CameraArbiter,
    pub(crate) measurements: MeasurementBuffer,
    pub(crate) photos: PhotoStore,
    pub(crate) cancel: CancellationToken,
}

impl ServiceContext {
    pub(crate) fn new(
        settings: Settings,
        arbiter: CameraArbiter,
        photos: PhotoStore,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let history = settings.monitor.history;
        Arc::new(Self {
            settings,
            arbiter,
            measurements: MeasurementBuffer::with_capacity(history),
            photos,
            cancel,
        })
    }
}

/**
 * Sleeps for `duration` unless `cancel` fires first. Threads park while
 * waiting; main unparks them on shutdown so they notice promptly.
 * Returns true if cancelled.
 */
pub(crate) fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    sleep_until_or_cancel(cancel, Instant::now() + duration)
}

pub(crate) fn sleep_until_or_cancel(cancel: &CancellationToken, deadline: Instant) -> bool {
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        // Cap each park so a missed unpark only delays shutdown slightly.
        thread::park_timeout((deadline - now).min(Duration::from_millis(250)));
    }
}
