use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    common::{sleep_or_cancel, CameraMode, ServiceContext},
    retry::RetryPolicy,
};

pub(crate) const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub(crate) const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const IDLE_CHECK: Duration = Duration::from_secs(1);

/// Wraps one JPEG in the multipart framing used by `/video_feed`.
pub(crate) fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    part.put_slice(PART_HEADER);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/**
 * Fan-out point between the single preview capture loop and any number of
 * HTTP viewers. Viewers that fall behind skip frames rather than slowing
 * the camera down.
 */
pub(crate) struct PreviewHub {
    frames: broadcast::Sender<Bytes>,
    /// Unparked when the first viewer arrives.
    broadcaster: OnceLock<thread::Thread>,
    published: AtomicU64,
}

impl PreviewHub {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        let (frames, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            frames,
            broadcaster: OnceLock::new(),
            published: AtomicU64::new(0),
        })
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        let rx = self.frames.subscribe();
        if let Some(broadcaster) = self.broadcaster.get() {
            broadcaster.unpark();
        }
        rx
    }

    pub(crate) fn viewer_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Returns how many viewers the part was queued for.
    pub(crate) fn publish(&self, part: Bytes) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.frames.send(part).unwrap_or(0)
    }

    pub(crate) fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/**
 * Entry point for the preview thread. While anyone is watching it grabs a
 * preview frame through the arbiter every `frame_interval` and publishes
 * it on the hub. With no viewers the camera is left alone.
 */
pub(crate) fn start_preview_controller(
    ctx: Arc<ServiceContext>,
    hub: Arc<PreviewHub>,
    frame_interval: Duration,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("Starting preview thread");
        _main_preview_loop(&ctx, &hub, frame_interval, retry);
        info!(frames = hub.published(), "Preview stopped");
    })
}

fn _main_preview_loop(
    ctx: &ServiceContext,
    hub: &PreviewHub,
    frame_interval: Duration,
    retry: RetryPolicy,
) {
    // A viewer arriving before this is set is picked up by the idle poll.
    let _ = hub.broadcaster.set(thread::current());
    let cancel = &ctx.cancel;
    let mut failures: u32 = 0;

    while !cancel.is_cancelled() {
        if hub.viewer_count() == 0 {
            // subscribe() unparks us.
            thread::park_timeout(IDLE_CHECK);
            continue;
        }

        let cancelled = match ctx.arbiter.capture(CameraMode::Preview) {
            Ok(jpeg) => {
                failures = 0;
                let viewers = hub.publish(multipart_part(&jpeg));
                debug!(bytes = jpeg.len(), viewers, "Published preview frame");
                sleep_or_cancel(cancel, frame_interval)
            }
            Err(e) => {
                let delay = retry.delay(failures);
                failures = failures.saturating_add(1);
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Preview frame failed");
                sleep_or_cancel(cancel, delay)
            }
        };
        if cancelled {
            break;
        }
    }
}

/**
 * Body of one `/video_feed` response: the hub's parts until the viewer
 * disconnects (the stream is dropped) or the service shuts down.
 */
pub(crate) fn frame_stream(
    rx: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures_util::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                received = rx.recv() => received,
            };
            match received {
                Ok(part) => return Some((Ok(part), (rx, cancel))),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Preview viewer lagging, skipping frames");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
