mod camera_controller;
mod common;
mod display_controller;
mod error;
mod preview_controller;
mod retry;
mod sensor_controller;
mod timelapse_controller;
mod user_config;
mod web_server;

use std::{
    net::SocketAddr, path::PathBuf, sync::atomic::Ordering, thread::JoinHandle, time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    camera_controller::{CameraArbiter, CameraDevice, SyntheticCamera, V4l2Camera},
    common::{CameraMode, ServiceContext},
    display_controller::{start_display_controller, DisplaySink, Lcd1602, LogDisplay},
    error::CameraError,
    preview_controller::{start_preview_controller, PreviewHub, FRAME_INTERVAL},
    retry::RetryPolicy,
    sensor_controller::{start_sensor_poller, Dht11, Sensor, SyntheticSensor},
    timelapse_controller::{
        start_timelapse_controller, PhotoNaming, PhotoStore, TimelapseController, VideoAssembler,
    },
    user_config::{Settings, DEFAULT_CONFIG_PATH},
    web_server::Dashboard,
};

/// Frames a slow preview viewer may fall behind before it starts skipping.
const PREVIEW_BACKLOG: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "pi-timelapse", version, about = "Raspberry Pi camera timelapse with a live preview")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding camera.json and monitor.json
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config_dir: PathBuf,

    /// Use a synthetic camera and sensor instead of the hardware
    #[arg(long, global = true)]
    test_source: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Live preview server, with the timelapse sharing the camera
    Serve(RunArgs),
    /// Headless timelapse capture
    Timelapse(RunArgs),
    /// Preview, timelapse, sensor history and status display
    Monitor(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Output directory for photos [default: timelapse, or timelapse_nowy for monitor]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds between photos
    #[arg(short, long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Address the web server listens on
    #[arg(long, default_value = "0.0.0.0:5000")]
    bind: SocketAddr,

    /// Photo file naming
    #[arg(long, value_enum, default_value_t = NamingArg::Counter)]
    naming: NamingArg,

    /// Assemble the photos into a video after stopping
    #[arg(long)]
    video: bool,

    /// Do not run the status display
    #[arg(long)]
    no_display: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum NamingArg {
    /// img_001.jpg, img_002.jpg, ...
    Counter,
    /// timelapse_YYYYMMDD_HHMMSS.jpg
    Timestamp,
}

impl From<NamingArg> for PhotoNaming {
    fn from(naming: NamingArg) -> Self {
        match naming {
            NamingArg::Counter => PhotoNaming::Counter,
            NamingArg::Timestamp => PhotoNaming::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Serve,
    Timelapse,
    Monitor,
}

impl RunMode {
    fn default_output(self) -> &'static str {
        match self {
            RunMode::Serve | RunMode::Timelapse => "timelapse",
            RunMode::Monitor => "timelapse_nowy",
        }
    }

    fn initial_camera_mode(self) -> CameraMode {
        match self {
            RunMode::Timelapse => CameraMode::Still,
            RunMode::Serve | RunMode::Monitor => CameraMode::Preview,
        }
    }

    fn dashboard(self) -> Option<Dashboard> {
        match self {
            RunMode::Serve => Some(Dashboard::Preview),
            RunMode::Monitor => Some(Dashboard::Monitor),
            RunMode::Timelapse => None,
        }
    }
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pi_timelapse=info".parse()?))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let (mode, args) = match cli.command {
        Command::Serve(args) => (RunMode::Serve, args),
        Command::Timelapse(args) => (RunMode::Timelapse, args),
        Command::Monitor(args) => (RunMode::Monitor, args),
    };
    let settings = Settings::read(&cli.config_dir)
        .with_context(|| format!("Failed to load config from {}", cli.config_dir.display()))?;

    run(mode, args, settings, cli.test_source).await
}

async fn run(mode: RunMode, args: RunArgs, settings: Settings, test_source: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(mode.default_output()));
    info!(?mode, output = %output.display(), interval_secs = args.interval, "Starting");

    let camera_settings = settings.camera.clone();
    let arbiter = CameraArbiter::spawn_with(
        move || -> Result<Box<dyn CameraDevice>, CameraError> {
            if test_source {
                Ok(Box::new(SyntheticCamera::new(&camera_settings)))
            } else {
                Ok(Box::new(V4l2Camera::open(&camera_settings)?))
            }
        },
        settings.camera.clone(),
        mode.initial_camera_mode(),
    )
    .context("Failed to start camera")?;

    let photos = PhotoStore::open(&output, args.naming.into())
        .with_context(|| format!("Failed to prepare output directory {}", output.display()))?;
    let ctx = ServiceContext::new(settings, arbiter, photos, cancel.clone());

    let sensor = match mode {
        RunMode::Monitor => Some(_open_sensor(&ctx, test_source)?),
        RunMode::Serve | RunMode::Timelapse => None,
    };

    let timelapse = start_timelapse_controller(
        ctx.clone(),
        Duration::from_secs(args.interval),
        RetryPolicy::capture(),
    );
    let mut thread_handles = Vec::new();

    if let Some(sensor) = sensor {
        thread_handles.push(start_sensor_poller(ctx.clone(), sensor, RetryPolicy::sensor()));
        if !args.no_display {
            let sink = _open_display(&ctx, test_source);
            thread_handles.push(start_display_controller(ctx.clone(), sink));
        }
    }

    let server = match mode.dashboard() {
        Some(dashboard) => {
            let hub = PreviewHub::new(PREVIEW_BACKLOG);
            thread_handles.push(start_preview_controller(
                ctx.clone(),
                hub.clone(),
                FRAME_INTERVAL,
                RetryPolicy::preview(),
            ));
            let app = web_server::router(ctx.clone(), hub, dashboard);
            let bind = args.bind;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                let result = web_server::serve(app, bind, cancel.clone()).await;
                // Take everything else down with the server.
                cancel.cancel();
                result
            }))
        }
        None => None,
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received, shutting down");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let server_result = match server {
        Some(task) => task.await.context("Web server task panicked")?,
        None => Ok(()),
    };

    let shutdown_ctx = ctx.clone();
    let video = args.video;
    tokio::task::spawn_blocking(move || {
        _shutdown(&shutdown_ctx, timelapse, thread_handles, video);
    })
    .await
    .context("Shutdown failed")?;

    server_result
}

fn _open_sensor(ctx: &ServiceContext, test_source: bool) -> Result<Box<dyn Sensor>> {
    if test_source {
        return Ok(Box::new(SyntheticSensor::new()));
    }
    let pin = ctx.settings.monitor.sensor_pin;
    let sensor = Dht11::open(pin).with_context(|| format!("Failed to open DHT11 on GPIO {}", pin))?;
    info!(pin, "Opened DHT11 sensor");
    Ok(Box::new(sensor))
}

fn _open_display(ctx: &ServiceContext, test_source: bool) -> Box<dyn DisplaySink> {
    if test_source {
        return Box::new(LogDisplay);
    }
    let monitor = &ctx.settings.monitor;
    match Lcd1602::open(monitor.lcd_bus, monitor.lcd_address) {
        Ok(lcd) => {
            info!(bus = monitor.lcd_bus, address = monitor.lcd_address, "Opened LCD");
            Box::new(lcd)
        }
        Err(e) => {
            warn!(error = %e, "LCD not available, logging status instead");
            Box::new(LogDisplay)
        }
    }
}

/**
 * Wakes and joins every worker, releases the camera, then runs video
 * assembly once if it was asked for.
 */
fn _shutdown(
    ctx: &ServiceContext,
    timelapse: TimelapseController,
    thread_handles: Vec<JoinHandle<()>>,
    video: bool,
) {
    timelapse.thread_handle.thread().unpark();
    for handle in &thread_handles {
        handle.thread().unpark();
    }

    if timelapse.thread_handle.join().is_err() {
        error!("Timelapse thread panicked");
    }
    for handle in thread_handles {
        let name = handle.thread().name().map(String::from);
        if handle.join().is_err() {
            error!(thread = ?name, "Worker thread panicked");
        }
    }

    let stats = &timelapse.stats;
    info!(
        captured = stats.captured.load(Ordering::Relaxed),
        failed = stats.failed.load(Ordering::Relaxed),
        phase = ?*timelapse.phase.lock().unwrap(),
        "Timelapse finished"
    );
    if ctx.measurements.len() > 0 {
        info!(
            buffered = ctx.measurements.len(),
            capacity = ctx.measurements.capacity(),
            "Sensor history at shutdown"
        );
    }

    match ctx.arbiter.release() {
        Ok(()) => info!(
            state = ?ctx.arbiter.state(),
            mode_switches = ctx.arbiter.mode_switches(),
            "Camera released"
        ),
        Err(e) => warn!(error = %e, "Failed to release camera"),
    }

    if video {
        match VideoAssembler::default().assemble(&ctx.photos) {
            Ok((path, frames)) => info!(video = %path.display(), frames, "Video created"),
            Err(e) => error!(error = %e, "Video assembly failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_per_mode() {
        let cli = Cli::try_parse_from(["pi-timelapse", "monitor"]).unwrap();
        let Command::Monitor(args) = cli.command else {
            panic!("expected monitor");
        };
        assert_eq!(args.output, None);
        assert_eq!(args.interval, 60);
        assert_eq!(args.bind, "0.0.0.0:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(args.naming, NamingArg::Counter);
        assert_eq!(RunMode::Monitor.default_output(), "timelapse_nowy");
        assert_eq!(RunMode::Serve.default_output(), "timelapse");
        assert_eq!(cli.config_dir, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "pi-timelapse",
            "timelapse",
            "-o",
            "shots",
            "-i",
            "5",
            "--naming",
            "timestamp",
            "--video",
            "--test-source",
        ])
        .unwrap();
        assert!(cli.test_source);
        let Command::Timelapse(args) = cli.command else {
            panic!("expected timelapse");
        };
        assert_eq!(args.output, Some(PathBuf::from("shots")));
        assert_eq!(args.interval, 5);
        assert_eq!(PhotoNaming::from(args.naming), PhotoNaming::Timestamp);
        assert!(args.video);
    }

    #[test]
    fn interval_must_be_positive() {
        assert!(Cli::try_parse_from(["pi-timelapse", "serve", "-i", "0"]).is_err());
    }

    #[test]
    fn timelapse_starts_camera_in_still_mode() {
        assert_eq!(RunMode::Timelapse.initial_camera_mode(), CameraMode::Still);
        assert_eq!(RunMode::Serve.initial_camera_mode(), CameraMode::Preview);
        assert_eq!(RunMode::Timelapse.dashboard(), None);
        assert_eq!(RunMode::Monitor.dashboard(), Some(Dashboard::Monitor));
    }
}
