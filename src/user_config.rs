use std::{fs::read_to_string, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use json::JsonValue;

use crate::common::{CameraMode, MEASUREMENT_HISTORY};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "./config";
const CAMERA_FILE: &str = "camera.json";
const MONITOR_FILE: &str = "monitor.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ModeProfile {
    pub(crate) resolution: (u32, u32), // (width, height)
    /// V4L2 fourcc, e.g. `RGB3` or `MJPG`.
    pub(crate) format: [u8; 4],
    /// Frames thrown away after switching into this mode so exposure can settle.
    pub(crate) warmup_frames: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CameraSettings {
    pub(crate) device_path: String,
    pub(crate) preview: ModeProfile,
    pub(crate) still: ModeProfile,
    pub(crate) jpeg_quality: i32,
    pub(crate) timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MonitorSettings {
    pub(crate) sensor_pin: u8,
    pub(crate) lcd_bus: u8,
    pub(crate) lcd_address: u16,
    pub(crate) poll_period: Duration,
    pub(crate) display_period: Duration,
    pub(crate) history: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Settings {
    pub(crate) camera: CameraSettings,
    pub(crate) monitor: MonitorSettings,
}

///////////////////
// Implementations
///////////////////
impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_path: String::from("/dev/video0"),
            preview: ModeProfile {
                resolution: (800, 600),
                format: *b"RGB3",
                warmup_frames: 0,
            },
            still: ModeProfile {
                resolution: (2304, 1296),
                format: *b"MJPG",
                warmup_frames: 2,
            },
            jpeg_quality: 85,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sensor_pin: 4,
            lcd_bus: 1,
            lcd_address: 0x27,
            poll_period: Duration::from_secs(2),
            display_period: Duration::from_secs(3),
            history: MEASUREMENT_HISTORY,
        }
    }
}

impl CameraSettings {
    pub(crate) fn profile(&self, mode: CameraMode) -> &ModeProfile {
        match mode {
            CameraMode::Preview => &self.preview,
            CameraMode::Still => &self.still,
        }
    }

    fn apply_json(&mut self, camera_json: &JsonValue) -> Result<()> {
        if let Some(device) = camera_json["device"].as_str() {
            self.device_path = String::from(device.trim());
        }
        ModeProfile::apply_json(&mut self.preview, &camera_json["preview"])
            .context("invalid \"preview\" section")?;
        ModeProfile::apply_json(&mut self.still, &camera_json["still"])
            .context("invalid \"still\" section")?;
        if let Some(quality) = camera_json["jpeg_quality"].as_i32() {
            if !(1..=100).contains(&quality) {
                bail!("jpeg_quality must be within 1..=100, got {}", quality);
            }
            self.jpeg_quality = quality;
        }
        if let Some(ms) = camera_json["timeout_ms"].as_u64() {
            if ms == 0 {
                bail!("timeout_ms must be positive");
            }
            self.timeout = Duration::from_millis(ms);
        }
        Ok(())
    }
}

impl ModeProfile {
    fn apply_json(&mut self, mode_json: &JsonValue) -> Result<()> {
        if mode_json.is_null() {
            return Ok(());
        }
        if let Some(width) = mode_json["width"].as_u32() {
            self.resolution.0 = width;
        }
        if let Some(height) = mode_json["height"].as_u32() {
            self.resolution.1 = height;
        }
        if let Some(format) = mode_json["format"].as_str() {
            self.format = _parse_fourcc(format)?;
        }
        if let Some(warmup) = mode_json["warmup_frames"].as_u32() {
            self.warmup_frames = warmup;
        }
        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            bail!("resolution must be non-zero, got {:?}", self.resolution);
        }
        Ok(())
    }
}

impl MonitorSettings {
    fn apply_json(&mut self, monitor_json: &JsonValue) -> Result<()> {
        if let Some(pin) = monitor_json["sensor_pin"].as_u8() {
            self.sensor_pin = pin;
        }
        if let Some(bus) = monitor_json["lcd_bus"].as_u8() {
            self.lcd_bus = bus;
        }
        if let Some(address) = monitor_json["lcd_address"].as_u16() {
            self.lcd_address = address;
        }
        if let Some(secs) = monitor_json["poll_secs"].as_f64() {
            self.poll_period = _positive_secs(secs, "poll_secs")?;
        }
        if let Some(secs) = monitor_json["display_secs"].as_f64() {
            self.display_period = _positive_secs(secs, "display_secs")?;
        }
        if let Some(history) = monitor_json["history"].as_usize() {
            if history == 0 {
                bail!("history must be at least 1");
            }
            self.history = history;
        }
        Ok(())
    }
}

impl Settings {
    /**
     * Reads camera.json and monitor.json from `config_dir`. Either file may
     * be missing, in which case the defaults stand.
     */
    pub(crate) fn read(config_dir: &Path) -> Result<Self> {
        let camera_txt = _read_optional(&config_dir.join(CAMERA_FILE))?;
        let monitor_txt = _read_optional(&config_dir.join(MONITOR_FILE))?;
        Self::parse(camera_txt.as_deref(), monitor_txt.as_deref())
    }

    pub(crate) fn parse(camera_txt: Option<&str>, monitor_txt: Option<&str>) -> Result<Self> {
        let mut settings = Settings::default();
        if let Some(txt) = camera_txt {
            let camera_json =
                json::parse(txt).with_context(|| format!("could not parse {} as JSON", CAMERA_FILE))?;
            settings.camera.apply_json(&camera_json).context(CAMERA_FILE)?;
        }
        if let Some(txt) = monitor_txt {
            let monitor_json = json::parse(txt)
                .with_context(|| format!("could not parse {} as JSON", MONITOR_FILE))?;
            settings.monitor.apply_json(&monitor_json).context(MONITOR_FILE)?;
        }
        Ok(settings)
    }
}

fn _read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    read_to_string(path)
        .map(Some)
        .with_context(|| format!("could not read {}", path.display()))
}

fn _parse_fourcc(format: &str) -> Result<[u8; 4]> {
    let bytes = format.trim().as_bytes();
    if bytes.len() != 4 {
        bail!("format must be a four character code, got '{}'", format);
    }
    let mut fourcc = [0u8; 4];
    fourcc.copy_from_slice(bytes);
    Ok(fourcc)
}

fn _positive_secs(secs: f64, name: &str) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("{} must be a positive number of seconds, got {}", name, secs);
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_mean_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::read(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.camera.preview.resolution, (800, 600));
        assert_eq!(settings.camera.still.resolution, (2304, 1296));
        assert_eq!(settings.monitor.history, 100);
    }

    #[test]
    fn camera_file_overrides_defaults() {
        let camera = r#"{
            "device": "/dev/video2",
            "preview": { "width": 640, "height": 480, "format": "YUYV" },
            "still": { "warmup_frames": 5 },
            "jpeg_quality": 70,
            "timeout_ms": 2500
        }"#;
        let settings = Settings::parse(Some(camera), None).unwrap();
        assert_eq!(settings.camera.device_path, "/dev/video2");
        assert_eq!(settings.camera.preview.resolution, (640, 480));
        assert_eq!(&settings.camera.preview.format, b"YUYV");
        assert_eq!(settings.camera.still.resolution, (2304, 1296));
        assert_eq!(settings.camera.still.warmup_frames, 5);
        assert_eq!(settings.camera.jpeg_quality, 70);
        assert_eq!(settings.camera.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn monitor_file_overrides_defaults() {
        let monitor = r#"{ "sensor_pin": 17, "lcd_address": 63, "poll_secs": 0.5, "history": 10 }"#;
        let settings = Settings::parse(None, Some(monitor)).unwrap();
        assert_eq!(settings.monitor.sensor_pin, 17);
        assert_eq!(settings.monitor.lcd_address, 0x3f);
        assert_eq!(settings.monitor.poll_period, Duration::from_millis(500));
        assert_eq!(settings.monitor.display_period, Duration::from_secs(3));
        assert_eq!(settings.monitor.history, 10);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Settings::parse(Some("{ not json"), None).is_err());
        assert!(Settings::parse(Some(r#"{ "jpeg_quality": 0 }"#), None).is_err());
        assert!(Settings::parse(Some(r#"{ "timeout_ms": 0 }"#), None).is_err());
        assert!(Settings::parse(Some(r#"{ "still": { "format": "JPEG2" } }"#), None).is_err());
        assert!(Settings::parse(None, Some(r#"{ "poll_secs": -1 }"#)).is_err());
        assert!(Settings::parse(None, Some(r#"{ "history": 0 }"#)).is_err());
    }

    #[test]
    fn reads_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CAMERA_FILE), r#"{ "device": "/dev/video9" }"#).unwrap();
        let settings = Settings::read(dir.path()).unwrap();
        assert_eq!(settings.camera.device_path, "/dev/video9");
    }
}
