use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rppal::gpio::{Gpio, IoPin, Level, Mode};
use tracing::{debug, info, warn};

use crate::{
    common::{sleep_or_cancel, sleep_until_or_cancel, Measurement, ServiceContext},
    error::SensorError,
    retry::RetryPolicy,
};

/// Temperature (°C) and relative humidity (%).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Reading {
    pub(crate) temperature: f64,
    pub(crate) humidity: f64,
}

pub(crate) trait Sensor: Send {
    /// One attempt. Retrying is up to the caller.
    fn read(&mut self) -> Result<Reading, SensorError>;
}

//////// DHT11 Start ////////

const START_SIGNAL: Duration = Duration::from_millis(18);
const RESPONSE_TIMEOUT: Duration = Duration::from_micros(200);
const BIT_TIMEOUT: Duration = Duration::from_micros(120);
/// A '0' bit holds the line high for ~27µs, a '1' for ~70µs.
const ONE_THRESHOLD: Duration = Duration::from_micros(48);
const FRAME_BITS: usize = 40;

/**
 * DHT11 on a single GPIO line. The protocol is timed from userspace by
 * busy-waiting on the pin level, so individual reads fail now and then
 * when the scheduler gets in the way.
 */
pub(crate) struct Dht11 {
    pin: IoPin,
}

impl Dht11 {
    pub(crate) fn open(bcm_pin: u8) -> Result<Self, SensorError> {
        let pin = Gpio::new()?.get(bcm_pin)?.into_io(Mode::Output);
        let mut sensor = Self { pin };
        sensor.pin.set_high();
        Ok(sensor)
    }

    fn read_frame(&mut self) -> Result<[u8; 5], SensorError> {
        self.pin.set_mode(Mode::Output);
        self.pin.set_low();
        thread::sleep(START_SIGNAL);
        self.pin.set_high();
        self.pin.set_mode(Mode::Input);

        // Sensor answers with ~80µs low then ~80µs high.
        _wait_while(&self.pin, Level::High, RESPONSE_TIMEOUT).ok_or(SensorError::NoResponse)?;
        _wait_while(&self.pin, Level::Low, RESPONSE_TIMEOUT).ok_or(SensorError::NoResponse)?;
        _wait_while(&self.pin, Level::High, RESPONSE_TIMEOUT).ok_or(SensorError::NoResponse)?;

        let mut highs = Vec::with_capacity(FRAME_BITS);
        for bit in 0..FRAME_BITS {
            _wait_while(&self.pin, Level::Low, BIT_TIMEOUT).ok_or(SensorError::Timing(bit))?;
            let high = _wait_while(&self.pin, Level::High, BIT_TIMEOUT)
                .ok_or(SensorError::Timing(bit))?;
            highs.push(high);
        }
        decode_pulses(&highs)
    }
}

impl Sensor for Dht11 {
    fn read(&mut self) -> Result<Reading, SensorError> {
        let frame = self.read_frame()?;
        parse_frame(frame)
    }
}

fn _wait_while(pin: &IoPin, level: Level, timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    while pin.read() == level {
        if start.elapsed() > timeout {
            return None;
        }
    }
    Some(start.elapsed())
}

/// Turns the 40 measured high-pulse widths into the five frame bytes, MSB first.
pub(crate) fn decode_pulses(highs: &[Duration]) -> Result<[u8; 5], SensorError> {
    if highs.len() < FRAME_BITS {
        return Err(SensorError::Timing(highs.len()));
    }
    let mut frame = [0u8; 5];
    for (i, high) in highs.iter().take(FRAME_BITS).enumerate() {
        frame[i / 8] <<= 1;
        if *high > ONE_THRESHOLD {
            frame[i / 8] |= 1;
        }
    }
    Ok(frame)
}

/**
 * Frame layout: humidity integral, humidity decimal, temperature integral,
 * temperature decimal (bit 7 set for below zero), checksum of the first four.
 */
pub(crate) fn parse_frame(frame: [u8; 5]) -> Result<Reading, SensorError> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        return Err(SensorError::Checksum {
            expected: sum,
            actual: frame[4],
        });
    }
    let humidity = frame[0] as f64 + frame[1] as f64 / 10.0;
    let mut temperature = frame[2] as f64 + (frame[3] & 0x7f) as f64 / 10.0;
    if frame[3] & 0x80 != 0 {
        temperature = -temperature;
    }
    Ok(Reading {
        temperature,
        humidity,
    })
}

//////// DHT11 End ////////

/// Slowly drifting values for running without hardware.
pub(crate) struct SyntheticSensor {
    started: Instant,
}

impl SyntheticSensor {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Sensor for SyntheticSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        let t = self.started.elapsed().as_secs_f64();
        let temperature = 21.0 + 2.0 * (t / 60.0).sin();
        let humidity = 45.0 + 5.0 * (t / 90.0).cos();
        // One decimal, like the real sensor.
        Ok(Reading {
            temperature: (temperature * 10.0).round() / 10.0,
            humidity: (humidity * 10.0).round() / 10.0,
        })
    }
}

/**
 * One poll: up to `retry.max_attempts` reads. A sensor that keeps failing
 * yields the zero sentinel, so the caller always has something to record.
 */
pub(crate) fn read_measurement(
    sensor: &mut dyn Sensor,
    retry: &RetryPolicy,
    pause: impl FnMut(Duration),
) -> Measurement {
    let result = retry
        .run(|_| sensor.read(), pause)
        .map_err(|(attempts, last)| SensorError::Exhausted {
            attempts,
            last: Box::new(last),
        });
    match result {
        Ok(reading) => Measurement::now(reading.temperature, reading.humidity),
        Err(e) => {
            warn!(error = %e, "Sensor read failed, recording zero reading");
            Measurement::sentinel()
        }
    }
}

/**
 * Entry point for the sensor thread. Every `poll_period` it appends one
 * measurement to the context's buffer. The schedule is anchored to the
 * start time; a slow read shortens the following pause instead of
 * pushing every later sample back.
 */
pub(crate) fn start_sensor_poller(
    ctx: Arc<ServiceContext>,
    mut sensor: Box<dyn Sensor>,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("Starting sensor poller");
        let period = ctx.settings.monitor.poll_period;
        let cancel = &ctx.cancel;
        let mut next_poll = Instant::now();
        let mut samples: u64 = 0;

        while !cancel.is_cancelled() {
            let measurement = read_measurement(sensor.as_mut(), &retry, |delay| {
                sleep_or_cancel(cancel, delay);
            });
            debug!(
                temperature = measurement.temperature,
                humidity = measurement.humidity,
                "Recorded measurement"
            );
            ctx.measurements.push(measurement);
            samples += 1;

            next_poll += period;
            let now = Instant::now();
            if next_poll < now {
                next_poll = now;
            }
            if sleep_until_or_cancel(cancel, next_poll) {
                break;
            }
        }
        info!(samples, "Sensor poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        camera_controller::{
            testing::{test_settings, ScriptedCamera},
            CameraArbiter,
        },
        common::CameraMode,
        timelapse_controller::{PhotoNaming, PhotoStore},
        user_config::Settings,
    };

    /// Plays back a fixed list of results, then keeps failing.
    struct ScriptedSensor {
        results: VecDeque<Result<Reading, SensorError>>,
        reads: usize,
    }

    impl ScriptedSensor {
        fn new(results: Vec<Result<Reading, SensorError>>) -> Self {
            Self {
                results: results.into(),
                reads: 0,
            }
        }
    }

    impl Sensor for ScriptedSensor {
        fn read(&mut self) -> Result<Reading, SensorError> {
            self.reads += 1;
            self.results.pop_front().unwrap_or(Err(SensorError::NoResponse))
        }
    }

    fn reading(temperature: f64, humidity: f64) -> Reading {
        Reading {
            temperature,
            humidity,
        }
    }

    fn instant_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: Duration::ZERO,
            max_attempts,
        }
    }

    fn pulses(frame: [u8; 5]) -> Vec<Duration> {
        let mut highs = Vec::new();
        for byte in frame {
            for bit in (0..8).rev() {
                let us = if byte >> bit & 1 == 1 { 70 } else { 27 };
                highs.push(Duration::from_micros(us));
            }
        }
        highs
    }

    #[test]
    fn parses_valid_frame() {
        let parsed = parse_frame([45, 0, 23, 5, 73]).unwrap();
        assert_eq!(parsed, reading(23.5, 45.0));
    }

    #[test]
    fn parses_below_zero() {
        let frame = [60, 0, 2, 0x83, 60 + 2 + 0x83];
        let parsed = parse_frame(frame).unwrap();
        assert_eq!(parsed, reading(-2.3, 60.0));
    }

    #[test]
    fn rejects_bad_checksum() {
        match parse_frame([45, 0, 23, 5, 74]) {
            Err(SensorError::Checksum { expected, actual }) => {
                assert_eq!(expected, 73);
                assert_eq!(actual, 74);
            }
            other => panic!("expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn decodes_pulse_widths() {
        let frame = [0x2d, 0x00, 0x17, 0x05, 0x49];
        assert_eq!(decode_pulses(&pulses(frame)).unwrap(), frame);
    }

    #[test]
    fn short_pulse_train_is_timing_error() {
        let highs = pulses([1, 2, 3, 4, 10]);
        assert!(matches!(
            decode_pulses(&highs[..31]),
            Err(SensorError::Timing(31))
        ));
    }

    #[test]
    fn retries_until_a_read_succeeds() {
        let mut sensor = ScriptedSensor::new(vec![
            Err(SensorError::NoResponse),
            Ok(reading(22.0, 50.0)),
        ]);
        let mut pauses = 0;
        let measurement = read_measurement(&mut sensor, &instant_retry(3), |_| pauses += 1);
        assert_eq!(measurement.temperature, 22.0);
        assert_eq!(measurement.humidity, 50.0);
        assert_eq!(sensor.reads, 2);
        assert_eq!(pauses, 1);
    }

    #[test]
    fn exhausted_retries_give_zero_reading() {
        let mut sensor = ScriptedSensor::new(vec![]);
        let measurement = read_measurement(&mut sensor, &instant_retry(3), |_| {});
        assert_eq!(sensor.reads, 3);
        assert_eq!(measurement.temperature, 0.0);
        assert_eq!(measurement.humidity, 0.0);
    }

    #[test]
    fn synthetic_sensor_stays_in_range() {
        let mut sensor = SyntheticSensor::new();
        let value = sensor.read().unwrap();
        assert!((19.0..=23.0).contains(&value.temperature));
        assert!((40.0..=50.0).contains(&value.humidity));
    }

    #[test]
    fn poller_keeps_cadence_through_failures() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = CameraArbiter::spawn(
            Box::new(ScriptedCamera::default()),
            test_settings(),
            CameraMode::Preview,
        )
        .unwrap();
        let photos = PhotoStore::open(dir.path(), PhotoNaming::Counter).unwrap();
        let mut settings = Settings::default();
        settings.monitor.poll_period = Duration::from_millis(100);
        let ctx = ServiceContext::new(settings, arbiter, photos, CancellationToken::new());

        let sensor = ScriptedSensor::new(vec![
            Ok(reading(20.0, 40.0)),
            Err(SensorError::NoResponse),
            Ok(reading(21.0, 41.0)),
        ]);
        let handle = start_sensor_poller(ctx.clone(), Box::new(sensor), instant_retry(1));
        thread::sleep(Duration::from_millis(450));
        ctx.cancel.cancel();
        handle.thread().unpark();
        handle.join().unwrap();

        let history = ctx.measurements.snapshot();
        assert!(history.len() >= 4, "only {} samples", history.len());
        assert_eq!(history[0].temperature, 20.0);
        assert_eq!(history[1].temperature, 0.0);
        assert_eq!(history[2].temperature, 21.0);
        assert_eq!(history[3].humidity, 0.0);
    }
}
