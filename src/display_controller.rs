use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local};
use rppal::i2c::I2c;
use tracing::{info, warn};

use crate::{
    common::{sleep_or_cancel, Measurement, ServiceContext},
    error::DisplayError,
};

pub(crate) const LCD_WIDTH: usize = 16;
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Anything that can show two lines of status text.
pub(crate) trait DisplaySink: Send {
    fn show(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError>;
    fn clear(&mut self) -> Result<(), DisplayError>;
}

//////// LCD Start ////////

// PCF8574 backpack pins.
const BACKLIGHT: u8 = 0x08;
const ENABLE: u8 = 0x04;
const REGISTER_SELECT: u8 = 0x01;

const CMD_CLEAR: u8 = 0x01;
const LINE_ADDRESS: [u8; 2] = [0x80, 0xC0];
const INIT_SEQUENCE: [u8; 6] = [
    0x33, // reset, 8 bit
    0x32, // switch to 4 bit
    0x06, // cursor moves right
    0x0C, // display on, cursor off
    0x28, // two lines, 5x8 font
    CMD_CLEAR,
];

/// Single byte writes to the expander.
pub(crate) trait ByteBus: Send {
    fn send(&mut self, byte: u8) -> Result<(), DisplayError>;
}

impl ByteBus for I2c {
    fn send(&mut self, byte: u8) -> Result<(), DisplayError> {
        self.write(&[byte])?;
        Ok(())
    }
}

/**
 * Expander bytes for one HD44780 transfer in 4 bit mode: high nibble then
 * low nibble, each latched by pulsing the enable line.
 */
pub(crate) fn lcd_bytes(value: u8, is_data: bool) -> [u8; 4] {
    let rs = if is_data { REGISTER_SELECT } else { 0 };
    let high = (value & 0xF0) | BACKLIGHT | rs;
    let low = ((value << 4) & 0xF0) | BACKLIGHT | rs;
    [high | ENABLE, high, low | ENABLE, low]
}

/// 16x2 character LCD behind a PCF8574 I2C backpack.
pub(crate) struct Lcd1602<B: ByteBus> {
    bus: B,
}

impl Lcd1602<I2c> {
    pub(crate) fn open(bus: u8, address: u16) -> Result<Self, DisplayError> {
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;
        Self::init(i2c)
    }
}

impl<B: ByteBus> Lcd1602<B> {
    pub(crate) fn init(bus: B) -> Result<Self, DisplayError> {
        let mut lcd = Self { bus };
        for cmd in INIT_SEQUENCE {
            lcd.command(cmd)?;
        }
        thread::sleep(Duration::from_millis(50));
        Ok(lcd)
    }

    fn command(&mut self, cmd: u8) -> Result<(), DisplayError> {
        self.transfer(cmd, false)?;
        if cmd == CMD_CLEAR {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    fn transfer(&mut self, value: u8, is_data: bool) -> Result<(), DisplayError> {
        for byte in lcd_bytes(value, is_data) {
            self.bus.send(byte)?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: usize, text: &str) -> Result<(), DisplayError> {
        self.command(LINE_ADDRESS[line])?;
        for ch in format_line(text).chars() {
            // The character ROM is ASCII only.
            let code = if ch.is_ascii() { ch as u8 } else { b'?' };
            self.transfer(code, true)?;
        }
        Ok(())
    }
}

impl<B: ByteBus> DisplaySink for Lcd1602<B> {
    fn show(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError> {
        // Lines are padded to full width, so no clear and no flicker.
        self.write_line(0, line1)?;
        self.write_line(1, line2)
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        self.command(CMD_CLEAR)
    }
}

//////// LCD End ////////

/// Sink for headless runs: every page becomes a log line.
pub(crate) struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn show(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError> {
        info!(line1 = line1.trim_end(), line2 = line2.trim_end(), "Status");
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Pads or truncates `text` to exactly one display line.
pub(crate) fn format_line(text: &str) -> String {
    format!("{:<width$.width$}", text, width = LCD_WIDTH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusPage {
    Climate,
    Progress,
}

impl StatusPage {
    fn next(self) -> Self {
        match self {
            StatusPage::Climate => StatusPage::Progress,
            StatusPage::Progress => StatusPage::Climate,
        }
    }
}

pub(crate) fn render_page(
    page: StatusPage,
    latest: Option<&Measurement>,
    photo_count: usize,
    now: DateTime<Local>,
) -> (String, String) {
    let (line1, line2) = match page {
        StatusPage::Climate => match latest {
            Some(m) => (
                format!("Temp: {:.1}C", m.temperature),
                format!("Humidity: {:.1}%", m.humidity),
            ),
            None => ("Temp: --".to_string(), "Humidity: --".to_string()),
        },
        StatusPage::Progress => (
            format!("Photos: {}", photo_count),
            format!("Time: {}", now.format("%H:%M:%S")),
        ),
    };
    (format_line(&line1), format_line(&line2))
}

/**
 * Entry point for the display thread. Alternates between the climate page
 * and the progress page every `display_period`. Sink errors are logged and
 * the loop carries on; the display is cleared on the way out.
 */
pub(crate) fn start_display_controller(
    ctx: Arc<ServiceContext>,
    mut sink: Box<dyn DisplaySink>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("Starting status display");
        let period = ctx.settings.monitor.display_period;
        let cancel = &ctx.cancel;
        let mut page = StatusPage::Climate;

        while !cancel.is_cancelled() {
            let latest = ctx.measurements.latest();
            let (line1, line2) =
                render_page(page, latest.as_ref(), ctx.photos.photo_count(), Local::now());
            let pause = match sink.show(&line1, &line2) {
                Ok(()) => {
                    page = page.next();
                    period
                }
                Err(e) => {
                    warn!(error = %e, "Status display update failed");
                    ERROR_PAUSE
                }
            };
            if sleep_or_cancel(cancel, pause) {
                break;
            }
        }

        if let Err(e) = sink.clear() {
            warn!(error = %e, "Could not clear status display");
        }
        info!("Status display stopped");
    })
}
