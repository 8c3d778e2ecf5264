//! # Video configuration
//!
//! Everything the scanout needs to know is fixed before the first frame:
//!
//! | Option | Default | Notes |
//! |--------|---------|-------|
//! | `resolution` | 256×239 | at most 320×240, width a multiple of 4 |
//! | `shift` | (0, 0) | offset from the centred position, in pixels / rows |
//! | `mode` | graphics | text mode blanks the image area with the border colour |
//! | `pinout` | clk on gpio 6-7, data on 8-13 | RGB lane order, inverted pairs |
//! | `sys_clock_hz` | 252 MHz | must reach the 252 Mbit/s serializer rate |
//!
//! Only one timing (640×480 at 60 Hz, pixel-doubled) is supported. The image
//! is always line-doubled and pixel-doubled into it.

use crate::error::ConfigError;
use crate::palette;

/// Slots in the active part of a line buffer. Each slot is two pixel clocks.
pub const MAX_WIDTH: u16 = 320;
/// Logical rows in the active region. Each row is scanned twice.
pub const MAX_HEIGHT: u16 = 240;

/// TMDS bit rate for 25.2 MHz pixels: ten bits per pixel clock.
pub const SERIALIZER_HZ: u32 = 252_000_000;
pub const REFRESH_HZ: u32 = 60;

/// Highest GPIO number on the 80-pin RP2350B package.
pub const MAX_GPIO: u8 = 47;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Default for Resolution {
    fn default() -> Self {
        Self { width: 256, height: 239 }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Shift {
    pub x: i16,
    pub y: i16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    #[default]
    Graphics,
}

/// Which TMDS lane lands on the highest data pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LaneOrder {
    /// red on pair 2, green on pair 1, blue on pair 0
    #[default]
    Rgb,
    Bgr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pinout {
    /// first of the two clock pair pins (side-set)
    pub clk_base: u8,
    /// first of the six data pair pins
    pub data_base: u8,
    pub lane_order: LaneOrder,
    /// swap P and N of every pair
    pub invert_pairs: bool,
}

impl Default for Pinout {
    fn default() -> Self {
        Self {
            clk_base: 6,
            data_base: 8,
            lane_order: LaneOrder::Rgb,
            invert_pairs: true,
        }
    }
}

impl Pinout {
    /// Second pin of the clock pair.
    pub fn clk_last(&self) -> Option<u8> {
        self.clk_base.checked_add(1)
    }

    /// Last of the six data pins.
    pub fn data_last(&self) -> Option<u8> {
        self.data_base.checked_add(5)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (base, last) in [(self.clk_base, self.clk_last()), (self.data_base, self.data_last())] {
            match last {
                Some(pin) if pin <= MAX_GPIO => {}
                Some(pin) => return Err(ConfigError::PinOutOfRange { pin }),
                None => return Err(ConfigError::PinOutOfRange { pin: base }),
            }
        }

        let clk = self.clk_base..self.clk_base + 2;
        let data = self.data_base..self.data_base + 6;
        if clk.start < data.end && data.start < clk.end {
            return Err(ConfigError::PinOverlap);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VideoConfig {
    pub resolution: Resolution,
    pub shift: Shift,
    pub mode: OutputMode,
    pub pinout: Pinout,
    /// palette index drawn around the image
    pub border: u8,
    pub sys_clock_hz: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            shift: Shift::default(),
            mode: OutputMode::default(),
            pinout: Pinout::default(),
            border: 0,
            sys_clock_hz: SERIALIZER_HZ,
        }
    }
}

impl VideoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Resolution { width, height } = self.resolution;
        if width == 0 || height == 0 {
            return Err(ConfigError::EmptyResolution);
        }
        if width > MAX_WIDTH {
            return Err(ConfigError::WidthTooLarge { width, max: MAX_WIDTH });
        }
        if width % 4 != 0 {
            return Err(ConfigError::WidthNotAligned(width));
        }
        if height > MAX_HEIGHT {
            return Err(ConfigError::HeightTooLarge { height, max: MAX_HEIGHT });
        }

        let left = self.centred_left() + self.shift.x as i32;
        if left < 0 || left + width as i32 > MAX_WIDTH as i32 {
            return Err(ConfigError::ShiftOutOfRange { shift: self.shift.x });
        }

        if palette::is_reserved(self.border) {
            return Err(ConfigError::ReservedBorder(self.border));
        }

        if self.sys_clock_hz < SERIALIZER_HZ {
            return Err(ConfigError::ClockTooSlow {
                hz: self.sys_clock_hz,
                min: SERIALIZER_HZ,
            });
        }

        self.pinout.validate()
    }

    fn centred_left(&self) -> i32 {
        (MAX_WIDTH as i32 - self.resolution.width as i32) / 2
    }

    /// First active-window slot of the image. Only meaningful on a validated config.
    pub fn left_margin(&self) -> usize {
        (self.centred_left() + self.shift.x as i32).clamp(0, MAX_WIDTH as i32) as usize
    }

    /// Physical line at which deferred palette work runs: the first content
    /// line after the active region.
    pub fn palette_refresh_line(&self) -> u16 {
        self.resolution.height * 2 + 1
    }

    /// 16.8 fixed-point PIO clock divider for the serializer.
    pub fn serializer_divider(&self) -> (u16, u8) {
        let scaled = (self.sys_clock_hz as u64 * 256) / SERIALIZER_HZ as u64;
        ((scaled >> 8) as u16, (scaled & 0xff) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid_and_centred() {
        let config = VideoConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.left_margin(), 32);
        assert_eq!(config.palette_refresh_line(), 479);
        assert_eq!(config.serializer_divider(), (1, 0));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut config = VideoConfig::default();
        config.resolution.width = 324;
        assert_eq!(config.validate(), Err(ConfigError::WidthTooLarge { width: 324, max: 320 }));

        config.resolution.width = 258;
        assert_eq!(config.validate(), Err(ConfigError::WidthNotAligned(258)));

        config.resolution = Resolution { width: 256, height: 241 };
        assert_eq!(config.validate(), Err(ConfigError::HeightTooLarge { height: 241, max: 240 }));

        config.resolution = Resolution::default();
        config.shift.x = 33;
        assert_eq!(config.validate(), Err(ConfigError::ShiftOutOfRange { shift: 33 }));

        config.shift.x = -32;
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.left_margin(), 0);
    }

    #[test]
    fn rejects_bad_pins_and_clock() {
        let mut config = VideoConfig::default();
        config.pinout.clk_base = 9;
        assert_eq!(config.validate(), Err(ConfigError::PinOverlap));

        config.pinout = Pinout { data_base: 44, ..Pinout::default() };
        assert_eq!(config.validate(), Err(ConfigError::PinOutOfRange { pin: 49 }));

        config.pinout = Pinout { clk_base: 255, ..Pinout::default() };
        assert_eq!(config.validate(), Err(ConfigError::PinOutOfRange { pin: 255 }));
        config.pinout = Pinout { data_base: 251, ..Pinout::default() };
        assert_eq!(config.validate(), Err(ConfigError::PinOutOfRange { pin: 251 }));

        config.pinout = Pinout::default();
        config.sys_clock_hz = 150_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::ClockTooSlow { .. })));

        config.sys_clock_hz = 378_000_000;
        assert_eq!(config.serializer_divider(), (1, 128));
    }

    #[test]
    fn border_may_not_be_a_sync_index() {
        let config = VideoConfig { border: 252, ..VideoConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::ReservedBorder(252)));

        let config = VideoConfig { border: 255, ..VideoConfig::default() };
        assert_eq!(config.validate(), Ok(()));
    }
}
