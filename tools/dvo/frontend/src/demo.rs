use std::time::Duration;

use dasp_signal::{self as signal, Signal};
use dvo_core::emulator::{EmulationCore, FrameTarget};
use dvo_core::palette::HSYNC;
use rand::Rng;
use tracing::debug;

/// First of the eight bar colours.
const BAR_BASE: u8 = 1;
const BAR_WIDTH: usize = 32;

const BARS: [u32; 8] = [
    0xffffff, 0xffff00, 0x00ffff, 0x00ff00, 0xff00ff, 0xff0000, 0x0000ff, 0x000000,
];

/// Stand-in for the console core: scrolling colour bars, a slowly cycling
/// palette and a sine tone.
pub struct ColourBars {
    frame: u64,
    row: Vec<u8>,
    tone: Box<dyn Signal<Frame = f64> + Send>,
    amplitude: f64,
    /// extra time burned per frame, to provoke skipping
    load: Duration,
    jitter_us: u64,
}

impl ColourBars {
    pub fn new(width: u16, sample_rate: u32, load: Duration, jitter_us: u64) -> Self {
        let tone = signal::rate(sample_rate as f64).const_hz(440.0).sine();
        Self {
            frame: 0,
            row: vec![0; width as usize],
            tone: Box::new(tone),
            amplitude: 8000.0,
            load,
            jitter_us,
        }
    }

    fn burn(&self) {
        let extra = if self.jitter_us > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_us)
        } else {
            0
        };
        let until = std::time::Instant::now() + self.load + Duration::from_micros(extra);
        while std::time::Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    fn draw(&mut self, target: &FrameTarget) {
        let pixels = target.pixels();
        let height = pixels.resolution().height as usize;
        let scroll = self.frame as usize;

        for (x, px) in self.row.iter_mut().enumerate() {
            *px = BAR_BASE + (((x + scroll) / BAR_WIDTH) % BARS.len()) as u8;
        }
        for y in 0..height.saturating_sub(1) {
            pixels.write_row(y, &self.row);
        }

        // a stripe of a sync index on the last row, remapped on the way out
        self.row.fill(HSYNC);
        pixels.write_row(height.saturating_sub(1), &self.row);
    }
}

impl EmulationCore for ColourBars {
    fn run_one_frame(&mut self, target: &mut FrameTarget) {
        if self.frame == 0 {
            for (i, rgb) in BARS.iter().enumerate() {
                target.set_palette(BAR_BASE + i as u8, *rgb);
            }
        }

        // rotate one bar through the hue circle, a step per frame
        let hue = (self.frame % 360) as u32;
        target.set_palette(BAR_BASE, hue_to_rgb(hue));
        if self.frame % 300 == 299 {
            debug!("frame {}: full palette refresh", self.frame);
            target.request_full_palette_update();
        }

        if target.render() {
            self.draw(target);
        }
        self.burn();
        self.frame += 1;
    }

    fn mix_audio(&mut self, dst: &mut [i16], frames: usize) {
        for frame in dst.chunks_exact_mut(2).take(frames) {
            let s = (self.tone.next() * self.amplitude) as i16;
            frame[0] = s;
            frame[1] = s;
        }
    }
}

/// Fully saturated colour at `hue` degrees.
pub fn hue_to_rgb(hue: u32) -> u32 {
    let h = hue % 360;
    let x = (60 - (h % 120).abs_diff(60)) * 255 / 60;
    let (r, g, b) = match h / 60 {
        0 => (255, x, 0),
        1 => (x, 255, 0),
        2 => (0, 255, x),
        3 => (0, x, 255),
        4 => (x, 0, 255),
        _ => (255, 0, x),
    };
    r << 16 | g << 8 | b
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hue_wheel_corners() {
        assert_eq!(hue_to_rgb(0), 0xff0000);
        assert_eq!(hue_to_rgb(120), 0x00ff00);
        assert_eq!(hue_to_rgb(240), 0x0000ff);
        assert_eq!(hue_to_rgb(60), 0xffff00);
        assert_eq!(hue_to_rgb(360), 0xff0000);
    }
}
