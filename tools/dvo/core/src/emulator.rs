//! The narrow surface through which the frame scheduler drives an emulation
//! core. The core itself (CPU, PPU, APU) lives elsewhere.

use crate::framebuffer::PixelBuffers;
use crate::palette::Palette;

/// What one emulated frame may touch.
pub struct FrameTarget<'a> {
    render: bool,
    pixels: &'a PixelBuffers,
    palette: &'a Palette,
}

impl<'a> FrameTarget<'a> {
    pub fn new(render: bool, pixels: &'a PixelBuffers, palette: &'a Palette) -> Self {
        Self { render, pixels, palette }
    }

    /// False on skipped frames: the core should advance state without
    /// drawing.
    pub fn render(&self) -> bool {
        self.render
    }

    /// The draw buffer. Never the one being scanned out.
    pub fn pixels(&self) -> &'a PixelBuffers {
        self.pixels
    }

    pub fn palette(&self) -> &'a Palette {
        self.palette
    }

    pub fn set_palette(&self, index: u8, rgb: u32) {
        self.palette.set_palette(index, rgb);
    }

    pub fn request_full_palette_update(&self) {
        self.palette.request_full_palette_update();
    }
}

pub trait EmulationCore {
    /// Advance by exactly one video frame.
    fn run_one_frame(&mut self, target: &mut FrameTarget);

    /// Fill `dst` with `frames` interleaved stereo frames.
    fn mix_audio(&mut self, dst: &mut [i16], frames: usize);

    /// Called after the frame is presented, before the next deadline. Colour
    /// corrections that depend on the whole frame go here.
    fn end_of_frame(&mut self, _target: &mut FrameTarget) {}
}

impl<E: EmulationCore + ?Sized> EmulationCore for &mut E {
    fn run_one_frame(&mut self, target: &mut FrameTarget) {
        (**self).run_one_frame(target)
    }

    fn mix_audio(&mut self, dst: &mut [i16], frames: usize) {
        (**self).mix_audio(dst, frames)
    }

    fn end_of_frame(&mut self, target: &mut FrameTarget) {
        (**self).end_of_frame(target)
    }
}
