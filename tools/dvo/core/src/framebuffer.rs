//! Double-buffered pixel store shared between the emulation core and the
//! scanline interrupt.
//!
//! Pixels are palette indices packed four to a word, pixel `x` in byte
//! `x % 4` (little endian). The emulation core draws into the buffer named by
//! the current index; the interrupt reads the other one. A swap is a single
//! release store, so the interrupt may finish a line from the previous back
//! buffer. That one-line tear is accepted.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::config::Resolution;
use crate::error::ConfigError;

pub struct PixelBuffers {
    resolution: Resolution,
    words_per_row: usize,
    storage: &'static [AtomicU32],
    draw: AtomicU8,
}

impl PixelBuffers {
    /// Words needed for both buffers at `resolution`.
    pub fn storage_words(resolution: Resolution) -> usize {
        2 * (resolution.width as usize).div_ceil(4) * resolution.height as usize
    }

    /// Use caller-provided storage, e.g. carved out of external RAM.
    pub fn from_storage(resolution: Resolution, storage: &'static [AtomicU32]) -> Result<Self, ConfigError> {
        let required = Self::storage_words(resolution);
        if storage.len() < required {
            return Err(ConfigError::StorageTooSmall {
                len: storage.len(),
                required,
            });
        }

        Ok(Self {
            resolution,
            words_per_row: (resolution.width as usize).div_ceil(4),
            storage: &storage[..required],
            draw: AtomicU8::new(0),
        })
    }

    /// Allocate storage for the lifetime of the program.
    pub fn new(resolution: Resolution) -> Self {
        let words = Self::storage_words(resolution);
        let storage: Vec<AtomicU32> = (0..words).map(|_| AtomicU32::new(0)).collect();
        let storage: &'static [AtomicU32] = Box::leak(storage.into_boxed_slice());
        Self {
            resolution,
            words_per_row: (resolution.width as usize).div_ceil(4),
            storage,
            draw: AtomicU8::new(0),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn words_per_row(&self) -> usize {
        self.words_per_row
    }

    /// Index of the buffer the emulation core draws into.
    pub fn draw_index(&self) -> usize {
        self.draw.load(Ordering::Acquire) as usize
    }

    /// Present the draw buffer. Only called after a rendered frame.
    pub fn swap(&self) {
        self.draw.fetch_xor(1, Ordering::AcqRel);
    }

    fn row(&self, buffer: usize, y: usize) -> &[AtomicU32] {
        let buffer_words = self.words_per_row * self.resolution.height as usize;
        let start = buffer * buffer_words + y * self.words_per_row;
        &self.storage[start..start + self.words_per_row]
    }

    /// Row `y` of the displayed buffer, or `None` past the bottom.
    #[inline(always)]
    pub fn back_row(&self, y: usize) -> Option<&[AtomicU32]> {
        if y >= self.resolution.height as usize {
            return None;
        }
        Some(self.row(self.draw_index() ^ 1, y))
    }

    /// Row `y` of the draw buffer.
    pub fn draw_row(&self, y: usize) -> Option<&[AtomicU32]> {
        if y >= self.resolution.height as usize {
            return None;
        }
        Some(self.row(self.draw_index(), y))
    }

    /// Copy `pixels` into row `y` of the draw buffer. Excess pixels are ignored.
    pub fn write_row(&self, y: usize, pixels: &[u8]) {
        let Some(row) = self.draw_row(y) else {
            return;
        };
        let width = (self.resolution.width as usize).min(pixels.len());
        for (word, chunk) in row.iter().zip(pixels[..width].chunks(4)) {
            let mut bytes = word.load(Ordering::Relaxed).to_le_bytes();
            bytes[..chunk.len()].copy_from_slice(chunk);
            word.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
        }
    }

    pub fn set_pixel(&self, x: usize, y: usize, index: u8) {
        if x >= self.resolution.width as usize {
            return;
        }
        if let Some(row) = self.draw_row(y) {
            let word = &row[x / 4];
            let shift = (x % 4) * 8;
            let value = word.load(Ordering::Relaxed) & !(0xff << shift) | (index as u32) << shift;
            word.store(value, Ordering::Relaxed);
        }
    }

    pub fn fill(&self, index: u8) {
        let word = u32::from_ne_bytes([index; 4]);
        for y in 0..self.resolution.height as usize {
            if let Some(row) = self.draw_row(y) {
                row.iter().for_each(|w| w.store(word, Ordering::Relaxed));
            }
        }
    }

    /// Unpack row `y` of the displayed buffer.
    pub fn read_back_row(&self, y: usize, out: &mut [u8]) {
        if let Some(row) = self.back_row(y) {
            for (chunk, word) in out.chunks_mut(4).zip(row) {
                let bytes = word.load(Ordering::Relaxed).to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use pretty_assertions::assert_eq;

    fn small() -> PixelBuffers {
        PixelBuffers::new(Resolution { width: 8, height: 2 })
    }

    #[test]
    fn drawing_is_invisible_until_swap() {
        let buffers = small();
        buffers.write_row(1, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut out = vec![0u8; 8];
        buffers.read_back_row(1, &mut out);
        assert_eq!(out, vec![0; 8]);

        buffers.swap();
        buffers.read_back_row(1, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffers.draw_index(), 1);
    }

    #[test]
    fn set_pixel_touches_one_byte() {
        let buffers = small();
        buffers.fill(9);
        buffers.set_pixel(5, 0, 42);
        buffers.set_pixel(8, 0, 1);
        buffers.swap();

        let mut out = vec![0u8; 8];
        buffers.read_back_row(0, &mut out);
        assert_eq!(out, vec![9, 9, 9, 9, 9, 42, 9, 9]);
        assert!(buffers.back_row(2).is_none());
    }

    #[test]
    fn external_storage_must_fit() {
        let resolution = Resolution { width: 8, height: 2 };
        let storage: &'static [AtomicU32] = Box::leak((0..7).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice());
        assert_eq!(
            PixelBuffers::from_storage(resolution, storage).err(),
            Some(ConfigError::StorageTooSmall { len: 7, required: 8 })
        );
    }
}
