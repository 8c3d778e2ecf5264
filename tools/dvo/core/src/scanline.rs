//! # Scanline producer
//!
//! Runs in the line interrupt of the output core. Every physical line it
//! re-arms the control channel with the buffer filled last time; every
//! second line it fills the other buffer with the next logical row.
//!
//! Slot layout of one 400-slot line (each slot is two pixel clocks):
//!
//! | Slots | Active line | Blank line | Vsync line |
//! |-------|-------------|------------|------------|
//! | 0..48 | HSYNC | HSYNC | HVSYNC |
//! | 48..72 | IDLE | IDLE | VSYNC |
//! | 72..392 | border, image row, border | IDLE | VSYNC |
//! | 392..400 | IDLE | IDLE | VSYNC |
//!
//! There are 525 physical lines per frame (counter 0..=524). The first
//! `2 * height` are active, lines 490 and 491 carry vertical sync, and the
//! deferred palette work runs on line `2 * height + 1`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::info;

use crate::config::{OutputMode, VideoConfig, MAX_WIDTH};
use crate::dma::ChainPlan;
use crate::error::ScanoutError;
use crate::framebuffer::PixelBuffers;
use crate::hw::ScanoutHardware;
use crate::palette::{Palette, HSYNC, HVSYNC, IDLE, VSYNC};

pub const LINE_SLOTS: usize = 400;
pub const LINES_PER_FRAME: u16 = 525;

pub const HSYNC_END: usize = 48;
pub const ACTIVE_START: usize = 72;
pub const ACTIVE_END: usize = ACTIVE_START + MAX_WIDTH as usize;

pub const VSYNC_LINES: core::ops::Range<u16> = 490..492;

/// Physical line counter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanPosition {
    line: u16,
}

impl ScanPosition {
    #[inline(always)]
    pub fn advance(&mut self) -> u16 {
        self.line = if self.line >= LINES_PER_FRAME - 1 { 0 } else { self.line + 1 };
        self.line
    }

    pub fn line(&self) -> u16 {
        self.line
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Region {
    /// logical row `0..height` of the active region
    Active(u16),
    VSync,
    Blank,
}

impl Region {
    pub fn of(line: u16, height: u16) -> Self {
        if line < height * 2 {
            Region::Active(line / 2)
        } else if VSYNC_LINES.contains(&line) {
            Region::VSync
        } else {
            Region::Blank
        }
    }
}

#[repr(C, align(4))]
struct LineBuffer(UnsafeCell<[u8; LINE_SLOTS]>);

/// The two line buffers and the address cells the control channel reads.
///
/// The interrupt is the only writer. It only fills the buffer whose address
/// is not queued in the control channel, so the DMA never reads a buffer
/// while it is being written.
pub struct LineBuffers {
    lines: [LineBuffer; 2],
    addrs: [AtomicUsize; 2],
}

// Shared with the DMA engine. Writes follow the ownership rule above.
unsafe impl Sync for LineBuffers {}

impl LineBuffers {
    pub const fn new() -> Self {
        Self {
            lines: [
                LineBuffer(UnsafeCell::new([IDLE; LINE_SLOTS])),
                LineBuffer(UnsafeCell::new([IDLE; LINE_SLOTS])),
            ],
            addrs: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    pub fn buffer_addr(&self, index: usize) -> usize {
        self.lines[index & 1].0.get() as usize
    }

    /// Cell holding the address of buffer `index`, read by the control channel.
    pub fn addr_cell(&self, index: usize) -> &AtomicUsize {
        let cell = &self.addrs[index & 1];
        if cell.load(Ordering::Relaxed) == 0 {
            cell.store(self.buffer_addr(index), Ordering::Relaxed);
        }
        cell
    }

    /// Copy out the contents of buffer `index`, as the DMA would stream it.
    pub fn snapshot(&self, index: usize) -> [u8; LINE_SLOTS] {
        // SAFETY: byte reads of a buffer that is only written by the line
        // interrupt; a torn snapshot is harmless
        unsafe { core::ptr::read_volatile(self.lines[index & 1].0.get()) }
    }

    /// # Safety
    /// Only the scanline producer may call this, and only for the buffer
    /// that is not queued in the control channel.
    #[allow(clippy::mut_from_ref)]
    unsafe fn fill_target(&self, index: usize) -> &mut [u8; LINE_SLOTS] {
        unsafe { &mut *self.lines[index & 1].0.get() }
    }
}

/// Copies one image row into the active window, remapping sync indices.
pub trait ScanlineCopier {
    fn copy_row(&self, dst: &mut [u8], src: &[AtomicU32], palette: &Palette);
}

/// One word at a time, every pixel through [`Palette::remap`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableCopier;

impl ScanlineCopier for PortableCopier {
    fn copy_row(&self, dst: &mut [u8], src: &[AtomicU32], palette: &Palette) {
        for (out, word) in dst.chunks_mut(4).zip(src) {
            let bytes = word.load(Ordering::Relaxed).to_le_bytes();
            for (o, &b) in out.iter_mut().zip(bytes.iter()) {
                *o = palette.remap(b);
            }
        }
    }
}

/// Four words per step; words with no byte at or above 251 are stored
/// without going through the substitute map.
#[cfg(feature = "unrolled-copy")]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnrolledCopier;

#[cfg(feature = "unrolled-copy")]
impl UnrolledCopier {
    #[inline(always)]
    fn has_high_byte(word: u32) -> bool {
        (word & 0x8080_8080) & ((word & 0x7f7f_7f7f) + 0x0505_0505) & 0x8080_8080 != 0
    }

    #[inline(always)]
    fn copy_word(out: &mut [u8], word: u32, palette: &Palette) {
        let bytes = word.to_le_bytes();
        if Self::has_high_byte(word) {
            for (o, &b) in out.iter_mut().zip(bytes.iter()) {
                *o = palette.remap(b);
            }
        } else {
            out.copy_from_slice(&bytes[..out.len()]);
        }
    }
}

#[cfg(feature = "unrolled-copy")]
impl ScanlineCopier for UnrolledCopier {
    fn copy_row(&self, dst: &mut [u8], src: &[AtomicU32], palette: &Palette) {
        let mut blocks = dst.chunks_exact_mut(16);
        let mut words = src.chunks_exact(4);
        for (out, quad) in (&mut blocks).zip(&mut words) {
            let w = [
                quad[0].load(Ordering::Relaxed),
                quad[1].load(Ordering::Relaxed),
                quad[2].load(Ordering::Relaxed),
                quad[3].load(Ordering::Relaxed),
            ];
            Self::copy_word(&mut out[0..4], w[0], palette);
            Self::copy_word(&mut out[4..8], w[1], palette);
            Self::copy_word(&mut out[8..12], w[2], palette);
            Self::copy_word(&mut out[12..16], w[3], palette);
        }
        for (out, word) in blocks.into_remainder().chunks_mut(4).zip(words.remainder()) {
            Self::copy_word(out, word.load(Ordering::Relaxed), palette);
        }
    }
}

#[cfg(feature = "unrolled-copy")]
pub type SelectedCopier = UnrolledCopier;
#[cfg(not(feature = "unrolled-copy"))]
pub type SelectedCopier = PortableCopier;

/// Fixed geometry derived from the config at start-up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Geometry {
    left: usize,
    width: usize,
    height: u16,
    shift_y: i16,
    border: u8,
    mode: OutputMode,
    refresh_line: u16,
}

pub struct ScanlineProducer<H: ScanoutHardware, C: ScanlineCopier = SelectedCopier> {
    hw: H,
    copier: C,
    palette: &'static Palette,
    pixels: &'static PixelBuffers,
    lines: &'static LineBuffers,
    geometry: Geometry,
    position: ScanPosition,
    /// incremented once per filled line; its low bit names the buffer
    fill_index: u32,
    irq_count: u32,
}

impl<H: ScanoutHardware> ScanlineProducer<H> {
    pub fn start(
        config: &VideoConfig,
        hw: H,
        palette: &'static Palette,
        pixels: &'static PixelBuffers,
        lines: &'static LineBuffers,
    ) -> Result<Self, ScanoutError> {
        Self::with_copier(config, hw, SelectedCopier::default(), palette, pixels, lines)
    }
}

impl<H: ScanoutHardware, C: ScanlineCopier> ScanlineProducer<H, C> {
    pub fn with_copier(
        config: &VideoConfig,
        hw: H,
        copier: C,
        palette: &'static Palette,
        pixels: &'static PixelBuffers,
        lines: &'static LineBuffers,
    ) -> Result<Self, ScanoutError> {
        config.validate()?;

        let geometry = Geometry {
            left: config.left_margin(),
            width: config.resolution.width as usize,
            height: config.resolution.height,
            shift_y: config.shift.y,
            border: config.border,
            mode: config.mode,
            refresh_line: config.palette_refresh_line(),
        };

        let mut producer = Self {
            hw,
            copier,
            palette,
            pixels,
            lines,
            geometry,
            position: ScanPosition::default(),
            fill_index: 0,
            irq_count: 0,
        };

        // both buffers start as valid blank lines
        for index in 0..2 {
            // SAFETY: streaming has not started yet
            let buf = unsafe { producer.lines.fill_target(index) };
            fill_blank(buf);
        }

        let plan = ChainPlan::build(config, &producer.hw.endpoints(), lines, palette.cache())?;
        producer.hw.start(&plan)?;

        info!(
            "scanout started: {}x{} at slot {}, {:?} mode",
            geometry.width, geometry.height, geometry.left, geometry.mode
        );
        Ok(producer)
    }

    pub fn hardware(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn position(&self) -> ScanPosition {
        self.position
    }

    pub fn irq_count(&self) -> u32 {
        self.irq_count
    }

    /// Buffer the next content line is written into.
    pub fn fill_buffer_index(&self) -> usize {
        (self.fill_index & 1) as usize
    }

    /// Line interrupt body. Never blocks, allocates or logs.
    #[inline]
    pub fn on_line_irq(&mut self) {
        self.irq_count = self.irq_count.wrapping_add(1);
        self.hw.acknowledge_line();
        self.hw.queue_line(self.lines.addr_cell((self.fill_index & 1) as usize));

        let line = self.position.advance();
        if line & 1 == 0 {
            return;
        }
        self.fill_index = self.fill_index.wrapping_add(1);

        // SAFETY: the queued cell names the other buffer
        let buf = unsafe { self.lines.fill_target((self.fill_index & 1) as usize) };

        match Region::of(line, self.geometry.height) {
            Region::Active(row) => self.fill_active(buf, row),
            Region::VSync => fill_vsync(buf),
            Region::Blank => {
                fill_blank(buf);
                if line == self.geometry.refresh_line {
                    self.palette.apply_pending();
                }
            }
        }
    }

    fn fill_active(&self, buf: &mut [u8; LINE_SLOTS], row: u16) {
        let Geometry { left, width, border, .. } = self.geometry;
        let border = self.palette.remap(border);

        buf[..HSYNC_END].fill(HSYNC);
        buf[HSYNC_END..ACTIVE_START].fill(IDLE);
        buf[ACTIVE_END..].fill(IDLE);

        let window = &mut buf[ACTIVE_START..ACTIVE_END];
        window[..left].fill(border);
        window[left + width..].fill(border);

        let image = &mut window[left..left + width];
        let source_row = row as i32 - self.geometry.shift_y as i32;
        let source = match self.geometry.mode {
            OutputMode::Graphics if source_row >= 0 => self.pixels.back_row(source_row as usize),
            _ => None,
        };

        match source {
            Some(src) => self.copier.copy_row(image, src, self.palette),
            None => image.fill(border),
        }
    }
}

fn fill_blank(buf: &mut [u8; LINE_SLOTS]) {
    buf[..HSYNC_END].fill(HSYNC);
    buf[HSYNC_END..].fill(IDLE);
}

fn fill_vsync(buf: &mut [u8; LINE_SLOTS]) {
    buf[..HSYNC_END].fill(HVSYNC);
    buf[HSYNC_END..].fill(VSYNC);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::config::{Pinout, Resolution, Shift};
    use crate::hw::sim::SimVideo;
    use crate::palette::is_reserved;
    use crate::hw::VideoPeripherals;

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    fn producer(config: VideoConfig) -> (ScanlineProducer<SimVideo>, &'static Palette, &'static PixelBuffers) {
        let palette = leak(Palette::new(config.pinout));
        let pixels = leak(PixelBuffers::new(config.resolution));
        let lines = leak(LineBuffers::new());
        // SAFETY: every test builds its own simulated peripherals
        let hw = SimVideo::new(unsafe { VideoPeripherals::steal() });
        let producer = ScanlineProducer::start(&config, hw, palette, pixels, lines).unwrap();
        (producer, palette, pixels)
    }

    /// Run interrupts until `line` has been filled; returns the buffer.
    fn fill_line(producer: &mut ScanlineProducer<SimVideo>, line: u16) -> [u8; LINE_SLOTS] {
        while producer.position().line() != line {
            producer.on_line_irq();
        }
        producer.lines.snapshot(producer.fill_buffer_index())
    }

    #[test]
    fn position_wraps_after_524() {
        let mut position = ScanPosition::default();
        let mut last = 0;
        for _ in 0..LINES_PER_FRAME {
            last = position.advance();
        }
        assert_eq!(last, 0);
        assert_eq!(position.advance(), 1);
    }

    #[test]
    fn selected_copier_remaps_sync_indices() {
        let palette = Palette::new(Pinout::default());
        let src = [AtomicU32::new(u32::from_le_bytes([5, HSYNC, 7, VSYNC]))];
        let mut out = [0u8; 4];
        SelectedCopier::default().copy_row(&mut out, &src, &palette);
        assert_eq!(out[0], 5);
        assert_eq!(out[2], 7);
        assert!(!is_reserved(out[1]) && !is_reserved(out[3]));
    }

    #[test]
    fn regions() {
        assert_eq!(Region::of(0, 239), Region::Active(0));
        assert_eq!(Region::of(477, 239), Region::Active(238));
        assert_eq!(Region::of(478, 239), Region::Blank);
        assert_eq!(Region::of(491, 239), Region::VSync);
        assert_eq!(Region::of(492, 239), Region::Blank);
    }

    #[test]
    fn red_row_lands_in_the_centre() {
        let (mut producer, palette, pixels) = producer(VideoConfig::default());
        palette.set_palette(5, 0xff0000);
        pixels.write_row(0, &[5; 256]);
        pixels.swap();

        let line = fill_line(&mut producer, 1);
        assert_eq!(&line[104..360], &[5u8; 256][..]);
        assert_eq!(&line[..48], &[HSYNC; 48][..]);
        assert_eq!(&line[48..72], &[IDLE; 24][..]);
        assert_eq!(&line[72..104], &[0u8; 32][..]);
        assert_eq!(&line[360..392], &[0u8; 32][..]);
        assert_eq!(&line[392..], &[IDLE; 8][..]);
    }

    #[test]
    fn even_lines_do_no_content_work() {
        let (mut producer, _, _) = producer(VideoConfig::default());
        producer.on_line_irq();
        let index = producer.fill_buffer_index();
        producer.on_line_irq();
        assert_eq!(producer.position().line(), 2);
        assert_eq!(producer.fill_buffer_index(), index);
    }

    #[test]
    fn producer_never_fills_the_queued_buffer() {
        let (mut producer, _, _) = producer(VideoConfig::default());
        for _ in 0..2 * LINES_PER_FRAME {
            producer.on_line_irq();
            let queued = producer.hardware().queued_buffer();
            if producer.position().line() & 1 == 1 {
                assert_ne!(queued, Some(producer.lines.buffer_addr(producer.fill_buffer_index())));
            }
        }
    }

    #[test]
    fn vsync_and_blank_lines() {
        let (mut producer, _, _) = producer(VideoConfig::default());
        let blank = fill_line(&mut producer, 479);
        assert_eq!(&blank[..48], &[HSYNC; 48][..]);
        assert!(blank[48..].iter().all(|&b| b == IDLE));

        let vsync = fill_line(&mut producer, 491);
        assert_eq!(&vsync[..48], &[HVSYNC; 48][..]);
        assert!(vsync[48..].iter().all(|&b| b == VSYNC));
    }

    #[test]
    fn palette_update_waits_for_vblank() {
        let (mut producer, palette, _) = producer(VideoConfig::default());
        palette.request_full_palette_update();
        fill_line(&mut producer, 477);
        assert!(palette.full_update_pending());
        fill_line(&mut producer, 479);
        assert!(!palette.full_update_pending());
    }

    #[test]
    fn reserved_pixels_are_substituted() {
        let (mut producer, palette, pixels) = producer(VideoConfig::default());
        palette.set_palette(17, 0x0000ff);
        palette.set_palette(VSYNC, 0x0000fe);
        palette.apply_pending();

        pixels.write_row(3, &[VSYNC, 255, 17, 250]);
        pixels.swap();
        let line = fill_line(&mut producer, 7);
        assert_eq!(&line[104..108], &[17, 255, 17, 250]);
    }

    #[test]
    fn shift_and_text_mode() {
        let config = VideoConfig {
            resolution: Resolution { width: 16, height: 4 },
            shift: Shift { x: -152, y: 1 },
            border: 9,
            ..VideoConfig::default()
        };
        let (mut producer, _, pixels) = producer(config);
        pixels.fill(3);
        pixels.swap();

        let top = fill_line(&mut producer, 1);
        assert!(top[72..392].iter().all(|&b| b == 9));

        let second = fill_line(&mut producer, 3);
        assert_eq!(&second[72..88], &[3u8; 16][..]);
        assert!(second[88..392].iter().all(|&b| b == 9));

        let text = VideoConfig { mode: OutputMode::Text, ..config };
        let (mut producer, _, pixels) = self::producer(text);
        pixels.fill(3);
        pixels.swap();
        let line = fill_line(&mut producer, 3);
        assert!(line[72..392].iter().all(|&b| b == 9));
    }

    #[cfg(feature = "unrolled-copy")]
    proptest! {
        #[test]
        fn prop_unrolled_matches_portable(row in proptest::collection::vec(any::<u8>(), 320)) {
            let palette = leak(Palette::new(crate::config::Pinout::default()));
            let pixels = PixelBuffers::new(Resolution { width: 320, height: 1 });
            pixels.write_row(0, &row);
            pixels.swap();
            let src = pixels.back_row(0).unwrap();

            let mut a = [0u8; 320];
            let mut b = [0u8; 320];
            PortableCopier.copy_row(&mut a, src, palette);
            UnrolledCopier.copy_row(&mut b, src, palette);
            prop_assert_eq!(&a[..], &b[..]);
        }
    }

    proptest! {
        #[test]
        fn prop_no_reserved_index_reaches_the_image(row in proptest::collection::vec(any::<u8>(), 256)) {
            let (mut producer, _, pixels) = producer(VideoConfig::default());
            pixels.write_row(0, &row);
            pixels.swap();
            let line = fill_line(&mut producer, 1);
            prop_assert!(line[72..392].iter().all(|&b| !crate::palette::is_reserved(b)));
        }
    }
}
