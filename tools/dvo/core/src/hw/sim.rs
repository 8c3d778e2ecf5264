//! Software model of the scanout chains.
//!
//! `SimVideo` executes a [`ChainPlan`] the way the DMA block would: the line
//! control channel loads a buffer address into the data channel, the data
//! channel feeds indices through the address converter, and the palette
//! channels move each cache entry into the serializer. Symbols reaching the
//! serializer can be captured per physical line and decoded back to colours.
//!
//! Host addresses are used unmodified, so the converter keeps the full cache
//! base instead of the 20-bit X register value.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{debug, warn};

use crate::config::Pinout;
use crate::dma::{ChainPlan, Endpoints};
use crate::error::ScanoutError;
use crate::hw::{map, ScanoutHardware, VideoPeripherals};
use crate::palette::WORDS_PER_ENTRY;
use crate::scanline::{ScanlineCopier, ScanlineProducer, LINES_PER_FRAME, LINE_SLOTS};
use crate::tmds;

/// Serializer words per line: symbol then complement for every slot.
pub const WIRE_SYMBOLS: usize = LINE_SLOTS * 2;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub lines_streamed: u32,
    pub irqs_raised: u32,
    /// interrupts still pending when the next line started
    pub irqs_missed: u32,
}

pub struct SimVideo {
    peripherals: VideoPeripherals,
    endpoints: Endpoints,
    plan: Option<ChainPlan>,
    /// `READ_ADDR` of every channel
    read_addrs: [usize; 16],
    irq_pending: bool,
    wire: Vec<u64>,
    frame: Option<Vec<Vec<u64>>>,
    stats: SimStats,
}

impl SimVideo {
    pub fn new(peripherals: VideoPeripherals) -> Self {
        let endpoints = peripherals.endpoints();
        Self {
            peripherals,
            endpoints,
            plan: None,
            read_addrs: [0; 16],
            irq_pending: false,
            wire: Vec::with_capacity(WIRE_SYMBOLS),
            frame: None,
            stats: SimStats::default(),
        }
    }

    pub fn peripherals(&self) -> &VideoPeripherals {
        &self.peripherals
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Keep the symbols of every physical line of the frame.
    pub fn capture_frames(&mut self, enabled: bool) {
        self.frame = enabled.then(|| vec![Vec::new(); LINES_PER_FRAME as usize]);
    }

    /// Line buffer the control channel will load next.
    pub fn queued_buffer(&self) -> Option<usize> {
        let plan = self.plan.as_ref()?;
        let cell = self.read_addrs[plan.line_ctrl.channel as usize];
        // SAFETY: the plan only points the control channel at 'static address cells
        Some(unsafe { &*(cell as *const AtomicUsize) }.load(Ordering::Acquire))
    }

    /// Serializer input of the most recently streamed line.
    pub fn wire(&self) -> &[u64] {
        &self.wire
    }

    /// Captured serializer input of physical line `line`.
    pub fn captured(&self, line: u16) -> Option<&[u64]> {
        self.frame.as_ref()?.get(line as usize).map(Vec::as_slice)
    }

    /// Control channel transfer at the start of a line. Returns true when it
    /// raised the line interrupt.
    pub fn begin_line(&mut self) -> bool {
        let Some(plan) = self.plan else {
            return false;
        };

        if self.irq_pending {
            self.stats.irqs_missed += 1;
        }

        let ctrl = plan.line_ctrl;
        // SAFETY: see queued_buffer
        let value = unsafe { &*(self.read_addrs[ctrl.channel as usize] as *const AtomicUsize) }.load(Ordering::Acquire);
        match map::read_addr_channel(ctrl.write_addr) {
            Some(target) => self.read_addrs[target as usize] = value,
            None => warn!("control channel writes to {:#x}, not a read address", ctrl.write_addr),
        }

        self.irq_pending = !ctrl.ctrl.irq_quiet();
        if self.irq_pending {
            self.stats.irqs_raised += 1;
        }
        self.irq_pending
    }

    /// Data channel and palette fan-out for one line.
    pub fn stream_line(&mut self, line: u16) {
        let Some(plan) = self.plan else {
            return;
        };

        let data = plan.line_data;
        let base = self.read_addrs[data.channel as usize];
        let cache = plan.palette_data.read_addr & !0xfff;

        self.wire.clear();
        for slot in 0..data.transfer_count as usize {
            // SAFETY: the data channel reads 'static line buffers of LINE_SLOTS bytes
            let index = unsafe { core::ptr::read_volatile((base + slot) as *const u8) };
            let entry = cache | (index as usize) << 4;
            let words: [u32; WORDS_PER_ENTRY] = core::array::from_fn(|i| {
                // SAFETY: entries lie inside the 'static symbol cache
                unsafe { &*((entry + 4 * i) as *const AtomicU32) }.load(Ordering::Relaxed)
            });
            self.wire.push((words[1] as u64) << 32 | words[0] as u64);
            self.wire.push((words[3] as u64) << 32 | words[2] as u64);
        }

        self.stats.lines_streamed += 1;
        if let Some(frame) = self.frame.as_mut() {
            if let Some(slot) = frame.get_mut(line as usize) {
                slot.clone_from(&self.wire);
            }
        }
    }

    /// Decode a captured line into one RGB triple per pixel clock. Control
    /// symbols (identical halves) decode to `None`.
    pub fn decode_line(&self, line: u16, pinout: &Pinout) -> Option<Vec<Option<[u8; 3]>>> {
        let wire = self.captured(line)?;
        let mut pixels = Vec::with_capacity(wire.len());
        for pair in wire.chunks_exact(2) {
            let rgb = (pair[0] != pair[1]).then(|| tmds::decode_pair(pair[0], pair[1], pinout));
            pixels.push(rgb);
            pixels.push(rgb);
        }
        Some(pixels)
    }
}

impl ScanoutHardware for SimVideo {
    fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    fn start(&mut self, plan: &ChainPlan) -> Result<(), ScanoutError> {
        for program in [plan.line_data, plan.line_ctrl, plan.palette_data, plan.palette_ctrl] {
            self.read_addrs[program.channel as usize] = program.read_addr;
        }
        self.plan = Some(*plan);
        debug!("sim chains armed: {:?}", plan);
        Ok(())
    }

    fn acknowledge_line(&mut self) {
        self.irq_pending = false;
    }

    fn queue_line(&mut self, cell: &AtomicUsize) {
        if let Some(plan) = self.plan {
            self.read_addrs[plan.line_ctrl.channel as usize] = cell.as_ptr() as usize;
        }
    }
}

impl<C: ScanlineCopier> ScanlineProducer<SimVideo, C> {
    /// One physical line: control transfer, interrupt, data transfer.
    /// Returns the line number that was streamed.
    pub fn scan_line(&mut self) -> u16 {
        if self.hardware().begin_line() {
            self.on_line_irq();
        }
        let line = self.position().line();
        self.hardware().stream_line(line);
        line
    }

    pub fn scan_frame(&mut self) {
        for _ in 0..LINES_PER_FRAME {
            self.scan_line();
        }
    }
}
