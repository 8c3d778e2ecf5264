//! # DMA chains and PIO programs
//!
//! Scanout runs on two self-rearming DMA chains and two PIO state machines:
//!
//! ```text
//!  line_ctrl ──► line_data ──bytes──► conv SM ──addr──► palette_ctrl ──► palette_data ──words──► video SM ──► pins
//!      ▲             │                                       ▲                 │
//!      └─── chain ───┘                                       └───── chain ─────┘
//! ```
//!
//! * `line_ctrl` copies one word (a line buffer address) into `line_data`'s
//!   read address, then chains to it. Its completion raises the line IRQ.
//! * `line_data` streams the 400 palette indices of that line, one byte per
//!   conversion-FIFO slot, then chains back to `line_ctrl`.
//! * the conversion state machine turns an index into the address of its
//!   cache entry: `(base >> 12) << 12 | index << 4`.
//! * `palette_ctrl` loads that address into `palette_data`, which moves the
//!   four words of the entry into the serializer FIFO.
//!
//! [`ChainPlan`] is the complete, hardware-independent description of that
//! wiring. Backends either program real registers from it or interpret it.

use bitfield::bitfield;

use crate::config::VideoConfig;
use crate::error::ScanoutError;
use crate::palette::SymbolCache;
use crate::scanline::{LineBuffers, LINE_SLOTS};

pub const DATA_SIZE_BYTE: u8 = 0;
pub const DATA_SIZE_WORD: u8 = 2;

/// Unpaced transfer request.
pub const TREQ_PERMANENT: u8 = 0x3f;

bitfield! {
    /// `CHx_CTRL_TRIG` of the RP2350 DMA block.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct DmaCtrl(u32);
    impl Debug;
    pub enable, set_enable: 0;
    pub high_priority, set_high_priority: 1;
    pub u8, data_size, set_data_size: 3, 2;
    pub incr_read, set_incr_read: 4;
    pub incr_write, set_incr_write: 6;
    pub u8, chain_to, set_chain_to: 16, 13;
    pub u8, treq_sel, set_treq_sel: 22, 17;
    pub irq_quiet, set_irq_quiet: 23;
    pub busy, _: 26;
}

impl DmaCtrl {
    fn channel(data_size: u8, incr_read: bool, treq: u8, chain_to: u8) -> Self {
        let mut ctrl = DmaCtrl(0);
        ctrl.set_enable(true);
        ctrl.set_data_size(data_size);
        ctrl.set_incr_read(incr_read);
        ctrl.set_treq_sel(treq);
        ctrl.set_chain_to(chain_to);
        ctrl
    }

    pub fn transfer_bytes(&self) -> usize {
        1 << self.data_size()
    }
}

/// Channel numbers handed out by the peripheral claim.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelIds {
    pub line_data: u8,
    pub line_ctrl: u8,
    pub palette_data: u8,
    pub palette_ctrl: u8,
}

impl ChannelIds {
    pub fn mask(&self) -> u32 {
        1 << self.line_data | 1 << self.line_ctrl | 1 << self.palette_data | 1 << self.palette_ctrl
    }
}

/// Addresses and pacing signals a backend exposes to the chain plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub channels: ChannelIds,
    /// read address register of `line_data`
    pub line_data_read_addr: usize,
    /// read address register of `palette_data`
    pub palette_data_read_addr: usize,
    pub conv_tx_fifo: usize,
    pub conv_rx_fifo: usize,
    pub video_tx_fifo: usize,
    pub dreq_conv_tx: u8,
    pub dreq_conv_rx: u8,
    pub dreq_video_tx: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelProgram {
    pub channel: u8,
    pub read_addr: usize,
    pub write_addr: usize,
    pub transfer_count: u32,
    pub ctrl: DmaCtrl,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainPlan {
    pub line_data: ChannelProgram,
    pub line_ctrl: ChannelProgram,
    pub palette_data: ChannelProgram,
    pub palette_ctrl: ChannelProgram,
    /// X register of the conversion state machine: cache base >> 12
    pub conv_x: u32,
    /// 16.8 serializer clock divider
    pub clock_divider: (u16, u8),
}

impl ChainPlan {
    pub fn build(
        config: &VideoConfig,
        endpoints: &Endpoints,
        lines: &LineBuffers,
        cache: &SymbolCache,
    ) -> Result<Self, ScanoutError> {
        let base = cache.base_addr();
        if base & 0xfff != 0 {
            return Err(ScanoutError::CacheMisaligned(base));
        }
        let ids = endpoints.channels;

        let line_data = ChannelProgram {
            channel: ids.line_data,
            read_addr: lines.buffer_addr(0),
            write_addr: endpoints.conv_tx_fifo,
            transfer_count: LINE_SLOTS as u32,
            ctrl: DmaCtrl::channel(DATA_SIZE_BYTE, true, endpoints.dreq_conv_tx, ids.line_ctrl),
        };

        let line_ctrl = ChannelProgram {
            channel: ids.line_ctrl,
            read_addr: lines.addr_cell(0).as_ptr() as usize,
            write_addr: endpoints.line_data_read_addr,
            transfer_count: 1,
            ctrl: DmaCtrl::channel(DATA_SIZE_WORD, false, TREQ_PERMANENT, ids.line_data),
        };

        let palette_data = ChannelProgram {
            channel: ids.palette_data,
            read_addr: base,
            write_addr: endpoints.video_tx_fifo,
            transfer_count: crate::palette::WORDS_PER_ENTRY as u32,
            ctrl: DmaCtrl::channel(DATA_SIZE_WORD, true, endpoints.dreq_video_tx, ids.palette_ctrl),
        };

        let palette_ctrl = ChannelProgram {
            channel: ids.palette_ctrl,
            read_addr: endpoints.conv_rx_fifo,
            write_addr: endpoints.palette_data_read_addr,
            transfer_count: 1,
            ctrl: DmaCtrl::channel(DATA_SIZE_WORD, false, endpoints.dreq_conv_rx, ids.palette_data),
        };

        Ok(Self {
            line_data,
            line_ctrl,
            palette_data,
            palette_ctrl,
            conv_x: (base >> 12) as u32,
            clock_divider: config.serializer_divider(),
        })
    }
}

/// Address conversion: index byte in, cache entry address out.
pub const CONV_PROGRAM: [u16; 4] = [
    0x80a0, // pull block
    0x40e8, // in osr, 8
    0x4034, // in x, 20
    0x8020, // push block
];

/// Serializer: five 6-bit outs per clock level, 2-bit side-set on the clock pair.
pub const VIDEO_PROGRAM: [u16; 10] = [
    0x7006, 0x7006, 0x7006, 0x7006, 0x7006, // out pins, 6  side 0b10
    0x6806, 0x6806, 0x6806, 0x6806, 0x6806, // out pins, 6  side 0b01
];

/// Bits of each FIFO word the serializer consumes before pulling again.
pub const VIDEO_PULL_THRESHOLD: u8 = 30;

pub const fn pio_set_x(value: u8) -> u16 {
    0xe020 | (value as u16 & 0x1f)
}

pub const PIO_IN_X_4: u16 = 0x4024;
pub const PIO_MOV_X_ISR: u16 = 0xa026;

/// Forced instructions that load a full 32-bit value into X, four bits at a
/// time through the ISR.
pub fn load_x_sequence(value: u32) -> [u16; 17] {
    let mut program = [PIO_MOV_X_ISR; 17];
    for nibble in 0..8 {
        program[nibble * 2] = pio_set_x(((value >> (nibble * 4)) & 0xf) as u8);
        program[nibble * 2 + 1] = PIO_IN_X_4;
    }
    program
}

/// Address the conversion program produces for `index`.
#[inline(always)]
pub fn conv_address(x: u32, index: u8) -> u32 {
    (x << 12) | (index as u32) << 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ctrl_fields_pack() {
        let ctrl = DmaCtrl::channel(DATA_SIZE_WORD, true, 9, 3);
        assert_eq!(ctrl.0, 1 | 2 << 2 | 1 << 4 | 3 << 13 | 9 << 17);
        assert_eq!(ctrl.transfer_bytes(), 4);
        assert!(!ctrl.incr_write());
    }

    #[test]
    fn load_x_shifts_nibbles_low_first() {
        let program = load_x_sequence(0x0001_2345);
        assert_eq!(program[0], 0xe025);
        assert_eq!(program[1], PIO_IN_X_4);
        assert_eq!(program[8], 0xe021);
        assert_eq!(program[10], 0xe020);
        assert_eq!(program[16], PIO_MOV_X_ISR);
    }

    #[test]
    fn conv_address_selects_entry() {
        assert_eq!(conv_address(0x20001, 5), 0x2000_1050);
    }
}
