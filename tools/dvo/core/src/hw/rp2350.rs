//! # RP2350 scanout backend
//!
//! Programs the claimed DMA channels and PIO1 state machines straight from a
//! [`ChainPlan`]. Clocks, resets and the NVIC are left to board bring-up:
//! DMA and PIO1 must be out of reset, and `DMA_IRQ_0` (NVIC line
//! [`map::DMA_IRQ_0`]) must be unmasked at the highest priority with a
//! handler that calls [`ScanlineProducer::on_line_irq`].
//!
//! | Resource | Use |
//! |----------|-----|
//! | PIO1 SM0 | serializer, instruction memory 0..10 |
//! | PIO1 SM1 | address converter, instruction memory 10..14 |
//! | DMA 0-3 | line data, line control, palette data, palette control |
//! | GPIO | clock pair and three data pairs at 12 mA, fast slew |
//!
//! [`ScanlineProducer::on_line_irq`]: crate::scanline::ScanlineProducer::on_line_irq

use core::sync::atomic::AtomicUsize;

use bitfield::bitfield;
use log::{debug, info};
use volatile_register::{RO, RW, WO};

use crate::config::Pinout;
use crate::dma::{self, ChainPlan, ChannelProgram, Endpoints, CONV_PROGRAM, VIDEO_PROGRAM, VIDEO_PULL_THRESHOLD};
use crate::error::{ConfigError, ScanoutError};
use crate::hw::{map, ScanoutHardware, VideoPeripherals};

const VIDEO_OFFSET: u8 = 0;
const CONV_OFFSET: u8 = VIDEO_PROGRAM.len() as u8;

#[repr(C)]
pub struct DmaChannelRegs {
    pub read_addr: RW<u32>,
    pub write_addr: RW<u32>,
    pub trans_count: RW<u32>,
    pub ctrl_trig: RW<u32>,
    /// `CTRL` alias that does not trigger
    pub al1_ctrl: RW<u32>,
    _aliases: [u32; 11],
}

#[repr(C)]
pub struct DmaRegs {
    pub ch: [DmaChannelRegs; 16],
    pub intr: RW<u32>,
    pub inte0: RW<u32>,
    pub intf0: RW<u32>,
    pub ints0: RW<u32>,
    _irq1_3_timers: [u32; 16],
    pub multi_chan_trigger: WO<u32>,
    _sniff_fifo: [u32; 4],
    pub chan_abort: RW<u32>,
}

#[repr(C)]
pub struct PioSmRegs {
    pub clkdiv: RW<u32>,
    pub execctrl: RW<u32>,
    pub shiftctrl: RW<u32>,
    pub addr: RO<u32>,
    pub instr: RW<u32>,
    pub pinctrl: RW<u32>,
}

#[repr(C)]
pub struct PioRegs {
    pub ctrl: RW<u32>,
    pub fstat: RO<u32>,
    pub fdebug: RW<u32>,
    pub flevel: RO<u32>,
    pub txf: [WO<u32>; 4],
    pub rxf: [RO<u32>; 4],
    pub irq: RW<u32>,
    pub irq_force: WO<u32>,
    pub input_sync_bypass: RW<u32>,
    pub dbg_padout: RO<u32>,
    pub dbg_padoe: RO<u32>,
    pub dbg_cfginfo: RO<u32>,
    pub instr_mem: [WO<u32>; 32],
    pub sm: [PioSmRegs; 4],
    _rxf_putget: [u32; 16],
    pub gpiobase: RW<u32>,
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ExecCtrl(u32);
    impl Debug;
    pub u8, wrap_bottom, set_wrap_bottom: 11, 7;
    pub u8, wrap_top, set_wrap_top: 16, 12;
    pub side_pindir, set_side_pindir: 29;
    pub side_en, set_side_en: 30;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ShiftCtrl(u32);
    impl Debug;
    pub autopush, set_autopush: 16;
    pub autopull, set_autopull: 17;
    pub in_shift_right, set_in_shift_right: 18;
    pub out_shift_right, set_out_shift_right: 19;
    pub u8, push_thresh, set_push_thresh: 24, 20;
    pub u8, pull_thresh, set_pull_thresh: 29, 25;
    pub fjoin_tx, set_fjoin_tx: 30;
    pub fjoin_rx, set_fjoin_rx: 31;
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct PinCtrl(u32);
    impl Debug;
    pub u8, out_base, set_out_base: 4, 0;
    pub u8, set_base, set_set_base: 9, 5;
    pub u8, sideset_base, set_sideset_base: 14, 10;
    pub u8, out_count, set_out_count: 25, 20;
    pub u8, set_count, set_set_count: 28, 26;
    pub u8, sideset_count, set_sideset_count: 31, 29;
}

/// `set pindirs, value`
const fn set_pindirs(value: u8) -> u32 {
    0xe080 | (value as u32 & 0x1f)
}

/// `set pins, value`
const fn set_pins(value: u8) -> u32 {
    0xe000 | (value as u32 & 0x1f)
}

/// `jmp addr`
const fn jmp(addr: u8) -> u32 {
    addr as u32 & 0x1f
}

/// PADS: fast slew, input enabled, 12 mA, isolation off.
const PAD_HDMI: u32 = 1 | 1 << 6 | 3 << 4;

pub struct Rp2350Video {
    peripherals: VideoPeripherals,
    pinout: Pinout,
    gpio_base: u8,
    dma: &'static DmaRegs,
    pio: &'static PioRegs,
}

impl Rp2350Video {
    pub fn new(peripherals: VideoPeripherals, pinout: Pinout) -> Result<Self, ScanoutError> {
        pinout.validate()?;
        let lowest = pinout.clk_base.min(pinout.data_base);
        let highest = match (pinout.clk_last(), pinout.data_last()) {
            (Some(clk), Some(data)) => clk.max(data),
            _ => return Err(ConfigError::PinOutOfRange { pin: pinout.clk_base.max(pinout.data_base) }.into()),
        };
        // a PIO sees 32 consecutive GPIOs starting at 0 or 16
        let gpio_base = if highest < 32 { 0 } else { 16 };
        if lowest < gpio_base {
            return Err(ConfigError::PinOutOfRange { pin: lowest }.into());
        }

        // SAFETY: the peripheral tokens make this the only code touching the
        // claimed channels and state machines; other registers are only read
        let dma = unsafe { &*(map::DMA_BASE as *const DmaRegs) };
        let pio = unsafe { &*(map::pio_base(peripherals.video_sm.pio()) as *const PioRegs) };

        Ok(Self {
            peripherals,
            pinout,
            gpio_base,
            dma,
            pio,
        })
    }

    fn configure_pins(&self) {
        let funcsel = map::FUNCSEL_PIO0 + self.peripherals.video_sm.pio() as u32;
        let clk = self.pinout.clk_base..self.pinout.clk_base + 2;
        let data = self.pinout.data_base..self.pinout.data_base + 6;

        for pin in clk.chain(data) {
            let ctrl = (map::IO_BANK0_BASE + 4 + 8 * pin as usize) as *mut u32;
            let pad = (map::PADS_BANK0_BASE + 4 + 4 * pin as usize) as *mut u32;
            // SAFETY: GPIO control and pad registers of pins owned by the pinout
            unsafe {
                pad.write_volatile(PAD_HDMI);
                ctrl.write_volatile(funcsel);
            }
        }
    }

    fn exec(&self, sm: u8, instr: u32) {
        // SAFETY: forced instruction on a claimed state machine
        unsafe { self.pio.sm[sm as usize].instr.write(instr) }
    }

    fn load_programs(&self) {
        for (i, &instr) in VIDEO_PROGRAM.iter().enumerate() {
            unsafe { self.pio.instr_mem[VIDEO_OFFSET as usize + i].write(instr as u32) }
        }
        for (i, &instr) in CONV_PROGRAM.iter().enumerate() {
            unsafe { self.pio.instr_mem[CONV_OFFSET as usize + i].write(instr as u32) }
        }
    }

    fn configure_converter(&self, conv_x: u32) {
        let sm = self.peripherals.conv_sm.sm();
        let regs = &self.pio.sm[sm as usize];

        let mut exec = ExecCtrl(0);
        exec.set_wrap_bottom(CONV_OFFSET);
        exec.set_wrap_top(CONV_OFFSET + CONV_PROGRAM.len() as u8 - 1);

        let mut shift = ShiftCtrl(0);
        shift.set_in_shift_right(true);
        shift.set_out_shift_right(true);

        unsafe {
            regs.clkdiv.write(1 << 16);
            regs.execctrl.write(exec.0);
            regs.shiftctrl.write(shift.0);
            regs.pinctrl.write(0);
        }

        for instr in dma::load_x_sequence(conv_x) {
            self.exec(sm, instr as u32);
        }
        self.exec(sm, jmp(CONV_OFFSET));
    }

    fn configure_serializer(&self, divider: (u16, u8)) {
        let sm = self.peripherals.video_sm.sm();
        let regs = &self.pio.sm[sm as usize];
        let clk = self.pinout.clk_base - self.gpio_base;
        let data = self.pinout.data_base - self.gpio_base;

        let mut exec = ExecCtrl(0);
        exec.set_wrap_bottom(VIDEO_OFFSET);
        exec.set_wrap_top(VIDEO_OFFSET + VIDEO_PROGRAM.len() as u8 - 1);

        let mut shift = ShiftCtrl(0);
        shift.set_out_shift_right(true);
        shift.set_autopull(true);
        shift.set_pull_thresh(VIDEO_PULL_THRESHOLD);
        shift.set_fjoin_tx(true);

        unsafe {
            regs.clkdiv.write((divider.0 as u32) << 16 | (divider.1 as u32) << 8);
            regs.execctrl.write(exec.0);
            regs.shiftctrl.write(shift.0);
        }

        // drive every pin as an output, clock pair idling high
        for (base, count, value) in [(data, 5, 0x1f), (data + 5, 1, 0x01), (clk, 2, 0x03)] {
            let mut pins = PinCtrl(0);
            pins.set_set_base(base);
            pins.set_set_count(count);
            unsafe { regs.pinctrl.write(pins.0) }
            self.exec(sm, set_pindirs(value));
            if base == clk {
                self.exec(sm, set_pins(value));
            }
        }

        let mut pins = PinCtrl(0);
        pins.set_out_base(data);
        pins.set_out_count(6);
        pins.set_sideset_base(clk);
        pins.set_sideset_count(2);
        unsafe { regs.pinctrl.write(pins.0) }

        self.exec(sm, jmp(VIDEO_OFFSET));
    }

    fn program_channel(&self, program: &ChannelProgram, trigger: bool) {
        let ch = &self.dma.ch[program.channel as usize];
        unsafe {
            ch.read_addr.write(program.read_addr as u32);
            ch.write_addr.write(program.write_addr as u32);
            ch.trans_count.write(program.transfer_count);
            if trigger {
                ch.ctrl_trig.write(program.ctrl.0);
            } else {
                ch.al1_ctrl.write(program.ctrl.0);
            }
        }
    }
}

impl ScanoutHardware for Rp2350Video {
    fn endpoints(&self) -> Endpoints {
        self.peripherals.endpoints()
    }

    fn start(&mut self, plan: &ChainPlan) -> Result<(), ScanoutError> {
        let ids = self.peripherals.channel_ids();
        let video = self.peripherals.video_sm.sm();
        let conv = self.peripherals.conv_sm.sm();
        let sm_mask = 1 << video | 1 << conv;

        unsafe {
            self.dma.inte0.modify(|v| v & !(1 << ids.line_ctrl));
            self.dma.chan_abort.write(ids.mask());
        }
        while self.dma.chan_abort.read() != 0 {}

        unsafe {
            self.pio.ctrl.modify(|v| v & !sm_mask);
            self.pio.gpiobase.write(self.gpio_base as u32);
        }
        self.load_programs();
        self.configure_converter(plan.conv_x);
        self.configure_serializer(plan.clock_divider);
        self.configure_pins();
        unsafe {
            // restart both state machines and their clock dividers, then enable
            self.pio.ctrl.modify(|v| v | sm_mask << 4 | sm_mask << 8);
            self.pio.ctrl.modify(|v| v | sm_mask);
        }
        debug!("pio1 running, conv x = {:#07x}", plan.conv_x);

        self.program_channel(&plan.line_data, false);
        self.program_channel(&plan.line_ctrl, false);
        self.program_channel(&plan.palette_data, false);
        // palette control waits on the converter FIFO, so it can run now
        self.program_channel(&plan.palette_ctrl, true);

        unsafe {
            self.dma.ints0.write(1 << ids.line_ctrl);
            self.dma.inte0.modify(|v| v | 1 << ids.line_ctrl);
            self.dma.multi_chan_trigger.write(1 << ids.line_ctrl);
        }

        info!("dma chains started on channels {:?}", ids);
        Ok(())
    }

    #[inline(always)]
    fn acknowledge_line(&mut self) {
        let ch = self.peripherals.line_ctrl.id();
        unsafe { self.dma.ints0.write(1 << ch) }
    }

    #[inline(always)]
    fn queue_line(&mut self, cell: &AtomicUsize) {
        let ch = self.peripherals.line_ctrl.id();
        unsafe { self.dma.ch[ch as usize].read_addr.write(cell.as_ptr() as u32) }
    }
}
