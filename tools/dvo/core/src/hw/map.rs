//! RP2350 address map, as far as scanout needs it.

pub const DMA_BASE: usize = 0x5000_0000;
pub const DMA_CHANNEL_STRIDE: usize = 0x40;
pub const DMA_INTS0: usize = DMA_BASE + 0x40c;
pub const DMA_MULTI_CHAN_TRIGGER: usize = DMA_BASE + 0x450;

pub const PIO0_BASE: usize = 0x5020_0000;
pub const PIO_STRIDE: usize = 0x10_0000;
pub const PIO_TXF0: usize = 0x010;
pub const PIO_RXF0: usize = 0x020;

pub const IO_BANK0_BASE: usize = 0x4002_8000;
pub const PADS_BANK0_BASE: usize = 0x4003_8000;

/// GPIO function select for PIO0; PIO1 and PIO2 follow.
pub const FUNCSEL_PIO0: u32 = 6;

/// NVIC line of `DMA_IRQ_0`.
pub const DMA_IRQ_0: u16 = 10;

pub const DREQ_PIO_TX0: u8 = 0;
pub const DREQ_PIO_RX0: u8 = 4;
pub const DREQ_PER_PIO: u8 = 8;

pub const fn dma_channel(channel: u8) -> usize {
    DMA_BASE + channel as usize * DMA_CHANNEL_STRIDE
}

/// `CHx_READ_ADDR` is the first register of each channel.
pub const fn dma_read_addr(channel: u8) -> usize {
    dma_channel(channel)
}

pub const fn pio_base(pio: u8) -> usize {
    PIO0_BASE + pio as usize * PIO_STRIDE
}

pub const fn pio_txf(pio: u8, sm: u8) -> usize {
    pio_base(pio) + PIO_TXF0 + sm as usize * 4
}

pub const fn pio_rxf(pio: u8, sm: u8) -> usize {
    pio_base(pio) + PIO_RXF0 + sm as usize * 4
}

pub const fn dreq_tx(pio: u8, sm: u8) -> u8 {
    pio * DREQ_PER_PIO + DREQ_PIO_TX0 + sm
}

pub const fn dreq_rx(pio: u8, sm: u8) -> u8 {
    pio * DREQ_PER_PIO + DREQ_PIO_RX0 + sm
}

/// Channel whose `READ_ADDR` lives at `addr`, if any.
pub fn read_addr_channel(addr: usize) -> Option<u8> {
    let offset = addr.checked_sub(DMA_BASE)?;
    if offset % DMA_CHANNEL_STRIDE != 0 || offset / DMA_CHANNEL_STRIDE >= 16 {
        return None;
    }
    Some((offset / DMA_CHANNEL_STRIDE) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pio1_endpoints() {
        assert_eq!(pio_txf(1, 1), 0x5030_0014);
        assert_eq!(pio_rxf(1, 1), 0x5030_0024);
        assert_eq!(dreq_tx(1, 0), 8);
        assert_eq!(dreq_rx(1, 1), 13);
        assert_eq!(read_addr_channel(dma_read_addr(3)), Some(3));
        assert_eq!(read_addr_channel(dma_read_addr(3) + 4), None);
    }
}
