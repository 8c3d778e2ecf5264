//! Hardware ownership for scanout.
//!
//! The four DMA channels and two PIO state machines are claimed exactly once
//! through [`VideoPeripherals::take`]. The tokens are neither `Clone` nor
//! `Copy`, so a backend built from them is the only code that can touch
//! those channels.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::dma::{ChainPlan, ChannelIds, Endpoints};
use crate::error::ScanoutError;

pub mod map;
#[cfg(feature = "rp2350")]
pub mod rp2350;
pub mod sim;

pub trait ScanoutHardware {
    /// Register and FIFO addresses for [`ChainPlan::build`].
    fn endpoints(&self) -> Endpoints;

    /// Program both chains and start streaming. Called once.
    fn start(&mut self, plan: &ChainPlan) -> Result<(), ScanoutError>;

    /// Clear the line interrupt.
    fn acknowledge_line(&mut self);

    /// Point the control channel at `cell` without triggering it; the data
    /// channel's chain starts it when the current line ends.
    fn queue_line(&mut self, cell: &AtomicUsize);
}

#[derive(Debug, PartialEq, Eq)]
pub struct DmaChannel {
    id: u8,
}

impl DmaChannel {
    pub fn id(&self) -> u8 {
        self.id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StateMachine {
    pio: u8,
    sm: u8,
}

impl StateMachine {
    pub fn pio(&self) -> u8 {
        self.pio
    }

    pub fn sm(&self) -> u8 {
        self.sm
    }
}

/// Everything scanout needs: two chains of two channels, a serializer and an
/// address converter. Both state machines live on PIO1.
#[derive(Debug)]
pub struct VideoPeripherals {
    pub line_data: DmaChannel,
    pub line_ctrl: DmaChannel,
    pub palette_data: DmaChannel,
    pub palette_ctrl: DmaChannel,
    pub video_sm: StateMachine,
    pub conv_sm: StateMachine,
}

static TAKEN: AtomicBool = AtomicBool::new(false);

impl VideoPeripherals {
    /// Claim the scanout peripherals. `None` after the first call.
    pub fn take() -> Option<Self> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: first and only claim
        Some(unsafe { Self::steal() })
    }

    /// Like [`take`](Self::take), as a start-up error.
    pub fn claim() -> Result<Self, ScanoutError> {
        Self::take().ok_or(ScanoutError::PeripheralsTaken)
    }

    /// # Safety
    /// Creates tokens regardless of earlier claims. Two live owners of the
    /// same hardware channels will corrupt each other's chains.
    pub unsafe fn steal() -> Self {
        Self {
            line_data: DmaChannel { id: 0 },
            line_ctrl: DmaChannel { id: 1 },
            palette_data: DmaChannel { id: 2 },
            palette_ctrl: DmaChannel { id: 3 },
            video_sm: StateMachine { pio: 1, sm: 0 },
            conv_sm: StateMachine { pio: 1, sm: 1 },
        }
    }

    pub fn channel_ids(&self) -> ChannelIds {
        ChannelIds {
            line_data: self.line_data.id,
            line_ctrl: self.line_ctrl.id,
            palette_data: self.palette_data.id,
            palette_ctrl: self.palette_ctrl.id,
        }
    }

    /// Where the claimed channels and state machines sit in the address map.
    pub fn endpoints(&self) -> Endpoints {
        let channels = self.channel_ids();
        let (conv, video) = (&self.conv_sm, &self.video_sm);
        Endpoints {
            channels,
            line_data_read_addr: map::dma_read_addr(channels.line_data),
            palette_data_read_addr: map::dma_read_addr(channels.palette_data),
            conv_tx_fifo: map::pio_txf(conv.pio, conv.sm),
            conv_rx_fifo: map::pio_rxf(conv.pio, conv.sm),
            video_tx_fifo: map::pio_txf(video.pio, video.sm),
            dreq_conv_tx: map::dreq_tx(conv.pio, conv.sm),
            dreq_conv_rx: map::dreq_rx(conv.pio, conv.sm),
            dreq_video_tx: map::dreq_tx(video.pio, video.sm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn peripherals_are_claimed_once() {
        let first = VideoPeripherals::take();
        assert!(first.is_some());
        assert!(VideoPeripherals::take().is_none());
        assert_eq!(VideoPeripherals::claim().err(), Some(ScanoutError::PeripheralsTaken));
        assert_eq!(first.map(|p| p.channel_ids().mask()), Some(0b1111));
    }
}
