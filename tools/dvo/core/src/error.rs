use thiserror::Error;

use crate::arena::Partition;

/// Rejected [`VideoConfig`](crate::config::VideoConfig). Raised once, before streaming starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("width {width} exceeds the {max}-pixel active window")]
    WidthTooLarge { width: u16, max: u16 },
    #[error("width {0} is not a multiple of 4")]
    WidthNotAligned(u16),
    #[error("height {height} exceeds the {max}-line active region")]
    HeightTooLarge { height: u16, max: u16 },
    #[error("resolution must be non-zero")]
    EmptyResolution,
    #[error("horizontal shift {shift} puts the image outside the active window")]
    ShiftOutOfRange { shift: i16 },
    #[error("gpio {pin} is out of range")]
    PinOutOfRange { pin: u8 },
    #[error("clock pair and data pins overlap")]
    PinOverlap,
    #[error("system clock {hz}Hz is below the {min}Hz serializer rate")]
    ClockTooSlow { hz: u32, min: u32 },
    #[error("border colour {0} is a sync-control index")]
    ReservedBorder(u8),
    #[error("pixel storage holds {len} words, {required} required")]
    StorageTooSmall { len: usize, required: usize },
    #[error("skip pattern must render 1..={cycle} of {cycle} frames (cycle at most 32), got {rendered}")]
    SkipPattern { rendered: u8, cycle: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScanoutError {
    #[error("invalid video configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("video peripherals were already claimed")]
    PeripheralsTaken,
    #[error("symbol cache at {0:#010x} is not 4KiB aligned")]
    CacheMisaligned(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("{partition:?} partition exhausted: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory {
        partition: Partition,
        requested: usize,
        remaining: usize,
    },
    #[error("scratch region {region} holds {max} bytes, requested {requested}")]
    ScratchTooLarge {
        region: usize,
        requested: usize,
        max: usize,
    },
    #[error("no scratch region {0}")]
    UnknownScratch(usize),
    #[error("arena of {size} bytes cannot hold the {required}-byte layout")]
    LayoutTooSmall { size: usize, required: usize },
    #[error("{addr:#010x} is not {align}-byte aligned")]
    Misaligned { addr: usize, align: usize },
    #[error("platform allocator refused {0} bytes")]
    Platform(usize),
}
