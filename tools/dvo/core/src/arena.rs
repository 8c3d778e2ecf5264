//! Bump allocation over external PSRAM.
//!
//! The arena is carved up once: fixed scratch regions at the bottom, then a
//! permanent region that only grows, then a temporary region at the top that
//! is reset wholesale. Every allocation is preceded by one word holding its
//! rounded size, so `realloc` can copy without the caller remembering sizes.
//! Nothing is ever freed individually; [`ExternalHeap::mark`] and
//! [`ExternalHeap::restore`] roll an entire session back in one step.
//!
//! Internal mode sends requests to the platform allocator instead, with the
//! same header, so `free` and `realloc` work on either kind of pointer.

use alloc::alloc::{alloc as platform_alloc, dealloc as platform_dealloc, realloc as platform_realloc, Layout};
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use bytemuck::Zeroable;
use heapless::Vec;
use log::{debug, error, info, warn};

use crate::error::ArenaError;

/// Where the RP2350 maps PSRAM (QMI chip select 1).
pub const PSRAM_BASE: usize = 0x1100_0000;

pub const KIB: usize = 1024;

const WORD: usize = size_of::<usize>();

/// Allocations at least this large are logged.
pub const LOG_LARGE: usize = 64 * KIB;
/// Every allocation is logged once less than this remains.
pub const LOG_LOW: usize = 256 * KIB;

pub const SCRATCH_1: usize = 0;
pub const SCRATCH_2: usize = 1;
pub const FILE_BUFFER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Permanent,
    Temporary,
    /// platform allocator
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaLayout {
    pub scratch: Vec<ScratchRegion, 4>,
    /// bytes reserved for scratch at the bottom of the arena
    pub scratch_size: usize,
    /// bytes reserved for the temporary region at the top
    pub temp_size: usize,
}

impl ArenaLayout {
    /// Two 128 KiB work buffers and a 256 KiB file buffer, then a 512 KiB
    /// temporary region at the top.
    pub fn standard() -> Self {
        let mut scratch = Vec::new();
        for (offset, size) in [(0, 128 * KIB), (128 * KIB, 128 * KIB), (256 * KIB, 256 * KIB)] {
            // capacity 4, three regions
            let _ = scratch.push(ScratchRegion { offset, size });
        }
        Self {
            scratch,
            scratch_size: 512 * KIB,
            temp_size: 512 * KIB,
        }
    }

    /// Smallest arena this layout fits in, with a permanent region of at
    /// least one word.
    pub fn min_size(&self) -> usize {
        self.scratch_size + self.temp_size + 2 * WORD
    }
}

impl Default for ArenaLayout {
    fn default() -> Self {
        Self::standard()
    }
}

/// Saved offset of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaMark {
    partition: Partition,
    offset: usize,
}

impl ArenaMark {
    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

pub struct ExternalHeap {
    base: NonNull<u8>,
    size: usize,
    layout: ArenaLayout,
    /// permanent region is `[scratch_size, perm_end)`
    perm_end: usize,
    perm_offset: usize,
    /// relative to `perm_end`
    temp_offset: usize,
    mode: Partition,
    session_mark: Option<usize>,
}

// SAFETY: the heap owns its region; moving it between cores moves that ownership
unsafe impl Send for ExternalHeap {}

const fn round_up(size: usize) -> Option<usize> {
    match size.checked_add(WORD - 1) {
        Some(v) => Some(v & !(WORD - 1)),
        None => None,
    }
}

/// Rounded size, and the bytes it occupies including its header.
const fn with_header(size: usize) -> Option<(usize, usize)> {
    match round_up(size) {
        Some(rounded) => match rounded.checked_add(WORD) {
            Some(total) => Some((rounded, total)),
            None => None,
        },
        None => None,
    }
}

impl ExternalHeap {
    pub fn new(memory: &'static mut [u8], layout: ArenaLayout) -> Result<Self, ArenaError> {
        let size = memory.len();
        // SAFETY: the region is borrowed for 'static and handed over whole
        unsafe { Self::from_raw(memory.as_mut_ptr(), size, layout) }
    }

    /// # Safety
    /// `base..base + size` must be valid, writable, unaliased memory for as
    /// long as the heap or anything allocated from it is alive.
    pub unsafe fn from_raw(base: *mut u8, size: usize, layout: ArenaLayout) -> Result<Self, ArenaError> {
        let Some(base) = NonNull::new(base) else {
            return Err(ArenaError::Misaligned { addr: 0, align: WORD });
        };
        if base.as_ptr() as usize % WORD != 0 {
            return Err(ArenaError::Misaligned {
                addr: base.as_ptr() as usize,
                align: WORD,
            });
        }
        if size < layout.min_size() {
            return Err(ArenaError::LayoutTooSmall {
                size,
                required: layout.min_size(),
            });
        }
        if let Some(region) = layout.scratch.iter().find(|r| r.offset + r.size > layout.scratch_size) {
            return Err(ArenaError::LayoutTooSmall {
                size: layout.scratch_size,
                required: region.offset + region.size,
            });
        }

        let perm_end = (size - layout.temp_size) & !(WORD - 1);
        info!(
            "external heap: {} KiB at {:#010x}, {} KiB permanent, {} KiB temporary",
            size / KIB,
            base.as_ptr() as usize,
            (perm_end - layout.scratch_size) / KIB,
            layout.temp_size / KIB
        );

        Ok(Self {
            base,
            size,
            perm_offset: layout.scratch_size,
            layout,
            perm_end,
            temp_offset: 0,
            mode: Partition::Permanent,
            session_mark: None,
        })
    }

    /// The whole PSRAM device.
    ///
    /// # Safety
    /// PSRAM must be initialised and mapped at [`PSRAM_BASE`], and nothing
    /// else may use it.
    pub unsafe fn psram(size: usize) -> Result<Self, ArenaError> {
        Self::from_raw(PSRAM_BASE as *mut u8, size, ArenaLayout::standard())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn mode(&self) -> Partition {
        self.mode
    }

    /// Send requests to the temporary region (or back to the permanent one).
    pub fn set_temp_mode(&mut self, enabled: bool) {
        self.mode = if enabled { Partition::Temporary } else { Partition::Permanent };
    }

    /// Send requests to the platform allocator (or back to the permanent
    /// region), for code that genuinely frees.
    pub fn set_internal_mode(&mut self, enabled: bool) {
        self.mode = if enabled { Partition::Internal } else { Partition::Permanent };
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        (start..start + self.size).contains(&(ptr as usize))
    }

    /// Bytes taken from the permanent region.
    pub fn used(&self) -> usize {
        self.perm_offset - self.layout.scratch_size
    }

    pub fn remaining(&self) -> usize {
        self.perm_end - self.perm_offset
    }

    pub fn temp_remaining(&self) -> usize {
        self.layout.temp_size - self.temp_offset
    }

    /// Word-aligned block of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let (rounded, total) = with_header(size).ok_or(ArenaError::OutOfMemory {
            partition: self.mode,
            requested: size,
            remaining: 0,
        })?;

        match self.mode {
            Partition::Internal => self.alloc_internal(rounded),
            Partition::Temporary => {
                let remaining = self.temp_remaining();
                if total > remaining {
                    error!("temporary region exhausted: requested {}, {} free", rounded, remaining);
                    return Err(ArenaError::OutOfMemory {
                        partition: Partition::Temporary,
                        requested: rounded,
                        remaining,
                    });
                }
                let at = self.perm_end + self.temp_offset;
                self.temp_offset += total;
                // SAFETY: `at + WORD + rounded` is inside the temporary region
                Ok(unsafe { self.place(at, rounded) })
            }
            Partition::Permanent => {
                let remaining = self.remaining();
                if total > remaining {
                    error!("permanent region exhausted: requested {}, {} free", rounded, remaining);
                    return Err(ArenaError::OutOfMemory {
                        partition: Partition::Permanent,
                        requested: rounded,
                        remaining,
                    });
                }
                let at = self.perm_offset;
                self.perm_offset += total;
                // SAFETY: `at + WORD + rounded` is inside the permanent region
                let ptr = unsafe { self.place(at, rounded) };

                let left = self.remaining();
                if rounded >= LOG_LARGE || left < LOG_LOW {
                    info!(
                        "alloc({}) -> {:#010x}, {} used, {} remaining",
                        rounded,
                        ptr.as_ptr() as usize,
                        self.used(),
                        left
                    );
                }
                Ok(ptr)
            }
        }
    }

    /// Write the header at `offset` and return the block after it.
    unsafe fn place(&mut self, offset: usize, size: usize) -> NonNull<u8> {
        let header = self.base.as_ptr().add(offset) as *mut usize;
        header.write(size);
        NonNull::new_unchecked(header.add(1) as *mut u8)
    }

    fn alloc_internal(&mut self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let total = size.checked_add(WORD).ok_or(ArenaError::Platform(size))?;
        let layout = Layout::from_size_align(total, WORD).map_err(|_| ArenaError::Platform(size))?;
        // SAFETY: layout is non-zero sized
        let raw = unsafe { platform_alloc(layout) } as *mut usize;
        if raw.is_null() {
            error!("platform allocator refused {} bytes", size);
            return Err(ArenaError::Platform(size));
        }
        // SAFETY: raw is a fresh block of size + WORD bytes
        unsafe {
            raw.write(size);
            Ok(NonNull::new_unchecked(raw.add(1) as *mut u8))
        }
    }

    /// `count * size` zeroed bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let total = count.checked_mul(size).ok_or(ArenaError::OutOfMemory {
            partition: self.mode,
            requested: usize::MAX,
            remaining: self.remaining(),
        })?;
        let ptr = self.alloc(total)?;
        // SAFETY: the block holds at least `total` bytes
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Ok(ptr)
    }

    /// A zeroed, arena-backed slice.
    ///
    /// # Safety
    /// The slice is only valid until the allocation is rolled back by
    /// [`restore`](Self::restore), [`restore_session`](Self::restore_session),
    /// [`reset`](Self::reset) or a temporary reset.
    pub unsafe fn alloc_zeroed_slice<T: Zeroable>(&mut self, len: usize) -> Result<&'static mut [T], ArenaError> {
        if align_of::<T>() > WORD {
            return Err(ArenaError::Misaligned {
                addr: self.base.as_ptr() as usize + self.perm_offset + WORD,
                align: align_of::<T>(),
            });
        }
        let bytes = len.saturating_mul(size_of::<T>());
        let ptr = self.calloc(1, bytes)?;
        Ok(core::slice::from_raw_parts_mut(ptr.as_ptr() as *mut T, len))
    }

    /// Size recorded in the header of `ptr`.
    ///
    /// # Safety
    /// `ptr` must come from this heap.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        (ptr.as_ptr() as *const usize).sub(1).read()
    }

    /// No-op for arena blocks; platform blocks are released.
    ///
    /// # Safety
    /// `ptr` must come from this heap and not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        if self.contains(ptr.as_ptr()) {
            return;
        }
        let size = self.block_size(ptr);
        let raw = (ptr.as_ptr() as *mut usize).sub(1) as *mut u8;
        platform_dealloc(raw, Layout::from_size_align_unchecked(size + WORD, WORD));
    }

    /// Shrinking an arena block keeps it in place; growing allocates anew,
    /// copies and leaks the old block. `new_size == 0` frees and returns
    /// `None`.
    ///
    /// # Safety
    /// `ptr` must come from this heap. On success the old pointer must not be
    /// used again unless it was returned unchanged.
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Result<Option<NonNull<u8>>, ArenaError> {
        let Some(ptr) = ptr else {
            return self.alloc(new_size).map(Some);
        };
        if new_size == 0 {
            self.free(ptr);
            return Ok(None);
        }

        let old_size = self.block_size(ptr);
        if !self.contains(ptr.as_ptr()) {
            let (rounded, total) = with_header(new_size).ok_or(ArenaError::Platform(new_size))?;
            Layout::from_size_align(total, WORD).map_err(|_| ArenaError::Platform(new_size))?;
            let raw = (ptr.as_ptr() as *mut usize).sub(1) as *mut u8;
            let old = Layout::from_size_align_unchecked(old_size + WORD, WORD);
            let grown = platform_realloc(raw, old, total) as *mut usize;
            if grown.is_null() {
                return Err(ArenaError::Platform(new_size));
            }
            grown.write(rounded);
            return Ok(Some(NonNull::new_unchecked(grown.add(1) as *mut u8)));
        }

        if new_size <= old_size {
            return Ok(Some(ptr));
        }
        let fresh = self.alloc(new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size);
        Ok(Some(fresh))
    }

    /// Fixed scratch region `region`, if it holds `size` bytes.
    pub fn scratch(&mut self, region: usize, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let r = *self.layout.scratch.get(region).ok_or(ArenaError::UnknownScratch(region))?;
        if size > r.size {
            warn!("scratch region {} too small: requested {}, holds {}", region, size, r.size);
            return Err(ArenaError::ScratchTooLarge {
                region,
                requested: size,
                max: r.size,
            });
        }
        // SAFETY: the region lies inside the scratch area, which is inside the heap
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(r.offset)) })
    }

    /// Drop everything, including the session mark.
    pub fn reset(&mut self) {
        self.perm_offset = self.layout.scratch_size;
        self.temp_offset = 0;
        self.session_mark = None;
        debug!("external heap reset");
    }

    pub fn reset_temp(&mut self) {
        self.temp_offset = 0;
    }

    pub fn temp_offset(&self) -> usize {
        self.temp_offset
    }

    /// Roll the temporary region to an offset saved from
    /// [`temp_offset`](Self::temp_offset). Clamped to the region.
    pub fn set_temp_offset(&mut self, offset: usize) {
        self.temp_offset = offset.min(self.layout.temp_size);
    }

    /// Current offset of the active partition.
    pub fn mark(&self) -> ArenaMark {
        let offset = match self.mode {
            Partition::Temporary => self.temp_offset,
            _ => self.perm_offset,
        };
        let partition = match self.mode {
            Partition::Temporary => Partition::Temporary,
            _ => Partition::Permanent,
        };
        ArenaMark { partition, offset }
    }

    /// Return the marked partition to exactly where it was. Everything
    /// allocated after the mark becomes invalid.
    pub fn restore(&mut self, mark: ArenaMark) {
        match mark.partition {
            Partition::Temporary => self.temp_offset = mark.offset,
            _ => {
                debug!("external heap restored to {:#x}, {} bytes released", mark.offset, self.perm_offset.saturating_sub(mark.offset));
                self.perm_offset = mark.offset;
            }
        }
    }

    /// Remember the permanent offset as the start of a session (e.g. right
    /// after a ROM is loaded).
    pub fn mark_session(&mut self) {
        self.session_mark = Some(self.perm_offset);
        info!("session marked at {:#x} ({} KiB used)", self.perm_offset, self.used() / KIB);
    }

    /// Release everything allocated since [`mark_session`](Self::mark_session),
    /// along with the whole temporary region.
    pub fn restore_session(&mut self) -> bool {
        let Some(mark) = self.session_mark else {
            warn!("no session mark set, nothing restored");
            return false;
        };
        let freed = self.perm_offset.saturating_sub(mark);
        self.perm_offset = mark;
        self.temp_offset = 0;
        info!("session restored to {:#x} ({} KiB freed)", mark, freed / KIB);
        true
    }
}
