//! # Palette and symbol cache
//!
//! The emulation core writes 24-bit colours into a 256-entry table; the
//! scanout only ever sees their pre-encoded [TMDS symbols](crate::tmds).
//!
//! | Index | Meaning |
//! |-------|---------|
//! | 0-250 | ordinary colours |
//! | 251 | idle (no sync asserted) |
//! | 252 | horizontal sync |
//! | 253 | vertical sync |
//! | 254 | horizontal + vertical sync |
//! | 255 | ordinary colour (background) |
//!
//! The cache entries of the four sync indices never change. Colours written
//! to them are kept in the table, but pixel data carrying those values is
//! remapped to the closest ordinary colour while the line is copied.

use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU8, Ordering};

use log::debug;

use crate::config::Pinout;
use crate::tmds::{self, ColorConverter, SelectedConverter};

pub const PALETTE_SIZE: usize = 256;

pub const IDLE: u8 = 251;
pub const HSYNC: u8 = 252;
pub const VSYNC: u8 = 253;
pub const HVSYNC: u8 = 254;
pub const RESERVED_BASE: u8 = IDLE;
pub const RESERVED_COUNT: usize = 4;

/// Cache words per palette index: symbol low/high, complement low/high.
pub const WORDS_PER_ENTRY: usize = 4;

#[inline(always)]
pub const fn is_reserved(index: u8) -> bool {
    index >= RESERVED_BASE && index <= HVSYNC
}

/// Encoded symbols, laid out for the address-conversion state machine:
/// entry `i` starts at byte `i << 4`, and the table base is 4KiB aligned so
/// a fetch address is `(base >> 12) << 12 | index << 4`.
#[repr(C, align(4096))]
pub struct SymbolCache {
    words: [AtomicU32; PALETTE_SIZE * WORDS_PER_ENTRY],
}

impl SymbolCache {
    const fn new() -> Self {
        Self {
            words: [const { AtomicU32::new(0) }; PALETTE_SIZE * WORDS_PER_ENTRY],
        }
    }

    pub fn base_addr(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// The four words streamed for `index`.
    #[inline(always)]
    pub fn entry(&self, index: u8) -> [u32; WORDS_PER_ENTRY] {
        let at = index as usize * WORDS_PER_ENTRY;
        core::array::from_fn(|i| self.words[at + i].load(Ordering::Relaxed))
    }

    /// `(symbol, complement)` for `index`.
    pub fn symbols(&self, index: u8) -> (u64, u64) {
        let [lo, hi, clo, chi] = self.entry(index);
        (
            (hi as u64) << 32 | lo as u64,
            (chi as u64) << 32 | clo as u64,
        )
    }

    fn store(&self, index: u8, symbol: u64, complement: u64) {
        let at = index as usize * WORDS_PER_ENTRY;
        self.words[at].store(symbol as u32, Ordering::Relaxed);
        self.words[at + 1].store((symbol >> 32) as u32, Ordering::Relaxed);
        self.words[at + 2].store(complement as u32, Ordering::Relaxed);
        self.words[at + 3].store((complement >> 32) as u32, Ordering::Relaxed);
    }
}

pub struct Palette {
    colors: [AtomicU32; PALETTE_SIZE],
    cache: SymbolCache,
    substitutes: [AtomicU8; RESERVED_COUNT],
    converter: SelectedConverter,
    full_update_pending: AtomicBool,
    substitutes_stale: AtomicBool,
}

impl Palette {
    /// All-black palette with a fully converted cache.
    pub fn new(pinout: Pinout) -> Self {
        let palette = Self {
            colors: [const { AtomicU32::new(0) }; PALETTE_SIZE],
            cache: SymbolCache::new(),
            substitutes: [const { AtomicU8::new(0) }; RESERVED_COUNT],
            converter: SelectedConverter::new(pinout),
            full_update_pending: AtomicBool::new(false),
            substitutes_stale: AtomicBool::new(false),
        };
        palette.convert_all();
        palette
    }

    pub fn cache(&self) -> &SymbolCache {
        &self.cache
    }

    pub fn pinout(&self) -> &Pinout {
        self.converter.pinout()
    }

    pub fn color(&self, index: u8) -> u32 {
        self.colors[index as usize].load(Ordering::Relaxed)
    }

    /// Store a colour and re-encode its cache entry immediately. Sync
    /// indices keep their control symbols.
    ///
    /// May race a full conversion on the other core; see [`Self::encode`].
    pub fn set_palette(&self, index: u8, rgb: u32) {
        self.colors[index as usize].store(rgb & 0x00ff_ffff, Ordering::SeqCst);
        self.substitutes_stale.store(true, Ordering::Release);

        if is_reserved(index) {
            return;
        }
        self.encode(index);
    }

    /// Defer a full re-encode to the next vertical blank.
    pub fn request_full_palette_update(&self) {
        self.full_update_pending.store(true, Ordering::Release);
    }

    pub fn full_update_pending(&self) -> bool {
        self.full_update_pending.load(Ordering::Acquire)
    }

    /// Deferred work for the vertical-blank safe point.
    pub fn apply_pending(&self) {
        if self.full_update_pending.swap(false, Ordering::AcqRel) {
            self.convert_all();
        } else if self.substitutes_stale.load(Ordering::Acquire) {
            self.recompute_substitutes();
        }
    }

    /// Re-encode every ordinary colour, restore the sync symbols and refresh
    /// the substitute map.
    pub fn convert_all(&self) {
        for index in (0..=u8::MAX).filter(|&i| !is_reserved(i)) {
            self.encode(index);
        }
        self.restore_sync();
        self.recompute_substitutes();
    }

    /// Encode `index` from its current colour, and again if the colour
    /// changed while the entry was being stored. Whichever core stores last
    /// has then seen the newest colour, so a conversion running alongside
    /// `set_palette` cannot leave a stale symbol behind.
    fn encode(&self, index: u8) {
        let slot = &self.colors[index as usize];
        let mut rgb = slot.load(Ordering::SeqCst);
        loop {
            let symbol = self.converter.convert(rgb);
            self.cache.store(index, symbol, tmds::complement(symbol));
            fence(Ordering::SeqCst);
            let now = slot.load(Ordering::SeqCst);
            if now == rgb {
                break;
            }
            rgb = now;
        }
    }

    /// Sync symbols have no complement: both halves carry the same token.
    pub fn restore_sync(&self) {
        let pinout = *self.pinout();
        for (index, hsync, vsync) in [
            (IDLE, true, true),
            (HSYNC, false, true),
            (VSYNC, true, false),
            (HVSYNC, false, false),
        ] {
            let symbol = tmds::control_symbol(hsync, vsync, &pinout);
            self.cache.store(index, symbol, symbol);
        }
    }

    /// For every sync index, the ordinary index with the nearest colour by
    /// squared RGB distance. Ties go to the lower index.
    pub fn recompute_substitutes(&self) {
        self.substitutes_stale.store(false, Ordering::Release);

        for (slot, substitute) in self.substitutes.iter().enumerate() {
            let target = tmds::split_rgb(self.color(RESERVED_BASE + slot as u8));
            let mut best = 0u8;
            let mut best_distance = u32::MAX;

            for candidate in (0..=u8::MAX).filter(|&i| !is_reserved(i)) {
                let distance = distance_sq(target, tmds::split_rgb(self.color(candidate)));
                if distance < best_distance {
                    best = candidate;
                    best_distance = distance;
                    if distance == 0 {
                        break;
                    }
                }
            }

            substitute.store(best, Ordering::Relaxed);
        }

        debug!("sync substitutes: {:?}", self.substitutes());
    }

    pub fn substitutes(&self) -> [u8; RESERVED_COUNT] {
        core::array::from_fn(|i| self.substitutes[i].load(Ordering::Relaxed))
    }

    /// Pixel value as it may reach the wire.
    #[inline(always)]
    pub fn remap(&self, index: u8) -> u8 {
        if is_reserved(index) {
            self.substitutes[(index - RESERVED_BASE) as usize].load(Ordering::Relaxed)
        } else {
            index
        }
    }
}

fn distance_sq(a: [u8; 3], b: [u8; 3]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as i32 - y as i32;
            (d * d) as u32
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::config::Pinout;
    use crate::tmds::{decode_pair, deserialize, encode_tmds};

    fn palette() -> Box<Palette> {
        Box::new(Palette::new(Pinout::default()))
    }

    #[test]
    fn cache_is_page_aligned() {
        let palette = palette();
        assert_eq!(palette.cache().base_addr() % 4096, 0);
        assert_eq!(core::mem::size_of::<SymbolCache>(), 4096);
    }

    #[test]
    fn sync_entries_survive_palette_writes() {
        let palette = palette();
        let before = palette.cache().symbols(HSYNC);
        palette.set_palette(HSYNC, 0x123456);
        palette.request_full_palette_update();
        palette.apply_pending();

        assert_eq!(palette.cache().symbols(HSYNC), before);
        assert_eq!(palette.color(HSYNC), 0x123456);
        let (symbol, complement) = before;
        assert_eq!(symbol, complement);
    }

    #[test]
    fn background_index_is_an_ordinary_colour() {
        let palette = palette();
        palette.set_palette(255, 0x00ff00);
        let (symbol, complement) = palette.cache().symbols(255);
        assert_eq!(decode_pair(symbol, complement, palette.pinout()), [0, 255, 0]);
        assert_eq!(palette.remap(255), 255);
    }

    #[test]
    fn substitutes_pick_nearest_and_break_ties_low() {
        let palette = palette();
        for i in 0..=250u8 {
            palette.set_palette(i, 0xffffff);
        }
        palette.set_palette(7, 0x100000);
        palette.set_palette(9, 0x100000);
        palette.set_palette(40, 0x000010);
        palette.set_palette(IDLE, 0x120000);
        palette.set_palette(VSYNC, 0x000011);
        palette.set_palette(HSYNC, 0xfefefe);
        palette.set_palette(255, 0xfefefe);
        palette.apply_pending();

        let subs = palette.substitutes();
        assert_eq!(subs[0], 7);
        assert_eq!(subs[1], 255);
        assert_eq!(subs[2], 40);
        assert_eq!(palette.remap(VSYNC), 40);
        assert_eq!(palette.remap(12), 12);
    }

    #[test]
    fn full_update_is_deferred() {
        let palette = palette();
        palette.set_palette(3, 0x808080);
        palette.request_full_palette_update();
        assert!(palette.full_update_pending());
        palette.apply_pending();
        assert!(!palette.full_update_pending());
    }

    fn assert_entry_encodes(palette: &Palette, index: u8) {
        let (symbol, complement) = palette.cache().symbols(index);
        assert_eq!(complement, symbol ^ tmds::COMPLEMENT_MASK);
        assert_eq!(
            decode_pair(symbol, complement, palette.pinout()),
            tmds::split_rgb(palette.color(index)),
            "entry {index}"
        );
    }

    #[test]
    fn writes_around_a_deferred_update_keep_the_newest_colour() {
        let palette = palette();
        palette.set_palette(10, 0x0000ff);
        palette.request_full_palette_update();
        palette.set_palette(10, 0x00ff00);
        palette.set_palette(11, 0xff0000);
        palette.apply_pending();
        palette.set_palette(11, 0x123456);
        palette.request_full_palette_update();
        palette.set_palette(12, 0xabcdef);
        palette.apply_pending();

        for index in [10, 11, 12] {
            assert_entry_encodes(&palette, index);
        }
        assert_eq!(palette.color(10), 0x00ff00);
        assert_eq!(palette.color(11), 0x123456);
    }

    #[test]
    fn writes_during_a_conversion_on_another_core_are_not_lost() {
        let palette = palette();
        let writer_done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..2_000u32 {
                    for index in 0..8u8 {
                        palette.set_palette(index, round.wrapping_mul(0x010203) ^ index as u32);
                    }
                    if round % 50 == 0 {
                        palette.request_full_palette_update();
                    }
                }
                writer_done.store(true, Ordering::Release);
            });
            scope.spawn(|| {
                while !writer_done.load(Ordering::Acquire) {
                    palette.apply_pending();
                    palette.convert_all();
                }
            });
        });

        for index in 0..8u8 {
            assert_entry_encodes(&palette, index);
        }
    }

    proptest! {
        #[test]
        fn prop_cache_matches_last_write(index in 0u8..=250, rgb in 0u32..0x0100_0000) {
            let palette = palette();
            palette.set_palette(index, rgb);
            let (symbol, complement) = palette.cache().symbols(index);

            prop_assert_eq!(complement, symbol ^ tmds::COMPLEMENT_MASK);
            prop_assert_eq!(decode_pair(symbol, complement, palette.pinout()), tmds::split_rgb(rgb));
            for (word, component) in deserialize(symbol, palette.pinout()).into_iter().zip(tmds::split_rgb(rgb)) {
                let ones = component.count_ones();
                let xnor = ones > 4 || (ones == 4 && component & 1 == 0);
                prop_assert_eq!(word, encode_tmds(component));
                prop_assert_eq!(word >> 9 == 1, xnor);
            }
        }

        #[test]
        fn prop_reserved_pixels_remap_to_nearest(colors in proptest::collection::vec(0u32..0x0100_0000, 256)) {
            let palette = palette();
            for (i, &rgb) in colors.iter().enumerate() {
                palette.set_palette(i as u8, rgb);
            }
            palette.apply_pending();

            for reserved in IDLE..=HVSYNC {
                let target = tmds::split_rgb(colors[reserved as usize]);
                let chosen = palette.remap(reserved);
                prop_assert!(!is_reserved(chosen));

                let chosen_distance = distance_sq(target, tmds::split_rgb(colors[chosen as usize]));
                for other in (0..=u8::MAX).filter(|&i| !is_reserved(i)) {
                    let d = distance_sq(target, tmds::split_rgb(colors[other as usize]));
                    prop_assert!(d > chosen_distance || (d == chosen_distance && other >= chosen));
                }
            }
        }
    }
}
