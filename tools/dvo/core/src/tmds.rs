//! # TMDS symbols
//!
//! Every palette entry is pre-encoded into one 64-bit *symbol*: the three
//! 10-bit TMDS characters of its red, green and blue components, serialized
//! bit by bit across three differential pairs.
//!
//! ```text
//!  63 62 61 ........ 32 31 30 29 ......... 0
//! [ 0  0 | bits 9..5  | 0  0 | bits 4..0   ]   one 6-bit group per TMDS bit
//! ```
//!
//! Each group holds two pins per lane (`b`, `!b`), red on the highest pair by
//! default. The serializer consumes 30 bits per word, so a symbol is exactly
//! one pixel clock on the wire.
//!
//! Pixels are doubled horizontally: every palette index is emitted as its
//! symbol followed by its *complement*, which inverts the eight data bits of
//! each lane. The two characters carry opposite DC bias so the link stays
//! balanced without tracking running disparity.

use bit_field::BitField;

use crate::config::{LaneOrder, Pinout};

/// Flips TMDS data bits 0..=7 of all three lanes. Bits 8 and 9 are kept.
pub const COMPLEMENT_MASK: u64 = 0x0003_FFFF_FFFF_FFFF;

/// Control-period characters indexed by `(c1 << 1) | c0`.
pub const CONTROL_TOKENS: [u16; 4] = [0b1101010100, 0b0010101011, 0b0101010100, 0b1010101011];

const TMDS_BITS: usize = 10;

/// Stage-one TMDS encoding of one colour component.
///
/// Picks XOR or XNOR chaining to minimise transitions. Bit 8 flags XOR, bit 9
/// flags XNOR; the data bits are never inverted here.
pub fn encode_tmds(byte: u8) -> u16 {
    let ones = byte.count_ones();
    let xnor = ones > 4 || (ones == 4 && !byte.get_bit(0));

    let mut word = (byte & 1) as u16;
    for i in 1..8 {
        let bit = word.get_bit(i - 1) ^ byte.get_bit(i) ^ xnor;
        word.set_bit(i, bit);
    }
    word.set_bit(if xnor { 9 } else { 8 }, true);
    word
}

/// Receiver-side decoding of a 10-bit character.
pub fn decode_tmds(word: u16) -> u8 {
    let mut q = word.get_bits(0..8) as u8;
    if word.get_bit(9) {
        q = !q;
    }
    let xnor = !word.get_bit(8);

    let mut byte = q & 1;
    for i in 1..8 {
        byte.set_bit(i, q.get_bit(i) ^ q.get_bit(i - 1) ^ xnor);
    }
    byte
}

#[inline(always)]
fn group_shift(bit: usize) -> usize {
    6 * bit + if bit >= 5 { 2 } else { 0 }
}

/// Bit offsets of the red, green and blue pairs inside a group.
fn lane_shifts(order: LaneOrder) -> [usize; 3] {
    match order {
        LaneOrder::Rgb => [4, 2, 0],
        LaneOrder::Bgr => [0, 2, 4],
    }
}

/// One lane's share of a symbol. Lanes occupy disjoint bits, so a symbol is
/// the OR of its three lanes.
pub fn spread_lane(word: u16, lane_shift: usize, invert: bool) -> u64 {
    (0..TMDS_BITS).fold(0, |out, bit| {
        let b = word.get_bit(bit) as u64;
        let mut pair = b | ((b ^ 1) << 1);
        if invert {
            pair ^= 0b11;
        }
        out | pair << (group_shift(bit) + lane_shift)
    })
}

/// Assemble a symbol from three 10-bit characters.
pub fn serialize(chars: [u16; 3], pinout: &Pinout) -> u64 {
    let shifts = lane_shifts(pinout.lane_order);
    chars
        .iter()
        .zip(shifts)
        .fold(0, |out, (&word, shift)| out | spread_lane(word, shift, pinout.invert_pairs))
}

/// Split a symbol back into its red, green and blue characters.
pub fn deserialize(symbol: u64, pinout: &Pinout) -> [u16; 3] {
    let shifts = lane_shifts(pinout.lane_order);
    let mut chars = [0u16; 3];
    for bit in 0..TMDS_BITS {
        let mut group = (symbol >> group_shift(bit)) & 0x3f;
        if pinout.invert_pairs {
            group ^= 0x3f;
        }
        for (word, shift) in chars.iter_mut().zip(shifts) {
            word.set_bit(bit, (group >> shift) & 1 == 1);
        }
    }
    chars
}

#[inline(always)]
pub fn complement(symbol: u64) -> u64 {
    symbol ^ COMPLEMENT_MASK
}

/// Control symbol for the given sync line levels. Red and green carry the
/// idle token; blue carries HSYNC on C0 and VSYNC on C1.
pub fn control_symbol(hsync: bool, vsync: bool, pinout: &Pinout) -> u64 {
    let blue = CONTROL_TOKENS[((vsync as usize) << 1) | hsync as usize];
    serialize([CONTROL_TOKENS[0], CONTROL_TOKENS[0], blue], pinout)
}

/// Recover the RGB components carried by a symbol pair.
///
/// On the XNOR branch only the complement decodes exactly, so each lane is
/// read from whichever character has bit 9 clear.
pub fn decode_pair(symbol: u64, complement: u64, pinout: &Pinout) -> [u8; 3] {
    let chars = deserialize(symbol, pinout);
    let comps = deserialize(complement, pinout);
    let mut rgb = [0u8; 3];
    for lane in 0..3 {
        rgb[lane] = if chars[lane].get_bit(9) {
            decode_tmds(comps[lane])
        } else {
            decode_tmds(chars[lane])
        };
    }
    rgb
}

#[inline(always)]
pub fn split_rgb(rgb: u32) -> [u8; 3] {
    [(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8]
}

/// Palette colour to symbol conversion.
pub trait ColorConverter {
    fn new(pinout: Pinout) -> Self
    where
        Self: Sized;

    fn pinout(&self) -> &Pinout;

    /// Symbol for a 24-bit `0xRRGGBB` colour.
    fn convert(&self, rgb: u32) -> u64;
}

/// Encodes every component on demand.
pub struct EncodingConverter {
    pinout: Pinout,
}

impl ColorConverter for EncodingConverter {
    fn new(pinout: Pinout) -> Self {
        Self { pinout }
    }

    fn pinout(&self) -> &Pinout {
        &self.pinout
    }

    fn convert(&self, rgb: u32) -> u64 {
        serialize(split_rgb(rgb).map(encode_tmds), &self.pinout)
    }
}

/// Precomputed lane contributions for every component value; a conversion
/// is three lookups and two ORs.
#[cfg(feature = "tmds-table")]
pub struct TableConverter {
    pinout: Pinout,
    lanes: [[u64; 256]; 3],
}

#[cfg(feature = "tmds-table")]
impl ColorConverter for TableConverter {
    fn new(pinout: Pinout) -> Self {
        let shifts = lane_shifts(pinout.lane_order);
        let mut lanes = [[0u64; 256]; 3];
        for (table, shift) in lanes.iter_mut().zip(shifts) {
            for (value, entry) in table.iter_mut().enumerate() {
                *entry = spread_lane(encode_tmds(value as u8), shift, pinout.invert_pairs);
            }
        }
        Self { pinout, lanes }
    }

    fn pinout(&self) -> &Pinout {
        &self.pinout
    }

    #[inline(always)]
    fn convert(&self, rgb: u32) -> u64 {
        let [r, g, b] = split_rgb(rgb);
        self.lanes[0][r as usize] | self.lanes[1][g as usize] | self.lanes[2][b as usize]
    }
}

#[cfg(feature = "tmds-table")]
pub type SelectedConverter = TableConverter;
#[cfg(not(feature = "tmds-table"))]
pub type SelectedConverter = EncodingConverter;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn expects_xnor(byte: u8) -> bool {
        let ones = byte.count_ones();
        ones > 4 || (ones == 4 && byte & 1 == 0)
    }

    #[test]
    fn branch_flags_follow_the_ones_count() {
        for byte in 0..=255u8 {
            let word = encode_tmds(byte);
            let xnor = expects_xnor(byte);
            assert_eq!(word.get_bit(9), xnor, "byte {byte:#04x}");
            assert_eq!(word.get_bit(8), !xnor, "byte {byte:#04x}");
            assert_eq!(word >> 10, 0);
        }
    }

    #[test]
    fn known_characters() {
        // 0x00 and 0xff take opposite branches
        assert_eq!(encode_tmds(0x00), 0b01_0000_0000);
        assert_eq!(encode_tmds(0xff), 0b10_1111_1111);
        assert_eq!(encode_tmds(0x10), 0b01_1111_0000);
    }

    #[test]
    fn exact_character_of_each_pair_decodes() {
        for byte in 0..=255u8 {
            let word = encode_tmds(byte);
            let exact = if word.get_bit(9) { word ^ 0xff } else { word };
            assert_eq!(decode_tmds(exact), byte);
        }
    }

    #[test]
    fn complement_keeps_branch_flags() {
        let pinout = Pinout::default();
        let symbol = serialize([encode_tmds(0x12), encode_tmds(0xf0), encode_tmds(0x7e)], &pinout);
        let flipped = deserialize(complement(symbol), &pinout);
        for (lane, original) in deserialize(symbol, &pinout).iter().enumerate() {
            assert_eq!(flipped[lane] >> 8, original >> 8);
            assert_eq!(flipped[lane] & 0xff, !original & 0xff);
        }
    }

    #[test]
    fn lane_order_swaps_red_and_blue_pairs() {
        let rgb = Pinout { invert_pairs: false, ..Pinout::default() };
        let bgr = Pinout { lane_order: LaneOrder::Bgr, ..rgb };
        let chars = [encode_tmds(200), encode_tmds(100), encode_tmds(3)];
        let swapped = [chars[2], chars[1], chars[0]];
        assert_eq!(serialize(chars, &rgb), serialize(swapped, &bgr));
    }

    #[test]
    fn control_symbols_carry_sync_on_blue() {
        let pinout = Pinout::default();
        let idle = control_symbol(true, true, &pinout);
        assert_eq!(deserialize(idle, &pinout), [0b1101010100, 0b1101010100, 0b1010101011]);
        let hsync = control_symbol(false, true, &pinout);
        assert_eq!(deserialize(hsync, &pinout)[2], 0b0101010100);
    }

    #[test]
    fn pair_lines_are_always_differential() {
        let symbol = EncodingConverter::new(Pinout::default()).convert(0x00c0ffee);
        for bit in 0..TMDS_BITS {
            let group = (symbol >> group_shift(bit)) & 0x3f;
            for lane in 0..3 {
                let pair = (group >> (lane * 2)) & 0b11;
                assert!(pair == 0b01 || pair == 0b10, "bit {bit} lane {lane}: {pair:#b}");
            }
        }
        assert_eq!(symbol & 0xc000_0000_c000_0000, 0);
    }

    proptest! {
        #[test]
        fn prop_symbols_decode_to_their_colour(rgb in 0u32..0x0100_0000, bgr in any::<bool>(), invert in any::<bool>()) {
            let pinout = Pinout {
                lane_order: if bgr { LaneOrder::Bgr } else { LaneOrder::Rgb },
                invert_pairs: invert,
                ..Pinout::default()
            };
            let symbol = EncodingConverter::new(pinout).convert(rgb);
            prop_assert_eq!(decode_pair(symbol, complement(symbol), &pinout), split_rgb(rgb));

            for (lane, word) in deserialize(symbol, &pinout).into_iter().enumerate() {
                let component = split_rgb(rgb)[lane];
                prop_assert_eq!(word, encode_tmds(component));
                prop_assert_eq!(word.get_bit(9), expects_xnor(component));
            }
        }
    }

    #[cfg(feature = "tmds-table")]
    proptest! {
        #[test]
        fn prop_table_matches_encoder(rgb in 0u32..0x0100_0000) {
            let pinout = Pinout::default();
            prop_assert_eq!(TableConverter::new(pinout).convert(rgb), EncodingConverter::new(pinout).convert(rgb));
        }
    }
}
