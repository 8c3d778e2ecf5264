//! Sample conditioning between the mixer and the ring: rational gain, limiting
//! and stereo packing.

/// Rational gain applied as `sample * num / den`, widened so any ratio
/// saturates instead of wrapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Gain {
    pub num: i32,
    pub den: i32,
}

impl Gain {
    pub const UNITY: Gain = Gain { num: 1, den: 1 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    #[inline(always)]
    pub fn apply(&self, sample: i16) -> i32 {
        if self.den == 0 {
            return 0;
        }
        let scaled = sample as i64 * self.num as i64 / self.den as i64;
        scaled.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Limiter {
    /// Saturate at the 16-bit range.
    Hard,
    /// Compress everything past the knee before saturating.
    Soft,
}

pub const SOFT_KNEE: i32 = 30_000;
pub const SOFT_RATIO: i32 = 4;

#[inline(always)]
pub fn clamp16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[inline(always)]
pub fn soft_limit16(v: i32) -> i16 {
    let v = if v > SOFT_KNEE {
        SOFT_KNEE + (v - SOFT_KNEE) / SOFT_RATIO
    } else if v < -SOFT_KNEE {
        -SOFT_KNEE + (v + SOFT_KNEE) / SOFT_RATIO
    } else {
        v
    };
    clamp16(v)
}

impl Limiter {
    #[inline(always)]
    pub fn limit(self, v: i32) -> i16 {
        match self {
            Limiter::Hard => clamp16(v),
            Limiter::Soft => soft_limit16(v),
        }
    }
}

/// Left in the high half, right in the low half.
#[inline(always)]
pub const fn pack(left: i16, right: i16) -> u32 {
    (left as u16 as u32) << 16 | right as u16 as u32
}

#[inline(always)]
pub const fn unpack(frame: u32) -> (i16, i16) {
    ((frame >> 16) as u16 as i16, frame as u16 as i16)
}

/// Gain, limit and pack one interleaved stereo frame.
#[inline(always)]
pub fn condition(left: i16, right: i16, gain: Gain, limiter: Limiter) -> u32 {
    pack(limiter.limit(gain.apply(left)), limiter.limit(gain.apply(right)))
}

/// Scale both halves of a packed frame by `num / den`.
#[inline(always)]
pub fn scale_frame(frame: u32, num: i32, den: i32) -> u32 {
    let (l, r) = unpack(frame);
    pack(((l as i32 * num) / den) as i16, ((r as i32 * num) / den) as i16)
}
